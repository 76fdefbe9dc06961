use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::capabilities::{GenerationParams, TextGenerator};
use crate::config::LlmConfig;
use crate::error::ResearchError;
use crate::security::SecretValue;

/// Text generation over an OpenAI-compatible `chat/completions` endpoint.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: SecretValue,
}

impl OpenAiGenerator {
    pub fn new(client: reqwest::Client, config: LlmConfig, api_key: SecretValue) -> Self {
        Self {
            client,
            config,
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

fn first_choice(response: ChatResponse) -> Result<String, ResearchError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| ResearchError::Provider("completion contained no text".into()))
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    #[instrument(skip(self, prompt), fields(purpose = params.purpose.as_str()))]
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ResearchError> {
        let model = self.config.model_for(params.purpose);
        let body = ChatRequest {
            model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: params.temperature.unwrap_or(self.config.temperature),
            max_tokens: params.max_tokens,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|err| ResearchError::Provider(format!("completion request failed: {err}")))?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(ResearchError::InvalidConfiguration(format!(
                "completion endpoint rejected credentials ({status})"
            )));
        }
        if !status.is_success() {
            return Err(ResearchError::Provider(format!(
                "completion endpoint returned {status}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| ResearchError::Provider(format!("malformed completion: {err}")))?;
        let text = first_choice(parsed)?;
        debug!(model, chars = text.len(), "completion received");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let body = ChatRequest {
            model: "gpt-4o",
            messages: [ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.7,
            max_tokens: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn empty_completion_is_provider_error() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  "}}]}"#).unwrap();
        assert!(matches!(first_choice(parsed), Err(ResearchError::Provider(_))));

        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"answer"}}]}"#).unwrap();
        assert_eq!(first_choice(parsed).unwrap(), "answer");
    }
}
