use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::status_is_retryable;
use crate::capabilities::{SearchHit, SearchProvider};
use crate::config::SearchConfig;
use crate::error::ResearchError;
use crate::security::SecretValue;

/// Organic web results from SerpAPI.
pub struct SerpApiSearch {
    client: reqwest::Client,
    config: SearchConfig,
    api_key: SecretValue,
}

impl SerpApiSearch {
    pub fn new(client: reqwest::Client, config: SearchConfig, api_key: SecretValue) -> Self {
        Self {
            client,
            config,
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct SerpResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
}

/// 429 and 5xx stay `Search` errors and are retried. Any other rejection
/// (bad key, bad engine, unknown endpoint) will not change on retry.
fn status_error(status: reqwest::StatusCode) -> ResearchError {
    if status_is_retryable(status) {
        ResearchError::Search(format!("search endpoint returned {status}"))
    } else {
        ResearchError::InvalidConfiguration(format!(
            "search endpoint rejected the request with {status}"
        ))
    }
}

fn into_hits(response: SerpResponse, limit: usize) -> Result<Vec<SearchHit>, ResearchError> {
    match response.error {
        // SerpAPI reports an empty result page as an error string.
        Some(message) if message.contains("hasn't returned any results") => Ok(Vec::new()),
        Some(message) => Err(ResearchError::Search(message)),
        None => Ok(response
            .organic_results
            .into_iter()
            .take(limit)
            .map(|result| SearchHit::new(result.title, result.link, result.snippet))
            .collect()),
    }
}

#[async_trait]
impl SearchProvider for SerpApiSearch {
    #[instrument(skip(self))]
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ResearchError> {
        let num = limit.to_string();
        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&[
                ("engine", self.config.engine.as_str()),
                ("q", query),
                ("num", num.as_str()),
                ("safe", "active"),
                ("api_key", self.api_key.expose()),
            ])
            .send()
            .await
            .map_err(|err| {
                ResearchError::Search(format!("search request failed: {}", err.without_url()))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let parsed: SerpResponse = response
            .json()
            .await
            .map_err(|err| ResearchError::Search(format!("malformed search response: {err}")))?;
        let hits = into_hits(parsed, limit)?;
        debug!(hits = hits.len(), "search results received");
        Ok(hits)
    }
}
