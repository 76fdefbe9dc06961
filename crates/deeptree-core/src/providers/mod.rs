//! HTTP-backed capability implementations.

mod extractor;
mod openai;
mod serpapi;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

pub use extractor::{LlmPageExtractor, strip_html};
pub use openai::OpenAiGenerator;
pub use serpapi::SerpApiSearch;

use crate::capabilities::{Capabilities, DynTextGenerator};
use crate::config::Config;
use crate::error::ResearchError;

/// Wire the configured providers together. Fails early when a required
/// secret is missing from the environment.
pub fn build_capabilities(config: &Config) -> Result<Capabilities, ResearchError> {
    // Caps each HTTP request; one extraction attempt spans two of them and is
    // bounded by `engine.extract_timeout_ms` instead.
    let client = http_client(&config.extractor.user_agent, config.engine.call_timeout())?;

    let generator: DynTextGenerator = Arc::new(OpenAiGenerator::new(
        client.clone(),
        config.llm.clone(),
        config.llm_api_key()?,
    ));
    let search = Arc::new(SerpApiSearch::new(
        client.clone(),
        config.search.clone(),
        config.search_api_key()?,
    ));
    let extractor = Arc::new(LlmPageExtractor::new(
        client,
        generator.clone(),
        config.extractor.max_page_chars,
    ));

    Ok(Capabilities::new(generator, search, extractor))
}

fn http_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client, ResearchError> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()
        .map_err(|err| ResearchError::InvalidConfiguration(format!("http client: {err}")))
}

/// 429 and 5xx are worth another attempt; other non-2xx statuses are not.
fn status_is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
