use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::capabilities::Purpose;
use crate::{ResearchError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "DEEPTREE_CONFIG";

/// Top-level configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the configured LLM secret value (from environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, ResearchError> {
        require_env(&self.llm.api_key_env)
    }

    pub fn search_api_key(&self) -> Result<SecretValue, ResearchError> {
        require_env(&self.search.api_key_env)
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `DEEPTREE_CONFIG` environment variable.
    /// 3. `config.toml` in the current working directory.
    pub fn load(path: Option<PathBuf>) -> Result<Config, ResearchError> {
        let candidate = resolve_path(path);
        let raw = fs::read_to_string(&candidate)
            .map_err(|err| ResearchError::config_io(candidate.clone(), err))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Config, ResearchError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| ResearchError::InvalidConfiguration(err.to_string()))?;
        config.engine.validate()?;
        config.retry.validate()?;
        Self::validate_secrets(&config)?;
        Ok(config)
    }

    fn validate_secrets(config: &Config) -> Result<(), ResearchError> {
        if config.llm.api_key_env.trim().is_empty() {
            return Err(ResearchError::InvalidConfiguration(
                "llm.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.search.api_key_env.trim().is_empty() {
            return Err(ResearchError::InvalidConfiguration(
                "search.api_key_env must reference an environment variable".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV)
        && !from_env.trim().is_empty()
    {
        return PathBuf::from(from_env);
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

/// Tree bounds, truncation limits and concurrency. All fields are required.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Sub-questions generated per non-leaf question.
    pub fanout: usize,
    /// Largest `depth` a request may ask for.
    pub max_depth: usize,
    /// Largest `max_questions` a request may ask for.
    pub max_root_questions: usize,
    pub results_per_question: usize,
    pub min_snippet_chars: usize,
    /// Extracted page content is cut to this many characters before analysis.
    pub max_content_chars: usize,
    pub max_finding_chars: usize,
    pub extract_max_tokens: usize,
    pub summary_chars: usize,
    /// Global bound on simultaneous outbound calls.
    pub max_concurrent_calls: usize,
    pub call_timeout_ms: u64,
    /// Budget for one extraction attempt, which spans a page fetch and an
    /// extraction generation. Each of those HTTP requests is still capped
    /// by `call_timeout_ms`.
    pub extract_timeout_ms: u64,
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ResearchError> {
        let positive = [
            ("fanout", self.fanout),
            ("max_root_questions", self.max_root_questions),
            ("results_per_question", self.results_per_question),
            ("max_content_chars", self.max_content_chars),
            ("max_finding_chars", self.max_finding_chars),
            ("extract_max_tokens", self.extract_max_tokens),
            ("summary_chars", self.summary_chars),
            ("max_concurrent_calls", self.max_concurrent_calls),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ResearchError::InvalidConfiguration(format!(
                    "engine.{name} must be greater than zero"
                )));
            }
        }
        if self.call_timeout_ms == 0 {
            return Err(ResearchError::InvalidConfiguration(
                "engine.call_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.extract_timeout_ms < self.call_timeout_ms {
            return Err(ResearchError::InvalidConfiguration(
                "engine.extract_timeout_ms must be at least engine.call_timeout_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "RetryConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "RetryConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    const fn default_max_retries() -> usize {
        2
    }

    const fn default_initial_backoff_ms() -> u64 {
        500
    }

    const fn default_max_backoff_ms() -> u64 {
        8_000
    }

    fn validate(&self) -> Result<(), ResearchError> {
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ResearchError::InvalidConfiguration(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "LlmConfig::default_base_url")]
    pub base_url: String,
    pub model: String,
    /// Per-stage model overrides keyed by purpose (`report_narrative = "gpt-4o"`).
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default = "LlmConfig::default_temperature")]
    pub temperature: f32,
}

impl LlmConfig {
    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    const fn default_temperature() -> f32 {
        0.7
    }

    pub fn model_for(&self, purpose: Purpose) -> &str {
        self.models
            .get(purpose.as_str())
            .map(String::as_str)
            .unwrap_or(&self.model)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "SearchConfig::default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default = "SearchConfig::default_engine")]
    pub engine: String,
}

impl SearchConfig {
    fn default_endpoint() -> String {
        "https://serpapi.com/search.json".to_string()
    }

    fn default_engine() -> String {
        "google".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default = "ExtractorConfig::default_user_agent")]
    pub user_agent: String,
    /// Raw page text handed to the extraction prompt is cut to this many characters.
    #[serde(default = "ExtractorConfig::default_max_page_chars")]
    pub max_page_chars: usize,
}

impl ExtractorConfig {
    fn default_user_agent() -> String {
        concat!("deeptree/", env!("CARGO_PKG_VERSION")).to_string()
    }

    const fn default_max_page_chars() -> usize {
        24_000
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            user_agent: Self::default_user_agent(),
            max_page_chars: Self::default_max_page_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}
