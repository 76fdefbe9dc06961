//! Narrow contracts for the three outward-facing capabilities the engine consumes.
//!
//! Concrete HTTP implementations live in [`crate::providers`]; deterministic
//! stand-ins for tests and offline runs live in [`crate::stub`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ResearchError;

/// Pipeline stage a generation request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    RootQuestions,
    SubQuestions,
    Extraction,
    SourceAnalysis,
    ReportAnalysis,
    ReportNarrative,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::RootQuestions => "root_questions",
            Purpose::SubQuestions => "sub_questions",
            Purpose::Extraction => "extraction",
            Purpose::SourceAnalysis => "source_analysis",
            Purpose::ReportAnalysis => "report_analysis",
            Purpose::ReportNarrative => "report_narrative",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub purpose: Purpose,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
}

impl GenerationParams {
    pub fn new(purpose: Purpose) -> Self {
        Self {
            purpose,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Fails with [`ResearchError::Provider`] (or `Timeout`) when the backend cannot answer.
    async fn generate(&self, prompt: &str, params: &GenerationParams)
    -> Result<String, ResearchError>;
}

/// One organic search result as returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

impl SearchHit {
    pub fn new(
        title: impl Into<String>,
        link: impl Into<String>,
        snippet: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            snippet: snippet.into(),
        }
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Fails with [`ResearchError::Search`] only on provider-level failures.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ResearchError>;
}

#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// Fails with [`ResearchError::Fetch`] for unreachable pages and
    /// [`ResearchError::Provider`] when the extraction backend fails.
    async fn extract(
        &self,
        url: &str,
        instruction: &str,
        max_tokens: usize,
    ) -> Result<String, ResearchError>;
}

pub type DynTextGenerator = Arc<dyn TextGenerator>;
pub type DynSearchProvider = Arc<dyn SearchProvider>;
pub type DynContentExtractor = Arc<dyn ContentExtractor>;

/// The capability set injected into an orchestrator.
#[derive(Clone)]
pub struct Capabilities {
    pub generator: DynTextGenerator,
    pub search: DynSearchProvider,
    pub extractor: DynContentExtractor,
}

impl Capabilities {
    pub fn new(
        generator: DynTextGenerator,
        search: DynSearchProvider,
        extractor: DynContentExtractor,
    ) -> Self {
        Self {
            generator,
            search,
            extractor,
        }
    }
}
