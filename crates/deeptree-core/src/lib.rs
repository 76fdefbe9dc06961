//! DeepTree core: hierarchical research orchestration.
//!
//! A topic is expanded into a bounded tree of research questions; every
//! question gathers web sources, every source is fetched and analyzed
//! concurrently, and the processed tree is compiled bottom-up into a report.
//! External services are reached only through the traits in
//! [`capabilities`], so the engine runs unchanged against HTTP providers or
//! the deterministic stubs in [`stub`].

pub mod capabilities;
pub mod compiler;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod policy;
pub mod processor;
#[cfg(feature = "http-providers")]
pub mod providers;
pub mod render;
pub mod retriever;
pub mod security;
pub mod stub;
pub mod telemetry;
pub mod text;

pub use capabilities::{
    Capabilities, ContentExtractor, DynContentExtractor, DynSearchProvider, DynTextGenerator,
    GenerationParams, Purpose, SearchHit, SearchProvider, TextGenerator,
};
pub use compiler::ReportCompiler;
pub use config::{
    Config, ConfigLoader, EngineConfig, ExtractorConfig, LlmConfig, LoggingConfig, RetryConfig,
    SearchConfig,
};
pub use error::{ErrorDetail, ErrorKind, ResearchError};
pub use events::{EventCollector, Phase, ResearchEvent};
pub use metrics::init_metrics_from_env;
pub use model::{
    Coverage, DEFAULT_DEPTH, DEFAULT_MAX_QUESTIONS, NodeFinding, QuestionNode, ReportStats,
    ResearchQuery, ResearchReport, SourceAnalysis, SourceFinding, SourceRecord, SourceStatus,
};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use planner::QuestionTreeBuilder;
pub use policy::CallPolicy;
pub use processor::{ProcessorLimits, SourceProcessor};
pub use retriever::SourceRetriever;
pub use security::{SecretValue, redact_secrets, require_env};
pub use telemetry::{TelemetryOptions, init_telemetry};

pub use tokio_util::sync::CancellationToken;
