use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::ResearchError;
use crate::config::LoggingConfig;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// Configuration options when initialising telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Explicit filter directive; `RUST_LOG` wins over the configured default.
    pub env_filter: Option<String>,
    pub with_ansi: bool,
    pub with_target: bool,
    pub json: bool,
}

impl TelemetryOptions {
    pub fn from_logging(logging: &LoggingConfig) -> Self {
        Self {
            env_filter: Some(logging.level.clone()),
            json: logging.json,
            ..Self::default()
        }
    }
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            with_ansi: true,
            with_target: false,
            json: false,
        }
    }
}

/// Initialise the global tracing subscriber.
///
/// Safe to call multiple times; only the first invocation installs the subscriber.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), ResearchError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let directive = std::env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or(options.env_filter)
        .unwrap_or_else(|| "info,deeptree_core=info".to_string());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(directive))
        .with_target(options.with_target);

    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.with_ansi(options.with_ansi).try_init()
    };

    installed.map_err(|err| {
        ResearchError::InvalidConfiguration(format!("telemetry init failed: {err}"))
    })?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}
