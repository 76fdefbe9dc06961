use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use deeptree_core::stub::offline_capabilities;
use deeptree_core::{Config, Orchestrator};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::info;

use crate::config::ApiConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    request_permits: Arc<Semaphore>,
    max_requests: usize,
}

#[derive(Debug, Serialize)]
pub struct CapacityReport {
    pub max_requests: usize,
    pub available_requests: usize,
    pub active_requests: usize,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, max_requests: usize) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            orchestrator: Arc::new(orchestrator),
            request_permits: Arc::new(Semaphore::new(max_requests)),
            max_requests,
        }
    }

    /// Wire live (or offline) providers for the loaded configuration.
    pub fn try_new(api: &ApiConfig, config: &Config) -> Result<Self> {
        let orchestrator = if api.offline {
            info!("serving from offline stub providers");
            Orchestrator::with_capabilities(config, offline_capabilities())
        } else {
            Orchestrator::from_config(config)
        };
        let orchestrator = orchestrator.context("failed to build orchestrator")?;
        Ok(Self::new(orchestrator, api.max_concurrent_requests))
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    /// Claim a request slot; the slot is released when the permit drops.
    pub fn acquire_request_permit(&self) -> Result<OwnedSemaphorePermit, AppError> {
        match self.request_permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => Err(AppError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "research capacity reached; retry once a slot frees up",
            )),
            Err(TryAcquireError::Closed) => Err(AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "research executor unavailable",
            )),
        }
    }

    pub fn capacity(&self) -> CapacityReport {
        let available = self.request_permits.available_permits();
        CapacityReport {
            max_requests: self.max_requests,
            available_requests: available,
            active_requests: self.max_requests.saturating_sub(available),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use deeptree_core::{EngineConfig, RetryConfig};

    fn engine() -> EngineConfig {
        EngineConfig {
            fanout: 1,
            max_depth: 1,
            max_root_questions: 2,
            results_per_question: 1,
            min_snippet_chars: 1,
            max_content_chars: 100,
            max_finding_chars: 100,
            extract_max_tokens: 50,
            summary_chars: 100,
            max_concurrent_calls: 1,
            call_timeout_ms: 1_000,
            extract_timeout_ms: 2_000,
        }
    }

    #[test]
    fn capacity_limit_returns_429() {
        let orchestrator =
            Orchestrator::new(engine(), RetryConfig::default(), offline_capabilities()).unwrap();
        let state = AppState::new(orchestrator, 1);

        let permit = state
            .acquire_request_permit()
            .expect("first permit should succeed");
        assert_eq!(state.capacity().active_requests, 1);
        let err = state
            .acquire_request_permit()
            .expect_err("second permit should fail");
        assert_eq!(err.into_response().status(), StatusCode::TOO_MANY_REQUESTS);
        drop(permit);
        assert_eq!(state.capacity().available_requests, 1);
    }
}
