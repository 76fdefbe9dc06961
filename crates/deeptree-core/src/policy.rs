//! Timeout, retry and concurrency control shared by every outbound call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, RetryConfig};
use crate::error::ResearchError;
use crate::metrics;

/// Wraps a capability call with the global permit pool, a per-attempt
/// timeout, exponential backoff and request cancellation.
#[derive(Clone)]
pub struct CallPolicy {
    permits: Arc<Semaphore>,
    max_permits: usize,
    timeout: Duration,
    retry: RetryConfig,
}

impl CallPolicy {
    pub fn new(max_concurrent_calls: usize, timeout: Duration, retry: RetryConfig) -> Self {
        let max_permits = max_concurrent_calls.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            timeout,
            retry,
        }
    }

    pub fn from_config(engine: &EngineConfig, retry: &RetryConfig) -> Self {
        Self::new(
            engine.max_concurrent_calls,
            engine.call_timeout(),
            retry.clone(),
        )
    }

    /// Same permit pool and retry settings, different per-attempt timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `call` until it succeeds, fails terminally, exhausts its retries,
    /// or the request is cancelled. The permit is held only while an attempt
    /// is in flight, never during backoff.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, ResearchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResearchError>>,
    {
        let mut attempt = 0;
        let mut backoff_ms = self.retry.initial_backoff_ms;

        loop {
            if cancel.is_cancelled() {
                return Err(ResearchError::Cancelled);
            }

            let outcome = {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ResearchError::Cancelled),
                    permit = self.permits.acquire() => permit.map_err(|_| {
                        ResearchError::Systemic("outbound call limiter closed".into())
                    })?,
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ResearchError::Cancelled),
                    result = tokio::time::timeout(self.timeout, call()) => match result {
                        Ok(inner) => inner,
                        Err(_) => Err(ResearchError::Timeout(self.timeout.as_millis() as u64)),
                    },
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retry.max_retries && err.is_retryable() => {
                    attempt += 1;
                    tracing::warn!(
                        operation,
                        error = %err,
                        attempt,
                        backoff_ms,
                        "call failed, retrying"
                    );
                    metrics::record_retry(operation, err.kind());

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ResearchError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                    backoff_ms = backoff_ms.saturating_mul(2).min(self.retry.max_backoff_ms);
                }
                Err(err) => {
                    tracing::debug!(operation, error = %err, attempt, "call failed permanently");
                    return Err(err);
                }
            }
        }
    }
}
