use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::redact_secrets;

/// Core error type for DeepTree.
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("systemic failure: {0}")]
    Systemic(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("fetch error: {message}")]
    Fetch { message: String, retryable: bool },
    #[error("provider error: {0}")]
    Provider(String),
    #[error("call timed out after {0} ms")]
    Timeout(u64),
    #[error("research request cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ResearchError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn fetch(message: impl Into<String>, retryable: bool) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable,
        }
    }

    /// Whether the call policy may try the failed call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ResearchError::Search(_) | ResearchError::Provider(_) | ResearchError::Timeout(_) => {
                true
            }
            ResearchError::Fetch { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ResearchError::Validation(_) => ErrorKind::Validation,
            ResearchError::Systemic(_) => ErrorKind::Systemic,
            ResearchError::Search(_) => ErrorKind::Search,
            ResearchError::Fetch { .. } => ErrorKind::Fetch,
            ResearchError::Provider(_) => ErrorKind::Provider,
            ResearchError::Timeout(_) => ErrorKind::Timeout,
            ResearchError::Cancelled => ErrorKind::Cancelled,
            ResearchError::InvalidConfiguration(_)
            | ResearchError::MissingSecret(_)
            | ResearchError::ConfigIo { .. } => ErrorKind::Internal,
        }
    }

    /// Snapshot of this error suitable for storing on the research tree.
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.kind(), self.to_string())
    }
}

/// Coarse classification of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Systemic,
    Search,
    Fetch,
    Provider,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Systemic => "systemic",
            ErrorKind::Search => "search",
            ErrorKind::Fetch => "fetch",
            ErrorKind::Provider => "provider",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Failure recorded on a source record or question node instead of being propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl AsRef<str>) -> Self {
        Self {
            kind,
            message: redact_secrets(message.as_ref()),
        }
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_error_class() {
        assert!(ResearchError::Provider("503".into()).is_retryable());
        assert!(ResearchError::Timeout(100).is_retryable());
        assert!(ResearchError::fetch("HTTP 502", true).is_retryable());
        assert!(!ResearchError::fetch("HTTP 404", false).is_retryable());
        assert!(!ResearchError::Validation("bad".into()).is_retryable());
        assert!(!ResearchError::Cancelled.is_retryable());
    }

    #[test]
    fn detail_redacts_api_keys() {
        let err = ResearchError::Search(
            "request to https://serpapi.com/search.json?q=x&api_key=abc123 failed".into(),
        );
        let detail = err.detail();
        assert_eq!(detail.kind, ErrorKind::Search);
        assert!(!detail.message.contains("abc123"), "{}", detail.message);
    }
}
