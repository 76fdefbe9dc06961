use std::env;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::ResearchError;

static REDACTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
            .expect("invalid api_key regex"),
        Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)").expect("invalid secret regex"),
        Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        Regex::new(r"(sk-[A-Za-z0-9]{16,})").expect("invalid sk_token regex"),
    ]
});

/// Wrapper around sensitive values to reduce accidental logging.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***redacted***")
    }
}

/// Require that a given environment variable is set and non-empty.
pub fn require_env(var: &str) -> Result<SecretValue, ResearchError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretValue(value)),
        _ => Err(ResearchError::MissingSecret(var.to_string())),
    }
}

/// Mask credentials that provider errors tend to echo back (query strings, auth headers).
pub fn redact_secrets(input: &str) -> String {
    let mut output = input.to_string();
    for regex in REDACTION_PATTERNS.iter() {
        output = regex
            .replace_all(&output, |caps: &Captures| {
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .into_owned();
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_env_success() {
        unsafe {
            std::env::set_var("DEEPTREE_TEST_SECRET", "value");
        }
        let secret = require_env("DEEPTREE_TEST_SECRET").expect("secret should load");
        assert_eq!(secret.expose(), "value");
        assert_eq!(format!("{secret:?}"), "***redacted***");
    }

    #[test]
    fn require_env_missing() {
        unsafe {
            std::env::remove_var("DEEPTREE_TEST_SECRET_MISSING");
        }
        let err = require_env("DEEPTREE_TEST_SECRET_MISSING").unwrap_err();
        assert!(matches!(err, ResearchError::MissingSecret(_)));
    }

    #[test]
    fn redacts_known_credential_shapes() {
        let text = "GET /search?api_key=abc123&q=rust failed; Authorization: Bearer tok.en sk-ABCDEFGHIJKLMNOPQRST";
        let clean = redact_secrets(text);
        assert!(clean.contains("api_key=[REDACTED]&q=rust"), "{clean}");
        assert!(clean.contains("Bearer [REDACTED]"), "{clean}");
        assert!(!clean.contains("sk-ABCDEFGHIJKLMNOPQRST"), "{clean}");
    }
}
