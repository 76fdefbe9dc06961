use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_MAX_REQUESTS: usize = 4;

/// Process-level settings read from the environment. Engine settings come
/// from the TOML file resolved by `ConfigLoader`.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub listen_addr: SocketAddr,
    pub max_concurrent_requests: usize,
    pub config_path: Option<PathBuf>,
    /// Serve from the in-process stubs instead of the HTTP providers.
    pub offline: bool,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("DEEPTREE_API_ADDR")
            .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
            .parse()
            .context("invalid DEEPTREE_API_ADDR")?;

        let max_concurrent_requests = env::var("DEEPTREE_MAX_CONCURRENT_REQUESTS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_MAX_REQUESTS);

        let offline = env::var("DEEPTREE_OFFLINE")
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            listen_addr,
            max_concurrent_requests,
            config_path: env::var_os("DEEPTREE_CONFIG").map(PathBuf::from),
            offline,
        })
    }
}
