use anyhow::{Context, Result};
use deeptree_api::{ApiConfig, AppState, build_router};
use deeptree_core::{ConfigLoader, TelemetryOptions, init_metrics_from_env, init_telemetry};
use tokio::{net::TcpListener, signal};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let api = ApiConfig::from_env()?;
    let config = ConfigLoader::load(api.config_path.clone())
        .context("failed to load DeepTree configuration")?;
    init_telemetry(TelemetryOptions::from_logging(&config.logging))?;
    init_metrics_from_env("deeptree-api");

    let state = AppState::try_new(&api, &config)?;
    let app = build_router(state);

    let listener = TcpListener::bind(api.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", api.listen_addr))?;
    info!(
        addr = %api.listen_addr,
        max_concurrent_requests = api.max_concurrent_requests,
        offline = api.offline,
        "DeepTree API listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping server");
}
