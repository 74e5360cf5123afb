use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{api, config::Config, housekeeping::Janitor};

/// Start the janitor and the HTTP server, and run until Ctrl+C.
pub async fn run(cfg: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let state = api::AppState::new(cfg, shutdown.clone()).await?;
    info!(
        dirs = ?state.config.watched_dirs(),
        retention_secs = state.config.janitor.retention.as_secs(),
        interval_secs = state.config.janitor.scan_interval.as_secs(),
        "starting janitor"
    );
    let janitor = Janitor::from_config(&state.config, state.leases.clone()).spawn(shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl+C"),
        }
    });

    let res = api::run_http_server(state).await;
    shutdown.cancel();
    if let Err(e) = janitor.await {
        warn!(error = %e, "janitor task ended abnormally");
    }
    res
}
