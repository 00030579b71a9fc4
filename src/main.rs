use anyhow::Context;
use api_rest::AppState;
use api_shared::ApiKey;
use phistore_core::{RuntimeRole, StorageConfig, StorageManager, WorkspaceReaper};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for PHI Store on the storage-owner tier
///
/// Runs the storage service and the workspace reaper in one process. Both stop on Ctrl-C:
/// the service finishes in-flight requests and the reaper finishes its current pass.
///
/// # Environment Variables
/// - `PHISTORE_ROLE`: `storage-owner` (or `test` for local development)
/// - `PHISTORE_ADDR`: service address (default: "0.0.0.0:3000")
/// - `PHISTORE_API_KEY`: shared secret required of every caller
/// - `PHISTORE_SUBMISSION_DIR`, `PHISTORE_WORKSPACE_DIR`, `PHISTORE_LEDGER_DIR`: storage roots
/// - `PHISTORE_REAPER_INTERVAL_SECS`: seconds between reaper passes (default: 3600)
///
/// # Returns
/// * `Ok(())` - If the service and reaper run and shut down cleanly
/// * `Err(anyhow::Error)` - If startup fails or the server stops with an error
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("phistore_run=info".parse()?)
                .add_directive("phistore_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = StorageConfig::from_env()?;
    if config.role() == RuntimeRole::Edge {
        anyhow::bail!("phistore-run hosts the storage owner; the edge links phistore-core directly");
    }
    let api_key = ApiKey::new(
        config
            .api_key()
            .context("PHISTORE_API_KEY must be set for the storage service")?,
    )?;
    let addr = config.bind_addr.clone();

    let manager = Arc::new(StorageManager::new(config)?);
    for class in manager.classes() {
        let driver = manager.get_storage(class)?;
        if let Err(e) = driver.health().await {
            tracing::warn!(class = %class, "Storage class not writable at startup: {e}");
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);

    let reaper = WorkspaceReaper::new(Arc::clone(&manager));
    let mut reaper_stop = stop_rx;
    let reaper_task = tokio::spawn(async move {
        reaper
            .run(async move {
                let _ = reaper_stop.wait_for(|stop| *stop).await;
            })
            .await;
    });

    let app = api_rest::app(AppState { manager, api_key });
    tracing::info!("++ Starting PHI Store storage service on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    tracing::info!("-- Shutting down");
    let _ = stop_tx.send(true);
    reaper_task.await?;
    served?;

    Ok(())
}
