//! Standalone storage service binary.
//!
//! ## Purpose
//! Runs the storage service on its own, without the reaper.
//!
//! ## Intended use
//! Useful for development and for deployments that run the reaper elsewhere. The workspace's
//! main `phistore-run` binary runs the service and the reaper together.

use anyhow::Context;
use api_shared::ApiKey;
use phistore_core::{RuntimeRole, StorageConfig, StorageManager};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::AppState;

/// Main entry point for the storage service.
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - the configuration is invalid or names the edge role,
/// - no API key is configured,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?)
                .add_directive("phistore_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = StorageConfig::from_env()?;
    if config.role() == RuntimeRole::Edge {
        anyhow::bail!("the storage service cannot run in the edge role");
    }
    let api_key = ApiKey::new(
        config
            .api_key()
            .context("PHISTORE_API_KEY must be set for the storage service")?,
    )?;
    let addr = config.bind_addr.clone();

    let manager = Arc::new(StorageManager::new(config)?);
    let app = api_rest::app(AppState { manager, api_key });

    tracing::info!("-- Starting PHI Store storage service on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
