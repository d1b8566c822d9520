//! `dispatch` service binary
//!
//! Reference wiring: the results and notification servers run against an
//! in-process `InMemoryTransport`, so only code inside this process can
//! publish to them. A deployment against a real broker supplies its own
//! `Transport` implementation to `AppState::new`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dispatch::config::Config;
use dispatch::server::{spawn_notification_server, spawn_results_server};
use dispatch::store::Store;
use dispatch::transport::InMemoryTransport;
use dispatch::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "dispatch=debug".into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!(server_id = %config.server_id, "dispatch starting");

    let store = Store::connect(&config.database_url).await?;
    store.migrate().await?;

    let transport = Arc::new(InMemoryTransport::new(config.receive_poll));
    let state = AppState::new(config, store, transport);

    let cancel = CancellationToken::new();
    let results = spawn_results_server(state.clone(), cancel.clone());
    let notifications = spawn_notification_server(state.clone(), cancel.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();

    for (name, handle) in [("results", results), ("notifications", notifications)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(server = name, error = %e, "Server exited with error"),
            Err(e) => tracing::error!(server = name, error = %e, "Server task panicked"),
        }
    }

    info!("dispatch stopped");
    Ok(())
}
