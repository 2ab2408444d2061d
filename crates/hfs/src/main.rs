//! Helios FHIR Server (HFS)
//!
//! Document-store host: prepares the database and collections, then runs the
//! background reindex worker until interrupted.

mod config;

use std::sync::Arc;

use clap::Parser;
use helios_docstore::StoreInitializer;
use helios_docstore::backends::InMemoryDocumentClient;
use helios_docstore::definition::CompartmentDefinitionManager;
use helios_docstore::reindex::{CompartmentIndexer, ReindexJobWorker};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ServerConfig;

/// Initializes the tracing subscriber. `RUST_LOG` takes precedence over
/// `level`.
fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("helios_docstore={},hfs={}", level, level)));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_logging(&config.log_level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    let store_config = config.data_store_config()?;
    let reindex_config = config.reindex_config();
    reindex_config.validate()?;

    info!(
        host = %store_config.host,
        database = %store_config.database_id,
        reindex_enabled = reindex_config.enabled,
        "Starting Helios FHIR Server"
    );
    warn!("No remote store driver is linked; using the in-memory document store");

    let lock_config = store_config.lock.clone();
    let initializer =
        StoreInitializer::new(Arc::new(InMemoryDocumentClient::new()), store_config);
    let ready = initializer.initialize().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = if reindex_config.enabled {
        let definitions = Arc::new(CompartmentDefinitionManager::load_bundled()?);
        let worker = ReindexJobWorker::new(
            ready.resource_store.clone(),
            Arc::new(CompartmentIndexer::new(definitions)),
            reindex_config,
            lock_config,
        );
        Some(tokio::spawn(async move { worker.run(shutdown_rx).await }))
    } else {
        info!("Reindex worker disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Some(handle) = worker {
        handle.await?;
    }
    info!("Helios FHIR Server stopped");
    Ok(())
}
