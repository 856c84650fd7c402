use anyhow::Result;
use log::{error, info, warn};
use rtls_pipeline::api::RestApi;
use rtls_pipeline::config::{self, StoreBackend, CONFIG_ENV_VAR};
use rtls_pipeline::db::Database;
use rtls_pipeline::dispatcher::HttpTransport;
use rtls_pipeline::messaging::create_message_broker;
use rtls_pipeline::{MemoryStore, Pipeline, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
        .map(PathBuf::from)
}

async fn run_app() -> Result<()> {
    let config = config::load_config(config_path().as_deref())?;

    // RUST_LOG wins over the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.api.log_level.as_str()),
    )
    .init();
    info!("Starting RTLS telemetry pipeline");

    config.validate()?;
    info!("Configuration loaded");

    let store: Arc<dyn Store> = match config.database.backend {
        StoreBackend::Postgres => {
            let database = Database::connect(&config.database).await?;
            Arc::new(database.store())
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let message_broker = create_message_broker(config.message_broker.clone())?;
    info!("Message broker initialized");

    let transport = Arc::new(HttpTransport::new(Duration::from_millis(
        config.dispatcher.request_timeout_ms,
    ))?);

    let pipeline = Pipeline::new(config.clone(), store, transport, Some(message_broker))?;
    pipeline.start().await?;

    let http_server = RestApi::new(&config.api, pipeline.clone())?;
    let http_cancel = CancellationToken::new();
    let server_cancel = http_cancel.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(server_cancel).await {
            error!("API server failed: {}", e);
        }
    });
    info!("API server started");

    // Wait for termination signals
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    http_cancel.cancel();
    let _ = http_task.await;

    pipeline.shutdown().await?;
    info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run_app().await {
        eprintln!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
