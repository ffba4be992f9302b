use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::config::AppConfig;
use crate::registry::Registry;
use crate::store::s3::S3Store;
use crate::store::ObjectStore;

mod api;
mod chunker;
mod config;
mod executor;
mod handler;
mod media;
mod pipeline;
mod registry;
mod store;
mod uploader;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Arc::new(AppConfig::from_env()?);
    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(&config.bucket)?);

    let cancel = CancellationToken::new();
    let state = AppState {
        registry: Arc::new(Registry::new()),
        store,
        config,
        shutdown: cancel.clone(),
    };

    let server = api::start_api_server(state.clone(), cancel.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupt received, shutting down");
                cancel.cancel();
            },
        }
    }

    // Drain running pipelines so no child processes outlive the server.
    for (id, pipeline) in state.registry.list().await {
        if let Err(err) = pipeline.stop().await {
            log::error!("pipeline {id} failed to stop during shutdown: {err:#}");
        }
        state.registry.remove(&id).await;
    }

    let _ = server.await;
    Ok(())
}
