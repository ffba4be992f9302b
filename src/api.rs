use std::sync::Arc;

use axum::http::StatusCode;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::handler::recording::recording_router;
use crate::registry::Registry;
use crate::store::ObjectStore;

/// Dependencies handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn ObjectStore>,
    pub config: Arc<AppConfig>,
    /// Server-wide shutdown scope; pipelines derive their tokens from it.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(recording_router())
        .fallback(not_found)
        .with_state(state)
}

pub fn start_api_server(state: AppState, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let port = state.config.port;
        let app = router(state);

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                log::error!("failed to bind API server on port {port}: {err}");
                cancel.cancel();
                return;
            }
        };

        log::info!("API server started on port {port}");
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("API server error: {err}");
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down API server");
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Resource not found")
}
