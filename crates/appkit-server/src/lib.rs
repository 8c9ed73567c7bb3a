//! HTTP surface of the AppKit streaming layer.
//!
//! Streams are served as Server-Sent Events. A client that drops its
//! connection can come back with `Last-Event-ID` and continue right after
//! the last event it saw, as long as that event is still buffered.

pub mod config;
pub mod error;
pub mod routes;
pub mod source;
mod transport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use appkit_stream::{Capability, OperationRegistry, StreamManager};
use appkit_types::{AppKitError, Result, StreamConfig};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use config::ServerConfig;
pub use error::ApiError;
pub use source::{StreamSource, TickerSource};

/// Shared application state accessible from Axum routes.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StreamManager>,
    pub operations: Arc<OperationRegistry>,
    /// Generator factory for streams started by POST.
    pub source: Capability<Arc<dyn StreamSource>>,
}

impl AppState {
    pub fn new(stream: StreamConfig, source: Capability<Arc<dyn StreamSource>>) -> Result<Self> {
        Ok(Self {
            manager: StreamManager::new(stream)?,
            operations: OperationRegistry::new(),
            source,
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let source = Capability::from_flag("demo_source", config.demo_source, || {
            Arc::new(TickerSource::default()) as Arc<dyn StreamSource>
        });
        Self::new(config.stream.clone(), source)
    }

    pub fn heartbeat(&self) -> Duration {
        self.manager.config().heartbeat_interval
    }

    /// Abort every stream, then end every open response.
    pub fn shutdown(&self) {
        self.manager.shutdown();
        self.operations.cancel_all();
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/stream/:stream_id",
            get(routes::resume)
                .post(routes::start_or_resume)
                .delete(routes::abort),
        )
        .route("/api/streams", get(routes::list))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, sweeping idle streams in the background.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sweeper = state.manager.spawn_sweeper();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("listening on http://{}", addr);
    }

    let app = create_app(state.clone());
    let signal_state = state.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Shutting down, closing open streams");
            signal_state.shutdown();
        })
        .await;

    state.shutdown();
    sweeper.abort();
    result.map_err(AppKitError::Io)
}
