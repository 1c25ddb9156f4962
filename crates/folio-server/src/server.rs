use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use folio_engine::TurnOrchestrator;

use crate::handlers::{self, HandlerState};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Interval between SSE keep-alive comments on turn streams.
    pub keep_alive: Duration,
    /// Applies to every route except the turn stream.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9181,
            keep_alive: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<HandlerState>, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route("/v1/sessions/{id}", get(handlers::get_session))
        .route("/v1/sessions/{id}/history", get(handlers::get_history))
        .route("/v1/sessions/{id}/cancel", post(handlers::cancel_turn))
        .route("/health", get(handlers::health))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/v1/turns", post(handlers::create_turn))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns once the listener is bound.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<TurnOrchestrator>,
) -> Result<ServerHandle, std::io::Error> {
    let state = Arc::new(HandlerState::new(orchestrator, config.keep_alive));
    let router = build_router(state, config.request_timeout);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "folio server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task did not exit cleanly");
        }
    }
}
