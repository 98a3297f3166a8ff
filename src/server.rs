use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    force_flush, get_stats, health_check, reset_rate_limits, submit_event, SharedState,
};
use crate::middleware::logging_middleware;

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        // Ingest endpoints
        .route("/events/:kind", post(submit_event))
        // Admin and monitoring endpoints
        .route("/admin/stats", get(get_stats))
        .route("/admin/flush", post(force_flush))
        .route("/admin/rate-limits/reset", post(reset_rate_limits))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    state: SharedState,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(state: SharedState, bind_addr: SocketAddr) -> Self {
        Self { state, bind_addr }
    }

    /// Serve until SIGINT/SIGTERM, then drain the pipeline before exit.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let app = create_app(self.state.clone());
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Coalescer server starting on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Stats available at /admin/stats");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        // The listener is closed; flush everything still buffered.
        self.state.pipeline.shutdown().await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
