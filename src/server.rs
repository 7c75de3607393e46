use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatcher::Dispatcher;
use crate::handlers::{health_check, stats, translate, translate_segments, AppState};
use crate::middleware::logging_middleware;

pub fn create_app(dispatcher: AppState) -> Router {
    Router::new()
        .route("/v1/translate", post(translate))
        .route("/v1/translate/segments", post(translate_segments))
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .with_state(dispatcher)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_address: String,
}

impl Server {
    pub fn new(bind_address: impl Into<String>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            app: create_app(dispatcher),
            bind_address: bind_address.into(),
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;

        tracing::info!("Dispatcher listening on {}", self.bind_address);
        tracing::info!("Health check available at /health");

        axum::serve(listener, self.app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
