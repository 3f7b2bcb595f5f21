//! Read-only JSON surface for dashboards and health checks.

mod handlers;

use crate::cache::TtlCache;
use crate::collector::Supervisor;
use crate::config::GlobalConfig;
use crate::db::Store;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: GlobalConfig,
    pub store: Arc<Store>,
    pub supervisor: Arc<Supervisor>,
    pub cache: Arc<TtlCache<serde_json::Value>>,
}

/// HTTP server exposing the query and status endpoints.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: GlobalConfig, store: Arc<Store>, supervisor: Arc<Supervisor>) -> Self {
        let cache = Arc::new(TtlCache::new(Duration::from_secs(
            config.cache_ttl_seconds,
        )));
        Self {
            state: AppState {
                config,
                store,
                supervisor,
                cache,
            },
        }
    }

    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/health", get(handlers::handle_health))
            .route("/api/status", get(handlers::handle_status))
            .route("/api/targets", get(handlers::handle_targets))
            .route("/api/metrics", get(handlers::handle_metrics))
            .route("/api/metrics/batch", get(handlers::handle_metrics_batch))
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown future resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
