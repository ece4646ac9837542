//! Web server module.

mod error;
mod handlers;

pub use error::*;
pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
}

/// REST server for tag and alert management.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, store: Arc<Store>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/healthz", get(handlers::handle_healthz))
            // Tags
            .route("/api/plc-tags", get(handlers::handle_get_tags))
            .route("/api/plc-tags", post(handlers::handle_create_tag))
            .route("/api/plc-tags/bulk", post(handlers::handle_bulk_create_tags))
            .route("/api/plc-tags/{id}", put(handlers::handle_update_tag))
            .route("/api/plc-tags/{id}", delete(handlers::handle_delete_tag))
            .route("/api/plc-tags/{id}/history", get(handlers::handle_get_history))
            // Sites
            .route("/api/sites", get(handlers::handle_get_sites))
            .route("/api/sites", post(handlers::handle_create_site))
            .route("/api/sites/sync-from-ipc", post(handlers::handle_sync_from_ipc))
            .route("/api/sites/{id}", delete(handlers::handle_delete_site))
            // IPC inventory
            .route("/api/ipcs", get(handlers::handle_get_ipcs))
            .route("/api/ipcs", post(handlers::handle_create_ipc))
            .route("/api/ipcs/{id}", delete(handlers::handle_delete_ipc))
            // Alerts
            .route("/api/alerts", get(handlers::handle_get_alerts))
            .route("/api/alerts/{id}/read", post(handlers::handle_mark_alert_read))
            .route("/api/alerts/{id}/resolve", post(handlers::handle_resolve_alert))
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
