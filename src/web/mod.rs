//! Web server module.

mod handlers;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::registry::{ServerRegistry, SiteRegistry};
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
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
    pub sites: SiteRegistry,
    pub servers: ServerRegistry,
    pub scheduler: Arc<Scheduler>,
}

/// Build the API router over `state`.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Sites
        .route(
            "/api/sites",
            get(handlers::handle_list_sites).post(handlers::handle_create_site),
        )
        .route("/api/sites/quota", get(handlers::handle_site_quota))
        .route(
            "/api/sites/{id}",
            get(handlers::handle_get_site).delete(handlers::handle_delete_site),
        )
        .route("/api/sites/{id}/check", post(handlers::handle_check_site))
        .route("/api/sites/{id}/uptime", get(handlers::handle_site_uptime))
        .route("/api/sites/{id}/health-log", get(handlers::handle_site_health_log))
        .route(
            "/api/sites/{id}/webvitals",
            get(handlers::handle_site_webvitals).post(handlers::handle_run_webvitals),
        )
        .route("/api/sites/{id}/analytics", get(handlers::handle_site_analytics))
        // Accounts
        .route(
            "/api/account",
            get(handlers::handle_get_account).post(handlers::handle_create_account),
        )
        .route("/api/account/members", post(handlers::handle_add_account_member))
        // Plesk servers
        .route(
            "/api/servers",
            get(handlers::handle_list_servers).post(handlers::handle_create_server),
        )
        .route(
            "/api/servers/{id}",
            get(handlers::handle_get_server).delete(handlers::handle_delete_server),
        )
        .route("/api/servers/{id}/check", post(handlers::handle_check_server))
        .route("/api/servers/{id}/history", get(handlers::handle_server_history))
        // Manual trigger runs
        .route("/api/triggers/{name}", post(handlers::handle_run_trigger))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}

/// Web server for Peanut Monitor.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = router(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
