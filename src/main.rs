//! Peanut Monitor - WordPress site and Plesk server monitoring service.

mod alert;
mod config;
mod db;
mod probe;
mod registry;
mod scheduler;
mod scoring;
mod web;

use alert::{AlertGate, AlertSender, LogSender, WebhookSender};
use config::ServerConfig;
use db::{CredentialCipher, Store};
use probe::{ConnectClient, PageSpeedClient, PleskClient};
use registry::{CredentialVault, ServerRegistry, SiteRegistry};
use scheduler::{HealthPoller, Scheduler, ServerPoller, VitalsPoller};
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("peanut_monitor=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Peanut Monitor on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    if cfg.secret.is_empty() {
        tracing::warn!(
            "PEANUT_MONITOR_SECRET is not set; stored credentials are sealed with an empty secret"
        );
    }

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");
    let vault = CredentialVault::new(store.clone(), CredentialCipher::new(&cfg.secret));

    // Outbound clients; each call sets its own timeout
    let http = reqwest::Client::builder()
        .user_agent(concat!("peanut-monitor/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let plesk_http = reqwest::Client::builder()
        .danger_accept_invalid_certs(cfg.plesk_accept_invalid_certs)
        .build()?;

    let connect = ConnectClient::new(http.clone());
    let plesk = PleskClient::new(plesk_http);
    let pagespeed = match &cfg.pagespeed_api_key {
        Some(key) => Some(PageSpeedClient::new(http.clone(), &cfg.pagespeed_endpoint, key)),
        None => {
            tracing::info!("No PageSpeed API key configured, web vitals use the basic probe");
            None
        }
    };

    let sender: Arc<dyn AlertSender> = match &cfg.alert_webhook {
        Some(url) => Arc::new(WebhookSender::new(http.clone(), url)),
        None => Arc::new(LogSender),
    };
    let alerts = AlertGate::new(store.clone(), sender);

    // Create scheduler
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        HealthPoller::new(
            store.clone(),
            vault.clone(),
            connect.clone(),
            http.clone(),
            cfg.poll_concurrency,
        ),
        VitalsPoller::new(store.clone(), http, pagespeed, alerts, cfg.rate_limit_delay),
        ServerPoller::new(store.clone(), vault.clone(), plesk.clone(), cfg.rate_limit_delay),
    ));

    // Start scheduler
    scheduler.start().await;

    // Start web server
    let state = AppState {
        sites: SiteRegistry::new(store.clone(), vault.clone(), connect, cfg.site_quota),
        servers: ServerRegistry::new(store.clone(), vault, plesk),
        config: cfg,
        store,
        scheduler: scheduler.clone(),
    };
    let result = Server::new(state).start().await;

    scheduler.stop().await;
    result
}
