//! Scheduler module for the periodic poll cycles.
//!
//! Each trigger runs on its own interval loop. Every loop listens on a
//! shared broadcast channel so `stop` ends them all.

mod health;
mod retention;
mod servers;
mod webvitals;

pub use health::*;
pub use retention::*;
pub use servers::*;
pub use webvitals::*;

use crate::db::Store;

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub checked: usize,
    pub failed: usize,
}

/// Named periodic jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    HealthCheck,
    UptimeCheck,
    WebVitalsCheck,
    ServerHealthCheck,
    Retention,
}

impl Trigger {
    pub const ALL: [Trigger; 5] = [
        Trigger::HealthCheck,
        Trigger::UptimeCheck,
        Trigger::WebVitalsCheck,
        Trigger::ServerHealthCheck,
        Trigger::Retention,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Trigger::HealthCheck => "peanut_monitor_health_check",
            Trigger::UptimeCheck => "peanut_monitor_uptime_check",
            Trigger::WebVitalsCheck => "peanut_monitor_webvitals_check",
            Trigger::ServerHealthCheck => "peanut_monitor_server_health_check",
            Trigger::Retention => "peanut_monitor_retention",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn interval(&self) -> Duration {
        match self {
            Trigger::HealthCheck | Trigger::ServerHealthCheck => Duration::from_secs(3600),
            Trigger::UptimeCheck => Duration::from_secs(300),
            Trigger::WebVitalsCheck | Trigger::Retention => Duration::from_secs(86400),
        }
    }
}

/// Result of running a trigger by hand.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TriggerOutcome {
    Cycle(CycleReport),
    Retention(RetentionReport),
}

/// Owns the pollers and drives them on their intervals.
pub struct Scheduler {
    store: Arc<Store>,
    health: HealthPoller,
    vitals: VitalsPoller,
    servers: ServerPoller,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        health: HealthPoller,
        vitals: VitalsPoller,
        servers: ServerPoller,
    ) -> Self {
        Self {
            store,
            health,
            vitals,
            servers,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    pub fn health(&self) -> &HealthPoller {
        &self.health
    }

    pub fn vitals(&self) -> &VitalsPoller {
        &self.vitals
    }

    pub fn servers(&self) -> &ServerPoller {
        &self.servers
    }

    /// Spawn one loop per trigger. Calling `start` twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut stop = self.stop.lock().await;
        if stop.is_some() {
            return;
        }
        let (tx, _) = broadcast::channel(1);

        for trigger in Trigger::ALL {
            let scheduler = self.clone();
            let mut stop_rx = tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(trigger.interval());
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick fires immediately; let the service settle first.
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        _ = interval.tick() => {
                            scheduler.run_trigger(trigger).await;
                        }
                    }
                }
                tracing::debug!("Scheduler: {} loop stopped", trigger.name());
            });
        }

        *stop = Some(tx);
        tracing::info!("Scheduler started with {} triggers", Trigger::ALL.len());
    }

    /// Stop all trigger loops. Cycles already running finish first.
    pub async fn stop(&self) {
        let mut stop = self.stop.lock().await;
        if let Some(tx) = stop.take() {
            let _ = tx.send(());
        }
    }

    /// Run one trigger to completion.
    pub async fn run_trigger(&self, trigger: Trigger) -> TriggerOutcome {
        tracing::debug!("Running {}", trigger.name());
        match trigger {
            Trigger::HealthCheck => TriggerOutcome::Cycle(self.health.run_health_cycle().await),
            Trigger::UptimeCheck => TriggerOutcome::Cycle(self.health.run_uptime_cycle().await),
            Trigger::WebVitalsCheck => TriggerOutcome::Cycle(self.vitals.run_cycle().await),
            Trigger::ServerHealthCheck => TriggerOutcome::Cycle(self.servers.run_cycle().await),
            Trigger::Retention => {
                let store = self.store.clone();
                let result =
                    tokio::task::spawn_blocking(move || process_retention(&store, Utc::now()))
                        .await;
                match result {
                    Ok(Ok(report)) => TriggerOutcome::Retention(report),
                    Ok(Err(e)) => {
                        tracing::error!("Retention failed: {}", e);
                        TriggerOutcome::Retention(RetentionReport::default())
                    }
                    Err(e) => {
                        tracing::error!("Retention task panicked: {}", e);
                        TriggerOutcome::Retention(RetentionReport::default())
                    }
                }
            }
        }
    }
}
