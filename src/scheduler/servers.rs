//! Scheduled full health checks for Plesk servers.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::CycleReport;
use crate::db::{PleskServer, Store};
use crate::probe::{PleskClient, PleskTarget};
use crate::registry::{CredentialVault, RegistryError};
use crate::scoring::{evaluate_full, PleskHealth};

#[derive(Clone)]
pub struct ServerPoller {
    store: Arc<Store>,
    vault: CredentialVault,
    plesk: PleskClient,
    delay: Duration,
}

impl ServerPoller {
    pub fn new(
        store: Arc<Store>,
        vault: CredentialVault,
        plesk: PleskClient,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            vault,
            plesk,
            delay,
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let servers = match self.store.pollable_servers() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Server health check: failed to load servers: {}", e);
                return CycleReport::default();
            }
        };
        tracing::info!("Server health check starting for {} servers", servers.len());

        let mut report = CycleReport {
            checked: servers.len(),
            failed: 0,
        };
        for (i, server) in servers.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Err(e) = self.check_server(server).await {
                tracing::warn!("Server health check failed for {}: {}", server.host, e);
                report.failed += 1;
            }
        }
        report
    }

    /// Run the full fetch sequence and score it. Any failure sets the
    /// server to `error` and is returned.
    pub async fn check_server(&self, server: &PleskServer) -> Result<PleskHealth, RegistryError> {
        let now = Utc::now();

        let collected = match self.vault.server_key(server.id) {
            Ok(key) => {
                let target = PleskTarget {
                    host: &server.host,
                    port: server.port,
                    api_key: &key,
                };
                self.plesk.collect(&target).await.map_err(RegistryError::from)
            }
            Err(e) => Err(e),
        };

        match collected {
            Ok((info, metrics)) => {
                let health = evaluate_full(&metrics, now);
                self.store.record_server_health(
                    server.id,
                    &health,
                    info.plesk_version.as_deref(),
                    info.os_info.as_deref(),
                )?;
                Ok(health)
            }
            Err(e) => {
                self.store.mark_server_error(server.id, &e.to_string(), now)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CredentialCipher, NewServer, TargetStatus};
    use crate::probe::mock_panel;
    use crate::probe::test_server::serve;
    use crate::scoring::{Grade, HealthStatus, ScoreFormula};
    use tempfile::NamedTempFile;

    fn add_server(store: &Store, cipher: &CredentialCipher, base: &str, key: &str) -> PleskServer {
        let (host, port) = base.trim_start_matches("http://").split_once(':').unwrap();
        let id = store
            .insert_server(&NewServer {
                user_id: 1,
                name: "panel".to_string(),
                host: host.to_string(),
                port: port.parse().unwrap(),
                sealed_key: cipher.seal(key).unwrap(),
                plesk_version: None,
                os_info: None,
                last_health: serde_json::json!({}),
            })
            .unwrap();
        store.get_server(id).unwrap()
    }

    fn poller(store: &Arc<Store>, cipher: &CredentialCipher) -> ServerPoller {
        ServerPoller::new(
            store.clone(),
            CredentialVault::new(store.clone(), cipher.clone()),
            PleskClient::new(reqwest::Client::new()).insecure_http(),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn test_full_check_scores_cpu_critical() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let cipher = CredentialCipher::new("secret");
        let base = serve(mock_panel::panel(95.0)).await;
        let server = add_server(&store, &cipher, &base, "plesk-key");

        let health = poller(&store, &cipher).check_server(&server).await.unwrap();
        assert_eq!(health.formula, ScoreFormula::Full);
        assert_eq!(health.score, 85);
        assert_eq!(health.grade, Grade::B);
        assert_eq!(health.status, HealthStatus::Healthy);

        let stored = store.get_server(server.id).unwrap();
        assert_eq!(stored.status, TargetStatus::Active);
        assert_eq!(stored.plesk_version.as_deref(), Some("18.0.61"));
        assert_eq!(stored.os_info.as_deref(), Some("Ubuntu 22.04"));
        assert_eq!(store.plesk_history(server.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_marks_error_without_log_row() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let cipher = CredentialCipher::new("secret");
        let base = serve(mock_panel::panel(10.0)).await;
        let bad_key = add_server(&store, &cipher, &base, "stale-key");

        let report = poller(&store, &cipher).run_cycle().await;
        assert_eq!(report, CycleReport { checked: 1, failed: 1 });

        let stored = store.get_server(bad_key.id).unwrap();
        assert_eq!(stored.status, TargetStatus::Error);
        assert!(stored.last_health.unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("authentication failed"));
        assert!(store.plesk_history(bad_key.id, 10).unwrap().is_empty());
    }
}
