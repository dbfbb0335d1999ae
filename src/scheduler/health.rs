//! Health and uptime polling for monitored sites.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::Method;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::CycleReport;
use crate::db::{HealthSnapshot, MonitoredSite, Store, UptimeRecord, UptimeStatus};
use crate::probe::{parse_health, parse_suite_info, run_http_probe, ConnectClient, REQUEST_TIMEOUT};
use crate::registry::{CredentialVault, RegistryError};

#[derive(Clone)]
pub struct HealthPoller {
    store: Arc<Store>,
    vault: CredentialVault,
    connect: ConnectClient,
    http: reqwest::Client,
    concurrency: usize,
}

impl HealthPoller {
    pub fn new(
        store: Arc<Store>,
        vault: CredentialVault,
        connect: ConnectClient,
        http: reqwest::Client,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            vault,
            connect,
            http,
            concurrency: concurrency.max(1),
        }
    }

    /// Poll `/health` on every active or errored site, at most
    /// `concurrency` at a time. One site failing never stops the batch.
    pub async fn run_health_cycle(&self) -> CycleReport {
        let sites = match self.store.pollable_sites() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Health check: failed to load sites: {}", e);
                return CycleReport::default();
            }
        };
        tracing::info!("Health check starting for {} sites", sites.len());

        let failed = AtomicUsize::new(0);
        let checked = sites.len();
        stream::iter(sites)
            .for_each_concurrent(self.concurrency, |site| {
                let failed = &failed;
                async move {
                    if let Err(e) = self.check_site_health(&site).await {
                        tracing::warn!("Health check failed for {}: {}", site.site_url, e);
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;

        let report = CycleReport {
            checked,
            failed: failed.into_inner(),
        };
        tracing::info!(
            "Health check finished: {} checked, {} failed",
            report.checked,
            report.failed
        );
        report
    }

    /// Fetch, store and log one site's health. A failure marks the site as
    /// errored and is logged before being returned.
    pub async fn check_site_health(
        &self,
        site: &MonitoredSite,
    ) -> Result<HealthSnapshot, RegistryError> {
        let now = Utc::now();

        let (snapshot, body, key) = match self.fetch_health(site, now).await {
            Ok(fetched) => fetched,
            Err(e) => {
                let message = e.to_string();
                self.store.mark_site_error(site.id, &message, now)?;
                self.store.add_health_log(
                    site.id,
                    "error",
                    None,
                    None,
                    &serde_json::json!({ "error": message, "code": e.code() }),
                    now,
                )?;
                return Err(e);
            }
        };

        self.store
            .record_site_health(site.id, &serde_json::to_value(&snapshot)?, now)?;
        if let Some(suite) = parse_suite_info(&body) {
            self.store
                .update_site_suite(site.id, suite.installed, suite.version.as_deref())?;
        }
        self.store.add_health_log(
            site.id,
            snapshot.status.as_str(),
            Some(snapshot.score),
            Some(snapshot.grade),
            &serde_json::Value::Object(snapshot.checks.clone()),
            now,
        )?;

        if let Err(e) = self.collect_stats(site, &key, now).await {
            tracing::debug!("No stats from {}: {}", site.site_url, e);
        }

        Ok(snapshot)
    }

    async fn fetch_health(
        &self,
        site: &MonitoredSite,
        now: DateTime<Utc>,
    ) -> Result<(HealthSnapshot, serde_json::Value, String), RegistryError> {
        let key = self.vault.site_key(site.id)?;
        let body = self
            .connect
            .request(&site.site_url, &key, "health", Method::GET, None)
            .await?;
        let snapshot = parse_health(&body, now)?;
        Ok((snapshot, body, key))
    }

    /// Best effort: today's analytics row from the site's `stats` endpoint.
    async fn collect_stats(
        &self,
        site: &MonitoredSite,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let stats = self
            .connect
            .request(&site.site_url, key, "stats", Method::GET, None)
            .await?;
        self.store.upsert_analytics(site.id, now.date_naive(), &stats, now)?;
        Ok(())
    }

    pub async fn run_uptime_cycle(&self) -> CycleReport {
        let sites = match self.store.pollable_sites() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Uptime check: failed to load sites: {}", e);
                return CycleReport::default();
            }
        };
        tracing::debug!("Uptime check starting for {} sites", sites.len());

        let down = AtomicUsize::new(0);
        let checked = sites.len();
        stream::iter(sites)
            .for_each_concurrent(self.concurrency, |site| {
                let down = &down;
                async move {
                    match self.check_site_uptime(&site).await {
                        Ok(record) if record.status == UptimeStatus::Up => {}
                        Ok(_) => {
                            down.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            tracing::error!(
                                "Uptime check: failed to store result for {}: {}",
                                site.site_url,
                                e
                            );
                            down.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;

        CycleReport {
            checked,
            failed: down.into_inner(),
        }
    }

    /// GET the site's front page and append an uptime record. Anything
    /// below HTTP 400 is up; transport failures are down.
    pub async fn check_site_uptime(
        &self,
        site: &MonitoredSite,
    ) -> Result<UptimeRecord, RegistryError> {
        let checked_at = Utc::now();

        let record = match run_http_probe(&self.http, &site.site_url, REQUEST_TIMEOUT).await {
            Ok(timing) => UptimeRecord {
                site_id: site.id,
                status: if timing.is_up() { UptimeStatus::Up } else { UptimeStatus::Down },
                response_time_ms: Some(timing.total.as_millis() as i64),
                status_code: Some(timing.status),
                checked_at,
            },
            Err(e) => {
                tracing::warn!("{} is unreachable: {}", site.site_url, e);
                UptimeRecord {
                    site_id: site.id,
                    status: UptimeStatus::Down,
                    response_time_ms: None,
                    status_code: None,
                    checked_at,
                }
            }
        };

        self.store.add_uptime(&record)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CredentialCipher, NewSite, TargetStatus};
    use crate::probe::mock_site::{self, MockSite, SITE_KEY};
    use crate::probe::test_server::serve;
    use crate::scoring::{Grade, HealthStatus};
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    struct Harness {
        _tmp: NamedTempFile,
        store: Arc<Store>,
        poller: HealthPoller,
        cipher: CredentialCipher,
    }

    fn harness() -> Harness {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let cipher = CredentialCipher::new("secret");
        let vault = CredentialVault::new(store.clone(), cipher.clone());
        let poller = HealthPoller::new(
            store.clone(),
            vault,
            ConnectClient::new(reqwest::Client::new()),
            reqwest::Client::new(),
            2,
        );
        Harness {
            _tmp: tmp,
            store,
            poller,
            cipher,
        }
    }

    fn add_site(h: &Harness, url: &str) -> MonitoredSite {
        let id = h
            .store
            .insert_site(&NewSite {
                user_id: 1,
                site_url: url.to_string(),
                url_key: url.trim_start_matches("http://").to_string(),
                site_name: url.to_string(),
                site_key_hash: "h".to_string(),
                sealed_key: h.cipher.seal(SITE_KEY).unwrap(),
                peanut_suite_installed: false,
                peanut_suite_version: None,
            })
            .unwrap();
        h.store.get_site(id).unwrap()
    }

    #[tokio::test]
    async fn test_health_check_records_snapshot() {
        let h = harness();
        let base = serve(mock_site::router(Arc::new(MockSite::default()))).await;
        let site = add_site(&h, &base);

        let snapshot = h.poller.check_site_health(&site).await.unwrap();
        assert_eq!(snapshot.score, 84);
        assert_eq!(snapshot.grade, Grade::B);
        assert_eq!(snapshot.status, HealthStatus::Healthy);

        let stored = h.store.get_site(site.id).unwrap();
        assert_eq!(stored.status, TargetStatus::Active);
        assert_eq!(stored.last_health.unwrap()["score"], 84);
        assert!(stored.peanut_suite_installed);
        assert_eq!(stored.peanut_suite_version.as_deref(), Some("2.5.0"));
        assert!(stored.last_check.is_some());

        let log = h.store.health_log(site.id, 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, "healthy");

        let analytics = h.store.analytics_days(site.id).unwrap();
        assert_eq!(analytics.len(), 1);
        assert_eq!(analytics[0].1["visitors"], 120);
    }

    #[tokio::test]
    async fn test_failure_marks_error_and_batch_continues() {
        let h = harness();
        let healthy = serve(mock_site::router(Arc::new(MockSite::default()))).await;
        let failing_mock = Arc::new(MockSite::default());
        failing_mock.failing.store(true, std::sync::atomic::Ordering::SeqCst);
        let failing = serve(mock_site::router(failing_mock)).await;

        let good = add_site(&h, &healthy);
        let bad = add_site(&h, &failing);
        let gone = add_site(&h, "http://127.0.0.1:1");

        let report = h.poller.run_health_cycle().await;
        assert_eq!(report, CycleReport { checked: 3, failed: 2 });

        assert_eq!(h.store.get_site(good.id).unwrap().status, TargetStatus::Active);
        for id in [bad.id, gone.id] {
            let site = h.store.get_site(id).unwrap();
            assert_eq!(site.status, TargetStatus::Error);
            assert!(site.last_health.unwrap()["error"].is_string());
            assert_eq!(h.store.health_log(id, 10).unwrap()[0].status, "error");
        }

        // Errored sites stay in rotation and recover on the next good poll.
        let unreachable = h.store.get_site(gone.id).unwrap();
        assert!(h.poller.check_site_health(&unreachable).await.is_err());
        let recovered = h.poller.check_site_health(&h.store.get_site(good.id).unwrap()).await;
        assert!(recovered.is_ok());
    }

    #[tokio::test]
    async fn test_uptime_cycle() {
        let h = harness();
        let base = serve(mock_site::router(Arc::new(MockSite::default()))).await;
        let up = add_site(&h, &base);
        let down = add_site(&h, "http://127.0.0.1:1");

        let report = h.poller.run_uptime_cycle().await;
        assert_eq!(report, CycleReport { checked: 2, failed: 1 });

        let since = Utc::now() - ChronoDuration::hours(1);
        let up_history = h.store.uptime_history(up.id, since).unwrap();
        assert_eq!(up_history[0].status, UptimeStatus::Up);
        assert_eq!(up_history[0].status_code, Some(200));

        let down_history = h.store.uptime_history(down.id, since).unwrap();
        assert_eq!(down_history[0].status, UptimeStatus::Down);
        assert_eq!(down_history[0].response_time_ms, None);
    }
}
