//! Core Web Vitals polling.
//!
//! Uses PageSpeed Insights (mobile and desktop) when an API key is
//! configured, and falls back to a single timed GET otherwise or when
//! PageSpeed fails. The fallback estimates FCP as `ttfb + bytes / 1000`,
//! an approximation rather than a measured paint.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::CycleReport;
use crate::alert::AlertGate;
use crate::db::{MonitoredSite, Store, VitalsSource, WebVitalsRecord};
use crate::probe::{
    run_http_probe, PageSpeedClient, RemoteError, Strategy, StrategyReport, REQUEST_TIMEOUT,
};
use crate::registry::RegistryError;
use crate::scoring::{
    average_score, clamp_score, overall_status, round3, Metric, MetricValues, Rating,
};

#[derive(Clone)]
pub struct VitalsPoller {
    store: Arc<Store>,
    http: reqwest::Client,
    pagespeed: Option<PageSpeedClient>,
    alerts: AlertGate,
    delay: Duration,
}

fn ratings_json(ratings: &std::collections::BTreeMap<Metric, Rating>) -> serde_json::Value {
    ratings
        .iter()
        .map(|(m, r)| (m.as_str().to_string(), serde_json::Value::from(r.as_str())))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

/// Combine both strategy runs into one record.
fn pagespeed_record(
    site_id: i64,
    mobile: StrategyReport,
    desktop: StrategyReport,
    checked_at: DateTime<Utc>,
) -> WebVitalsRecord {
    let metrics = mobile.metrics.clone().or(&desktop.metrics);
    let ratings = metrics.ratings();
    let avg = average_score(&[mobile.score, desktop.score]);
    let opportunities = if mobile.opportunities.is_empty() {
        desktop.opportunities.clone()
    } else {
        mobile.opportunities.clone()
    };

    WebVitalsRecord {
        id: 0,
        site_id,
        source: VitalsSource::Pagespeed,
        mobile_score: mobile.score,
        desktop_score: desktop.score,
        overall_score: avg.map(clamp_score),
        lcp: metrics.lcp,
        fid: metrics.fid,
        inp: metrics.inp,
        cls: metrics.cls,
        ttfb: metrics.ttfb,
        fcp: metrics.fcp,
        ratings: ratings_json(&ratings),
        opportunities,
        details: serde_json::json!({
            "mobile": mobile,
            "desktop": desktop,
        }),
        status: overall_status(&ratings, avg),
        checked_at,
    }
}

impl VitalsPoller {
    pub fn new(
        store: Arc<Store>,
        http: reqwest::Client,
        pagespeed: Option<PageSpeedClient>,
        alerts: AlertGate,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            http,
            pagespeed,
            alerts,
            delay,
        }
    }

    /// Check every active or errored site one after another, pausing
    /// between sites to stay under PageSpeed's rate limit.
    pub async fn run_cycle(&self) -> CycleReport {
        let sites = match self.store.pollable_sites() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Web vitals check: failed to load sites: {}", e);
                return CycleReport::default();
            }
        };
        tracing::info!("Web vitals check starting for {} sites", sites.len());

        let mut report = CycleReport {
            checked: sites.len(),
            failed: 0,
        };
        for (i, site) in sites.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Err(e) = self.check_site(site).await {
                tracing::warn!("Web vitals check failed for {}: {}", site.site_url, e);
                report.failed += 1;
            }
        }

        tracing::info!(
            "Web vitals check finished: {} checked, {} failed",
            report.checked,
            report.failed
        );
        report
    }

    /// Measure one site, store the record and refresh its cached snapshot.
    /// A poor result alerts the account holder at most once per 24 hours.
    pub async fn check_site(&self, site: &MonitoredSite) -> Result<WebVitalsRecord, RegistryError> {
        let now = Utc::now();

        let measured = match &self.pagespeed {
            Some(client) => match Self::run_pagespeed(client, site, now).await {
                Ok(record) => Ok(record),
                Err(e) => {
                    tracing::warn!(
                        "PageSpeed failed for {}, using basic probe: {}",
                        site.site_url,
                        e
                    );
                    self.run_basic(site, now).await
                }
            },
            None => self.run_basic(site, now).await,
        };
        let mut record = measured?;

        record.id = self.store.add_webvitals(&record)?;
        self.store
            .set_site_webvitals(site.id, &serde_json::to_value(&record)?)?;

        if record.status == Rating::Poor {
            if let Err(e) = self.alerts.poor_webvitals(site, record.overall_score, now).await {
                tracing::error!("Failed to alert for site {}: {}", site.id, e);
            }
        }

        Ok(record)
    }

    async fn run_pagespeed(
        client: &PageSpeedClient,
        site: &MonitoredSite,
        now: DateTime<Utc>,
    ) -> Result<WebVitalsRecord, RemoteError> {
        let mobile = client.run(&site.site_url, Strategy::Mobile).await?;
        let desktop = client.run(&site.site_url, Strategy::Desktop).await?;
        Ok(pagespeed_record(site.id, mobile, desktop, now))
    }

    async fn run_basic(
        &self,
        site: &MonitoredSite,
        now: DateTime<Utc>,
    ) -> Result<WebVitalsRecord, RemoteError> {
        let timing = run_http_probe(&self.http, &site.site_url, REQUEST_TIMEOUT).await?;
        if !timing.is_up() {
            return Err(RemoteError::Api {
                status: timing.status,
                message: format!("site returned HTTP {}", timing.status),
            });
        }

        let ttfb = round3(timing.ttfb.as_secs_f64() * 1000.0);
        let fcp = round3(ttfb + timing.body_bytes as f64 / 1000.0);
        let metrics = MetricValues {
            ttfb: Some(ttfb),
            fcp: Some(fcp),
            ..Default::default()
        };
        let ratings = metrics.ratings();

        Ok(WebVitalsRecord {
            id: 0,
            site_id: site.id,
            source: VitalsSource::Basic,
            mobile_score: None,
            desktop_score: None,
            overall_score: None,
            lcp: None,
            fid: None,
            inp: None,
            cls: None,
            ttfb: Some(ttfb),
            fcp: Some(fcp),
            ratings: ratings_json(&ratings),
            opportunities: Vec::new(),
            details: serde_json::json!({
                "status_code": timing.status,
                "total_ms": round3(timing.total.as_secs_f64() * 1000.0),
                "html_bytes": timing.body_bytes,
                "fcp_estimated": true,
            }),
            status: overall_status(&ratings, None),
            checked_at: now,
        })
    }
}
