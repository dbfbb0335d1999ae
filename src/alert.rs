//! Alert delivery.
//!
//! Poor web vitals results raise an alert for the site's account holder.
//! [`AlertGate`] de-duplicates per site for 24 hours; delivery goes through
//! an [`AlertSender`] (webhook when configured, log otherwise).

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{DbError, MonitoredSite, Store};

/// Hours during which a repeated alert for the same site is dropped.
pub const ALERT_SUPPRESSION_HOURS: i64 = 24;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub site_id: i64,
    pub recipient: Option<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// POSTs each alert as JSON.
pub struct WebhookSender {
    http: reqwest::Client,
    url: String,
}

impl WebhookSender {
    pub fn new(http: reqwest::Client, url: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl AlertSender for WebhookSender {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self
            .http
            .post(&self.url)
            .json(alert)
            .timeout(WEBHOOK_TIMEOUT)
            .send()
            .await
            .map_err(|e| AlertError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AlertError::Delivery(format!(
                "webhook returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Writes alerts to the log. Used when no webhook is configured.
pub struct LogSender;

#[async_trait]
impl AlertSender for LogSender {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        tracing::warn!(
            site_id = alert.site_id,
            recipient = alert.recipient.as_deref().unwrap_or("-"),
            "{}: {}",
            alert.subject,
            alert.body
        );
        Ok(())
    }
}

/// Sends at most one web vitals alert per site per suppression window.
#[derive(Clone)]
pub struct AlertGate {
    store: Arc<Store>,
    sender: Arc<dyn AlertSender>,
}

impl AlertGate {
    pub fn new(store: Arc<Store>, sender: Arc<dyn AlertSender>) -> Self {
        Self { store, sender }
    }

    fn suppression_key(site_id: i64) -> String {
        format!("site:{}:webvitals", site_id)
    }

    /// Alert that `site` scored poorly. Returns whether an alert went out;
    /// `false` means one was already sent inside the window. A failed
    /// delivery releases the window again.
    pub async fn poor_webvitals(
        &self,
        site: &MonitoredSite,
        overall_score: Option<u8>,
        now: DateTime<Utc>,
    ) -> Result<bool, AlertError> {
        let score = overall_score.map_or_else(|| "n/a".to_string(), |s| s.to_string());
        let alert = Alert {
            site_id: site.id,
            recipient: self.store.account_email_for_user(site.user_id)?,
            subject: format!("Poor Core Web Vitals on {}", site.site_name),
            body: format!(
                "{} ({}) was rated poor in its latest performance check. Overall score: {}.",
                site.site_name, site.site_url, score
            ),
        };

        let key = Self::suppression_key(site.id);
        let until = now + ChronoDuration::hours(ALERT_SUPPRESSION_HOURS);
        if !self.store.claim_alert(&key, now, until)? {
            tracing::debug!("Alert for site {} suppressed", site.id);
            return Ok(false);
        }

        // A failed delivery must not use up the window.
        if let Err(e) = self.sender.send(&alert).await {
            self.store.release_alert(&key)?;
            return Err(e);
        }
        tracing::info!("Sent web vitals alert for site {}", site.id);
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every alert it is asked to send.
    #[derive(Default)]
    pub struct RecordingSender {
        pub sent: Mutex<Vec<Alert>>,
    }

    impl RecordingSender {
        pub fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AlertSender for RecordingSender {
        async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
            self.sent.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }
}
