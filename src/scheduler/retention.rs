//! Retention for time-series tables.

use crate::db::{DbError, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

pub const UPTIME_RETENTION_DAYS: i64 = 30;
pub const HEALTH_LOG_RETENTION_DAYS: i64 = 90;
pub const WEBVITALS_RETENTION_DAYS: i64 = 90;
pub const ANALYTICS_RETENTION_DAYS: i64 = 90;
pub const PLESK_LOG_RETENTION_DAYS: i64 = 90;

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    pub uptime: usize,
    pub health_log: usize,
    pub webvitals: usize,
    pub analytics: usize,
    pub plesk_log: usize,
    pub suppressions: usize,
}

impl RetentionReport {
    pub fn total(&self) -> usize {
        self.uptime
            + self.health_log
            + self.webvitals
            + self.analytics
            + self.plesk_log
            + self.suppressions
    }
}

/// Delete everything older than its table's retention window.
pub fn process_retention(store: &Store, now: DateTime<Utc>) -> Result<RetentionReport, DbError> {
    let days = |n: i64| now - ChronoDuration::days(n);

    let report = RetentionReport {
        uptime: store.delete_uptime_before(days(UPTIME_RETENTION_DAYS))?,
        health_log: store.delete_health_log_before(days(HEALTH_LOG_RETENTION_DAYS))?,
        webvitals: store.delete_webvitals_before(days(WEBVITALS_RETENTION_DAYS))?,
        analytics: store.delete_analytics_before(days(ANALYTICS_RETENTION_DAYS).date_naive())?,
        plesk_log: store.delete_plesk_logs_before(days(PLESK_LOG_RETENTION_DAYS))?,
        suppressions: store.delete_expired_suppressions(now)?,
    };

    if report.total() > 0 {
        tracing::info!("Retention removed {} rows: {:?}", report.total(), report);
    }
    Ok(report)
}
