//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scoring::{Grade, HealthStatus, Opportunity, VitalsStatus};

/// Lifecycle status of a monitored site or Plesk server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Active,
    Error,
    Disconnected,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Active => "active",
            TargetStatus::Error => "error",
            TargetStatus::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TargetStatus::Active),
            "error" => Some(TargetStatus::Error),
            "disconnected" => Some(TargetStatus::Disconnected),
            _ => None,
        }
    }
}

/// A remote WordPress installation. Never carries its site key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredSite {
    pub id: i64,
    pub user_id: i64,
    pub site_url: String,
    pub site_name: String,
    pub status: TargetStatus,
    pub peanut_suite_installed: bool,
    pub peanut_suite_version: Option<String>,
    pub last_health: Option<serde_json::Value>,
    pub last_webvitals: Option<serde_json::Value>,
    pub last_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a verified site.
#[derive(Debug, Clone)]
pub struct NewSite {
    pub user_id: i64,
    pub site_url: String,
    pub url_key: String,
    pub site_name: String,
    pub site_key_hash: String,
    pub sealed_key: String,
    pub peanut_suite_installed: bool,
    pub peanut_suite_version: Option<String>,
}

/// Filters for listing sites.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteFilter {
    pub status: Option<TargetStatus>,
    pub health: Option<HealthStatus>,
    pub search: Option<String>,
}

/// A health snapshot as stored in `last_health` and the health log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub score: u8,
    pub grade: Grade,
    pub status: HealthStatus,
    #[serde(default)]
    pub checks: serde_json::Map<String, serde_json::Value>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthLogEntry {
    pub id: i64,
    pub site_id: i64,
    pub status: String,
    pub score: Option<u8>,
    pub grade: Option<String>,
    pub checks: serde_json::Value,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UptimeStatus {
    Up,
    Down,
}

impl UptimeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UptimeStatus::Up => "up",
            UptimeStatus::Down => "down",
        }
    }
}

/// One uptime probe result.
#[derive(Debug, Clone, Serialize)]
pub struct UptimeRecord {
    pub site_id: i64,
    pub status: UptimeStatus,
    pub response_time_ms: Option<i64>,
    pub status_code: Option<u16>,
    pub checked_at: DateTime<Utc>,
}

/// Aggregate of uptime records over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UptimeSummary {
    pub checks: i64,
    pub up: i64,
    pub uptime_percent: Option<f64>,
    pub avg_response_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VitalsSource {
    Pagespeed,
    Basic,
}

impl VitalsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VitalsSource::Pagespeed => "pagespeed",
            VitalsSource::Basic => "basic",
        }
    }
}

/// One web vitals check. Flat metric values come from the mobile run when
/// available, desktop otherwise; `details` holds both strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebVitalsRecord {
    pub id: i64,
    pub site_id: i64,
    pub source: VitalsSource,
    pub mobile_score: Option<u8>,
    pub desktop_score: Option<u8>,
    pub overall_score: Option<u8>,
    pub lcp: Option<f64>,
    pub fid: Option<f64>,
    pub inp: Option<f64>,
    pub cls: Option<f64>,
    pub ttfb: Option<f64>,
    pub fcp: Option<f64>,
    pub ratings: serde_json::Value,
    pub opportunities: Vec<Opportunity>,
    pub details: serde_json::Value,
    pub status: VitalsStatus,
    pub checked_at: DateTime<Utc>,
}

/// A Plesk hosting panel. Never carries its API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PleskServer {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: TargetStatus,
    pub plesk_version: Option<String>,
    pub os_info: Option<String>,
    pub last_health: Option<serde_json::Value>,
    pub last_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub user_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub sealed_key: String,
    pub plesk_version: Option<String>,
    pub os_info: Option<String>,
    pub last_health: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PleskHealthLogEntry {
    pub id: i64,
    pub server_id: i64,
    pub status: String,
    pub score: u8,
    pub grade: String,
    pub checks: serde_json::Value,
    pub checked_at: DateTime<Utc>,
}
