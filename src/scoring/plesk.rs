//! Plesk server health scoring.
//!
//! Two formulas exist. The full formula deducts points from 100 across seven
//! checks whose weights sum to 100. The quick formula only looks at CPU, RAM
//! and disk and is used when a server is first registered. Every result
//! records which formula produced it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::{clamp_score, grade_for, status_for, Grade, HealthStatus};

pub const WEIGHT_CPU: f64 = 15.0;
pub const WEIGHT_RAM: f64 = 15.0;
pub const WEIGHT_DISK: f64 = 20.0;
pub const WEIGHT_SERVICES: f64 = 20.0;
pub const WEIGHT_SSL: f64 = 15.0;
pub const WEIGHT_LOAD: f64 = 10.0;
pub const WEIGHT_UPDATES: f64 = 5.0;

const QUICK_WEIGHT_CPU: f64 = 30.0;
const QUICK_WEIGHT_RAM: f64 = 30.0;
const QUICK_WEIGHT_DISK: f64 = 40.0;

/// Points deducted per stopped critical service.
pub const SERVICE_DOWN_PENALTY: f64 = 5.0;
/// Certificates expiring within this many days count as a warning.
pub const SSL_WARNING_DAYS: i64 = 14;

/// Warning and critical cutoffs for a resource metric.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
}

pub const PERCENT_THRESHOLDS: Thresholds = Thresholds { warning: 80.0, critical: 90.0 };
pub const LOAD_THRESHOLDS: Thresholds = Thresholds { warning: 5.0, critical: 10.0 };

static CRITICAL_SERVICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(apache2?|httpd|nginx|mysqld?|mariadb|postgresql|php[0-9.]*-fpm|named|bind9?|dovecot|postfix|fail2ban|sshd?)\b",
    )
    .expect("critical service pattern is valid")
});

/// Whether a service name belongs to the critical allowlist.
pub fn is_critical_service(name: &str) -> bool {
    CRITICAL_SERVICE.is_match(name)
}

/// Which scoring formula produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreFormula {
    Full,
    Quick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
    Unknown,
}

/// Outcome of one scored check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub weight: f64,
    pub deduction: f64,
    pub value: serde_json::Value,
    pub message: String,
}

/// Service state as reported by the panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub name: String,
    pub running: bool,
}

/// A domain's certificate expiry, when known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub domain: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything the full check needs from one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub cpu_usage: Option<f64>,
    pub ram_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub load_average: Option<f64>,
    pub services: Vec<ServiceState>,
    pub certificates: Vec<CertificateInfo>,
    pub update_available: bool,
}

/// A scored Plesk health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PleskHealth {
    pub score: u8,
    pub grade: Grade,
    pub status: HealthStatus,
    pub formula: ScoreFormula,
    pub checks: BTreeMap<String, CheckResult>,
    pub checked_at: DateTime<Utc>,
}

impl PleskHealth {
    fn from_checks(
        checks: BTreeMap<String, CheckResult>,
        formula: ScoreFormula,
        now: DateTime<Utc>,
    ) -> Self {
        let total: f64 = checks.values().map(|c| c.deduction).sum();
        let score = clamp_score(100.0 - total);
        Self {
            score,
            grade: grade_for(score),
            status: status_for(score),
            formula,
            checks,
            checked_at: now,
        }
    }
}

/// Full weight at or above critical, half weight at or above warning.
fn resource_check(value: Option<f64>, weight: f64, t: Thresholds, unit: &str) -> CheckResult {
    let Some(v) = value else {
        return CheckResult {
            status: CheckStatus::Unknown,
            weight,
            deduction: 0.0,
            value: serde_json::Value::Null,
            message: "not reported".to_string(),
        };
    };

    let (status, deduction) = if v >= t.critical {
        (CheckStatus::Critical, weight)
    } else if v >= t.warning {
        (CheckStatus::Warning, weight / 2.0)
    } else {
        (CheckStatus::Ok, 0.0)
    };

    CheckResult {
        status,
        weight,
        deduction,
        value: serde_json::json!(v),
        message: format!("{:.2}{}", v, unit),
    }
}

fn services_check(services: &[ServiceState]) -> CheckResult {
    let stopped: Vec<&str> = services
        .iter()
        .filter(|s| !s.running && is_critical_service(&s.name))
        .map(|s| s.name.as_str())
        .collect();

    let deduction = (stopped.len() as f64 * SERVICE_DOWN_PENALTY).min(WEIGHT_SERVICES);
    let status = match stopped.len() {
        0 => CheckStatus::Ok,
        1 => CheckStatus::Warning,
        _ => CheckStatus::Critical,
    };
    let message = if stopped.is_empty() {
        "all critical services running".to_string()
    } else {
        format!("stopped: {}", stopped.join(", "))
    };

    CheckResult {
        status,
        weight: WEIGHT_SERVICES,
        deduction,
        value: serde_json::json!({ "stopped": stopped, "total": services.len() }),
        message,
    }
}

/// Any expired certificate costs the full weight, otherwise any expiring
/// within 14 days costs half. Issues never stack beyond that.
fn ssl_check(certs: &[CertificateInfo], now: DateTime<Utc>) -> CheckResult {
    let horizon = now + ChronoDuration::days(SSL_WARNING_DAYS);
    let mut expired = Vec::new();
    let mut expiring = Vec::new();

    for cert in certs {
        match cert.expires_at {
            Some(at) if at <= now => expired.push(cert.domain.as_str()),
            Some(at) if at <= horizon => expiring.push(cert.domain.as_str()),
            _ => {}
        }
    }

    let (status, deduction, message) = if !expired.is_empty() {
        (CheckStatus::Critical, WEIGHT_SSL, format!("expired: {}", expired.join(", ")))
    } else if !expiring.is_empty() {
        (
            CheckStatus::Warning,
            WEIGHT_SSL / 2.0,
            format!("expiring within {} days: {}", SSL_WARNING_DAYS, expiring.join(", ")),
        )
    } else {
        (CheckStatus::Ok, 0.0, format!("{} certificates checked", certs.len()))
    };

    CheckResult {
        status,
        weight: WEIGHT_SSL,
        deduction,
        value: serde_json::json!({ "expired": expired, "expiring": expiring }),
        message,
    }
}

fn updates_check(update_available: bool) -> CheckResult {
    CheckResult {
        status: if update_available { CheckStatus::Warning } else { CheckStatus::Ok },
        weight: WEIGHT_UPDATES,
        deduction: if update_available { WEIGHT_UPDATES } else { 0.0 },
        value: serde_json::json!(update_available),
        message: if update_available {
            "panel update available".to_string()
        } else {
            "panel up to date".to_string()
        },
    }
}

/// Full seven-check score used by scheduled checks.
pub fn evaluate_full(metrics: &ServerMetrics, now: DateTime<Utc>) -> PleskHealth {
    let mut checks = BTreeMap::new();
    checks.insert(
        "cpu_usage".to_string(),
        resource_check(metrics.cpu_usage, WEIGHT_CPU, PERCENT_THRESHOLDS, "%"),
    );
    checks.insert(
        "ram_usage".to_string(),
        resource_check(metrics.ram_usage, WEIGHT_RAM, PERCENT_THRESHOLDS, "%"),
    );
    checks.insert(
        "disk_usage".to_string(),
        resource_check(metrics.disk_usage, WEIGHT_DISK, PERCENT_THRESHOLDS, "%"),
    );
    checks.insert(
        "load_average".to_string(),
        resource_check(metrics.load_average, WEIGHT_LOAD, LOAD_THRESHOLDS, ""),
    );
    checks.insert("services".to_string(), services_check(&metrics.services));
    checks.insert("ssl_certs".to_string(), ssl_check(&metrics.certificates, now));
    checks.insert("plesk_updates".to_string(), updates_check(metrics.update_available));

    PleskHealth::from_checks(checks, ScoreFormula::Full, now)
}

/// CPU/RAM/disk estimate used at registration time.
pub fn evaluate_quick(metrics: &ServerMetrics, now: DateTime<Utc>) -> PleskHealth {
    let mut checks = BTreeMap::new();
    checks.insert(
        "cpu_usage".to_string(),
        resource_check(metrics.cpu_usage, QUICK_WEIGHT_CPU, PERCENT_THRESHOLDS, "%"),
    );
    checks.insert(
        "ram_usage".to_string(),
        resource_check(metrics.ram_usage, QUICK_WEIGHT_RAM, PERCENT_THRESHOLDS, "%"),
    );
    checks.insert(
        "disk_usage".to_string(),
        resource_check(metrics.disk_usage, QUICK_WEIGHT_DISK, PERCENT_THRESHOLDS, "%"),
    );

    PleskHealth::from_checks(checks, ScoreFormula::Quick, now)
}
