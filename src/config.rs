//! Configuration module for Peanut Monitor.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Default PageSpeed Insights v5 endpoint.
pub const PAGESPEED_ENDPOINT: &str = "https://www.googleapis.com/pagespeedonline/v5/runPagespeed";

/// How many sites an account may register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteQuota {
    Unlimited,
    Limited(u32),
}

impl SiteQuota {
    /// Parse `unlimited`, `-1` or a non-negative number.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") || s == "-1" {
            return Some(Self::Unlimited);
        }
        s.parse().ok().map(Self::Limited)
    }

    /// Whether one more site fits next to `current` existing ones.
    pub fn allows(&self, current: usize) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(max) => current < *max as usize,
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "peanut-monitor.db")
    pub db_path: String,
    /// Key material for sealing stored credentials.
    pub secret: String,
    /// Google PageSpeed Insights API key. Without one, web vitals use the basic probe.
    pub pagespeed_api_key: Option<String>,
    pub pagespeed_endpoint: String,
    /// Webhook receiving alert payloads. Without one, alerts are only logged.
    pub alert_webhook: Option<String>,
    pub site_quota: SiteQuota,
    /// Blocking delay between targets for rate-limited third-party APIs.
    pub rate_limit_delay: Duration,
    /// Maximum in-flight health/uptime polls.
    pub poll_concurrency: usize,
    pub plesk_accept_invalid_certs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "peanut-monitor.db".to_string(),
            secret: String::new(),
            pagespeed_api_key: None,
            pagespeed_endpoint: PAGESPEED_ENDPOINT.to_string(),
            alert_webhook: None,
            site_quota: SiteQuota::Unlimited,
            rate_limit_delay: Duration::from_secs(2),
            poll_concurrency: 4,
            plesk_accept_invalid_certs: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PEANUT_MONITOR_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PEANUT_MONITOR_DB_PATH`: Database file path (default: "peanut-monitor.db")
    /// - `PEANUT_MONITOR_SECRET`: credential sealing secret
    /// - `PEANUT_MONITOR_PAGESPEED_API_KEY`, `PEANUT_MONITOR_PAGESPEED_ENDPOINT`
    /// - `PEANUT_MONITOR_ALERT_WEBHOOK`
    /// - `PEANUT_MONITOR_SITE_LIMIT`: number or "unlimited" (default)
    /// - `PEANUT_MONITOR_RATE_LIMIT_DELAY_SECS` (default: 2)
    /// - `PEANUT_MONITOR_POLL_CONCURRENCY` (default: 4)
    /// - `PEANUT_MONITOR_PLESK_ACCEPT_INVALID_CERTS` (default: false)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut cfg = Self::default();

        if let Some(port) = lookup("PEANUT_MONITOR_HTTP_PORT").and_then(|s| s.parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("PEANUT_MONITOR_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secret) = lookup("PEANUT_MONITOR_SECRET") {
            cfg.secret = secret;
        }

        cfg.pagespeed_api_key =
            lookup("PEANUT_MONITOR_PAGESPEED_API_KEY").filter(|s| !s.is_empty());

        if let Some(endpoint) = lookup("PEANUT_MONITOR_PAGESPEED_ENDPOINT") {
            cfg.pagespeed_endpoint = endpoint;
        }

        cfg.alert_webhook = lookup("PEANUT_MONITOR_ALERT_WEBHOOK").filter(|s| !s.is_empty());

        if let Some(quota) =
            lookup("PEANUT_MONITOR_SITE_LIMIT").and_then(|s| SiteQuota::parse(&s))
        {
            cfg.site_quota = quota;
        }

        if let Some(secs) =
            lookup("PEANUT_MONITOR_RATE_LIMIT_DELAY_SECS").and_then(|s| s.parse().ok())
        {
            cfg.rate_limit_delay = Duration::from_secs(secs);
        }

        if let Some(n) =
            lookup("PEANUT_MONITOR_POLL_CONCURRENCY").and_then(|s| s.parse::<usize>().ok())
        {
            cfg.poll_concurrency = n.max(1);
        }

        if let Some(flag) = lookup("PEANUT_MONITOR_PLESK_ACCEPT_INVALID_CERTS") {
            cfg.plesk_accept_invalid_certs = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "peanut-monitor.db");
        assert_eq!(cfg.site_quota, SiteQuota::Unlimited);
        assert_eq!(cfg.rate_limit_delay, Duration::from_secs(2));
        assert!(cfg.pagespeed_api_key.is_none());
    }

    #[test]
    fn test_config_from_env_values() {
        let vars: HashMap<&str, &str> = [
            ("PEANUT_MONITOR_HTTP_PORT", "9090"),
            ("PEANUT_MONITOR_SITE_LIMIT", "5"),
            ("PEANUT_MONITOR_PAGESPEED_API_KEY", ""),
            ("PEANUT_MONITOR_POLL_CONCURRENCY", "0"),
            ("PEANUT_MONITOR_PLESK_ACCEPT_INVALID_CERTS", "true"),
        ]
        .into_iter()
        .collect();

        let cfg = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.site_quota, SiteQuota::Limited(5));
        assert!(cfg.pagespeed_api_key.is_none());
        assert_eq!(cfg.poll_concurrency, 1);
        assert!(cfg.plesk_accept_invalid_certs);
    }

    #[test]
    fn test_site_quota() {
        assert_eq!(SiteQuota::parse("unlimited"), Some(SiteQuota::Unlimited));
        assert_eq!(SiteQuota::parse("-1"), Some(SiteQuota::Unlimited));
        assert_eq!(SiteQuota::parse("3"), Some(SiteQuota::Limited(3)));
        assert_eq!(SiteQuota::parse("lots"), None);

        assert!(SiteQuota::Limited(2).allows(1));
        assert!(!SiteQuota::Limited(2).allows(2));
        assert!(!SiteQuota::Limited(0).allows(0));
        assert!(SiteQuota::Unlimited.allows(10_000));
    }
}
