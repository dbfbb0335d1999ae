//! Plesk REST API client.
//!
//! Uses HTTP Basic auth as `admin:{api_key}` against `/api/v2`. Panels
//! differ in how they shape statistics, so parsing looks in several places
//! for each value.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::{as_number, first_number, first_string, read_json, RemoteError};
use crate::scoring::{round3, CertificateInfo, ServerMetrics, ServiceState};

pub const PLESK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PLESK_PORT: u16 = 8443;

/// Where and how to reach one panel.
#[derive(Debug, Clone, Copy)]
pub struct PleskTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub api_key: &'a str,
}

/// Panel identity from `/server`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerInfo {
    pub hostname: Option<String>,
    pub plesk_version: Option<String>,
    pub os_info: Option<String>,
    pub update_available: bool,
}

/// CPU, RAM, disk and load from `/server/statistics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceStats {
    pub cpu_usage: Option<f64>,
    pub ram_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub load_average: Option<f64>,
}

#[derive(Clone)]
pub struct PleskClient {
    http: reqwest::Client,
    scheme: &'static str,
}

impl PleskClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http, scheme: "https" }
    }

    /// Talk plain HTTP to in-process test panels.
    #[cfg(test)]
    pub fn insecure_http(mut self) -> Self {
        self.scheme = "http";
        self
    }

    fn url(&self, target: &PleskTarget<'_>, path: &str) -> String {
        format!("{}://{}:{}/api/v2/{}", self.scheme, target.host, target.port, path)
    }

    async fn get_json(
        &self,
        target: &PleskTarget<'_>,
        path: &str,
    ) -> Result<serde_json::Value, RemoteError> {
        let response = self
            .http
            .get(self.url(target, path))
            .basic_auth("admin", Some(target.api_key))
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(PLESK_TIMEOUT)
            .send()
            .await?;
        read_json(response).await
    }

    pub async fn server_info(&self, target: &PleskTarget<'_>) -> Result<ServerInfo, RemoteError> {
        Ok(parse_server_info(&self.get_json(target, "server").await?))
    }

    pub async fn statistics(&self, target: &PleskTarget<'_>) -> Result<ResourceStats, RemoteError> {
        Ok(parse_statistics(&self.get_json(target, "server/statistics").await?))
    }

    pub async fn services(
        &self,
        target: &PleskTarget<'_>,
    ) -> Result<Vec<ServiceState>, RemoteError> {
        Ok(parse_services(&self.get_json(target, "server/services").await?))
    }

    pub async fn certificates(
        &self,
        target: &PleskTarget<'_>,
    ) -> Result<Vec<CertificateInfo>, RemoteError> {
        Ok(parse_domains(&self.get_json(target, "domains").await?))
    }

    /// Full fetch sequence: server info, statistics, services, domains.
    /// The first failure aborts the sequence.
    pub async fn collect(
        &self,
        target: &PleskTarget<'_>,
    ) -> Result<(ServerInfo, ServerMetrics), RemoteError> {
        let info = self.server_info(target).await?;
        let stats = self.statistics(target).await?;
        let services = self.services(target).await?;
        let certificates = self.certificates(target).await?;

        let metrics = ServerMetrics {
            cpu_usage: stats.cpu_usage,
            ram_usage: stats.ram_usage,
            disk_usage: stats.disk_usage,
            load_average: stats.load_average,
            services,
            certificates,
            update_available: info.update_available,
        };
        Ok((info, metrics))
    }
}

pub fn parse_server_info(v: &serde_json::Value) -> ServerInfo {
    let platform = first_string(v, &["/os", "/os_info", "/platform"]);
    let os_version = first_string(v, &["/os_version"]);
    let os_info = match (platform, os_version) {
        (Some(p), Some(ver)) => Some(format!("{} {}", p, ver)),
        (p, ver) => p.or(ver),
    };

    let update_available = v
        .get("update_available")
        .and_then(|u| u.as_bool())
        .unwrap_or_else(|| {
            first_string(v, &["/panel_update_version", "/available_update"]).is_some()
        });

    ServerInfo {
        hostname: first_string(v, &["/hostname"]),
        plesk_version: first_string(v, &["/panel_version", "/plesk_version", "/version"]),
        os_info,
        update_available,
    }
}

fn used_percent(v: &serde_json::Value, used: &str, total: &str) -> Option<f64> {
    let used = v.pointer(used).and_then(as_number)?;
    let total = v.pointer(total).and_then(as_number)?;
    (total > 0.0).then(|| used * 100.0 / total)
}

/// Worst usage across a list of partitions.
fn max_partition_usage(v: &serde_json::Value) -> Option<f64> {
    let partitions = ["/disk/partitions", "/disks", "/disk"]
        .iter()
        .find_map(|p| v.pointer(p).and_then(|d| d.as_array()))?;
    partitions
        .iter()
        .filter_map(|p| {
            first_number(p, &["/usage", "/used_percent"])
                .or_else(|| used_percent(p, "/used", "/total"))
        })
        .fold(None, |acc: Option<f64>, u| Some(acc.map_or(u, |a| a.max(u))))
}

pub fn parse_statistics(v: &serde_json::Value) -> ResourceStats {
    let stats = v.get("statistics").filter(|s| s.is_object()).unwrap_or(v);

    let cpu = first_number(stats, &["/cpu/usage", "/cpu_usage", "/cpu/load"]);
    let ram = first_number(stats, &["/memory/usage", "/ram_usage", "/memory_usage"])
        .or_else(|| used_percent(stats, "/memory/used", "/memory/total"))
        .or_else(|| used_percent(stats, "/ram/used", "/ram/total"));
    let disk = first_number(stats, &["/disk/usage", "/disk_usage"])
        .or_else(|| used_percent(stats, "/disk/used", "/disk/total"))
        .or_else(|| max_partition_usage(stats));
    let load = first_number(
        stats,
        &[
            "/load_average/1min",
            "/load_average/load1",
            "/load/1min",
            "/load_average/0",
            "/load_average",
        ],
    );

    ResourceStats {
        cpu_usage: cpu.map(round3),
        ram_usage: ram.map(round3),
        disk_usage: disk.map(round3),
        load_average: load.map(round3),
    }
}

fn list<'a>(v: &'a serde_json::Value, key: &str) -> &'a [serde_json::Value] {
    v.as_array()
        .or_else(|| v.get(key).and_then(|l| l.as_array()))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn parse_services(v: &serde_json::Value) -> Vec<ServiceState> {
    list(v, "services")
        .iter()
        .filter_map(|s| {
            let name = first_string(s, &["/name", "/id", "/service"])?;
            let running = s.get("running").and_then(|r| r.as_bool()).unwrap_or_else(|| {
                first_string(s, &["/state", "/status"]).map_or(false, |state| {
                    matches!(
                        state.to_ascii_lowercase().as_str(),
                        "running" | "started" | "active" | "up" | "on"
                    )
                })
            });
            Some(ServiceState { name, running })
        })
        .collect()
}

pub fn parse_domains(v: &serde_json::Value) -> Vec<CertificateInfo> {
    list(v, "domains")
        .iter()
        .filter_map(|d| {
            let domain = first_string(d, &["/name", "/ascii_name"])?;
            let expires_at = [
                "/ssl_expires_at",
                "/certificate/expires_at",
                "/certificate/expiration_date",
                "/certificate/valid_to",
                "/ssl/expires",
                "/ssl_expiration",
            ]
            .iter()
            .find_map(|p| d.pointer(p).and_then(parse_expiry));
            Some(CertificateInfo { domain, expires_at })
        })
        .collect()
}

/// Accepts unix seconds, RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`.
fn parse_expiry(v: &serde_json::Value) -> Option<DateTime<Utc>> {
    if let Some(secs) = v.as_i64() {
        return DateTime::from_timestamp(secs, 0);
    }
    let s = v.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
pub(crate) mod mock_panel {
    use axum::{
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };

    /// `Basic base64("admin:plesk-key")`
    pub const GOOD_AUTH: &str = "Basic YWRtaW46cGxlc2sta2V5";

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some(GOOD_AUTH)
    }

    fn guarded(headers: HeaderMap, body: serde_json::Value) -> impl IntoResponse {
        if authorized(&headers) {
            (StatusCode::OK, Json(body))
        } else {
            (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"message": "bad credentials"})))
        }
    }

    /// A panel reporting `cpu` percent CPU and otherwise healthy values.
    pub fn panel(cpu: f64) -> Router {
        Router::new()
            .route(
                "/api/v2/server",
                get(|h: HeaderMap| async move {
                    guarded(h, serde_json::json!({
                        "hostname": "web-01.example.com",
                        "panel_version": "18.0.61",
                        "platform": "Ubuntu",
                        "os_version": "22.04"
                    }))
                }),
            )
            .route(
                "/api/v2/server/statistics",
                get(move |h: HeaderMap| async move {
                    guarded(h, serde_json::json!({
                        "cpu": {"usage": cpu},
                        "memory": {"used": 4096, "total": 8192},
                        "disk": {"usage": "50%"},
                        "load_average": {"1min": 2.0}
                    }))
                }),
            )
            .route(
                "/api/v2/server/services",
                get(|h: HeaderMap| async move {
                    guarded(h, serde_json::json!([
                        {"id": "nginx", "state": "running"},
                        {"id": "mariadb", "state": "running"},
                        {"id": "spamassassin", "state": "stopped"}
                    ]))
                }),
            )
            .route(
                "/api/v2/domains",
                get(|h: HeaderMap| async move {
                    guarded(h, serde_json::json!([
                        {"id": 1, "name": "example.com", "ssl_expires_at": "2099-01-01T00:00:00Z"}
                    ]))
                }),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::test_server::serve;
    use chrono::TimeZone;

    fn target(base: &str, key: &'static str) -> (String, u16, &'static str) {
        let addr = base.trim_start_matches("http://");
        let (host, port) = addr.split_once(':').unwrap();
        (host.to_string(), port.parse().unwrap(), key)
    }

    #[tokio::test]
    async fn test_collect_full_sequence() {
        let base = serve(mock_panel::panel(95.0)).await;
        let (host, port, key) = target(&base, "plesk-key");
        let client = PleskClient::new(reqwest::Client::new()).insecure_http();

        let (info, metrics) = client
            .collect(&PleskTarget { host: &host, port, api_key: key })
            .await
            .unwrap();
        assert_eq!(info.plesk_version.as_deref(), Some("18.0.61"));
        assert_eq!(info.os_info.as_deref(), Some("Ubuntu 22.04"));
        assert!(!info.update_available);
        assert_eq!(metrics.cpu_usage, Some(95.0));
        assert_eq!(metrics.ram_usage, Some(50.0));
        assert_eq!(metrics.disk_usage, Some(50.0));
        assert_eq!(metrics.load_average, Some(2.0));
        assert_eq!(metrics.services.len(), 3);
        assert_eq!(metrics.certificates.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let base = serve(mock_panel::panel(10.0)).await;
        let (host, port, _) = target(&base, "plesk-key");
        let client = PleskClient::new(reqwest::Client::new()).insecure_http();

        let err = client
            .collect(&PleskTarget { host: &host, port, api_key: "wrong" })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "auth_failed");
    }

    #[test]
    fn test_parse_statistics_variants() {
        let stats = parse_statistics(&serde_json::json!({
            "statistics": {
                "cpu_usage": "12.5",
                "ram": {"used": 3, "total": 4},
                "disks": [{"used": 10, "total": 100}, {"usage": 91.2}],
                "load_average": [3.5, 2.0, 1.0]
            }
        }));
        assert_eq!(stats.cpu_usage, Some(12.5));
        assert_eq!(stats.ram_usage, Some(75.0));
        assert_eq!(stats.disk_usage, Some(91.2));
        assert_eq!(stats.load_average, Some(3.5));

        assert_eq!(parse_statistics(&serde_json::json!({})), ResourceStats::default());
    }

    #[test]
    fn test_parse_services() {
        let services = parse_services(&serde_json::json!({"services": [
            {"name": "Apache", "running": false},
            {"id": "postfix", "status": "Active"},
            {"name": "", "id": "nginx", "state": "running"},
            {"state": "running"}
        ]}));
        assert_eq!(services.len(), 3);
        assert!(!services[0].running);
        assert!(services[1].running);
        assert_eq!(services[2].name, "nginx");
    }

    #[test]
    fn test_parse_domains_expiry_formats() {
        let certs = parse_domains(&serde_json::json!([
            {"name": "a.test", "certificate": {"valid_to": "2026-05-01"}},
            {"name": "b.test", "ssl_expires_at": 1767225600},
            {"name": "c.test"}
        ]));
        assert_eq!(certs[0].expires_at, Some(Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()));
        assert_eq!(certs[1].expires_at, Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        assert_eq!(certs[2].expires_at, None);
    }

    #[test]
    fn test_parse_server_info_update() {
        let info = parse_server_info(&serde_json::json!({
            "panel_version": "18.0.59",
            "panel_update_version": "18.0.61",
            "platform": "Unix"
        }));
        assert!(info.update_available);
        assert_eq!(info.os_info.as_deref(), Some("Unix"));

        // An empty field falls through to the next one.
        let info = parse_server_info(&serde_json::json!({
            "panel_update_version": "",
            "available_update": "18.0.60"
        }));
        assert!(info.update_available);
    }
}
