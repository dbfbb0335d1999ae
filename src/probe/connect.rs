//! Client for the Peanut Connect REST API exposed by monitored sites.

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{message_from_body, read_json, RemoteError};
use crate::db::HealthSnapshot;
use crate::scoring::{clamp_score, grade_for, status_for, Grade, HealthStatus};

/// REST namespace every monitored site exposes.
pub const CONNECT_NAMESPACE: &str = "wp-json/peanut-connect/v1";
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(15);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Peanut Suite installation details reported by a site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteInfo {
    #[serde(default, alias = "active")]
    pub installed: bool,
    #[serde(default)]
    pub version: Option<String>,
}

/// Body of a successful verify call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub wp_version: Option<String>,
    #[serde(default)]
    pub peanut_suite: Option<SuiteInfo>,
}

/// Bearer-authenticated calls to a site's Peanut Connect endpoints.
#[derive(Clone)]
pub struct ConnectClient {
    http: reqwest::Client,
}

impl ConnectClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// `{site_url}/wp-json/peanut-connect/v1/{endpoint}`
    pub fn endpoint_url(site_url: &str, endpoint: &str) -> String {
        format!(
            "{}/{}/{}",
            site_url.trim_end_matches('/'),
            CONNECT_NAMESPACE,
            endpoint.trim_start_matches('/')
        )
    }

    /// One-time handshake used when registering a site.
    ///
    /// 401 maps to `InvalidKey`, any other non-200 to `VerificationFailed`
    /// and transport problems to `ConnectionFailed`.
    pub async fn verify_connection(
        &self,
        site_url: &str,
        key: &str,
    ) -> Result<VerifyResponse, RemoteError> {
        let response = self
            .http
            .get(Self::endpoint_url(site_url, "verify"))
            .bearer_auth(key)
            .timeout(VERIFY_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::InvalidKey);
        }
        if status != StatusCode::OK {
            return Err(RemoteError::VerificationFailed(
                message_from_body(&body).unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
            ));
        }

        let verify: VerifyResponse =
            serde_json::from_str(&body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

        if verify.success == Some(false) {
            return Err(RemoteError::VerificationFailed(
                verify.message.unwrap_or_else(|| "site rejected the connection".to_string()),
            ));
        }

        Ok(verify)
    }

    /// Generic authenticated call. Pure transport: recording a failure
    /// against the site is the caller's job.
    pub async fn request(
        &self,
        site_url: &str,
        key: &str,
        endpoint: &str,
        method: Method,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, RemoteError> {
        let mut req = self
            .http
            .request(method, Self::endpoint_url(site_url, endpoint))
            .bearer_auth(key)
            .timeout(REQUEST_TIMEOUT);

        if let Some(body) = body {
            req = req.json(body);
        }

        read_json(req.send().await?).await
    }
}

/// Turn a `/health` response into a snapshot. Accepts the payload at the
/// top level or under `health`; grade and status are derived from the score
/// when the site leaves them out.
pub fn parse_health(
    body: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<HealthSnapshot, RemoteError> {
    let health = body.get("health").filter(|h| h.is_object()).unwrap_or(body);

    let score = health
        .get("score")
        .and_then(super::as_number)
        .map(clamp_score)
        .ok_or_else(|| RemoteError::InvalidResponse("health payload has no score".to_string()))?;

    let grade = health
        .get("grade")
        .and_then(|g| g.as_str())
        .and_then(Grade::parse)
        .unwrap_or_else(|| grade_for(score));

    let status = health
        .get("status")
        .and_then(|s| s.as_str())
        .and_then(HealthStatus::parse)
        .unwrap_or_else(|| status_for(score));

    let checks = health
        .get("checks")
        .and_then(|c| c.as_object())
        .cloned()
        .unwrap_or_default();

    Ok(HealthSnapshot {
        score,
        grade,
        status,
        checks,
        checked_at: now,
    })
}

/// Suite details embedded in a health or verify payload, if present.
pub fn parse_suite_info(body: &serde_json::Value) -> Option<SuiteInfo> {
    body.get("peanut_suite")
        .or_else(|| body.pointer("/health/peanut_suite"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}
