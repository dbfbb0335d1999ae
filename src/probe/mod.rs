//! Probe module for outbound calls.
//!
//! Talks to monitored sites (Peanut Connect REST API and plain HTTP),
//! Google PageSpeed Insights and Plesk panels.

mod connect;
mod http;
mod pagespeed;
mod plesk;

pub use connect::*;
pub use http::*;
pub use pagespeed::*;
pub use plesk::*;

use thiserror::Error;

/// Failures talking to a remote system.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("invalid site key")]
    InvalidKey,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("PageSpeed error: {0}")]
    PageSpeed(String),
}

impl RemoteError {
    /// Stable identifier surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            RemoteError::ConnectionFailed(_) => "connection_failed",
            RemoteError::InvalidKey => "invalid_key",
            RemoteError::AuthFailed(_) => "auth_failed",
            RemoteError::Forbidden(_) => "forbidden",
            RemoteError::VerificationFailed(_) => "verification_failed",
            RemoteError::Api { .. } => "api_error",
            RemoteError::InvalidResponse(_) => "invalid_response",
            RemoteError::PageSpeed(_) => "pagespeed_error",
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::ConnectionFailed(format!("request timed out: {}", e))
        } else {
            RemoteError::ConnectionFailed(e.to_string())
        }
    }
}

/// Pull a human-readable message out of an error body.
pub(crate) fn message_from_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["/message", "/error/message", "/error", "/errors/0/message"]
        .iter()
        .find_map(|p| value.pointer(p).and_then(|v| v.as_str()))
        .map(str::to_string)
}

/// Map a response to JSON: 401 auth, 403 forbidden, other non-2xx API
/// errors, unparsable bodies invalid.
pub(crate) async fn read_json(
    response: reqwest::Response,
) -> Result<serde_json::Value, RemoteError> {
    let status = response.status();
    let body = response.text().await?;

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(RemoteError::AuthFailed(
            message_from_body(&body).unwrap_or_else(|| "HTTP 401".to_string()),
        ));
    }
    if status == reqwest::StatusCode::FORBIDDEN {
        return Err(RemoteError::Forbidden(
            message_from_body(&body).unwrap_or_else(|| "insufficient permissions".to_string()),
        ));
    }
    if !status.is_success() {
        return Err(RemoteError::Api {
            status: status.as_u16(),
            message: message_from_body(&body).unwrap_or_else(|| status.to_string()),
        });
    }

    serde_json::from_str(&body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

/// Read a number that may arrive as a JSON number or numeric string.
pub(crate) fn as_number(v: &serde_json::Value) -> Option<f64> {
    v.as_f64().or_else(|| {
        v.as_str()
            .and_then(|s| s.trim().trim_end_matches('%').trim().parse().ok())
    })
}

/// First numeric value found at any of the JSON pointers.
pub(crate) fn first_number(v: &serde_json::Value, pointers: &[&str]) -> Option<f64> {
    pointers.iter().find_map(|p| v.pointer(p).and_then(as_number))
}

/// First non-empty string found at any of the JSON pointers.
pub(crate) fn first_string(v: &serde_json::Value, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|p| {
        v.pointer(p)
            .and_then(|s| s.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_from_body() {
        assert_eq!(message_from_body(r#"{"message":"nope"}"#).as_deref(), Some("nope"));
        assert_eq!(
            message_from_body(r#"{"error":{"code":400,"message":"bad url"}}"#).as_deref(),
            Some("bad url")
        );
        assert_eq!(message_from_body("<html>"), None);
    }

    #[test]
    fn test_number_helpers() {
        let v = serde_json::json!({"a": "42.5%", "b": {"c": 7}, "d": ""});
        assert_eq!(as_number(&v["a"]), Some(42.5));
        assert_eq!(first_number(&v, &["/missing", "/b/c"]), Some(7.0));
        assert_eq!(first_string(&v, &["/d", "/a"]).as_deref(), Some("42.5%"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(RemoteError::InvalidKey.code(), "invalid_key");
        assert_eq!(RemoteError::ConnectionFailed("x".into()).code(), "connection_failed");
        assert_eq!(RemoteError::Api { status: 500, message: "x".into() }.code(), "api_error");
        assert_eq!(RemoteError::PageSpeed("quota".into()).code(), "pagespeed_error");
    }
}
