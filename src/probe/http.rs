//! Plain HTTP probe used for uptime checks and the basic web vitals fallback.

use std::time::{Duration, Instant};
use super::RemoteError;

/// Timing of a single GET.
#[derive(Debug, Clone)]
pub struct HttpTiming {
    pub status: u16,
    /// Time until response headers arrived.
    pub ttfb: Duration,
    /// Time until the full body was read.
    pub total: Duration,
    pub body_bytes: usize,
}

impl HttpTiming {
    /// Anything below 400 counts as reachable.
    pub fn is_up(&self) -> bool {
        self.status < 400
    }
}

/// Prefix bare hostnames with https://.
pub fn ensure_scheme(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("https://{}", address)
    }
}

/// Run an HTTP probe against the given address.
pub async fn run_http_probe(
    client: &reqwest::Client,
    address: &str,
    timeout: Duration,
) -> Result<HttpTiming, RemoteError> {
    let url = ensure_scheme(address);

    let start = Instant::now();

    let response = client.get(&url).timeout(timeout).send().await?;
    let ttfb = start.elapsed();
    let status = response.status().as_u16();

    // Read the full body to measure complete transfer time
    let body = response.bytes().await?;

    Ok(HttpTiming {
        status,
        ttfb,
        total: start.elapsed(),
        body_bytes: body.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::test_server::serve;
    use axum::{http::StatusCode, routing::get, Router};

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let client = reqwest::Client::new();
        let result =
            run_http_probe(&client, "http://256.256.256.256", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(RemoteError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_http_probe_measures_body() {
        let base = serve(
            Router::new()
                .route("/", get(|| async { "x".repeat(2048) }))
                .route("/broken", get(|| async { StatusCode::BAD_GATEWAY })),
        )
        .await;
        let client = reqwest::Client::new();

        let timing = run_http_probe(&client, &base, Duration::from_secs(5)).await.unwrap();
        assert_eq!(timing.status, 200);
        assert_eq!(timing.body_bytes, 2048);
        assert!(timing.is_up());
        assert!(timing.total >= timing.ttfb);

        let broken = run_http_probe(&client, &format!("{}/broken", base), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!broken.is_up());
    }

    #[test]
    fn test_ensure_scheme() {
        assert_eq!(ensure_scheme("example.com"), "https://example.com");
        assert_eq!(ensure_scheme("http://example.com"), "http://example.com");
    }
}
