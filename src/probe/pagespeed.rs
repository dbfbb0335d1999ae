//! Google PageSpeed Insights client and Lighthouse report parsing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{as_number, RemoteError};
use crate::scoring::{
    clamp_score, round3, top_opportunities, MetricValues, Opportunity, OPPORTUNITY_AUDITS,
};

/// PageSpeed runs a full Lighthouse pass; it is slow.
pub const PAGESPEED_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Mobile,
    Desktop,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Mobile => "mobile",
            Strategy::Desktop => "desktop",
        }
    }
}

/// Parsed result of one PageSpeed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyReport {
    pub strategy: Strategy,
    pub score: Option<u8>,
    pub metrics: MetricValues,
    pub opportunities: Vec<Opportunity>,
}

#[derive(Clone)]
pub struct PageSpeedClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl PageSpeedClient {
    pub fn new(http: reqwest::Client, endpoint: &str, api_key: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Run PageSpeed for `url` with one strategy. A vendor error payload
    /// fails the whole run.
    pub async fn run(&self, url: &str, strategy: Strategy) -> Result<StrategyReport, RemoteError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("url", url),
                ("key", self.api_key.as_str()),
                ("strategy", strategy.as_str()),
                ("category", "performance"),
            ])
            .timeout(PAGESPEED_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        let value: serde_json::Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(_) if !status.is_success() => {
                return Err(RemoteError::Api {
                    status: status.as_u16(),
                    message: status.to_string(),
                })
            }
            Err(e) => return Err(RemoteError::InvalidResponse(e.to_string())),
        };

        if let Some(err) = vendor_error(&value) {
            return Err(err);
        }
        if !status.is_success() {
            return Err(RemoteError::Api {
                status: status.as_u16(),
                message: status.to_string(),
            });
        }

        parse_report(strategy, &value)
    }
}

fn vendor_error(value: &serde_json::Value) -> Option<RemoteError> {
    let error = value.get("error").filter(|e| e.is_object())?;
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown PageSpeed error");
    Some(RemoteError::PageSpeed(message.to_string()))
}

/// Extract score, metrics and opportunities from a PageSpeed response.
pub fn parse_report(
    strategy: Strategy,
    value: &serde_json::Value,
) -> Result<StrategyReport, RemoteError> {
    if let Some(err) = vendor_error(value) {
        return Err(err);
    }

    let lighthouse = value
        .get("lighthouseResult")
        .ok_or_else(|| RemoteError::InvalidResponse("missing lighthouseResult".to_string()))?;

    let score = lighthouse
        .pointer("/categories/performance/score")
        .and_then(|s| s.as_f64())
        .map(|s| clamp_score(s * 100.0));

    let audits = lighthouse.get("audits").cloned().unwrap_or_default();

    let metrics = MetricValues {
        lcp: audit_value(&audits, &["largest-contentful-paint"]),
        fid: audit_value(&audits, &["max-potential-fid"]),
        inp: audit_value(
            &audits,
            &["interaction-to-next-paint", "experimental-interaction-to-next-paint"],
        ),
        cls: audit_value(&audits, &["cumulative-layout-shift"]),
        ttfb: audit_value(&audits, &["server-response-time"]),
        fcp: audit_value(&audits, &["first-contentful-paint"]),
        speed_index: audit_value(&audits, &["speed-index"]),
        total_blocking_time: audit_value(&audits, &["total-blocking-time"]),
    };

    let candidates = OPPORTUNITY_AUDITS
        .iter()
        .filter_map(|id| {
            let audit = audits.get(*id)?;
            let audit_score = audit.get("score").and_then(|s| s.as_f64())?;
            if audit_score >= 1.0 {
                return None;
            }
            let savings = audit
                .pointer("/details/overallSavingsMs")
                .and_then(as_number)
                .or_else(|| audit.get("numericValue").and_then(as_number))?;
            Some(Opportunity {
                id: id.to_string(),
                title: audit
                    .get("title")
                    .and_then(|t| t.as_str())
                    .unwrap_or(*id)
                    .to_string(),
                savings_ms: round3(savings),
            })
        })
        .collect();

    Ok(StrategyReport {
        strategy,
        score,
        metrics,
        opportunities: top_opportunities(candidates),
    })
}

/// `numericValue` of the first audit present, rounded to 3 places.
fn audit_value(audits: &serde_json::Value, ids: &[&str]) -> Option<f64> {
    ids.iter()
        .find_map(|id| audits.get(*id).and_then(|a| a.get("numericValue")).and_then(as_number))
        .map(round3)
}

/// Build a PageSpeed-shaped response. Shared with poller tests.
#[cfg(test)]
pub(crate) fn sample_response(score: f64, lcp: f64, cls: f64) -> serde_json::Value {
    serde_json::json!({
        "lighthouseResult": {
            "categories": {"performance": {"score": score}},
            "audits": {
                "largest-contentful-paint": {"numericValue": lcp},
                "max-potential-fid": {"numericValue": 80.12345},
                "experimental-interaction-to-next-paint": {"numericValue": 150.0},
                "cumulative-layout-shift": {"numericValue": cls},
                "server-response-time": {"numericValue": 420.0},
                "first-contentful-paint": {"numericValue": 1500.0},
                "speed-index": {"numericValue": 3100.0},
                "total-blocking-time": {"numericValue": 250.0},
                "render-blocking-resources": {
                    "title": "Eliminate render-blocking resources",
                    "score": 0.4,
                    "details": {"overallSavingsMs": 1200.0}
                },
                "unused-javascript": {
                    "title": "Reduce unused JavaScript",
                    "score": 0.5,
                    "details": {"overallSavingsMs": 600.0}
                },
                "uses-text-compression": {
                    "title": "Enable text compression",
                    "score": 1.0,
                    "details": {"overallSavingsMs": 900.0}
                },
                "uses-rel-preconnect": {
                    "title": "Preconnect to required origins",
                    "score": 0.9,
                    "details": {"overallSavingsMs": 40.0}
                }
            }
        }
    })
}
