//! Core Web Vitals ratings and overall status.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A rated timing or layout metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Lcp,
    Fid,
    Inp,
    Cls,
    Ttfb,
    Fcp,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Lcp,
        Metric::Fid,
        Metric::Inp,
        Metric::Cls,
        Metric::Ttfb,
        Metric::Fcp,
    ];

    /// (good upper bound, poor lower bound). Milliseconds, except CLS.
    pub fn thresholds(&self) -> (f64, f64) {
        match self {
            Metric::Lcp => (2500.0, 4000.0),
            Metric::Fid => (100.0, 300.0),
            Metric::Inp => (200.0, 500.0),
            Metric::Cls => (0.1, 0.25),
            Metric::Ttfb => (800.0, 1800.0),
            Metric::Fcp => (1800.0, 3000.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Lcp => "lcp",
            Metric::Fid => "fid",
            Metric::Inp => "inp",
            Metric::Cls => "cls",
            Metric::Ttfb => "ttfb",
            Metric::Fcp => "fcp",
        }
    }
}

/// Rating of a single metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rating {
    Good,
    NeedsImprovement,
    Poor,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Good => "good",
            Rating::NeedsImprovement => "needs-improvement",
            Rating::Poor => "poor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "good" => Some(Rating::Good),
            "needs-improvement" => Some(Rating::NeedsImprovement),
            "poor" => Some(Rating::Poor),
            _ => None,
        }
    }
}

/// Rate a value: good when `<= good`, poor when `> poor`.
pub fn rate(metric: Metric, value: f64) -> Rating {
    let (good, poor) = metric.thresholds();
    if value <= good {
        Rating::Good
    } else if value > poor {
        Rating::Poor
    } else {
        Rating::NeedsImprovement
    }
}

/// Status of a whole web vitals check. Shares its wire form with [`Rating`].
pub type VitalsStatus = Rating;

/// Measured values for one strategy (mobile, desktop) or one basic probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    pub lcp: Option<f64>,
    pub fid: Option<f64>,
    pub inp: Option<f64>,
    pub cls: Option<f64>,
    pub ttfb: Option<f64>,
    pub fcp: Option<f64>,
    pub speed_index: Option<f64>,
    pub total_blocking_time: Option<f64>,
}

impl MetricValues {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Lcp => self.lcp,
            Metric::Fid => self.fid,
            Metric::Inp => self.inp,
            Metric::Cls => self.cls,
            Metric::Ttfb => self.ttfb,
            Metric::Fcp => self.fcp,
        }
    }

    /// Ratings for every metric that has a value.
    pub fn ratings(&self) -> BTreeMap<Metric, Rating> {
        Metric::ALL
            .iter()
            .filter_map(|m| self.get(*m).map(|v| (*m, rate(*m, v))))
            .collect()
    }

    /// Fill gaps in `self` from `other`.
    pub fn or(self, other: &MetricValues) -> MetricValues {
        MetricValues {
            lcp: self.lcp.or(other.lcp),
            fid: self.fid.or(other.fid),
            inp: self.inp.or(other.inp),
            cls: self.cls.or(other.cls),
            ttfb: self.ttfb.or(other.ttfb),
            fcp: self.fcp.or(other.fcp),
            speed_index: self.speed_index.or(other.speed_index),
            total_blocking_time: self.total_blocking_time.or(other.total_blocking_time),
        }
    }
}

/// Mean of the available strategy scores.
pub fn average_score(scores: &[Option<u8>]) -> Option<f64> {
    let present: Vec<f64> = scores.iter().flatten().map(|s| f64::from(*s)).collect();
    if present.is_empty() {
        return None;
    }
    Some(present.iter().sum::<f64>() / present.len() as f64)
}

/// poor: >= 2 poor metrics or avg < 50; needs-improvement: >= 1 poor or avg < 75.
pub fn overall_status(ratings: &BTreeMap<Metric, Rating>, avg_score: Option<f64>) -> VitalsStatus {
    let poor = ratings.values().filter(|r| **r == Rating::Poor).count();
    let below = |limit: f64| avg_score.map_or(false, |s| s < limit);

    if poor >= 2 || below(50.0) {
        Rating::Poor
    } else if poor >= 1 || below(75.0) {
        Rating::NeedsImprovement
    } else {
        Rating::Good
    }
}

/// A Lighthouse improvement opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub title: String,
    pub savings_ms: f64,
}

/// Audits worth surfacing as opportunities.
pub const OPPORTUNITY_AUDITS: [&str; 11] = [
    "render-blocking-resources",
    "unused-css-rules",
    "unused-javascript",
    "modern-image-formats",
    "uses-optimized-images",
    "offscreen-images",
    "uses-responsive-images",
    "efficient-animated-content",
    "uses-text-compression",
    "uses-rel-preconnect",
    "uses-rel-preload",
];

pub const MAX_OPPORTUNITIES: usize = 5;
pub const MIN_SAVINGS_MS: f64 = 100.0;

/// Keep candidates saving more than 100ms, largest savings first, at most five.
pub fn top_opportunities(mut candidates: Vec<Opportunity>) -> Vec<Opportunity> {
    candidates.retain(|o| o.savings_ms > MIN_SAVINGS_MS);
    candidates.sort_by(|a, b| b.savings_ms.total_cmp(&a.savings_ms));
    candidates.truncate(MAX_OPPORTUNITIES);
    candidates
}
