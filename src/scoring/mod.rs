//! Scoring module.
//!
//! Pure functions turning raw measurements into scores, grades and
//! statuses. Nothing in here touches the network or the database.

mod plesk;
mod vitals;

pub use plesk::*;
pub use vitals::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Letter grade for a 0-100 health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Grade::A),
            "B" => Some(Grade::B),
            "C" => Some(Grade::C),
            "D" => Some(Grade::D),
            "F" => Some(Grade::F),
            _ => None,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grade a score: A>=90, B>=80, C>=70, D>=60, else F.
pub fn grade_for(score: u8) -> Grade {
    match score {
        90.. => Grade::A,
        80..=89 => Grade::B,
        70..=79 => Grade::C,
        60..=69 => Grade::D,
        _ => Grade::F,
    }
}

/// Overall health of a site or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(HealthStatus::Healthy),
            "warning" => Some(HealthStatus::Warning),
            "critical" => Some(HealthStatus::Critical),
            _ => None,
        }
    }
}

/// healthy >= 80, warning >= 50, critical below.
pub fn status_for(score: u8) -> HealthStatus {
    match score {
        80.. => HealthStatus::Healthy,
        50..=79 => HealthStatus::Warning,
        _ => HealthStatus::Critical,
    }
}

/// Clamp a fractional score into 0..=100 and round it.
pub fn clamp_score(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

/// Round to three decimal places.
pub fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grade_thresholds() {
        assert_eq!(grade_for(100), Grade::A);
        assert_eq!(grade_for(90), Grade::A);
        assert_eq!(grade_for(89), Grade::B);
        assert_eq!(grade_for(80), Grade::B);
        assert_eq!(grade_for(79), Grade::C);
        assert_eq!(grade_for(70), Grade::C);
        assert_eq!(grade_for(69), Grade::D);
        assert_eq!(grade_for(60), Grade::D);
        assert_eq!(grade_for(59), Grade::F);
        assert_eq!(grade_for(0), Grade::F);
    }

    #[test]
    fn test_grade_is_monotonic() {
        // Grade ordering is A < B < ... < F, so a lower score never yields a better grade.
        let mut previous = grade_for(100);
        for score in (0..=100u8).rev() {
            let grade = grade_for(score);
            assert!(grade >= previous, "score {} graded {} after {}", score, grade, previous);
            previous = grade;
        }
    }

    #[test]
    fn test_status_thresholds() {
        assert_eq!(status_for(80), HealthStatus::Healthy);
        assert_eq!(status_for(79), HealthStatus::Warning);
        assert_eq!(status_for(50), HealthStatus::Warning);
        assert_eq!(status_for(49), HealthStatus::Critical);
    }

    #[test]
    fn test_clamp_and_round() {
        assert_eq!(clamp_score(-7.5), 0);
        assert_eq!(clamp_score(142.0), 100);
        assert_eq!(clamp_score(92.5), 93);
        assert_eq!(clamp_score(f64::NAN), 0);
        assert_eq!(round3(0.123456), 0.123);
        assert_eq!(round3(2500.0004), 2500.0);
    }

    #[test]
    fn test_grade_parse() {
        assert_eq!(Grade::parse("b"), Some(Grade::B));
        assert_eq!(Grade::parse("E"), None);
        assert_eq!(HealthStatus::parse("warning"), Some(HealthStatus::Warning));
    }
}
