//! Rolling strategies and failure thresholds

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How hosts are ordered and grouped into batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollingStrategy {
    /// Batches in input order
    #[default]
    Simple,
    /// A small first batch gates the rest of the rollout
    Canary,
    /// Hosts designated as indexers are moved to the final batches
    IndexersLast,
}

impl fmt::Display for RollingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Canary => write!(f, "canary"),
            Self::IndexersLast => write!(f, "indexers_last"),
        }
    }
}

impl FromStr for RollingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "simple" | "rolling" => Ok(Self::Simple),
            "canary" => Ok(Self::Canary),
            "indexers_last" => Ok(Self::IndexersLast),
            other => Err(format!("unknown rolling strategy '{}'", other)),
        }
    }
}

/// Either an absolute number or a percentage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CountOrPercentRepr", into = "CountOrPercentRepr")]
pub enum CountOrPercent {
    /// Absolute host count
    Count(usize),
    /// Percentage in `(0, 100]`
    Percent(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum CountOrPercentRepr {
    Count(usize),
    Text(String),
}

impl TryFrom<CountOrPercentRepr> for CountOrPercent {
    type Error = String;

    fn try_from(repr: CountOrPercentRepr) -> Result<Self, Self::Error> {
        match repr {
            CountOrPercentRepr::Count(n) => Ok(Self::Count(n)),
            CountOrPercentRepr::Text(s) => s.parse(),
        }
    }
}

impl From<CountOrPercent> for CountOrPercentRepr {
    fn from(value: CountOrPercent) -> Self {
        match value {
            CountOrPercent::Count(n) => CountOrPercentRepr::Count(n),
            CountOrPercent::Percent(_) => CountOrPercentRepr::Text(value.to_string()),
        }
    }
}

impl FromStr for CountOrPercent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: f64 = pct
                .trim()
                .parse()
                .map_err(|_| format!("invalid percentage '{}'", s))?;
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(format!("percentage must be in (0, 100], got {}", pct));
            }
            Ok(Self::Percent(pct))
        } else {
            s.parse()
                .map(Self::Count)
                .map_err(|_| format!("expected a count or a percentage, got '{}'", s))
        }
    }
}

impl fmt::Display for CountOrPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{}", n),
            Self::Percent(p) => write!(f, "{}%", p),
        }
    }
}

/// Failure threshold that aborts the remaining batches of a run.
pub type MaxFailures = CountOrPercent;

/// Size of the canary batch.
pub type CanarySize = CountOrPercent;

impl CountOrPercent {
    /// Whether `failed` out of `processed` hosts crosses this threshold.
    ///
    /// A count is the number of failures tolerated. A percentage is compared
    /// exactly against the hosts processed so far, with no rounding.
    pub fn exceeded(&self, failed: usize, processed: usize) -> bool {
        match *self {
            Self::Count(max) => failed > max,
            Self::Percent(pct) => {
                processed > 0 && (failed as f64) * 100.0 > pct * (processed as f64)
            }
        }
    }

    /// Resolve to a host count out of `total`: percentages round up, the
    /// result is at least one host and never more than `total`.
    pub fn of(&self, total: usize) -> usize {
        let n = match *self {
            Self::Count(n) => n,
            Self::Percent(pct) => ((total as f64) * pct / 100.0).ceil() as usize,
        };
        n.max(1).min(total.max(1))
    }

    /// Whether the value is usable
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::Count(_) => true,
            Self::Percent(p) => p > 0.0 && p <= 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse_display() {
        assert_eq!(
            "indexers-last".parse::<RollingStrategy>().unwrap(),
            RollingStrategy::IndexersLast
        );
        assert_eq!(RollingStrategy::Canary.to_string(), "canary");
        assert!("random".parse::<RollingStrategy>().is_err());
    }

    #[test]
    fn test_count_threshold() {
        let max = MaxFailures::Count(2);
        assert!(!max.exceeded(2, 5));
        assert!(max.exceeded(3, 5));
    }

    #[test]
    fn test_percent_threshold_is_exact() {
        let max: MaxFailures = "10%".parse().unwrap();
        // 1 of 10 is exactly 10%: not exceeded
        assert!(!max.exceeded(1, 10));
        assert!(max.exceeded(2, 10));
        // 1 of 5 is 20%
        assert!(max.exceeded(1, 5));
        assert!(!max.exceeded(0, 0));
    }

    #[test]
    fn test_canary_size() {
        assert_eq!(CanarySize::Count(1).of(4), 1);
        assert_eq!(CanarySize::Count(10).of(4), 4);
        assert_eq!(CanarySize::Percent(10.0).of(15), 2);
        assert_eq!(CanarySize::Percent(1.0).of(3), 1);
    }

    #[test]
    fn test_serde_forms() {
        let count: CountOrPercent = serde_yaml::from_str("3").unwrap();
        assert_eq!(count, CountOrPercent::Count(3));
        let pct: CountOrPercent = serde_yaml::from_str("\"25%\"").unwrap();
        assert_eq!(pct, CountOrPercent::Percent(25.0));
        assert!(serde_yaml::from_str::<CountOrPercent>("\"150%\"").is_err());
        assert_eq!(serde_json::to_string(&pct).unwrap(), "\"25%\"");
    }
}
