//! Risk levels attached to authenticated requests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Risk of letting a request proceed, derived from the permissions it holds.
///
/// Levels are ordered: `Low < Medium < High < Critical`, so policies can be
/// written as thresholds.
///
/// # Example
///
/// ```
/// use bastion_types::RiskLevel;
///
/// assert!(RiskLevel::Critical > RiskLevel::High);
/// assert_eq!("high".parse::<RiskLevel>(), Ok(RiskLevel::High));
/// assert_eq!(RiskLevel::Medium.as_str(), "medium");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Read-only access to public data.
    Low,
    /// Default for authenticated or degraded requests without mutation rights.
    Medium,
    /// Holds write or delete rights.
    High,
    /// Holds execute rights.
    Critical,
}

impl RiskLevel {
    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown risk level '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        let mut levels = vec![
            RiskLevel::Critical,
            RiskLevel::Low,
            RiskLevel::High,
            RiskLevel::Medium,
        ];
        levels.sort();
        assert_eq!(
            levels,
            vec![
                RiskLevel::Low,
                RiskLevel::Medium,
                RiskLevel::High,
                RiskLevel::Critical
            ]
        );
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!("severe".parse::<RiskLevel>().is_err());
        assert_eq!(" CRITICAL ".parse::<RiskLevel>(), Ok(RiskLevel::Critical));
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&RiskLevel::Critical).expect("serialize risk");
        assert_eq!(json, "\"critical\"");
    }
}
