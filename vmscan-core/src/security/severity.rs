//! Severity levels and per-severity summaries.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ScanError;

use super::Finding;

/// Vulnerability severity, ordered from least to most severe.
///
/// The derived `Ord` is the threshold order: `None < Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational, no assigned impact.
    None,
    /// Low severity - CVSS 0.1-3.9.
    Low,
    /// Medium severity - CVSS 4.0-6.9.
    Medium,
    /// High severity - CVSS 7.0-8.9.
    High,
    /// Critical severity - CVSS 9.0-10.0.
    Critical,
}

impl Severity {
    /// Every level, least severe first.
    pub const ALL: [Severity; 5] =
        [Severity::None, Severity::Low, Severity::Medium, Severity::High, Severity::Critical];

    /// Parse a severity label. Returns `None` for labels outside the known set
    /// (Trivy reports `UNKNOWN` when no authority has rated a finding).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "CRITICAL" => Some(Severity::Critical),
            "HIGH" => Some(Severity::High),
            "MEDIUM" => Some(Severity::Medium),
            "LOW" => Some(Severity::Low),
            "NONE" => Some(Severity::None),
            _ => None,
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::None => "NONE",
        }
    }

    /// Whether a finding of this severity meets `threshold`.
    pub fn meets(&self, threshold: Severity) -> bool {
        *self >= threshold
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::parse(s).ok_or_else(|| ScanError::InvalidConfig {
            reason: format!(
                "unknown severity '{}' (expected one of NONE, LOW, MEDIUM, HIGH, CRITICAL)",
                s
            ),
        })
    }
}

// Config files are hand-written, so accept any casing.
impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let label = String::deserialize(deserializer)?;
        label.parse().map_err(serde::de::Error::custom)
    }
}

/// Count of findings by severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeveritySummary {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub none: u32,
    /// Findings whose severity label was not recognized.
    pub unknown: u32,
    pub total: u32,
}

impl SeveritySummary {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut summary = SeveritySummary::default();
        for finding in findings {
            match finding.severity {
                Some(Severity::Critical) => summary.critical += 1,
                Some(Severity::High) => summary.high += 1,
                Some(Severity::Medium) => summary.medium += 1,
                Some(Severity::Low) => summary.low += 1,
                Some(Severity::None) => summary.none += 1,
                None => summary.unknown += 1,
            }
            summary.total += 1;
        }
        summary
    }

    /// Number of findings at exactly `severity`.
    pub fn count(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::None => self.none,
        }
    }

    /// Most severe level present, if any recognized finding exists.
    pub fn highest(&self) -> Option<Severity> {
        Severity::ALL.iter().rev().copied().find(|s| self.count(*s) > 0)
    }
}

impl fmt::Display for SeveritySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "critical={} high={} medium={} low={} none={} unknown={}",
            self.critical, self.high, self.medium, self.low, self.none, self.unknown
        )
    }
}
