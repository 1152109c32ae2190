//! Vulnerability report interpretation.
//!
//! This module turns the scanner's JSON output into typed findings and
//! decides pass/fail against a severity threshold:
//! - Parsing Trivy reports into a flat list of [`Finding`]s
//! - Summarizing findings by [`Severity`]
//! - Producing a [`ScanVerdict`] whose retained findings become the stored report
//!
//! # Example
//!
//! ```
//! use vmscan_core::security::{interpret, Severity};
//!
//! let raw = br#"{"Results": [{"Vulnerabilities": [
//!     {"VulnerabilityID": "CVE-2024-1", "PkgName": "zlib", "Severity": "HIGH"}
//! ]}]}"#;
//!
//! let verdict = interpret(raw, Severity::Medium).unwrap();
//! assert!(!verdict.pass);
//! assert_eq!(verdict.retained[0].package_name, "zlib");
//! ```

mod severity;
mod trivy;
mod verdict;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use severity::{Severity, SeveritySummary};
pub use trivy::parse_report;
pub use verdict::{interpret, ScanVerdict};

/// Numeric score from one rating authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v2_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v3_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v2_vector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v3_vector: Option<String>,
}

/// A single vulnerability found in an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// CVE or advisory ID (e.g., "CVE-2024-12345").
    pub id: String,
    /// Affected package name.
    pub package_name: String,
    /// Currently installed version.
    pub installed_version: String,
    /// Version that fixes the vulnerability, if one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_version: Option<String>,
    /// Declared severity; `None` when the label was not recognized.
    pub severity: Option<Severity>,
    /// Severity label exactly as the scanner reported it.
    pub severity_label: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Scores keyed by rating authority.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, Score>,
}

/// Every finding from a report, flattened across result groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedReport {
    pub artifact_name: Option<String>,
    pub findings: Vec<Finding>,
    pub summary: SeveritySummary,
}
