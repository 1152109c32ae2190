//! Trivy JSON report parsing.
//!
//! The scanner runs on the ephemeral instance (`trivy rootfs --format json`) and
//! the resulting file is copied back to the host. This module turns that file
//! into a [`ParsedReport`]; thresholding happens in [`super::verdict`].

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::error::{Result, ScanError};

use super::{Finding, ParsedReport, Score, Severity, SeveritySummary};

/// Parse raw Trivy JSON output.
///
/// A report without result groups is valid and yields no findings. Empty
/// input is rejected: a missing report is a scanner failure, not a clean scan.
pub fn parse_report(raw: &[u8]) -> Result<ParsedReport> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ScanError::InvalidReport { reason: "report is empty".into() });
    }

    let output: TrivyOutput = serde_json::from_slice(raw).map_err(|e| {
        tracing::debug!("Trivy output: {}", String::from_utf8_lossy(raw));
        ScanError::InvalidReport { reason: format!("Failed to parse Trivy output: {}", e) }
    })?;

    let findings: Vec<Finding> = output
        .results
        .unwrap_or_default()
        .into_iter()
        .flat_map(|result| result.vulnerabilities.unwrap_or_default())
        .map(convert_vulnerability)
        .collect();

    let summary = SeveritySummary::from_findings(&findings);

    Ok(ParsedReport { artifact_name: output.artifact_name, findings, summary })
}

fn convert_vulnerability(vuln: TrivyVulnerability) -> Finding {
    let scores = vuln
        .cvss
        .unwrap_or_default()
        .into_iter()
        .map(|(authority, cvss)| {
            (
                authority,
                Score {
                    v2_score: cvss.v2_score,
                    v3_score: cvss.v3_score,
                    v2_vector: cvss.v2_vector,
                    v3_vector: cvss.v3_vector,
                },
            )
        })
        .collect::<BTreeMap<_, _>>();

    Finding {
        id: vuln.vulnerability_id,
        package_name: vuln.pkg_name,
        installed_version: vuln.installed_version.unwrap_or_default(),
        fixed_version: vuln.fixed_version.filter(|v| !v.is_empty()),
        severity: Severity::parse(&vuln.severity),
        severity_label: vuln.severity,
        title: vuln.title.unwrap_or_default(),
        description: vuln.description.unwrap_or_default(),
        scores,
    }
}

// Trivy JSON output structures

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyOutput {
    artifact_name: Option<String>,
    results: Option<Vec<TrivyResult>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyResult {
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    vulnerability_id: String,
    pkg_name: String,
    installed_version: Option<String>,
    fixed_version: Option<String>,
    #[serde(default)]
    severity: String,
    title: Option<String>,
    description: Option<String>,
    /// Scores keyed by rating authority (`nvd`, `redhat`, `ghsa`, ...).
    #[serde(rename = "CVSS")]
    cvss: Option<HashMap<String, TrivyCvss>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyCvss {
    v2_vector: Option<String>,
    v3_vector: Option<String>,
    v2_score: Option<f64>,
    v3_score: Option<f64>,
}
