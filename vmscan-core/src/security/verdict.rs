//! Threshold evaluation of parsed reports.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

use super::{parse_report, Finding, ParsedReport, Severity, SeveritySummary};

/// Outcome of comparing a report against a severity threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanVerdict {
    /// Threshold the findings were compared against.
    pub threshold: Severity,
    /// Findings at or above the threshold.
    pub retained: Vec<Finding>,
    /// Number of findings in the full report, retained or not.
    pub total_findings: usize,
    /// Per-severity counts over the full report.
    pub summary: SeveritySummary,
    /// True when nothing was retained.
    pub pass: bool,
}

impl ScanVerdict {
    /// Classify an already parsed report.
    ///
    /// Only the declared severity decides retention; numeric scores ride along
    /// for reporting. Findings with an unrecognized severity never count.
    pub fn from_report(report: &ParsedReport, threshold: Severity) -> Self {
        let retained: Vec<Finding> = report
            .findings
            .iter()
            .filter(|f| f.severity.is_some_and(|s| s.meets(threshold)))
            .cloned()
            .collect();

        Self {
            threshold,
            pass: retained.is_empty(),
            retained,
            total_findings: report.findings.len(),
            summary: report.summary.clone(),
        }
    }

    /// Image tag value for this verdict.
    pub fn tag_value(&self) -> &'static str {
        if self.pass {
            "passed"
        } else {
            "failed"
        }
    }

    /// The persisted report: the retained findings as a JSON array.
    pub fn report_blob(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.retained).map_err(|e| ScanError::InvalidReport {
            reason: format!("Failed to serialize retained findings: {}", e),
        })
    }
}

/// Parse a raw Trivy report and evaluate it against `threshold`.
pub fn interpret(raw: &[u8], threshold: Severity) -> Result<ScanVerdict> {
    let report = parse_report(raw)?;
    Ok(ScanVerdict::from_report(&report, threshold))
}
