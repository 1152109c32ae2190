//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_histogram, histogram};

use crate::error::ResourceKind;
use crate::security::Severity;

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    describe_counter!(
        "vmscan_scans_total",
        "Total number of image scans finished (by outcome: passed, failed, error category)"
    );
    describe_histogram!(
        "vmscan_scan_duration_seconds",
        "Wall time of one image lifecycle, provisioning through teardown"
    );
    describe_histogram!(
        "vmscan_instance_ready_seconds",
        "Time from instance creation until the provider reports it active"
    );
    describe_counter!(
        "vmscan_resource_releases_total",
        "Total number of resource releases (by resource, outcome)"
    );
    describe_counter!(
        "vmscan_findings_retained_total",
        "Findings at or above the threshold (by severity)"
    );
}

/// Record a finished lifecycle run.
pub fn record_scan(outcome: &str, duration_secs: f64) {
    counter!("vmscan_scans_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("vmscan_scan_duration_seconds").record(duration_secs);
}

pub fn record_instance_ready(duration_secs: f64) {
    histogram!("vmscan_instance_ready_seconds").record(duration_secs);
}

pub fn record_release(resource: ResourceKind, ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!(
        "vmscan_resource_releases_total",
        "resource" => resource.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_retained(severity: Option<Severity>, count: u64) {
    let label = severity.map(|s| s.as_str()).unwrap_or("UNKNOWN");
    counter!("vmscan_findings_retained_total", "severity" => label).increment(count);
}
