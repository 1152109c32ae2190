//! Configuration management.
//!
//! `ScanConfig` is loaded once (JSON file, then CLI overrides) and passed by
//! reference into the lifecycle controller and batch scheduler. Nothing in the
//! core reads process-wide configuration.

use crate::error::{Result, ScanError};
use crate::paths;
use crate::security::Severity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fixed-interval, bounded retry loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Instance readiness: 100 checks, 5 seconds apart.
    pub const READINESS: PollPolicy = PollPolicy { interval_ms: 5_000, max_attempts: 100 };

    /// Scan completion: 20 checks, 10 seconds apart.
    pub const COMPLETION: PollPolicy = PollPolicy { interval_ms: 10_000, max_attempts: 20 };

    /// Initial remote connection: 10 attempts, 10 seconds apart.
    pub const CONNECT: PollPolicy = PollPolicy { interval_ms: 10_000, max_attempts: 10 };

    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self { interval_ms: interval.as_millis() as u64, max_attempts }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on time spent sleeping across all attempts.
    pub fn budget(&self) -> Duration {
        self.interval() * self.max_attempts.saturating_sub(1)
    }
}

/// What a threshold violation means for the run's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationPolicy {
    /// Every violation is an error.
    #[default]
    Strict,
    /// A violation on an image that was tagged (not removed) is only logged.
    WarnWhenTagged,
}

/// Per-run scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Flavor name or ID for scan instances.
    pub flavor: String,
    /// Network the scan instance boots on.
    pub network_id: String,
    /// External network that floating IPs are allocated from.
    pub floating_ip_network: String,
    pub config_drive: bool,
    /// Findings at or above this severity fail the image.
    pub severity_threshold: Severity,
    /// Delete failing images instead of tagging them.
    pub auto_delete_on_fail: bool,
    /// Return failing verdicts as success.
    pub skip_threshold_check: bool,
    pub violation_policy: ViolationPolicy,
    /// Image property that receives "passed"/"failed".
    pub tag_key: String,
    /// Object-store key prefix for reports.
    pub report_prefix: String,
    pub keypair_prefix: String,
    /// Finding IDs the scanner should ignore.
    pub ignore_list: Vec<String>,
    /// Directory on the instance holding the marker and results files.
    pub remote_dir: String,
    pub ssh_user: String,
    /// Pin the Trivy version installed on images that lack it.
    pub trivy_version: Option<String>,
    pub scratch_dir: PathBuf,
    pub readiness: PollPolicy,
    pub completion: PollPolicy,
    pub connect: PollPolicy,
    /// Maximum simultaneous lifecycle runs.
    pub concurrency: usize,
    pub log_level: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            flavor: String::new(),
            network_id: String::new(),
            floating_ip_network: "public".to_string(),
            config_drive: false,
            severity_threshold: Severity::High,
            auto_delete_on_fail: false,
            skip_threshold_check: false,
            violation_policy: ViolationPolicy::Strict,
            tag_key: "vulnerability_scan".to_string(),
            report_prefix: "scans".to_string(),
            keypair_prefix: "vmscan".to_string(),
            ignore_list: Vec::new(),
            remote_dir: "/tmp/vmscan".to_string(),
            ssh_user: "ubuntu".to_string(),
            trivy_version: None,
            scratch_dir: paths::scratch_dir(),
            readiness: PollPolicy::READINESS,
            completion: PollPolicy::COMPLETION,
            connect: PollPolicy::CONNECT,
            concurrency: 5,
            log_level: "info".to_string(),
        }
    }
}

impl ScanConfig {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing default file yields the defaults; an explicitly named file
    /// must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (paths::config_path(), false),
        };

        if !path.exists() {
            if explicit {
                return Err(ScanError::InvalidConfig {
                    reason: format!("config file {} does not exist", path.display()),
                });
            }
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| ScanError::IoError { path: path.clone(), source: e })?;
        serde_json::from_str(&content).map_err(|e| ScanError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })
    }

    /// Check the settings a lifecycle run depends on.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("flavor", &self.flavor),
            ("network_id", &self.network_id),
            ("floating_ip_network", &self.floating_ip_network),
            ("tag_key", &self.tag_key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(invalid(format!("{} must be set", name)));
            }
        }

        let policies = [
            ("readiness", &self.readiness),
            ("completion", &self.completion),
            ("connect", &self.connect),
        ];
        for (name, policy) in policies {
            if policy.max_attempts == 0 {
                return Err(invalid(format!("{}.max_attempts must be at least 1", name)));
            }
        }

        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1".to_string()));
        }

        if !self.remote_dir.starts_with('/') || !is_shell_safe(&self.remote_dir, "/._-") {
            return Err(invalid(format!(
                "remote_dir '{}' must be an absolute path of [A-Za-z0-9/._-]",
                self.remote_dir
            )));
        }

        if !is_shell_safe(&self.ssh_user, "._-") {
            return Err(invalid(format!("ssh_user '{}' is not a valid user name", self.ssh_user)));
        }

        if let Some(version) = &self.trivy_version {
            if !is_shell_safe(version, ".-") {
                return Err(invalid(format!("trivy_version '{}' is not a version string", version)));
            }
        }

        for id in &self.ignore_list {
            if !is_shell_safe(id, "._:-") {
                return Err(invalid(format!("ignore_list entry '{}' is not a finding ID", id)));
            }
        }

        Ok(())
    }
}

fn invalid(reason: String) -> ScanError {
    ScanError::InvalidConfig { reason }
}

/// Non-empty and limited to ASCII alphanumerics plus `extra`.
pub(crate) fn is_shell_safe(value: &str, extra: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || extra.contains(c))
}
