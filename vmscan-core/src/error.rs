//! Error types for vmscan.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Every variant maps onto an [`ErrorCategory`] so that batch summaries and
//! metrics can tell infrastructure faults apart from policy outcomes.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::security::Severity;

/// Result type alias for vmscan operations.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Kind of cloud resource provisioned during a lifecycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Keypair,
    FloatingIp,
    Instance,
    Session,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Keypair => "keypair",
            ResourceKind::FloatingIp => "floating_ip",
            ResourceKind::Instance => "instance",
            ResourceKind::Session => "session",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A release that failed while unwinding a lifecycle run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub resource: ResourceKind,
    pub id: String,
    pub reason: String,
}

impl fmt::Display for ReleaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.resource, self.id, self.reason)
    }
}

/// Coarse classification of a [`ScanError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Provisioning,
    Readiness,
    Connectivity,
    ScanTimeout,
    Interpretation,
    Policy,
    PostScan,
    Cleanup,
    Config,
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Provisioning => "provisioning",
            ErrorCategory::Readiness => "readiness",
            ErrorCategory::Connectivity => "connectivity",
            ErrorCategory::ScanTimeout => "scan_timeout",
            ErrorCategory::Interpretation => "interpretation",
            ErrorCategory::Policy => "policy",
            ErrorCategory::PostScan => "post_scan",
            ErrorCategory::Cleanup => "cleanup",
            ErrorCategory::Config => "config",
            ErrorCategory::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for vmscan.
#[derive(Error, Debug)]
pub enum ScanError {
    // Provisioning errors
    #[error("Failed to provision {resource} for image {image_id}: {source}")]
    Provisioning {
        resource: ResourceKind,
        image_id: String,
        #[source]
        source: Box<ScanError>,
    },

    #[error("Failed to attach floating IP {address} to instance {instance_id}: {source}")]
    Attach {
        instance_id: String,
        address: String,
        #[source]
        source: Box<ScanError>,
    },

    // Readiness errors
    #[error("Instance {instance_id} not active after {attempts} status checks")]
    ReadinessTimeout { instance_id: String, attempts: u32 },

    #[error("Instance {instance_id} entered failed state: {status}")]
    InstanceFailed { instance_id: String, status: String },

    #[error("Failed to query status of instance {instance_id}: {source}")]
    InstanceStatus {
        instance_id: String,
        #[source]
        source: Box<ScanError>,
    },

    // Connectivity errors
    #[error("Could not open remote session to {address} after {attempts} attempts: {source}")]
    Connect {
        address: String,
        attempts: u32,
        #[source]
        source: Box<ScanError>,
    },

    #[error("Remote command failed: {reason}")]
    Remote { reason: String },

    // Scan errors
    #[error("Scan on {address} did not complete after {attempts} completion checks")]
    ScanTimeout { address: String, attempts: u32 },

    #[error("Failed to transfer {path}: {reason}")]
    Transfer { path: String, reason: String },

    #[error("Invalid scan report: {reason}")]
    InvalidReport { reason: String },

    // Policy outcome
    #[error(
        "Image {image_id} has {retained} finding(s) at or above {threshold} (image {}){}",
        removal_label(.image_removed),
        post_scan_label(.post_scan)
    )]
    ThresholdViolation {
        image_id: String,
        threshold: Severity,
        retained: usize,
        image_removed: bool,
        /// Tagging, removal or upload failure that happened alongside the violation.
        #[source]
        post_scan: Option<Box<ScanError>>,
    },

    #[error("Failed to {action} for image {image_id}: {source}")]
    PostScan {
        image_id: String,
        action: &'static str,
        #[source]
        source: Box<ScanError>,
    },

    #[error("{}", format_cleanup(.source, .failures))]
    Cleanup { source: Option<Box<ScanError>>, failures: Vec<ReleaseFailure> },

    // Collaborator errors
    #[error("Cloud API {operation} failed: {reason}")]
    Cloud { operation: String, reason: String },

    #[error("Object store write to {key} failed: {reason}")]
    Store { key: String, reason: String },

    #[error("Image not found: {image_id}")]
    ImageNotFound { image_id: String },

    // Batch errors
    #[error("No images match name prefix '{prefix}'")]
    NoTargets { prefix: String },

    #[error("{failed} of {total} image scan(s) failed")]
    BatchFailed { failed: usize, total: usize },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn removal_label(removed: &bool) -> &'static str {
    if *removed {
        "removed"
    } else {
        "kept"
    }
}

fn post_scan_label(post_scan: &Option<Box<ScanError>>) -> String {
    match post_scan {
        Some(err) => format!("; {}", err),
        None => String::new(),
    }
}

fn format_cleanup(source: &Option<Box<ScanError>>, failures: &[ReleaseFailure]) -> String {
    let released = failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
    match source {
        Some(source) => format!("{} (cleanup also failed: {})", source, released),
        None => format!("Cleanup failed: {}", released),
    }
}

impl ScanError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Create a Cloud error for a named API operation.
    pub fn cloud(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Cloud { operation: operation.into(), reason: reason.to_string() }
    }

    /// Attach release failures collected while unwinding.
    ///
    /// The original error stays the primary cause; an empty failure list
    /// returns `self` unchanged.
    pub fn with_cleanup(self, failures: Vec<ReleaseFailure>) -> Self {
        if failures.is_empty() {
            return self;
        }
        match self {
            ScanError::Cleanup { source, failures: mut existing } => {
                existing.extend(failures);
                ScanError::Cleanup { source, failures: existing }
            }
            other => ScanError::Cleanup { source: Some(Box::new(other)), failures },
        }
    }

    /// The error that triggered a cleanup, or `self` for every other variant.
    pub fn primary(&self) -> &ScanError {
        match self {
            ScanError::Cleanup { source: Some(source), .. } => source.primary(),
            other => other,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ScanError::Provisioning { .. } | ScanError::Attach { .. } => {
                ErrorCategory::Provisioning
            }
            ScanError::ReadinessTimeout { .. }
            | ScanError::InstanceFailed { .. }
            | ScanError::InstanceStatus { .. } => ErrorCategory::Readiness,
            ScanError::Connect { .. } | ScanError::Remote { .. } => ErrorCategory::Connectivity,
            ScanError::ScanTimeout { .. } | ScanError::Transfer { .. } => {
                ErrorCategory::ScanTimeout
            }
            ScanError::InvalidReport { .. } => ErrorCategory::Interpretation,
            ScanError::ThresholdViolation { .. } => ErrorCategory::Policy,
            ScanError::PostScan { .. } | ScanError::Store { .. } => ErrorCategory::PostScan,
            ScanError::Cleanup { .. } => ErrorCategory::Cleanup,
            ScanError::InvalidConfig { .. } => ErrorCategory::Config,
            _ => ErrorCategory::Other,
        }
    }

    /// True for outcomes that reflect the image's contents rather than an infrastructure fault.
    pub fn is_policy(&self) -> bool {
        self.primary().category() == ErrorCategory::Policy
    }
}
