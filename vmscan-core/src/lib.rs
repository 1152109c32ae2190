//! vmscan Core Library
//!
//! Types, traits and engines for vulnerability-scanning VM images on
//! disposable cloud instances: the lifecycle controller that drives one image
//! from provisioning to teardown, the batch scheduler that runs many of them
//! concurrently, and the report interpreter that turns scanner output into a
//! pass/fail verdict.

pub mod batch;
pub mod cloud;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod paths;
pub mod remote;
pub mod security;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use batch::{
    select_targets, BatchReport, BatchScheduler, ScanRunner, TargetOutcome, TargetSelector,
};
pub use cloud::{CloudProvider, OpenStackClient, OpenStackCredentials};
pub use config::{PollPolicy, ScanConfig, ViolationPolicy};
pub use error::{ErrorCategory, ReleaseFailure, ResourceKind, Result, ScanError};
pub use lifecycle::{LifecycleController, ScanJob};
pub use observability::{init as init_observability, LogOptions};
pub use remote::{CopiedFile, Identity, OpenSshConnector, RemoteConnector, RemoteSession};
pub use security::{interpret, parse_report, Finding, ParsedReport, ScanVerdict, Severity};
pub use store::{LocalStore, ObjectStore, StoreLocation, SwiftStore};
pub use types::{CloudImage, ScanTarget};
