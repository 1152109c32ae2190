//! Compensation stack for provisioned resources.
//!
//! Every successful acquire pushes its release. [`Compensations::unwind`]
//! consumes the stack and runs the releases newest-first, each exactly once,
//! so every exit path of a lifecycle run tears down the same way.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::{ReleaseFailure, ResourceKind, ScanError};
use crate::observability::metrics;

type Release = Box<dyn FnOnce() -> BoxFuture<'static, crate::Result<()>> + Send>;

struct Pending {
    resource: ResourceKind,
    id: String,
    release: Release,
}

/// Pending releases for one lifecycle run.
pub struct Compensations {
    image_id: String,
    pending: Vec<Pending>,
}

impl Compensations {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self { image_id: image_id.into(), pending: Vec::new() }
    }

    /// Register the release for a resource that was just acquired.
    pub fn push<F, Fut>(&mut self, resource: ResourceKind, id: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let id = id.into();
        debug!(image_id = %self.image_id, resource = %resource, id = %id, "Registered release");
        self.pending.push(Pending { resource, id, release: Box::new(move || release().boxed()) });
    }

    /// Move the pending releases into a new stack, leaving this one empty.
    pub fn take(&mut self) -> Compensations {
        let pending = std::mem::take(&mut self.pending);
        Compensations { image_id: self.image_id.clone(), pending }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run every pending release in reverse acquisition order.
    ///
    /// A failed release is logged and collected; the remaining releases still run.
    pub async fn unwind(mut self) -> Vec<ReleaseFailure> {
        let pending = std::mem::take(&mut self.pending);
        let mut failures = Vec::new();

        for Pending { resource, id, release } in pending.into_iter().rev() {
            match release().await {
                Ok(()) => {
                    debug!(image_id = %self.image_id, resource = %resource, id = %id, "Released");
                    metrics::record_release(resource, true);
                }
                Err(e) => {
                    warn!(
                        image_id = %self.image_id,
                        resource = %resource,
                        id = %id,
                        error = %e,
                        "Failed to release resource"
                    );
                    metrics::record_release(resource, false);
                    failures.push(ReleaseFailure { resource, id, reason: e.to_string() });
                }
            }
        }

        failures
    }

    /// Unwind, then return `err` carrying any release failures.
    pub async fn fail(self, err: ScanError) -> ScanError {
        let failures = self.unwind().await;
        err.with_cleanup(failures)
    }
}

impl Drop for Compensations {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            let leaked: Vec<String> =
                self.pending.iter().map(|p| format!("{} {}", p.resource, p.id)).collect();
            warn!(
                image_id = %self.image_id,
                leaked = %leaked.join(", "),
                "Compensations dropped without unwinding; resources leaked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push_recorded(
        saga: &mut Compensations,
        log: &Arc<Mutex<Vec<String>>>,
        resource: ResourceKind,
        id: &str,
        fail: bool,
    ) {
        let log = log.clone();
        let name = id.to_string();
        saga.push(resource, id, move || async move {
            log.lock().unwrap().push(name.clone());
            if fail {
                Err(ScanError::cloud("delete", format!("{} is busy", name)))
            } else {
                Ok(())
            }
        });
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_order() {
        let log = recorder();
        let mut saga = Compensations::new("img-1");
        push_recorded(&mut saga, &log, ResourceKind::Keypair, "kp", false);
        push_recorded(&mut saga, &log, ResourceKind::FloatingIp, "fip", false);
        push_recorded(&mut saga, &log, ResourceKind::Instance, "vm", false);
        assert_eq!(saga.len(), 3);

        let failures = saga.unwind().await;

        assert!(failures.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["vm", "fip", "kp"]);
    }

    #[tokio::test]
    async fn test_failed_release_does_not_stop_unwind() {
        let log = recorder();
        let mut saga = Compensations::new("img-1");
        push_recorded(&mut saga, &log, ResourceKind::Keypair, "kp", false);
        push_recorded(&mut saga, &log, ResourceKind::FloatingIp, "fip", true);
        push_recorded(&mut saga, &log, ResourceKind::Instance, "vm", false);

        let failures = saga.unwind().await;

        assert_eq!(*log.lock().unwrap(), vec!["vm", "fip", "kp"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].resource, ResourceKind::FloatingIp);
        assert_eq!(failures[0].id, "fip");
        assert!(failures[0].reason.contains("fip is busy"));
    }

    #[tokio::test]
    async fn test_fail_keeps_original_error_primary() {
        let log = recorder();
        let mut saga = Compensations::new("img-1");
        push_recorded(&mut saga, &log, ResourceKind::Keypair, "kp", true);

        let err = saga
            .fail(ScanError::ReadinessTimeout { instance_id: "vm".into(), attempts: 100 })
            .await;

        assert!(matches!(err.primary(), ScanError::ReadinessTimeout { .. }));
        match &err {
            ScanError::Cleanup { failures, .. } => assert_eq!(failures.len(), 1),
            other => panic!("expected cleanup error, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_without_release_failures_returns_error_unchanged() {
        let log = recorder();
        let mut saga = Compensations::new("img-1");
        push_recorded(&mut saga, &log, ResourceKind::Keypair, "kp", false);

        let err = saga.fail(ScanError::InvalidReport { reason: "bad".into() }).await;

        assert!(matches!(err, ScanError::InvalidReport { .. }));
        assert_eq!(*log.lock().unwrap(), vec!["kp"]);
    }

    #[tokio::test]
    async fn test_take_moves_pending_releases() {
        let log = recorder();
        let mut saga = Compensations::new("img-1");
        push_recorded(&mut saga, &log, ResourceKind::Keypair, "kp", false);
        push_recorded(&mut saga, &log, ResourceKind::Instance, "vm", false);

        let taken = saga.take();
        assert!(saga.is_empty());
        assert_eq!(taken.len(), 2);

        assert!(taken.unwind().await.is_empty());
        assert!(saga.unwind().await.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["vm", "kp"]);
    }

    #[tokio::test]
    async fn test_empty_stack() {
        let saga = Compensations::new("img-1");
        assert!(saga.is_empty());
        assert!(saga.unwind().await.is_empty());
    }
}
