//! Scan lifecycle controller.
//!
//! Drives one image through provisioning, remote scan, result retrieval,
//! interpretation, tagging/upload and teardown. Every resource acquired along
//! the way is registered on a [`Compensations`] stack, and every exit path
//! unwinds that stack before returning.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::batch::{panic_message, ScanRunner};
use crate::cloud::CloudProvider;
use crate::config::{ScanConfig, ViolationPolicy};
use crate::error::{ReleaseFailure, ResourceKind, Result, ScanError};
use crate::observability::metrics;
use crate::paths;
use crate::remote::{connect_with_retry, remote_path, Identity, RemoteConnector, RemoteSession};
use crate::security::{interpret, ScanVerdict, Severity};
use crate::store::ObjectStore;
use crate::types::{FloatingIp, Instance, InstanceSpec, InstanceState, Keypair, ScanTarget};

mod bootscript;
mod poll;
mod saga;

pub use bootscript::{boot_script, BootScriptOptions, MARKER_FILE, RESULTS_FILE};
pub use poll::{poll_until, PollOutcome};
pub use saga::Compensations;

/// Content type of persisted reports.
pub const REPORT_CONTENT_TYPE: &str = "application/json";

/// Per-target state of one lifecycle run.
///
/// Owned by a single run and never shared; the handles are filled in as
/// provisioning succeeds.
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub image_id: String,
    pub keypair: Option<String>,
    pub floating_ip: Option<FloatingIp>,
    pub instance: Option<Instance>,
    pub started_at: DateTime<Utc>,
    pub readiness_polls: u32,
    pub completion_polls: u32,
}

impl ScanJob {
    pub fn new(target: &ScanTarget) -> Self {
        Self {
            image_id: target.id.clone(),
            keypair: None,
            floating_ip: None,
            instance: None,
            started_at: Utc::now(),
            readiness_polls: 0,
            completion_polls: 0,
        }
    }
}

/// Everything a run must give back, held outside the run's future so a
/// panicking run can still be torn down.
struct Teardown {
    saga: Compensations,
    session: Option<Box<dyn RemoteSession>>,
}

impl Teardown {
    fn new(image_id: &str) -> Self {
        Self { saga: Compensations::new(image_id), session: None }
    }

    /// Close the session, then release the provisioned resources newest-first.
    async fn release(&mut self) -> Vec<ReleaseFailure> {
        let mut failures = match self.session.take() {
            Some(session) => close_session(session).await,
            None => Vec::new(),
        };
        failures.extend(self.saga.take().unwind().await);
        failures
    }

    async fn fail(&mut self, err: ScanError) -> ScanError {
        let failures = self.release().await;
        err.with_cleanup(failures)
    }
}

/// Runs single-image scan lifecycles against the three external clients.
#[derive(Clone)]
pub struct LifecycleController {
    cloud: Arc<dyn CloudProvider>,
    connector: Arc<dyn RemoteConnector>,
    store: Arc<dyn ObjectStore>,
}

impl LifecycleController {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        connector: Arc<dyn RemoteConnector>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self { cloud, connector, store }
    }

    /// Scan one image.
    ///
    /// Returns the verdict, or the first unrecoverable error. Failing verdicts
    /// become [`ScanError::ThresholdViolation`] unless the configuration says
    /// otherwise. Release failures never replace the error that triggered the
    /// teardown; they are attached to it as [`ScanError::Cleanup`]. A panic
    /// inside the run still releases everything it acquired and surfaces as
    /// [`ScanError::Internal`].
    #[instrument(skip(self, target, config), fields(image_id = %target.id, image = %target.name))]
    pub async fn run(&self, target: &ScanTarget, config: &ScanConfig) -> Result<ScanVerdict> {
        let started = Instant::now();
        let mut job = ScanJob::new(target);
        let mut teardown = Teardown::new(&target.id);

        let run = AssertUnwindSafe(self.execute(target, config, &mut job, &mut teardown));
        let result = match run.catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Scan lifecycle panicked, releasing resources");
                let failures = teardown.release().await;
                remove_scratch(&paths::run_scratch_dir(&config.scratch_dir, &target.id)).await;
                Err(ScanError::Internal(format!("scan lifecycle panicked: {}", message))
                    .with_cleanup(failures))
            }
        };

        let outcome = match &result {
            Ok(verdict) if verdict.pass => "passed",
            Ok(_) => "failed",
            Err(e) if e.is_policy() => "failed",
            Err(e) => e.category().as_str(),
        };
        metrics::record_scan(outcome, started.elapsed().as_secs_f64());

        info!(
            outcome,
            started_at = %job.started_at,
            readiness_polls = job.readiness_polls,
            completion_polls = job.completion_polls,
            elapsed_secs = started.elapsed().as_secs(),
            "Scan lifecycle finished"
        );

        result
    }

    async fn execute(
        &self,
        target: &ScanTarget,
        config: &ScanConfig,
        job: &mut ScanJob,
        teardown: &mut Teardown,
    ) -> Result<ScanVerdict> {
        let script = boot_script(&BootScriptOptions::from_config(config))?;

        // Step 1: identity
        let keypair_name = keypair_name(&config.keypair_prefix, &target.id);
        let keypair = self
            .cloud
            .create_keypair(&keypair_name)
            .await
            .map_err(|e| provisioning(ResourceKind::Keypair, target, e))?;
        self.release_keypair_on_unwind(&mut teardown.saga, &keypair);
        job.keypair = Some(keypair.name.clone());

        // Step 2: network identity
        let ip = match self.cloud.create_floating_ip(&config.floating_ip_network).await {
            Ok(ip) => ip,
            Err(e) => {
                let err = provisioning(ResourceKind::FloatingIp, target, e);
                return Err(teardown.fail(err).await);
            }
        };
        self.release_floating_ip_on_unwind(&mut teardown.saga, &ip);
        job.floating_ip = Some(ip.clone());

        // Step 3: instance
        let spec = InstanceSpec {
            name: keypair.name.clone(),
            image_id: target.id.clone(),
            keypair_name: keypair.name.clone(),
            flavor: config.flavor.clone(),
            network_id: config.network_id.clone(),
            config_drive: config.config_drive,
            boot_script: script,
        };
        let created_at = Instant::now();
        let instance = match self.cloud.create_instance(&spec).await {
            Ok(instance) => instance,
            Err(e) => {
                let err = provisioning(ResourceKind::Instance, target, e);
                return Err(teardown.fail(err).await);
            }
        };
        self.release_instance_on_unwind(&mut teardown.saga, &instance);
        job.instance = Some(instance.clone());
        info!(instance_id = %instance.id, address = %ip.address, "Scan instance created");

        // Step 4: readiness
        match self.wait_until_active(&instance, config).await {
            Ok(attempts) => {
                job.readiness_polls = attempts;
                metrics::record_instance_ready(created_at.elapsed().as_secs_f64());
            }
            Err(e) => return Err(teardown.fail(e).await),
        }

        // Step 5: attach
        if let Err(e) = self.cloud.attach_floating_ip(&instance.id, &ip).await {
            let err = ScanError::Attach {
                instance_id: instance.id.clone(),
                address: ip.address.clone(),
                source: Box::new(e),
            };
            return Err(teardown.fail(err).await);
        }

        // Step 6: remote session, completion polling, result download
        let identity = Identity::new(&config.ssh_user, &keypair);
        let connecting =
            connect_with_retry(self.connector.as_ref(), &identity, &ip.address, &config.connect);
        let session = match connecting.await {
            Ok(session) => session,
            Err(e) => {
                let err = ScanError::Connect {
                    address: ip.address.clone(),
                    attempts: config.connect.max_attempts,
                    source: Box::new(e),
                };
                return Err(teardown.fail(err).await);
            }
        };

        let scratch = paths::run_scratch_dir(&config.scratch_dir, &target.id);
        let session: &dyn RemoteSession = &**teardown.session.insert(session);
        let fetched = self.fetch_results(session, &scratch, config, job).await;

        // Step 7: teardown, whatever step 6 did
        let failures = teardown.release().await;

        let results = match fetched {
            Ok(path) => path,
            Err(e) => {
                remove_scratch(&scratch).await;
                return Err(e.with_cleanup(failures));
            }
        };

        // Step 8: interpretation
        let verdict = match read_and_interpret(&results, config.severity_threshold).await {
            Ok(verdict) => verdict,
            Err(e) => {
                remove_scratch(&scratch).await;
                return Err(e.with_cleanup(failures));
            }
        };
        info!(
            pass = verdict.pass,
            retained = verdict.retained.len(),
            total = verdict.total_findings,
            summary = %verdict.summary,
            "Scan report interpreted"
        );

        // Step 9: post-verdict actions
        let (post_result, image_removed) = self.apply_verdict(target, config, &verdict).await;
        remove_scratch(&scratch).await;

        // Step 10: outcome. A violation stays the primary error even when
        // tagging, removal or upload also failed.
        let outcome = match (judge(target, config, verdict, image_removed), post_result) {
            (judged, Ok(())) => judged,
            (Ok(_), Err(e)) => Err(e),
            (Err(violation), Err(e)) => Err(with_post_scan_failure(violation, e)),
        };
        match outcome {
            Ok(verdict) if failures.is_empty() => Ok(verdict),
            Ok(_) => Err(ScanError::Cleanup { source: None, failures }),
            Err(e) => Err(e.with_cleanup(failures)),
        }
    }

    /// Poll until the instance is active. Returns the number of status checks.
    async fn wait_until_active(&self, instance: &Instance, config: &ScanConfig) -> Result<u32> {
        let cloud = self.cloud.as_ref();
        let instance_id = instance.id.as_str();

        let outcome = poll_until(&config.readiness, |attempt| async move {
            match cloud.instance_state(instance_id).await {
                Ok(InstanceState::Active) => Ok(Some(())),
                Ok(InstanceState::Pending(status)) => {
                    debug!(
                        instance_id = %instance_id,
                        attempt,
                        status = %status,
                        "Instance not active yet"
                    );
                    Ok(None)
                }
                Ok(InstanceState::Failed(status)) => Err(ScanError::InstanceFailed {
                    instance_id: instance_id.to_string(),
                    status,
                }),
                Err(e) => Err(ScanError::InstanceStatus {
                    instance_id: instance_id.to_string(),
                    source: Box::new(e),
                }),
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready { attempts, .. } => {
                info!(instance_id = %instance_id, attempts, "Instance active");
                Ok(attempts)
            }
            PollOutcome::Exhausted { attempts } => {
                warn!(instance_id = %instance_id, attempts, "Instance never became active");
                Err(ScanError::ReadinessTimeout { instance_id: instance_id.to_string(), attempts })
            }
        }
    }

    /// Wait for the completion marker, then copy the results file.
    async fn fetch_results(
        &self,
        session: &dyn RemoteSession,
        scratch: &Path,
        config: &ScanConfig,
        job: &mut ScanJob,
    ) -> Result<PathBuf> {
        let remote_dir = config.remote_dir.as_str();

        let outcome = poll_until(&config.completion, |attempt| async move {
            let marker = session.copy_file_from_remote(remote_dir, scratch, MARKER_FILE).await?;
            match marker {
                Some(file) if !file.is_empty() => Ok(Some(())),
                _ => {
                    debug!(address = %session.address(), attempt, "Scan still running");
                    Ok(None)
                }
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready { attempts, .. } => job.completion_polls = attempts,
            PollOutcome::Exhausted { attempts } => {
                job.completion_polls = attempts;
                return Err(ScanError::ScanTimeout {
                    address: session.address().to_string(),
                    attempts,
                });
            }
        }

        match session.copy_file_from_remote(remote_dir, scratch, RESULTS_FILE).await? {
            Some(file) => {
                debug!(path = %file.path.display(), bytes = file.len, "Downloaded scan results");
                Ok(file.path)
            }
            None => Err(ScanError::Transfer {
                path: remote_path(remote_dir, RESULTS_FILE),
                reason: "results file missing after the scan completed".to_string(),
            }),
        }
    }

    /// Tag or remove the image, then upload the report.
    ///
    /// The upload runs even when tagging/removal failed; the first error wins.
    async fn apply_verdict(
        &self,
        target: &ScanTarget,
        config: &ScanConfig,
        verdict: &ScanVerdict,
    ) -> (Result<()>, bool) {
        let remove = !verdict.pass && config.auto_delete_on_fail;

        let image_result = if remove {
            warn!(image_id = %target.id, "Removing image that failed the scan");
            self.cloud
                .remove_image(&target.id)
                .await
                .map_err(|e| post_scan(target, "remove image", e))
        } else {
            let value = verdict.tag_value();
            debug!(image_id = %target.id, key = %config.tag_key, value, "Tagging image");
            self.cloud
                .tag_image(&target.id, &config.tag_key, value)
                .await
                .map_err(|e| post_scan(target, "tag image", e))
        };
        let image_removed = remove && image_result.is_ok();

        let upload_result = self.upload_report(target, config, verdict).await;

        for finding in &verdict.retained {
            metrics::record_retained(finding.severity, 1);
        }

        (image_result.and(upload_result), image_removed)
    }

    async fn upload_report(
        &self,
        target: &ScanTarget,
        config: &ScanConfig,
        verdict: &ScanVerdict,
    ) -> Result<()> {
        let key = paths::report_key(&config.report_prefix, &target.id);
        let body = verdict.report_blob().map_err(|e| post_scan(target, "encode report", e))?;

        self.store
            .put(REPORT_CONTENT_TYPE, &key, body)
            .await
            .map_err(|e| post_scan(target, "upload report", e))?;

        info!(image_id = %target.id, key = %key, store = self.store.name(), "Report uploaded");
        Ok(())
    }

    fn release_keypair_on_unwind(&self, saga: &mut Compensations, keypair: &Keypair) {
        let cloud = self.cloud.clone();
        let name = keypair.name.clone();
        saga.push(ResourceKind::Keypair, &keypair.name, move || async move {
            cloud.remove_keypair(&name).await
        });
    }

    fn release_floating_ip_on_unwind(&self, saga: &mut Compensations, ip: &FloatingIp) {
        let cloud = self.cloud.clone();
        let id = ip.id.clone();
        saga.push(ResourceKind::FloatingIp, &ip.id, move || async move {
            cloud.remove_floating_ip(&id).await
        });
    }

    fn release_instance_on_unwind(&self, saga: &mut Compensations, instance: &Instance) {
        let cloud = self.cloud.clone();
        let id = instance.id.clone();
        saga.push(ResourceKind::Instance, &instance.id, move || async move {
            cloud.remove_instance(&id).await
        });
    }
}

#[async_trait]
impl ScanRunner for LifecycleController {
    async fn run(&self, target: &ScanTarget, config: &ScanConfig) -> Result<ScanVerdict> {
        LifecycleController::run(self, target, config).await
    }
}

/// Decide whether a verdict is returned as success.
fn judge(
    target: &ScanTarget,
    config: &ScanConfig,
    verdict: ScanVerdict,
    image_removed: bool,
) -> Result<ScanVerdict> {
    if verdict.pass {
        return Ok(verdict);
    }

    if config.skip_threshold_check {
        warn!(
            image_id = %target.id,
            retained = verdict.retained.len(),
            threshold = %verdict.threshold,
            "Threshold check skipped for failing image"
        );
        return Ok(verdict);
    }

    if config.violation_policy == ViolationPolicy::WarnWhenTagged && !image_removed {
        warn!(
            image_id = %target.id,
            retained = verdict.retained.len(),
            threshold = %verdict.threshold,
            "Image failed the scan and was tagged"
        );
        return Ok(verdict);
    }

    Err(ScanError::ThresholdViolation {
        image_id: target.id.clone(),
        threshold: verdict.threshold,
        retained: verdict.retained.len(),
        image_removed,
        post_scan: None,
    })
}

fn with_post_scan_failure(mut violation: ScanError, failure: ScanError) -> ScanError {
    if let ScanError::ThresholdViolation { post_scan, .. } = &mut violation {
        *post_scan = Some(Box::new(failure));
    }
    violation
}

async fn read_and_interpret(path: &Path, threshold: Severity) -> Result<ScanVerdict> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| ScanError::IoError { path: path.to_path_buf(), source: e })?;
    interpret(&raw, threshold)
}

/// Close the session; a failure is recorded as a release failure.
async fn close_session(session: Box<dyn RemoteSession>) -> Vec<ReleaseFailure> {
    let address = session.address().to_string();
    match session.close().await {
        Ok(()) => {
            metrics::record_release(ResourceKind::Session, true);
            Vec::new()
        }
        Err(e) => {
            warn!(address = %address, error = %e, "Failed to close remote session");
            metrics::record_release(ResourceKind::Session, false);
            vec![ReleaseFailure {
                resource: ResourceKind::Session,
                id: address,
                reason: e.to_string(),
            }]
        }
    }
}

async fn remove_scratch(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove scratch directory"),
    }
}

fn keypair_name(prefix: &str, image_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, image_id, &suffix[..8])
}

fn provisioning(resource: ResourceKind, target: &ScanTarget, source: ScanError) -> ScanError {
    ScanError::Provisioning { resource, image_id: target.id.clone(), source: Box::new(source) }
}

fn post_scan(target: &ScanTarget, action: &'static str, source: ScanError) -> ScanError {
    ScanError::PostScan { image_id: target.id.clone(), action, source: Box::new(source) }
}
