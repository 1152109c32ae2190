//! Batch scan scheduler.
//!
//! Fans a [`ScanRunner`] out over many images. A counting semaphore bounds how
//! many lifecycles run at once; a failed or panicking run is recorded against
//! its own image and never cancels its siblings.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cloud::CloudProvider;
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::security::ScanVerdict;
use crate::types::ScanTarget;

/// Runs the full lifecycle for one image.
#[async_trait]
pub trait ScanRunner: Send + Sync {
    async fn run(&self, target: &ScanTarget, config: &ScanConfig) -> Result<ScanVerdict>;
}

/// How the images to scan are chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    /// One image by ID.
    Id(String),
    /// Every image whose name starts with the prefix.
    NamePrefix(String),
}

/// Resolve a selector into scan targets, ordered by name.
pub async fn select_targets(
    cloud: &dyn CloudProvider,
    selector: &TargetSelector,
) -> Result<Vec<ScanTarget>> {
    match selector {
        TargetSelector::Id(id) => {
            let image = cloud.fetch_image(id).await?;
            Ok(vec![ScanTarget::from(image)])
        }
        TargetSelector::NamePrefix(prefix) => {
            if prefix.is_empty() {
                return Err(ScanError::InvalidConfig {
                    reason: "name prefix must not be empty".to_string(),
                });
            }

            let mut targets: Vec<ScanTarget> = cloud
                .fetch_images_by_prefix(prefix)
                .await?
                .into_iter()
                .map(ScanTarget::from)
                .collect();
            if targets.is_empty() {
                return Err(ScanError::NoTargets { prefix: prefix.clone() });
            }

            targets.sort_by(|a, b| a.name.cmp(&b.name));
            info!(prefix = %prefix, count = targets.len(), "Selected images by name prefix");
            Ok(targets)
        }
    }
}

/// Result of one image's lifecycle.
#[derive(Debug)]
pub struct TargetOutcome {
    pub target: ScanTarget,
    pub result: Result<ScanVerdict>,
    pub elapsed: Duration,
}

impl TargetOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    /// Short status for summaries.
    pub fn status(&self) -> &'static str {
        match &self.result {
            Ok(verdict) if verdict.pass => "passed",
            Ok(_) => "failed (allowed)",
            Err(e) if e.is_policy() => "failed",
            Err(_) => "error",
        }
    }
}

/// Aggregated batch results, in completion order.
#[derive(Debug)]
pub struct BatchReport {
    pub outcomes: Vec<TargetOutcome>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    /// `BatchFailed` if any target failed.
    pub fn ensure_success(&self) -> Result<()> {
        let failed = self.failed();
        if failed > 0 {
            return Err(ScanError::BatchFailed { failed, total: self.total() });
        }
        Ok(())
    }
}

/// Runs lifecycles for many targets with bounded concurrency.
pub struct BatchScheduler {
    runner: Arc<dyn ScanRunner>,
    concurrency: usize,
}

impl BatchScheduler {
    /// Default number of simultaneous lifecycles.
    pub const DEFAULT_CONCURRENCY: usize = 5;

    pub fn new(runner: Arc<dyn ScanRunner>, concurrency: usize) -> Self {
        Self { runner, concurrency }
    }

    /// Scan every target and wait for all of them.
    pub async fn run(
        &self,
        targets: Vec<ScanTarget>,
        config: Arc<ScanConfig>,
    ) -> Result<BatchReport> {
        if targets.is_empty() {
            return Err(ScanError::InvalidConfig { reason: "no images to scan".to_string() });
        }
        if self.concurrency == 0 {
            return Err(ScanError::InvalidConfig {
                reason: "concurrency must be at least 1".to_string(),
            });
        }

        let started = Instant::now();
        let total = targets.len();
        info!(targets = total, concurrency = self.concurrency, "Starting batch scan");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::new();

        for target in targets {
            let runner = self.runner.clone();
            let config = config.clone();
            let semaphore = semaphore.clone();
            let task_target = target.clone();

            let handle = tasks.spawn(async move {
                let target = task_target;
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return TargetOutcome {
                            target,
                            result: Err(ScanError::internal(e)),
                            elapsed: Duration::ZERO,
                        }
                    }
                };

                let started = Instant::now();
                let result = AssertUnwindSafe(runner.run(&target, &config))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(ScanError::Internal(format!(
                            "scan task panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    });

                TargetOutcome { target, result, elapsed: started.elapsed() }
            });
            spawned.insert(handle.id(), target);
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    let Some(target) = spawned.remove(&e.id()) else {
                        error!(error = %e, "Scan task for unknown target failed");
                        continue;
                    };
                    TargetOutcome {
                        target,
                        result: Err(ScanError::Internal(format!("scan task failed: {}", e))),
                        elapsed: Duration::ZERO,
                    }
                }
            };

            log_outcome(&outcome);
            outcomes.push(outcome);
        }

        let report = BatchReport { outcomes, elapsed: started.elapsed() };
        info!(
            total = report.total(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            elapsed_secs = report.elapsed.as_secs(),
            "Batch scan finished"
        );
        Ok(report)
    }
}

fn log_outcome(outcome: &TargetOutcome) {
    let image_id = outcome.target.id.as_str();
    match &outcome.result {
        Ok(verdict) if verdict.pass => {
            info!(image_id = %image_id, image = %outcome.target.name, "Image passed the scan");
        }
        Ok(verdict) => {
            warn!(
                image_id = %image_id,
                image = %outcome.target.name,
                retained = verdict.retained.len(),
                "Image failed the scan; not treated as an error"
            );
        }
        Err(e) => {
            error!(
                image_id = %image_id,
                image = %outcome.target.name,
                category = %e.category(),
                error = %e,
                "Image scan failed"
            );
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    }
}
