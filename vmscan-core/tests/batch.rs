//! Integration tests for the batch scheduler and target selection.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{trivy_report, Fixture, Step};
use vmscan_core::{
    error::{Result, ScanError},
    security::{ScanVerdict, Severity, SeveritySummary},
    select_targets, BatchScheduler, ScanConfig, ScanRunner, ScanTarget, TargetSelector,
};

/// Runner that sleeps, tracks how many runs overlap, and fails on request.
#[derive(Default)]
struct CountingRunner {
    active: AtomicUsize,
    max_active: AtomicUsize,
    runs: AtomicUsize,
    fail_id: Option<String>,
    panic_id: Option<String>,
}

#[async_trait]
impl ScanRunner for CountingRunner {
    async fn run(&self, target: &ScanTarget, _config: &ScanConfig) -> Result<ScanVerdict> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.panic_id.as_deref() == Some(target.id.as_str()) {
            panic!("runner blew up on {}", target.id);
        }
        if self.fail_id.as_deref() == Some(target.id.as_str()) {
            return Err(ScanError::cloud("create keypair", "quota exceeded"));
        }

        Ok(ScanVerdict {
            threshold: Severity::High,
            retained: Vec::new(),
            total_findings: 0,
            summary: SeveritySummary::default(),
            pass: true,
        })
    }
}

fn targets(n: usize) -> Vec<ScanTarget> {
    (0..n).map(|i| ScanTarget::new(format!("img-{:02}", i), format!("image-{:02}", i))).collect()
}

#[tokio::test]
async fn test_concurrency_bound_is_respected() {
    let runner = Arc::new(CountingRunner::default());
    let scheduler = BatchScheduler::new(runner.clone(), 3);

    let report = scheduler.run(targets(10), Arc::new(ScanConfig::default())).await.unwrap();

    assert_eq!(report.total(), 10);
    assert_eq!(report.succeeded(), 10);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 10);
    assert!(runner.max_active.load(Ordering::SeqCst) <= 3);
    assert_eq!(runner.max_active.load(Ordering::SeqCst), 3);
    report.ensure_success().unwrap();
}

#[tokio::test]
async fn test_concurrency_one_is_sequential() {
    let runner = Arc::new(CountingRunner::default());
    let scheduler = BatchScheduler::new(runner.clone(), 1);

    scheduler.run(targets(4), Arc::new(ScanConfig::default())).await.unwrap();

    assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrency_above_target_count_runs_everything_at_once() {
    let runner = Arc::new(CountingRunner::default());
    let scheduler = BatchScheduler::new(runner.clone(), 16);

    scheduler.run(targets(4), Arc::new(ScanConfig::default())).await.unwrap();

    assert_eq!(runner.max_active.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_failure_is_isolated_to_its_target() {
    let runner = Arc::new(CountingRunner { fail_id: Some("img-02".into()), ..Default::default() });
    let scheduler = BatchScheduler::new(runner.clone(), 2);

    let report = scheduler.run(targets(5), Arc::new(ScanConfig::default())).await.unwrap();

    assert_eq!(report.total(), 5);
    assert_eq!(report.failed(), 1);
    let failed: Vec<&str> = report
        .outcomes
        .iter()
        .filter(|o| !o.succeeded())
        .map(|o| o.target.id.as_str())
        .collect();
    assert_eq!(failed, vec!["img-02"]);

    match report.ensure_success() {
        Err(ScanError::BatchFailed { failed, total }) => {
            assert_eq!(failed, 1);
            assert_eq!(total, 5);
        }
        other => panic!("expected batch failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_panicking_run_is_recorded_as_failure() {
    let runner = Arc::new(CountingRunner { panic_id: Some("img-01".into()), ..Default::default() });
    let scheduler = BatchScheduler::new(runner.clone(), 2);

    let report = scheduler.run(targets(3), Arc::new(ScanConfig::default())).await.unwrap();

    assert_eq!(report.total(), 3);
    assert_eq!(report.failed(), 1);
    let outcome = report.outcomes.iter().find(|o| o.target.id == "img-01").unwrap();
    match &outcome.result {
        Err(ScanError::Internal(message)) => {
            assert!(message.contains("runner blew up"), "{}", message)
        }
        other => panic!("expected internal error, got {:?}", other),
    }
    assert_eq!(outcome.status(), "error");
}

#[tokio::test]
async fn test_rejects_empty_batch_and_zero_concurrency() {
    let runner = Arc::new(CountingRunner::default());

    let err = BatchScheduler::new(runner.clone(), 5)
        .run(Vec::new(), Arc::new(ScanConfig::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidConfig { .. }));

    let err = BatchScheduler::new(runner.clone(), 0)
        .run(targets(2), Arc::new(ScanConfig::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidConfig { .. }));
    assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_batch_with_real_controller_isolates_provisioning_failure() {
    let fixture = Fixture::new(trivy_report(&[("CVE-2024-0001", "LOW")]));
    fixture.cloud.fail_image("broken");
    let controller = Arc::new(fixture.controller.clone());

    let targets = vec![
        ScanTarget::new("alpha", "base-alpha"),
        ScanTarget::new("broken", "base-broken"),
        ScanTarget::new("gamma", "base-gamma"),
        ScanTarget::new("delta", "base-delta"),
    ];
    let report = BatchScheduler::new(controller, 2)
        .run(targets, Arc::new(fixture.config.clone()))
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.failed(), 1);
    let broken = report.outcomes.iter().find(|o| o.target.id == "broken").unwrap();
    assert!(matches!(broken.result, Err(ScanError::Provisioning { .. })));

    // Three full lifecycles, three resources each, all released.
    assert_eq!(fixture.cloud.created().len(), 9);
    fixture.cloud.assert_released_exactly_created();
    assert_eq!(fixture.store.keys().len(), 3);
}

#[tokio::test]
async fn test_panicking_lifecycle_does_not_leak_resources() {
    let fixture = Fixture::new(trivy_report(&[]));
    fixture.cloud.panic_on(Step::Attach);
    let controller = Arc::new(fixture.controller.clone());

    let report = BatchScheduler::new(controller, 1)
        .run(vec![ScanTarget::new("img-1", "base")], Arc::new(fixture.config.clone()))
        .await
        .unwrap();

    assert_eq!(report.failed(), 1);
    assert!(matches!(report.outcomes[0].result, Err(ScanError::Internal(_))));
    assert_eq!(fixture.cloud.created().len(), 3);
    fixture.cloud.assert_released_exactly_created();
}

#[tokio::test]
async fn test_select_by_prefix_orders_by_name() {
    let fixture = Fixture::new(Vec::new());
    fixture.cloud.add_image("3", "ubuntu-22.04-c");
    fixture.cloud.add_image("1", "ubuntu-22.04-a");
    fixture.cloud.add_image("9", "debian-12");
    fixture.cloud.add_image("2", "ubuntu-22.04-b");

    let selected =
        select_targets(fixture.cloud.as_ref(), &TargetSelector::NamePrefix("ubuntu-".into()))
            .await
            .unwrap();

    let names: Vec<&str> = selected.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["ubuntu-22.04-a", "ubuntu-22.04-b", "ubuntu-22.04-c"]);
}

#[tokio::test]
async fn test_select_errors() {
    let fixture = Fixture::new(Vec::new());
    fixture.cloud.add_image("1", "ubuntu-22.04");

    let err = select_targets(fixture.cloud.as_ref(), &TargetSelector::NamePrefix("rhel".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::NoTargets { ref prefix } if prefix == "rhel"));

    let err = select_targets(fixture.cloud.as_ref(), &TargetSelector::Id("missing".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::ImageNotFound { .. }));

    let selected = select_targets(fixture.cloud.as_ref(), &TargetSelector::Id("1".into()))
        .await
        .unwrap();
    assert_eq!(selected, vec![ScanTarget::new("1", "ubuntu-22.04")]);
}
