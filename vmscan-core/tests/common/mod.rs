//! Shared mocks for integration tests.
//!
//! The mocks stand in for the cloud API, the SSH connector and the object
//! store, and record every create/release so tests can check that teardown
//! released exactly what was created.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use vmscan_core::{
    cloud::CloudProvider,
    error::{ResourceKind, Result, ScanError},
    remote::{CopiedFile, Identity, RemoteConnector, RemoteSession},
    store::ObjectStore,
    types::{CloudImage, FloatingIp, Instance, InstanceSpec, InstanceState, Keypair},
    LifecycleController, PollPolicy, ScanConfig,
};

/// Cloud calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    CreateKeypair,
    CreateFloatingIp,
    CreateInstance,
    InstanceState,
    Attach,
    ReleaseKeypair,
    ReleaseFloatingIp,
    ReleaseInstance,
    TagImage,
    RemoveImage,
}

#[derive(Default)]
struct CloudState {
    next_id: u32,
    created: Vec<(ResourceKind, String)>,
    released: Vec<(ResourceKind, String)>,
    tags: Vec<(String, String, String)>,
    removed_images: Vec<String>,
    instance_polls: u32,
    boot_scripts: Vec<String>,
}

/// In-memory cloud.
pub struct MockCloud {
    state: Mutex<CloudState>,
    failures: Mutex<HashSet<Step>>,
    panics: Mutex<HashSet<Step>>,
    /// Keypair creation fails for these image IDs.
    failing_images: Mutex<HashSet<String>>,
    /// Status checks before the instance turns active; `None` never does.
    ready_after: Mutex<Option<u32>>,
    /// Provider status reported instead of becoming active.
    terminal_status: Mutex<Option<String>>,
    images: Mutex<Vec<CloudImage>>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            failures: Mutex::new(HashSet::new()),
            panics: Mutex::new(HashSet::new()),
            failing_images: Mutex::new(HashSet::new()),
            ready_after: Mutex::new(Some(2)),
            terminal_status: Mutex::new(None),
            images: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(&self, step: Step) {
        self.failures.lock().unwrap().insert(step);
    }

    pub fn panic_on(&self, step: Step) {
        self.panics.lock().unwrap().insert(step);
    }

    pub fn fail_image(&self, image_id: &str) {
        self.failing_images.lock().unwrap().insert(image_id.to_string());
    }

    pub fn never_ready(&self) {
        *self.ready_after.lock().unwrap() = None;
    }

    pub fn enter_status(&self, status: &str) {
        *self.terminal_status.lock().unwrap() = Some(status.to_string());
    }

    pub fn add_image(&self, id: &str, name: &str) {
        self.images.lock().unwrap().push(CloudImage {
            id: id.to_string(),
            name: name.to_string(),
            status: "active".to_string(),
            created_at: None,
            properties: HashMap::new(),
        });
    }

    pub fn created(&self) -> Vec<(ResourceKind, String)> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn released(&self) -> Vec<(ResourceKind, String)> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn tags(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().tags.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state.lock().unwrap().removed_images.clone()
    }

    pub fn instance_polls(&self) -> u32 {
        self.state.lock().unwrap().instance_polls
    }

    pub fn boot_scripts(&self) -> Vec<String> {
        self.state.lock().unwrap().boot_scripts.clone()
    }

    /// Every created resource was released exactly once, and nothing else was.
    pub fn assert_released_exactly_created(&self) {
        let mut created = self.created();
        let mut released = self.released();
        created.sort_by(|a, b| a.1.cmp(&b.1));
        released.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(created, released, "released set differs from created set");
    }

    fn check(&self, step: Step) -> Result<()> {
        let panics = self.panics.lock().unwrap().contains(&step);
        if panics {
            panic!("injected panic at {:?}", step);
        }
        if self.failures.lock().unwrap().contains(&step) {
            return Err(ScanError::cloud(format!("{:?}", step), "injected failure"));
        }
        Ok(())
    }

    fn create(&self, resource: ResourceKind, prefix: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{}-{}", prefix, state.next_id);
        state.created.push((resource, id.clone()));
        id
    }

    fn release(&self, step: Step, resource: ResourceKind, id: &str) -> Result<()> {
        self.check(step)?;
        self.state.lock().unwrap().released.push((resource, id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    async fn create_keypair(&self, name: &str) -> Result<Keypair> {
        self.check(Step::CreateKeypair)?;
        let failing =
            self.failing_images.lock().unwrap().iter().any(|id| name.contains(id.as_str()));
        if failing {
            return Err(ScanError::cloud("create keypair", "quota exceeded"));
        }

        let mut state = self.state.lock().unwrap();
        state.created.push((ResourceKind::Keypair, name.to_string()));
        Ok(Keypair { name: name.to_string(), private_key: "-----BEGIN KEY-----".to_string() })
    }

    async fn remove_keypair(&self, name: &str) -> Result<()> {
        self.release(Step::ReleaseKeypair, ResourceKind::Keypair, name)
    }

    async fn create_floating_ip(&self, _network_name: &str) -> Result<FloatingIp> {
        self.check(Step::CreateFloatingIp)?;
        let id = self.create(ResourceKind::FloatingIp, "fip");
        let address = format!("203.0.113.{}", id.trim_start_matches("fip-"));
        Ok(FloatingIp { id, address })
    }

    async fn remove_floating_ip(&self, id: &str) -> Result<()> {
        self.release(Step::ReleaseFloatingIp, ResourceKind::FloatingIp, id)
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        self.check(Step::CreateInstance)?;
        self.state.lock().unwrap().boot_scripts.push(spec.boot_script.clone());
        let id = self.create(ResourceKind::Instance, "vm");
        Ok(Instance { id, name: spec.name.clone() })
    }

    async fn instance_state(&self, _id: &str) -> Result<InstanceState> {
        self.check(Step::InstanceState)?;
        let polls = {
            let mut state = self.state.lock().unwrap();
            state.instance_polls += 1;
            state.instance_polls
        };

        if let Some(status) = self.terminal_status.lock().unwrap().clone() {
            return Ok(InstanceState::from_status(&status));
        }
        match *self.ready_after.lock().unwrap() {
            Some(n) if polls > n => Ok(InstanceState::Active),
            _ => Ok(InstanceState::Pending("BUILD".to_string())),
        }
    }

    async fn attach_floating_ip(&self, _instance_id: &str, _ip: &FloatingIp) -> Result<()> {
        self.check(Step::Attach)
    }

    async fn remove_instance(&self, id: &str) -> Result<()> {
        self.release(Step::ReleaseInstance, ResourceKind::Instance, id)
    }

    async fn fetch_image(&self, id: &str) -> Result<CloudImage> {
        self.images
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| ScanError::ImageNotFound { image_id: id.to_string() })
    }

    async fn fetch_images_by_prefix(&self, prefix: &str) -> Result<Vec<CloudImage>> {
        Ok(self
            .images
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn tag_image(&self, id: &str, key: &str, value: &str) -> Result<()> {
        self.check(Step::TagImage)?;
        self.state.lock().unwrap().tags.push((id.to_string(), key.to_string(), value.to_string()));
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        self.check(Step::RemoveImage)?;
        self.state.lock().unwrap().removed_images.push(id.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Shared behaviour and counters for every session a [`MockConnector`] opens.
pub struct SessionScript {
    /// Marker copies that report "not ready" before the marker says done.
    pub marker_after: AtomicU32,
    /// Results file content; `None` means the file never appears.
    pub results: Mutex<Option<Vec<u8>>>,
    pub close_fails: Mutex<bool>,
    /// Copying the results file panics.
    pub results_panic: Mutex<bool>,
    pub marker_checks: AtomicU32,
    pub closes: AtomicU32,
}

/// Remote connector whose sessions serve canned files.
pub struct MockConnector {
    pub script: Arc<SessionScript>,
    /// Attempts that fail before one succeeds; `u32::MAX` never connects.
    pub connect_failures: AtomicU32,
    pub connects: AtomicU32,
}

impl MockConnector {
    pub fn new(results: Vec<u8>) -> Self {
        Self {
            script: Arc::new(SessionScript {
                marker_after: AtomicU32::new(1),
                results: Mutex::new(Some(results)),
                close_fails: Mutex::new(false),
                results_panic: Mutex::new(false),
                marker_checks: AtomicU32::new(0),
                closes: AtomicU32::new(0),
            }),
            connect_failures: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        }
    }

    pub fn marker_after(&self, checks: u32) {
        self.script.marker_after.store(checks, Ordering::SeqCst);
    }

    pub fn without_results(&self) {
        *self.script.results.lock().unwrap() = None;
    }

    pub fn fail_close(&self) {
        *self.script.close_fails.lock().unwrap() = true;
    }

    pub fn panic_on_results(&self) {
        *self.script.results_panic.lock().unwrap() = true;
    }

    pub fn fail_connects(&self, attempts: u32) {
        self.connect_failures.store(attempts, Ordering::SeqCst);
    }

    pub fn marker_checks(&self) -> u32 {
        self.script.marker_checks.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.script.closes.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn connect(&self, _identity: &Identity, address: &str) -> Result<Box<dyn RemoteSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(ScanError::Remote { reason: format!("connection refused by {}", address) });
        }

        Ok(Box::new(MockSession { address: address.to_string(), script: self.script.clone() }))
    }
}

struct MockSession {
    address: String,
    script: Arc<SessionScript>,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn copy_file_from_remote(
        &self,
        _remote_dir: &str,
        local_dir: &Path,
        file: &str,
    ) -> Result<Option<CopiedFile>> {
        let content = if file == vmscan_core::lifecycle::MARKER_FILE {
            let checks = self.script.marker_checks.fetch_add(1, Ordering::SeqCst) + 1;
            if checks <= self.script.marker_after.load(Ordering::SeqCst) {
                // The marker exists but is still empty while the scan runs.
                Some(Vec::new())
            } else {
                Some(b"done\n".to_vec())
            }
        } else {
            let panics = *self.script.results_panic.lock().unwrap();
            if panics {
                panic!("session dropped mid-transfer");
            }
            self.script.results.lock().unwrap().clone()
        };

        let Some(content) = content else {
            return Ok(None);
        };

        std::fs::create_dir_all(local_dir).unwrap();
        let path = local_dir.join(file);
        std::fs::write(&path, &content).unwrap();
        Ok(Some(CopiedFile { path, len: content.len() as u64 }))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        if *self.script.close_fails.lock().unwrap() {
            return Err(ScanError::Remote { reason: "control master already gone".to_string() });
        }
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Object store keeping objects in memory.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, (String, Vec<u8>)>>,
    fail: Mutex<bool>,
}

impl MemoryStore {
    pub fn fail_writes(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub fn get(&self, key: &str) -> Option<(String, Vec<u8>)> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, content_type: &str, key: &str, body: Vec<u8>) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(ScanError::Store { key: key.to_string(), reason: "503".to_string() });
        }
        self.objects.lock().unwrap().insert(key.to_string(), (content_type.to_string(), body));
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Trivy JSON with one finding per `(id, severity)` pair.
pub fn trivy_report(findings: &[(&str, &str)]) -> Vec<u8> {
    let vulnerabilities: Vec<serde_json::Value> = findings
        .iter()
        .map(|(id, severity)| {
            serde_json::json!({
                "VulnerabilityID": id,
                "PkgName": "openssl",
                "InstalledVersion": "3.0.2-0ubuntu1",
                "FixedVersion": "3.0.2-0ubuntu1.15",
                "Severity": severity,
                "Title": format!("{} in openssl", id),
                "CVSS": { "nvd": { "V3Score": 7.5 } }
            })
        })
        .collect();

    serde_json::to_vec(&serde_json::json!({
        "ArtifactName": "/",
        "Results": [{ "Target": "ubuntu 22.04", "Vulnerabilities": vulnerabilities }]
    }))
    .unwrap()
}

/// Mocks wired into a controller.
pub struct Fixture {
    pub cloud: Arc<MockCloud>,
    pub connector: Arc<MockConnector>,
    pub store: Arc<MemoryStore>,
    pub controller: LifecycleController,
    pub config: ScanConfig,
    pub scratch: TempDir,
}

impl Fixture {
    pub fn new(results: Vec<u8>) -> Self {
        let cloud = Arc::new(MockCloud::new());
        let connector = Arc::new(MockConnector::new(results));
        let store = Arc::new(MemoryStore::default());
        let controller = LifecycleController::new(cloud.clone(), connector.clone(), store.clone());
        let scratch = TempDir::new().unwrap();

        let fast = |attempts| PollPolicy::new(Duration::from_millis(1), attempts);
        let config = ScanConfig {
            flavor: "m1.small".to_string(),
            network_id: "net-1".to_string(),
            scratch_dir: scratch.path().to_path_buf(),
            readiness: fast(100),
            completion: fast(20),
            connect: fast(10),
            ..Default::default()
        };

        Self { cloud, connector, store, controller, config, scratch }
    }

    pub fn run_dir(&self, image_id: &str) -> PathBuf {
        self.scratch.path().join(image_id)
    }
}
