//! `vmscan scan` command

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};
use tracing::info;
use vmscan_core::{
    select_targets, BatchReport, BatchScheduler, LifecycleController, LocalStore, ObjectStore,
    OpenSshConnector, OpenStackClient, OpenStackCredentials, ScanConfig, Severity, StoreLocation,
    SwiftStore, TargetOutcome, TargetSelector, ViolationPolicy,
};

use super::truncate;

#[derive(Args)]
pub struct ScanArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Where reports go: swift:<container> or file:<directory>
    #[arg(short, long, env = "VMSCAN_STORE")]
    store: StoreLocation,

    /// Flavor name or ID for the scan instance
    #[arg(long)]
    flavor: Option<String>,

    /// Network the scan instance boots on
    #[arg(long)]
    network_id: Option<String>,

    /// External network to allocate floating IPs from
    #[arg(long)]
    floating_ip_network: Option<String>,

    /// Attach a config drive to the scan instance
    #[arg(long)]
    config_drive: bool,

    /// Minimum severity that fails an image
    #[arg(short, long)]
    threshold: Option<Severity>,

    /// Delete failing images instead of tagging them
    #[arg(long)]
    auto_delete: bool,

    /// Report failing images without failing the run
    #[arg(long)]
    skip_threshold_check: bool,

    /// Only log violations on images that were tagged, not removed
    #[arg(long)]
    warn_when_tagged: bool,

    /// Finding IDs to ignore (repeatable)
    #[arg(long = "ignore")]
    ignore: Vec<String>,

    /// Login user on the scan instance
    #[arg(long)]
    ssh_user: Option<String>,

    /// Trivy version to install when the image lacks it
    #[arg(long)]
    trivy_version: Option<String>,

    /// Maximum images scanned at once
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Serve Prometheus metrics on this address while scanning
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,

    #[command(flatten)]
    cloud: CloudArgs,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Scan a single image by ID
    #[arg(long)]
    image_id: Option<String>,

    /// Scan every image whose name starts with this prefix
    #[arg(long)]
    name_prefix: Option<String>,
}

impl TargetArgs {
    fn selector(&self) -> TargetSelector {
        match (&self.image_id, &self.name_prefix) {
            (Some(id), _) => TargetSelector::Id(id.clone()),
            (None, Some(prefix)) => TargetSelector::NamePrefix(prefix.clone()),
            // The argument group requires exactly one of the two.
            (None, None) => TargetSelector::NamePrefix(String::new()),
        }
    }
}

/// OpenStack credentials, normally taken from an openrc environment.
#[derive(Args)]
struct CloudArgs {
    #[arg(long, env = "OS_AUTH_URL")]
    os_auth_url: String,

    #[arg(long, env = "OS_USERNAME")]
    os_username: String,

    #[arg(long, env = "OS_PASSWORD", hide_env_values = true)]
    os_password: String,

    #[arg(long, env = "OS_PROJECT_NAME")]
    os_project_name: String,

    #[arg(long, env = "OS_USER_DOMAIN_NAME", default_value = "Default")]
    os_user_domain_name: String,

    #[arg(long, env = "OS_PROJECT_DOMAIN_NAME", default_value = "Default")]
    os_project_domain_name: String,

    #[arg(long, env = "OS_REGION_NAME")]
    os_region_name: Option<String>,

    #[arg(long, env = "OS_INTERFACE", default_value = "public")]
    os_interface: String,
}

impl From<CloudArgs> for OpenStackCredentials {
    fn from(args: CloudArgs) -> Self {
        Self {
            auth_url: args.os_auth_url,
            username: args.os_username,
            password: args.os_password,
            project_name: args.os_project_name,
            user_domain: args.os_user_domain_name,
            project_domain: args.os_project_domain_name,
            region: args.os_region_name,
            interface: args.os_interface,
        }
    }
}

impl ScanArgs {
    /// Layer command-line flags over the loaded configuration.
    fn apply(&self, config: &mut ScanConfig) {
        if let Some(flavor) = &self.flavor {
            config.flavor = flavor.clone();
        }
        if let Some(network) = &self.network_id {
            config.network_id = network.clone();
        }
        if let Some(network) = &self.floating_ip_network {
            config.floating_ip_network = network.clone();
        }
        if let Some(threshold) = self.threshold {
            config.severity_threshold = threshold;
        }
        if let Some(user) = &self.ssh_user {
            config.ssh_user = user.clone();
        }
        if let Some(version) = &self.trivy_version {
            config.trivy_version = Some(version.clone());
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if !self.ignore.is_empty() {
            config.ignore_list = self.ignore.clone();
        }

        config.config_drive |= self.config_drive;
        config.auto_delete_on_fail |= self.auto_delete;
        config.skip_threshold_check |= self.skip_threshold_check;
        if self.warn_when_tagged {
            config.violation_policy = ViolationPolicy::WarnWhenTagged;
        }
    }
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "IMAGE ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "FINDINGS")]
    findings: String,
    #[tabled(rename = "DURATION")]
    duration: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

impl From<&TargetOutcome> for OutcomeRow {
    fn from(outcome: &TargetOutcome) -> Self {
        let status = match outcome.status() {
            "passed" => "passed".green().to_string(),
            "failed (allowed)" => "failed (allowed)".yellow().to_string(),
            other => other.red().to_string(),
        };

        let (findings, detail) = match &outcome.result {
            Ok(verdict) => (
                format!("{}/{}", verdict.retained.len(), verdict.total_findings),
                verdict.summary.to_string(),
            ),
            Err(e) => ("-".to_string(), truncate(&e.to_string(), 80)),
        };

        Self {
            id: outcome.target.id.clone(),
            name: outcome.target.name.clone(),
            status,
            findings,
            duration: format_duration(outcome.elapsed),
            detail,
        }
    }
}

/// Run the scan lifecycle for the selected images.
pub async fn scan(args: ScanArgs, mut config: ScanConfig) -> Result<ExitCode> {
    args.apply(&mut config);
    config.validate().context("Invalid scan configuration")?;

    let selector = args.target.selector();
    let client = Arc::new(
        OpenStackClient::connect(args.cloud.into())
            .await
            .context("Failed to authenticate with OpenStack")?,
    );

    let store: Arc<dyn ObjectStore> = match &args.store {
        StoreLocation::Swift { container } => Arc::new(
            SwiftStore::open(client.clone(), container)
                .await
                .context("Failed to open report container")?,
        ),
        StoreLocation::Local { root } => Arc::new(LocalStore::new(root.clone())),
    };

    let targets = select_targets(client.as_ref(), &selector).await?;
    println!(
        "{} Scanning {} image(s), reports to {}",
        "→".cyan().bold(),
        targets.len(),
        args.store.to_string().bold()
    );

    let controller = LifecycleController::new(
        client.clone(),
        Arc::new(OpenSshConnector::new()),
        store,
    );
    let scheduler = BatchScheduler::new(Arc::new(controller), config.concurrency);
    let report = scheduler.run(targets, Arc::new(config)).await?;

    print_summary(&report);
    info!(total = report.total(), failed = report.failed(), "Scan finished");

    report.ensure_success()?;
    Ok(ExitCode::SUCCESS)
}

fn print_summary(report: &BatchReport) {
    let rows: Vec<OutcomeRow> = report.outcomes.iter().map(OutcomeRow::from).collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);

    let mark = if report.failed() == 0 { "✓".green().bold() } else { "✗".red().bold() };
    println!(
        "{} {}/{} succeeded in {}",
        mark,
        report.succeeded(),
        report.total(),
        format_duration(report.elapsed).dimmed()
    );
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{:01}s", secs, elapsed.subsec_millis() / 100)
    }
}
