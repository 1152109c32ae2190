//! `vmscan boot-script` command

use anyhow::Result;
use vmscan_core::lifecycle::{boot_script as render, BootScriptOptions};
use vmscan_core::ScanConfig;

/// Print the boot script for the effective configuration.
pub fn boot_script(
    config: ScanConfig,
    ignore: Vec<String>,
    trivy_version: Option<String>,
) -> Result<()> {
    let mut options = BootScriptOptions::from_config(&config);
    if !ignore.is_empty() {
        options.ignore_list = ignore;
    }
    if trivy_version.is_some() {
        options.trivy_version = trivy_version;
    }

    print!("{}", render(&options)?);
    Ok(())
}
