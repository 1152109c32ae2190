//! `vmscan config` command

use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use vmscan_core::{paths, ScanConfig};

/// Print where configuration is read from and the values in effect.
pub fn show(config: &ScanConfig, explicit: Option<&Path>) -> Result<()> {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(paths::config_path);
    let state = if path.exists() { "".normal() } else { " (not found, using defaults)".dimmed() };

    println!("{} {}{}", "Config file:".bold(), path.display(), state);
    println!("{}", serde_json::to_string_pretty(config)?);

    if let Err(e) = config.validate() {
        println!("{} {}", "⚠".yellow().bold(), e);
    }
    Ok(())
}
