//! `vmscan interpret` command

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};
use vmscan_core::{security::interpret as interpret_report, Severity};

use super::{severity_label, truncate};

#[derive(Tabled)]
struct FindingRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "PACKAGE")]
    package: String,
    #[tabled(rename = "INSTALLED")]
    installed: String,
    #[tabled(rename = "FIXED")]
    fixed: String,
    #[tabled(rename = "SEVERITY")]
    severity: String,
    #[tabled(rename = "TITLE")]
    title: String,
}

/// Interpret a report file; exits 1 when the report fails the threshold.
pub async fn interpret(file: &Path, threshold: Severity, json: bool) -> Result<ExitCode> {
    let raw = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let verdict = interpret_report(&raw, threshold)
        .with_context(|| format!("Failed to interpret {}", file.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&verdict.retained)?);
    } else {
        println!("{} {}", "Findings:".bold(), verdict.summary);

        if !verdict.retained.is_empty() {
            let rows: Vec<FindingRow> = verdict
                .retained
                .iter()
                .map(|f| FindingRow {
                    id: f.id.clone(),
                    package: f.package_name.clone(),
                    installed: f.installed_version.clone(),
                    fixed: f.fixed_version.clone().unwrap_or_else(|| "-".to_string()),
                    severity: severity_label(f.severity, &f.severity_label),
                    title: truncate(&f.title, 60),
                })
                .collect();

            let mut table = Table::new(rows);
            table.with(Style::modern());
            println!("{}", table);
        }
    }

    if verdict.pass {
        println!(
            "{} No findings at or above {}",
            "✓".green().bold(),
            verdict.threshold.to_string().bold()
        );
        Ok(ExitCode::SUCCESS)
    } else {
        println!(
            "{} {} finding(s) at or above {}",
            "✗".red().bold(),
            verdict.retained.len(),
            verdict.threshold.to_string().bold()
        );
        Ok(ExitCode::FAILURE)
    }
}
