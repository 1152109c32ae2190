//! CLI command implementations

pub mod boot_script;
pub mod config;
pub mod interpret;
pub mod scan;

use colored::Colorize;
use vmscan_core::Severity;

/// Severity label colored by how bad it is.
pub(crate) fn severity_label(severity: Option<Severity>, raw: &str) -> String {
    match severity {
        Some(Severity::Critical) => raw.red().bold().to_string(),
        Some(Severity::High) => raw.red().to_string(),
        Some(Severity::Medium) => raw.yellow().to_string(),
        Some(Severity::Low) | Some(Severity::None) => raw.normal().to_string(),
        None => raw.dimmed().to_string(),
    }
}

/// Cut `text` to `max` characters, marking the cut with an ellipsis.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
