//! Centralized path configuration for vmscan.
//!
//! Local paths (config, scratch) and the object-store key layout all go
//! through this module so the CLI and the lifecycle controller agree.

use std::path::{Path, PathBuf};

/// Get the vmscan configuration directory.
///
/// Resolution order:
/// 1. `VMSCAN_CONFIG_DIR` environment variable
/// 2. `<platform config dir>/vmscan` (e.g. `~/.config/vmscan`)
/// 3. `./.vmscan` when no home directory can be determined
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VMSCAN_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|d| d.join("vmscan")).unwrap_or_else(|| PathBuf::from(".vmscan"))
}

/// Get the default config file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Get the scratch directory that holds downloaded results.
///
/// `VMSCAN_SCRATCH_DIR` overrides the default `<tmp>/vmscan`.
pub fn scratch_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VMSCAN_SCRATCH_DIR") {
        return PathBuf::from(dir);
    }

    std::env::temp_dir().join("vmscan")
}

/// Per-run scratch directory. Named by image ID so concurrent runs never collide.
pub fn run_scratch_dir(scratch: &Path, image_id: &str) -> PathBuf {
    scratch.join(sanitize(image_id))
}

/// Object-store key for an image's persisted report.
pub fn report_key(prefix: &str, image_id: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/results.json", image_id)
    } else {
        format!("{}/{}/results.json", prefix, image_id)
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
