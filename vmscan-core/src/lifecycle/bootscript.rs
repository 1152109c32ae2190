//! Boot script passed to scan instances as user data.
//!
//! The script is the only channel into the instance before SSH is up, so it
//! carries the whole scan: it drops an empty completion marker, makes sure
//! Trivy is installed, scans the root filesystem and finally writes `done`
//! into the marker. The controller treats an empty marker as "still running".

use crate::config::{is_shell_safe, ScanConfig};
use crate::error::{Result, ScanError};

/// Completion marker, empty until the scanner exits.
pub const MARKER_FILE: &str = "finished";

/// Scanner JSON output.
pub const RESULTS_FILE: &str = "results.json";

const IGNORE_FILE: &str = ".trivyignore";

const TRIVY_INSTALL_URL: &str =
    "https://raw.githubusercontent.com/aquasecurity/trivy/main/contrib/install.sh";

/// Inputs to [`boot_script`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootScriptOptions {
    pub remote_dir: String,
    pub ignore_list: Vec<String>,
    pub trivy_version: Option<String>,
}

impl BootScriptOptions {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            remote_dir: config.remote_dir.clone(),
            ignore_list: config.ignore_list.clone(),
            trivy_version: config.trivy_version.clone(),
        }
    }
}

impl Default for BootScriptOptions {
    fn default() -> Self {
        Self::from_config(&ScanConfig::default())
    }
}

/// Render the boot script.
///
/// Every interpolated value is checked against a conservative character set
/// first; the ignore list ends up inside a quoted heredoc.
pub fn boot_script(options: &BootScriptOptions) -> Result<String> {
    if !options.remote_dir.starts_with('/') || !is_shell_safe(&options.remote_dir, "/._-") {
        return Err(invalid(format!("remote directory '{}' is not usable", options.remote_dir)));
    }
    for id in &options.ignore_list {
        if !is_shell_safe(id, "._:-") {
            return Err(invalid(format!("'{}' is not a finding ID", id)));
        }
    }
    let version_arg = match &options.trivy_version {
        Some(v) if is_shell_safe(v, ".-") => {
            format!(" {}", if v.starts_with('v') { v.clone() } else { format!("v{}", v) })
        }
        Some(v) => return Err(invalid(format!("'{}' is not a Trivy version", v))),
        None => String::new(),
    };

    let dir = options.remote_dir.trim_end_matches('/');
    let mut ignores = options.ignore_list.join("\n");
    if !ignores.is_empty() {
        ignores.push('\n');
    }

    Ok(format!(
        r#"#!/bin/sh
set -u

SCAN_DIR='{dir}'
mkdir -p "$SCAN_DIR"
: > "$SCAN_DIR/{marker}"

if ! command -v trivy >/dev/null 2>&1; then
    curl -sfL {install_url} | sh -s -- -b /usr/local/bin{version_arg}
fi

cat > "$SCAN_DIR/{ignore}" <<'VMSCAN_IGNORE'
{ignores}VMSCAN_IGNORE

trivy rootfs --quiet --format json \
    --output "$SCAN_DIR/{results}" \
    --ignorefile "$SCAN_DIR/{ignore}" \
    --skip-dirs /proc,/sys,/dev \
    /

echo done > "$SCAN_DIR/{marker}"
"#,
        dir = dir,
        marker = MARKER_FILE,
        results = RESULTS_FILE,
        ignore = IGNORE_FILE,
        install_url = TRIVY_INSTALL_URL,
        version_arg = version_arg,
        ignores = ignores,
    ))
}

fn invalid(reason: String) -> ScanError {
    ScanError::InvalidConfig { reason }
}
