//! OpenSSH-backed remote sessions.
//!
//! Each session runs one OpenSSH control master in the background and routes
//! every copy through its control socket, so authentication happens once per
//! instance. The private key and the socket live in a private temporary
//! directory that is removed when the session goes away.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{remote_path, transfer_error, CopiedFile, Identity, RemoteConnector, RemoteSession};
use crate::error::{Result, ScanError};

const KEY_FILE: &str = "id";
const CONTROL_SOCKET: &str = "ctl";

/// Connects to instances with the system `ssh` and `scp` binaries.
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    ssh_binary: PathBuf,
    scp_binary: PathBuf,
    connect_timeout_secs: u32,
    /// How long an orphaned control master lingers after its last use.
    control_persist: String,
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            scp_binary: PathBuf::from("scp"),
            connect_timeout_secs: 10,
            control_persist: "10m".to_string(),
        }
    }
}

impl OpenSshConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use specific `ssh`/`scp` binaries instead of the ones on `PATH`.
    pub fn with_binaries(mut self, ssh: impl Into<PathBuf>, scp: impl Into<PathBuf>) -> Self {
        self.ssh_binary = ssh.into();
        self.scp_binary = scp.into();
        self
    }

    fn master_args(&self, key: &Path, socket: &Path, destination: &str) -> Vec<String> {
        let mut args = common_options(key, socket);
        args.extend([
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            format!("ControlPersist={}", self.control_persist),
            "-N".to_string(),
            "-f".to_string(),
            destination.to_string(),
        ]);
        args
    }
}

#[async_trait]
impl RemoteConnector for OpenSshConnector {
    #[instrument(skip(self, identity), fields(user = %identity.user))]
    async fn connect(&self, identity: &Identity, address: &str) -> Result<Box<dyn RemoteSession>> {
        let workdir = tempfile::Builder::new()
            .prefix("vmscan-ssh-")
            .tempdir()
            .map_err(|e| ScanError::Remote {
                reason: format!("failed to create key directory: {}", e),
            })?;

        let key = workdir.path().join(KEY_FILE);
        write_private_key(&key, &identity.private_key).await?;

        let socket = workdir.path().join(CONTROL_SOCKET);
        let destination = format!("{}@{}", identity.user, address);

        let output = Command::new(&self.ssh_binary)
            .args(self.master_args(&key, &socket, &destination))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ScanError::Remote {
                reason: format!("failed to run {}: {}", self.ssh_binary.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScanError::Remote {
                reason: format!(
                    "ssh to {} failed ({}): {}",
                    destination,
                    output.status,
                    stderr.trim()
                ),
            });
        }

        debug!(address = %address, "SSH control master started");

        Ok(Box::new(OpenSshSession {
            ssh_binary: self.ssh_binary.clone(),
            scp_binary: self.scp_binary.clone(),
            address: address.to_string(),
            destination,
            key,
            socket,
            workdir,
        }))
    }
}

struct OpenSshSession {
    ssh_binary: PathBuf,
    scp_binary: PathBuf,
    address: String,
    destination: String,
    key: PathBuf,
    socket: PathBuf,
    // Removes the key file and control socket on drop.
    workdir: TempDir,
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn copy_file_from_remote(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        file: &str,
    ) -> Result<Option<CopiedFile>> {
        let source = remote_path(remote_dir, file);
        let target = local_dir.join(file);

        tokio::fs::create_dir_all(local_dir)
            .await
            .map_err(|e| ScanError::IoError { path: local_dir.to_path_buf(), source: e })?;

        let output = Command::new(&self.scp_binary)
            .arg("-q")
            .args(common_options(&self.key, &self.socket))
            .arg(format!("{}:{}", self.destination, source))
            .arg(&target)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| transfer_error(&source, format!("failed to run scp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_file(&stderr) {
                return Ok(None);
            }
            return Err(transfer_error(&source, stderr.trim()));
        }

        let len = tokio::fs::metadata(&target)
            .await
            .map_err(|e| ScanError::IoError { path: target.clone(), source: e })?
            .len();

        Ok(Some(CopiedFile { path: target, len }))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let output = Command::new(&self.ssh_binary)
            .arg("-o")
            .arg(format!("ControlPath={}", self.socket.display()))
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ScanError::Remote {
                reason: format!("failed to run ssh -O exit: {}", e),
            })?;

        let session = *self;
        let workdir = session.workdir.path().to_path_buf();
        session
            .workdir
            .close()
            .map_err(|e| ScanError::IoError { path: workdir, source: e })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScanError::Remote {
                reason: format!(
                    "failed to stop control master for {}: {}",
                    session.address,
                    stderr.trim()
                ),
            });
        }

        debug!(address = %session.address, "SSH session closed");
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Options shared by the control master and every copy.
fn common_options(key: &Path, socket: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        key.display().to_string(),
        "-o".to_string(),
        format!("ControlPath={}", socket.display()),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "IdentitiesOnly=yes".to_string(),
        // Scan instances are fresh on every run; their host keys are never known.
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
    ]
}

fn is_missing_file(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
}

async fn write_private_key(path: &Path, key: &str) -> Result<()> {
    let mut content = key.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }

    tokio::fs::write(path, content)
        .await
        .map_err(|e| ScanError::IoError { path: path.to_path_buf(), source: e })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| ScanError::IoError { path: path.to_path_buf(), source: e })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_args() {
        let connector = OpenSshConnector::new();
        let args = connector.master_args(
            Path::new("/tmp/k/id"),
            Path::new("/tmp/k/ctl"),
            "ubuntu@203.0.113.7",
        );
        let joined = args.join(" ");

        assert!(joined.starts_with("-i /tmp/k/id -o ControlPath=/tmp/k/ctl"));
        assert!(joined.contains("ControlMaster=yes"));
        assert!(joined.contains("ControlPersist=10m"));
        assert!(joined.contains("BatchMode=yes"));
        assert!(joined.ends_with("-N -f ubuntu@203.0.113.7"));
    }

    #[test]
    fn test_missing_file_detection() {
        assert!(is_missing_file("scp: /tmp/vmscan/finished: No such file or directory\n"));
        assert!(!is_missing_file("ssh: connect to host 203.0.113.7 port 22: Connection refused"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join(KEY_FILE);
        write_private_key(&path, "-----BEGIN KEY-----").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }
}
