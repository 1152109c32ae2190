//! Remote execution: secure shell/file-transfer sessions to scan instances.
//!
//! The lifecycle controller only needs two things from an instance once it is
//! reachable: to fetch files from the scan directory and to hang up. Both are
//! behind [`RemoteSession`]; [`RemoteConnector`] opens sessions.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::PollPolicy;
use crate::error::{Result, ScanError};
use crate::types::Keypair;

mod ssh;

pub use ssh::OpenSshConnector;

/// Login identity for a scan instance.
#[derive(Clone)]
pub struct Identity {
    pub user: String,
    pub private_key: String,
}

impl Identity {
    pub fn new(user: impl Into<String>, keypair: &Keypair) -> Self {
        Self { user: user.into(), private_key: keypair.private_key.clone() }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("user", &self.user).finish_non_exhaustive()
    }
}

/// A file copied from the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedFile {
    pub path: PathBuf,
    pub len: u64,
}

impl CopiedFile {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Opens remote sessions.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Open one session. A single attempt; retries live in [`connect_with_retry`].
    async fn connect(&self, identity: &Identity, address: &str) -> Result<Box<dyn RemoteSession>>;
}

/// An open session to one instance.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Copy `<remote_dir>/<file>` into `local_dir`.
    ///
    /// Returns `Ok(None)` when the remote file does not exist. Repeated calls
    /// overwrite the local copy.
    async fn copy_file_from_remote(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        file: &str,
    ) -> Result<Option<CopiedFile>>;

    /// Tear the session down.
    async fn close(self: Box<Self>) -> Result<()>;

    fn address(&self) -> &str;
}

/// Open a session, retrying on a fixed interval.
///
/// After `policy.max_attempts` failures the last error is returned as is.
pub async fn connect_with_retry(
    connector: &dyn RemoteConnector,
    identity: &Identity,
    address: &str,
    policy: &PollPolicy,
) -> Result<Box<dyn RemoteSession>> {
    let mut attempt = 1;
    loop {
        match connector.connect(identity, address).await {
            Ok(session) => {
                debug!(address = %address, attempt, "Remote session established");
                return Ok(session);
            }
            Err(e) if attempt >= policy.max_attempts => return Err(e),
            Err(e) => {
                warn!(
                    address = %address,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Remote connection failed, retrying"
                );
            }
        }
        attempt += 1;
        tokio::time::sleep(policy.interval()).await;
    }
}

/// Join a remote directory and file name.
pub(crate) fn remote_path(remote_dir: &str, file: &str) -> String {
    format!("{}/{}", remote_dir.trim_end_matches('/'), file)
}

pub(crate) fn transfer_error(path: &str, reason: impl std::fmt::Display) -> ScanError {
    ScanError::Transfer { path: path.to_string(), reason: reason.to_string() }
}
