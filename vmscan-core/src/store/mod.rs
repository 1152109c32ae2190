//! Object storage for scan reports.
//!
//! Reports are written once per image under an image-keyed path (see
//! [`crate::paths::report_key`]), so concurrent runs never write the same key.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{Result, ScanError};

mod local;
mod swift;

pub use local::LocalStore;
pub use swift::SwiftStore;

/// Write-only blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`, replacing any previous object.
    async fn put(&self, content_type: &str, key: &str, body: Vec<u8>) -> Result<()>;

    /// Store name (for logging).
    fn name(&self) -> &str;
}

/// Where reports go, as given on the command line.
///
/// Accepted forms: `swift:<container>` and `file:<directory>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Swift { container: String },
    Local { root: PathBuf },
}

impl FromStr for StoreLocation {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ScanError::InvalidConfig {
            reason: format!("store '{}' must be swift:<container> or file:<directory>", s),
        };

        let (scheme, rest) = s.split_once(':').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }

        match scheme {
            "swift" => {
                if rest.contains('/') {
                    return Err(invalid());
                }
                Ok(StoreLocation::Swift { container: rest.to_string() })
            }
            "file" => Ok(StoreLocation::Local { root: PathBuf::from(rest) }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::Swift { container } => write!(f, "swift:{}", container),
            StoreLocation::Local { root } => write!(f, "file:{}", root.display()),
        }
    }
}
