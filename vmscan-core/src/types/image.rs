//! Image domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Image record as returned by the cloud image service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudImage {
    /// Image ID (UUID in Glance)
    pub id: String,

    /// Image name
    pub name: String,

    /// Image status (e.g., "active")
    pub status: String,

    /// Creation timestamp
    pub created_at: Option<DateTime<Utc>>,

    /// Custom properties, including scan tags written by vmscan
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// One image selected for scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTarget {
    /// Image ID
    pub id: String,

    /// Display name
    pub name: String,

    /// When the image was created
    pub created_at: Option<DateTime<Utc>>,
}

impl ScanTarget {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), created_at: None }
    }
}

impl From<CloudImage> for ScanTarget {
    fn from(image: CloudImage) -> Self {
        Self { id: image.id, name: image.name, created_at: image.created_at }
    }
}

impl std::fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
