//! Handles for the ephemeral resources a scan provisions.

use serde::{Deserialize, Serialize};

/// SSH keypair created for one scan.
#[derive(Clone, Serialize, Deserialize)]
pub struct Keypair {
    /// Keypair name (unique per run)
    pub name: String,

    /// PEM-encoded private key generated by the provider
    pub private_key: String,
}

// Keep the private key out of logs.
impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Floating IP allocated on an external network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    /// Floating IP ID
    pub id: String,

    /// Public address (e.g., 203.0.113.10)
    pub address: String,
}

/// Compute instance booted from the target image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Instance ID
    pub id: String,

    /// Instance name
    pub name: String,
}

/// Everything needed to boot a scan instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub image_id: String,
    pub keypair_name: String,
    pub flavor: String,
    pub network_id: String,
    pub config_drive: bool,
    /// Shell script passed as user data
    pub boot_script: String,
}

/// Instance state as seen by the readiness loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    /// Booted and ready for network attachment.
    Active,

    /// Still building; carries the provider's status string.
    Pending(String),

    /// Will never become active.
    Failed(String),
}

impl InstanceState {
    /// Map a Nova server status onto the readiness states.
    pub fn from_status(status: &str) -> Self {
        match status.to_uppercase().as_str() {
            "ACTIVE" => InstanceState::Active,
            "ERROR" | "DELETED" | "SOFT_DELETED" | "SHUTOFF" => {
                InstanceState::Failed(status.to_string())
            }
            _ => InstanceState::Pending(status.to_string()),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Active)
    }
}
