//! Cloud provider abstraction.
//!
//! The lifecycle controller talks to the cloud only through the
//! [`CloudProvider`] trait:
//! - OpenStack: [`OpenStackClient`] (Keystone, Nova, Neutron, Glance)
//! - Tests: in-memory mocks that record every create/release call

use crate::error::Result;
use crate::types::{CloudImage, FloatingIp, Instance, InstanceSpec, InstanceState, Keypair};
use async_trait::async_trait;

/// Cloud provider trait.
///
/// Every create operation has a matching remove operation; the controller pairs
/// them so anything it creates is released on every exit path.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create a keypair; the provider generates and returns the private key.
    async fn create_keypair(&self, name: &str) -> Result<Keypair>;

    /// Delete a keypair by name.
    async fn remove_keypair(&self, name: &str) -> Result<()>;

    /// Allocate a floating IP on the external network named `network_name`.
    async fn create_floating_ip(&self, network_name: &str) -> Result<FloatingIp>;

    /// Release a floating IP.
    async fn remove_floating_ip(&self, id: &str) -> Result<()>;

    /// Boot an instance.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance>;

    /// Current instance state.
    async fn instance_state(&self, id: &str) -> Result<InstanceState>;

    /// Associate a floating IP with an instance.
    async fn attach_floating_ip(&self, instance_id: &str, ip: &FloatingIp) -> Result<()>;

    /// Delete an instance.
    async fn remove_instance(&self, id: &str) -> Result<()>;

    /// Fetch one image record.
    async fn fetch_image(&self, id: &str) -> Result<CloudImage>;

    /// All images whose name starts with `prefix`.
    async fn fetch_images_by_prefix(&self, prefix: &str) -> Result<Vec<CloudImage>>;

    /// Set an image property.
    async fn tag_image(&self, id: &str, key: &str, value: &str) -> Result<()>;

    /// Delete an image record.
    async fn remove_image(&self, id: &str) -> Result<()>;

    /// Provider name (for logging/metrics).
    fn name(&self) -> &str;
}

mod openstack;
pub use openstack::{OpenStackClient, OpenStackCredentials};
