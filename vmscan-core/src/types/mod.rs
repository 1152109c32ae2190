//! Core domain types for vmscan.

pub mod image;
pub mod instance;

// Re-exports
pub use image::{CloudImage, ScanTarget};
pub use instance::{FloatingIp, Instance, InstanceSpec, InstanceState, Keypair};
