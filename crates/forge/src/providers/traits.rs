//! Hypervisor trait and common types for virtualization providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::output::Output;

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Authentication failed or no valid session is held.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A compute host entry is unusable.
    #[error("invalid compute host: {0}")]
    InvalidHost(String),

    /// A long-running task finished unsuccessfully.
    #[error("task {upid} failed: {status}")]
    Task { upid: String, status: String },

    /// Guest agent query failed.
    #[error("guest agent error: {0}")]
    Agent(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A physical or virtual host VMs are placed on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeHost {
    /// Host name within the hypervisor cluster.
    pub name: String,
    /// Whether the host is currently online.
    pub online: bool,
    /// CPU count reported by the host.
    pub cpu_count: u32,
    /// Available memory in bytes.
    pub memory_available: u64,
}

impl ComputeHost {
    /// Check the host entry is usable for placement.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::InvalidHost`] for empty names or hosts
    /// reporting zero capacity.
    pub fn validate(&self) -> Result<(), HypervisorError> {
        if self.name.is_empty() {
            return Err(HypervisorError::InvalidHost("empty host name".to_string()));
        }
        if self.cpu_count == 0 {
            return Err(HypervisorError::InvalidHost(format!(
                "host {} reports zero CPUs",
                self.name
            )));
        }
        Ok(())
    }
}

/// Reference to an image materialized on a compute host's storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    /// Volume identifier usable as a VM CD-ROM source.
    pub volume_id: String,
    /// Host the image was downloaded to.
    pub host: String,
}

/// Validated specification of a VM to create.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// VM name (the node name).
    pub name: String,
    /// Target compute host.
    pub host: String,
    /// CPU cores.
    pub cores: u32,
    /// Dedicated memory in MB.
    pub memory_mb: u32,
    /// Boot disk size in GB.
    pub disk_gb: u32,
    /// Network bridge.
    pub network_bridge: String,
    /// Installer image the VM boots from.
    pub image: ImageRef,
}

/// Handle to a created VM.
#[derive(Debug, Clone)]
pub struct VmHandle {
    /// Hypervisor-assigned VM identifier.
    pub id: u32,
    /// Host the VM runs on.
    pub host: String,
    /// Network address, resolved lazily from the VM's reported interfaces.
    ///
    /// Resolution policy: the last non-empty IPv4 address on the last
    /// reported interface. Intentionally permissive; "last reported" carries
    /// no further meaning.
    pub address: Output<String>,
}

/// Trait for virtualization providers.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Authenticate against the hypervisor API.
    async fn authenticate(&self) -> Result<(), HypervisorError>;

    /// Enumerate compute hosts, online or not.
    async fn list_hosts(&self) -> Result<Vec<ComputeHost>, HypervisorError>;

    /// Materialize an image from a URL onto a host's storage, overwriting
    /// any previous copy.
    async fn download_image(
        &self,
        url: &str,
        host: &str,
        file_name: &str,
    ) -> Result<ImageRef, HypervisorError>;

    /// Create and start a VM; its address resolves lazily.
    async fn create_vm(&self, spec: &VmSpec) -> Result<VmHandle, HypervisorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_validation() {
        let host = ComputeHost {
            name: "pve1".to_string(),
            online: true,
            cpu_count: 32,
            memory_available: 64 << 30,
        };
        host.validate().unwrap();

        let unnamed = ComputeHost {
            name: String::new(),
            ..host.clone()
        };
        assert!(unnamed.validate().is_err());

        let no_cpu = ComputeHost {
            cpu_count: 0,
            ..host
        };
        assert!(no_cpu.validate().is_err());
    }
}
