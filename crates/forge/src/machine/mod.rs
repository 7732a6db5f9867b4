//! Machine configuration collaborator.
//!
//! Everything that talks the Talos machine API: secrets generation, base
//! machine configs, per-node configuration apply, bootstrap, health and
//! kubeconfig retrieval.

mod talosctl;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::node::Role;

pub use talosctl::Talosctl;

/// Errors from the machine configuration service.
#[derive(Error, Debug)]
pub enum MachineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An external command exited unsuccessfully.
    #[error("{program} failed: {detail}")]
    Command { program: String, detail: String },

    /// Operation exceeded its ceiling.
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// No machine configuration exists for this role.
    #[error("no machine configuration for role {0}")]
    UnsupportedRole(Role),

    /// A returned document could not be interpreted.
    #[error("cannot parse {what}: {detail}")]
    Parse { what: String, detail: String },
}

/// The cluster's cryptographic material. Generated once, immutable.
#[derive(Debug, Clone)]
pub struct ClusterSecrets {
    /// Raw secrets bundle (YAML).
    pub yaml: String,
}

impl ClusterSecrets {
    #[must_use]
    pub fn new(yaml: impl Into<String>) -> Self {
        Self { yaml: yaml.into() }
    }
}

/// Certificate/key bundle authenticating management operations.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub ca_certificate: String,
    pub client_certificate: String,
    pub client_key: String,
    /// The full talosconfig document the bundle was derived from.
    pub raw: String,
}

/// Talos machine configuration operations.
#[async_trait]
pub trait MachineService: Send + Sync {
    /// Generate the cluster's cryptographic material.
    async fn generate_secrets(&self, talos_version: &str) -> Result<ClusterSecrets, MachineError>;

    /// Derive the client identity from the cluster secrets.
    async fn client_configuration(
        &self,
        cluster_name: &str,
        api_endpoint: &str,
        secrets: &ClusterSecrets,
    ) -> Result<ClientIdentity, MachineError>;

    /// Generate the base machine configuration for a role.
    async fn base_config(
        &self,
        cluster_name: &str,
        role: Role,
        api_endpoint: &str,
        secrets: &ClusterSecrets,
    ) -> Result<String, MachineError>;

    /// Apply a base configuration plus JSON patches to one node.
    async fn apply_configuration(
        &self,
        identity: &ClientIdentity,
        base_config: &str,
        node_name: &str,
        patches: &[String],
        address: &str,
    ) -> Result<(), MachineError>;

    /// Bootstrap cluster consensus on one node. Invoked at most once per
    /// cluster, with a hard ceiling.
    async fn bootstrap(
        &self,
        identity: &ClientIdentity,
        address: &str,
        timeout: Duration,
    ) -> Result<(), MachineError>;

    /// Retrieve a kubeconfig through the given node.
    async fn kubeconfig(
        &self,
        identity: &ClientIdentity,
        address: &str,
    ) -> Result<String, MachineError>;

    /// Single health query across the declared node set.
    async fn cluster_health(
        &self,
        identity: &ClientIdentity,
        control_planes: &[String],
        workers: &[String],
        endpoints: &[String],
    ) -> Result<(), MachineError>;
}
