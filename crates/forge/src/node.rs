//! Cluster member model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeployError;
use crate::output::Output;
use crate::providers::VmHandle;

/// Role of a node within the cluster.
///
/// The lowercase string form doubles as the Talos `machineType` value and as
/// the patch directory name consumed by the config merge engine, so changing
/// it breaks on-disk patch discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    ControlPlane,
    Worker,
    Infrastructure,
    Other,
}

impl Role {
    /// Canonical lowercase form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlPlane => "controlplane",
            Self::Worker => "worker",
            Self::Infrastructure => "infrastructure",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One member of the cluster.
///
/// Created by the cluster aggregate during node-set generation. The address
/// and compute handle are bound exactly once by the deployment pipeline
/// after provisioning; rebinding either is an error.
#[derive(Debug, Clone)]
pub struct Node {
    role: Role,
    name: String,
    pool: String,
    bootstrap: bool,
    address: Option<Output<String>>,
    vm: Option<VmHandle>,
}

impl Node {
    pub(crate) fn new(role: Role, name: impl Into<String>, bootstrap: bool) -> Self {
        Self {
            role,
            name: name.into(),
            pool: "default".to_string(),
            bootstrap,
            address: None,
            vm: None,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical placement group.
    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn set_pool(&mut self, pool: impl Into<String>) {
        self.pool = pool.into();
    }

    /// True for exactly one control-plane node per cluster.
    #[must_use]
    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    /// Network address, absent until the pipeline provisions the node.
    #[must_use]
    pub fn address(&self) -> Option<&Output<String>> {
        self.address.as_ref()
    }

    /// Bind the node's network address.
    ///
    /// # Errors
    ///
    /// Returns an error if an address is already bound; addresses are set
    /// once and never reset.
    pub fn bind_address(&mut self, address: Output<String>) -> Result<(), DeployError> {
        if self.address.is_some() {
            return Err(DeployError::Provisioning {
                node: self.name.clone(),
                detail: "address already bound".to_string(),
            });
        }
        self.address = Some(address);
        Ok(())
    }

    /// Handle to the provisioned compute resource, if any.
    #[must_use]
    pub fn vm(&self) -> Option<&VmHandle> {
        self.vm.as_ref()
    }

    /// Bind the provisioned compute resource.
    ///
    /// # Errors
    ///
    /// Returns an error if a compute handle is already bound.
    pub fn bind_vm(&mut self, vm: VmHandle) -> Result<(), DeployError> {
        if self.vm.is_some() {
            return Err(DeployError::Provisioning {
                node: self.name.clone(),
                detail: "compute resource already bound".to_string(),
            });
        }
        self.vm = Some(vm);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_string_forms() {
        assert_eq!(Role::ControlPlane.to_string(), "controlplane");
        assert_eq!(Role::Worker.to_string(), "worker");
        assert_eq!(Role::Infrastructure.to_string(), "infrastructure");
        assert_eq!(Role::Other.to_string(), "other");
    }

    #[test]
    fn defaults() {
        let node = Node::new(Role::Worker, "talos-worker-0", false);
        assert_eq!(node.pool(), "default");
        assert!(node.address().is_none());
        assert!(node.vm().is_none());
        assert!(!node.is_bootstrap());
    }

    #[test]
    fn address_binds_once() {
        let mut node = Node::new(Role::ControlPlane, "talos-controlplane-0", true);
        node.bind_address(Output::ready("10.0.0.1".to_string()))
            .unwrap();
        let err = node
            .bind_address(Output::ready("10.0.0.2".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("already bound"));
    }
}
