//! Cluster aggregate: the node set, cluster-wide identity and secrets.

use std::fmt;

use tracing::info;

use crate::error::DeployError;
use crate::machine::{ClientIdentity, ClusterSecrets, MachineService};
use crate::node::{Node, Role};

/// A declared Talos cluster and its generated node set.
///
/// Nodes are kept in insertion order (control plane first); that order is
/// the creation order for every downstream per-node operation.
pub struct Cluster {
    name: String,
    talos_version: String,
    kubernetes_version: String,
    api_endpoint: String,
    nodes: Vec<Node>,
    has_bootstrap_node: bool,
    secrets: Option<ClusterSecrets>,
    client_identity: Option<ClientIdentity>,
}

impl Cluster {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        talos_version: impl Into<String>,
        kubernetes_version: impl Into<String>,
        api_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            talos_version: talos_version.into(),
            kubernetes_version: kubernetes_version.into(),
            api_endpoint: api_endpoint.into(),
            nodes: Vec::new(),
            has_bootstrap_node: false,
            secrets: None,
            client_identity: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn talos_version(&self) -> &str {
        &self.talos_version
    }

    #[must_use]
    pub fn kubernetes_version(&self) -> &str {
        &self.kubernetes_version
    }

    /// The stable API address clients use.
    #[must_use]
    pub fn api_endpoint(&self) -> &str {
        &self.api_endpoint
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    #[must_use]
    pub fn has_bootstrap_node(&self) -> bool {
        self.has_bootstrap_node
    }

    /// Append `count` nodes of the given role with sequential names.
    ///
    /// The first control-plane node generated cluster-wide becomes the
    /// bootstrap candidate; the flag is never reassigned afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::InvalidRole`] for roles the generator has no
    /// handler for.
    pub fn generate_nodes(&mut self, count: usize, role: Role) -> Result<(), DeployError> {
        match role {
            Role::ControlPlane | Role::Worker => {}
            Role::Infrastructure | Role::Other => return Err(DeployError::InvalidRole(role)),
        }

        let start = self.nodes.iter().filter(|n| n.role() == role).count();
        for i in start..start + count {
            let bootstrap = role == Role::ControlPlane && !self.has_bootstrap_node;
            if bootstrap {
                self.has_bootstrap_node = true;
            }
            let name = format!("{}-{}-{}", self.name, role, i);
            self.nodes.push(Node::new(role, name, bootstrap));
        }
        Ok(())
    }

    /// Nodes of one role, in insertion order.
    #[must_use]
    pub fn nodes_by_role(&self, role: Role) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.role() == role).collect()
    }

    /// The bootstrap candidate, if nodes have been generated.
    #[must_use]
    pub fn bootstrap_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.is_bootstrap())
    }

    /// Generate the cluster secrets and derive the client identity.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::SecretsAlreadyGenerated`] on a second call;
    /// the material is immutable once created. Underlying generation
    /// failures are fatal.
    pub async fn generate_secrets(
        &mut self,
        machine: &dyn MachineService,
    ) -> Result<(), DeployError> {
        if self.secrets.is_some() {
            return Err(DeployError::SecretsAlreadyGenerated);
        }
        let secrets = machine.generate_secrets(&self.talos_version).await?;
        let identity = machine
            .client_configuration(&self.name, &self.api_endpoint, &secrets)
            .await?;
        self.secrets = Some(secrets);
        self.client_identity = Some(identity);
        info!(cluster = %self.name, "cluster secrets generated");
        Ok(())
    }

    #[must_use]
    pub fn secrets(&self) -> Option<&ClusterSecrets> {
        self.secrets.as_ref()
    }

    #[must_use]
    pub fn client_identity(&self) -> Option<&ClientIdentity> {
        self.client_identity.as_ref()
    }

    /// Resolved addresses of one role's nodes, in insertion order.
    ///
    /// Must not be called before every node of that role has an address
    /// bound; the addresses are consumed by value.
    ///
    /// # Errors
    ///
    /// Returns an error for nodes without a bound address or whose address
    /// failed to resolve.
    pub async fn addresses_by_role(&self, role: Role) -> Result<Vec<String>, DeployError> {
        let mut addresses = Vec::new();
        for node in self.nodes_by_role(role) {
            let output = node.address().ok_or_else(|| DeployError::Provisioning {
                node: node.name().to_string(),
                detail: "no address bound".to_string(),
            })?;
            addresses.push(output.resolve().await?);
        }
        Ok(addresses)
    }

    /// Single readiness query against the cluster's API endpoint.
    ///
    /// Gates on a non-empty node set, a non-empty control-plane address
    /// list and a resolved client identity. No retry loop and no timeout of
    /// its own; the health collaborator's behavior is inherited.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Readiness`] if a gate is unmet or the health
    /// query fails.
    pub async fn wait_for_ready(&self, machine: &dyn MachineService) -> Result<(), DeployError> {
        if self.nodes.is_empty() {
            return Err(DeployError::Readiness("cluster has no nodes".to_string()));
        }
        let identity = self
            .client_identity
            .as_ref()
            .ok_or_else(|| DeployError::Readiness("client identity not derived".to_string()))?;

        let control_planes = self.addresses_by_role(Role::ControlPlane).await?;
        if control_planes.is_empty() {
            return Err(DeployError::Readiness(
                "no control plane addresses".to_string(),
            ));
        }
        let workers = self.addresses_by_role(Role::Worker).await?;

        machine
            .cluster_health(
                identity,
                &control_planes,
                &workers,
                std::slice::from_ref(&self.api_endpoint),
            )
            .await
            .map_err(|e| DeployError::Readiness(e.to_string()))
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cluster{{name: {}, nodes: {}, has_bootstrap_node: {}, talos: {}, kubernetes: {}, api: {}}}",
            self.name,
            self.nodes.len(),
            self.has_bootstrap_node,
            self.talos_version,
            self.kubernetes_version,
            self.api_endpoint
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineError;
    use crate::output::Output;
    use async_trait::async_trait;
    use std::time::Duration;

    fn cluster() -> Cluster {
        Cluster::new("talos", "v1.10.0", "v1.33.0", "https://192.168.4.9:6443")
    }

    struct StubMachine;

    #[async_trait]
    impl MachineService for StubMachine {
        async fn generate_secrets(&self, _: &str) -> Result<ClusterSecrets, MachineError> {
            Ok(ClusterSecrets::new("secrets: {}"))
        }

        async fn client_configuration(
            &self,
            _: &str,
            _: &str,
            _: &ClusterSecrets,
        ) -> Result<ClientIdentity, MachineError> {
            Ok(ClientIdentity {
                ca_certificate: "ca".to_string(),
                client_certificate: "crt".to_string(),
                client_key: "key".to_string(),
                raw: "context: talos".to_string(),
            })
        }

        async fn base_config(
            &self,
            _: &str,
            _: Role,
            _: &str,
            _: &ClusterSecrets,
        ) -> Result<String, MachineError> {
            Ok("version: v1alpha1".to_string())
        }

        async fn apply_configuration(
            &self,
            _: &ClientIdentity,
            _: &str,
            _: &str,
            _: &[String],
            _: &str,
        ) -> Result<(), MachineError> {
            Ok(())
        }

        async fn bootstrap(
            &self,
            _: &ClientIdentity,
            _: &str,
            _: Duration,
        ) -> Result<(), MachineError> {
            Ok(())
        }

        async fn kubeconfig(&self, _: &ClientIdentity, _: &str) -> Result<String, MachineError> {
            Ok("apiVersion: v1".to_string())
        }

        async fn cluster_health(
            &self,
            _: &ClientIdentity,
            _: &[String],
            _: &[String],
            _: &[String],
        ) -> Result<(), MachineError> {
            Ok(())
        }
    }

    #[test]
    fn generates_odd_control_plane_counts_with_single_bootstrap() {
        for n in [1usize, 3, 5, 7] {
            let mut c = cluster();
            c.generate_nodes(n, Role::ControlPlane).unwrap();

            assert_eq!(c.nodes_by_role(Role::ControlPlane).len(), n);
            let bootstrap: Vec<_> = c.nodes().iter().filter(|n| n.is_bootstrap()).collect();
            assert_eq!(bootstrap.len(), 1);
            assert_eq!(bootstrap[0].name(), "talos-controlplane-0");

            let mut names: Vec<_> = c.nodes().iter().map(Node::name).collect();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), n);
        }
    }

    #[test]
    fn workers_are_never_bootstrap_candidates() {
        let mut c = cluster();
        c.generate_nodes(3, Role::Worker).unwrap();
        assert!(!c.has_bootstrap_node());
        assert!(c.bootstrap_node().is_none());

        c.generate_nodes(3, Role::ControlPlane).unwrap();
        assert_eq!(c.bootstrap_node().unwrap().name(), "talos-controlplane-0");
    }

    #[test]
    fn bootstrap_flag_is_not_reassigned_on_later_generations() {
        let mut c = cluster();
        c.generate_nodes(1, Role::ControlPlane).unwrap();
        c.generate_nodes(2, Role::ControlPlane).unwrap();

        let bootstrap: Vec<_> = c.nodes().iter().filter(|n| n.is_bootstrap()).collect();
        assert_eq!(bootstrap.len(), 1);
        assert_eq!(bootstrap[0].name(), "talos-controlplane-0");
        // Per-role indices continue across generations.
        assert_eq!(c.nodes()[2].name(), "talos-controlplane-2");
    }

    #[test]
    fn unhandled_roles_are_rejected() {
        let mut c = cluster();
        assert!(matches!(
            c.generate_nodes(1, Role::Infrastructure),
            Err(DeployError::InvalidRole(Role::Infrastructure))
        ));
        assert!(matches!(
            c.generate_nodes(1, Role::Other),
            Err(DeployError::InvalidRole(Role::Other))
        ));
        assert!(c.nodes().is_empty());
    }

    #[tokio::test]
    async fn secrets_are_generated_once() {
        let mut c = cluster();
        c.generate_secrets(&StubMachine).await.unwrap();
        assert!(c.secrets().is_some());
        assert!(c.client_identity().is_some());

        let err = c.generate_secrets(&StubMachine).await.unwrap_err();
        assert!(matches!(err, DeployError::SecretsAlreadyGenerated));
    }

    #[tokio::test]
    async fn readiness_gates_on_identity_and_addresses() {
        let mut c = cluster();
        assert!(c.wait_for_ready(&StubMachine).await.is_err());

        c.generate_nodes(1, Role::ControlPlane).unwrap();
        assert!(c.wait_for_ready(&StubMachine).await.is_err());

        c.generate_secrets(&StubMachine).await.unwrap();
        // Address not bound yet.
        assert!(c.wait_for_ready(&StubMachine).await.is_err());

        c.nodes_mut()[0]
            .bind_address(Output::ready("10.0.0.1".to_string()))
            .unwrap();
        c.wait_for_ready(&StubMachine).await.unwrap();
    }
}
