//! Deployment pipeline.
//!
//! Drives a full cluster deployment as a fixed sequence of stages. Stages
//! run strictly in order and the first failure aborts the run; already
//! created resources are left in place for inspection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::error::DeployError;
use crate::image::ImageService;
use crate::machine::MachineService;
use crate::node::Role;
use crate::patch::{
    discover_patch_files, install_disk_patch, merge_documents, render_template, yaml_to_json,
    NodeContext,
};
use crate::persist::write_durable;
use crate::providers::{ComputeHost, Hypervisor, ImageRef, VmSpec};
use crate::settings::Settings;

/// The stages of a deployment, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStage {
    SetupCluster,
    SetupProvisioner,
    AcquireImage,
    ProvisionNodes,
    ConfigureNodes,
    AwaitReady,
    Export,
}

impl DeployStage {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetupCluster => "setup-cluster",
            Self::SetupProvisioner => "setup-provisioner",
            Self::AcquireImage => "acquire-image",
            Self::ProvisionNodes => "provision-nodes",
            Self::ConfigureNodes => "configure-nodes",
            Self::AwaitReady => "await-ready",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful run hands back.
#[derive(Debug, Clone)]
pub struct DeployOutputs {
    /// Client identity document (talosconfig).
    pub talosconfig: String,
    /// Cluster admin kubeconfig.
    pub kubeconfig: String,
    /// Where the kubeconfig was persisted.
    pub kubeconfig_path: std::path::PathBuf,
}

/// Orchestrates one cluster deployment end to end.
pub struct Pipeline {
    settings: Settings,
    cluster: Cluster,
    hypervisor: Arc<dyn Hypervisor>,
    images: Arc<dyn ImageService>,
    machine: Arc<dyn MachineService>,
    hosts: Vec<ComputeHost>,
    image: Option<ImageRef>,
}

impl Pipeline {
    /// Build a pipeline over the given collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Configuration`] if the settings are invalid;
    /// nothing is created for an invalid specification.
    pub fn new(
        settings: Settings,
        hypervisor: Arc<dyn Hypervisor>,
        images: Arc<dyn ImageService>,
        machine: Arc<dyn MachineService>,
    ) -> Result<Self, DeployError> {
        settings.validate()?;
        let cluster = Cluster::new(
            &settings.cluster_name,
            &settings.talos_version,
            &settings.kubernetes_version,
            &settings.api_endpoint,
        );
        Ok(Self {
            settings,
            cluster,
            hypervisor,
            images,
            machine,
            hosts: Vec::new(),
            image: None,
        })
    }

    #[must_use]
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Run every stage in order.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure, wrapped with the stage it occurred
    /// in. No rollback is attempted.
    pub async fn execute(&mut self) -> Result<DeployOutputs, DeployError> {
        use DeployStage as Stage;

        self.setup_cluster()
            .await
            .map_err(|e| e.in_stage(Stage::SetupCluster))?;
        self.setup_provisioner()
            .await
            .map_err(|e| e.in_stage(Stage::SetupProvisioner))?;
        self.acquire_image()
            .await
            .map_err(|e| e.in_stage(Stage::AcquireImage))?;
        self.provision_nodes()
            .await
            .map_err(|e| e.in_stage(Stage::ProvisionNodes))?;
        self.configure_nodes()
            .await
            .map_err(|e| e.in_stage(Stage::ConfigureNodes))?;
        self.await_ready()
            .await
            .map_err(|e| e.in_stage(Stage::AwaitReady))?;
        let outputs = self
            .export()
            .await
            .map_err(|e| e.in_stage(Stage::Export))?;

        info!(cluster = %self.cluster, "deployment complete");
        Ok(outputs)
    }

    /// Generate the node set and the cluster secrets.
    async fn setup_cluster(&mut self) -> Result<(), DeployError> {
        self.cluster
            .generate_nodes(self.settings.control_plane_count, Role::ControlPlane)?;
        self.cluster
            .generate_nodes(self.settings.worker_count, Role::Worker)?;
        self.cluster.generate_secrets(self.machine.as_ref()).await?;
        info!(
            control_planes = self.settings.control_plane_count,
            workers = self.settings.worker_count,
            "node set generated"
        );
        Ok(())
    }

    /// Authenticate and enumerate usable compute hosts.
    async fn setup_provisioner(&mut self) -> Result<(), DeployError> {
        self.hypervisor.authenticate().await?;
        let hosts: Vec<ComputeHost> = self
            .hypervisor
            .list_hosts()
            .await?
            .into_iter()
            .filter(|h| h.online && h.validate().is_ok())
            .collect();
        if hosts.is_empty() {
            return Err(DeployError::Discovery(
                "no online compute hosts available".to_string(),
            ));
        }
        info!(hosts = hosts.len(), "compute hosts discovered");
        self.hosts = hosts;
        Ok(())
    }

    /// Build the installer image and materialize it on storage.
    async fn acquire_image(&mut self) -> Result<(), DeployError> {
        let handle = self.images.build_image(&self.settings.extensions).await?;
        let url = self.images.download_url(
            &handle,
            &self.settings.arch,
            &self.settings.platform,
            &self.settings.talos_version,
        );
        let file_name = format!(
            "talos-{}-{}-{}.iso",
            self.settings.talos_version, self.settings.platform, self.settings.arch
        );
        // Shared storage: one copy serves every host.
        let host = &self.hosts[0].name;
        let image = self
            .hypervisor
            .download_image(&url, host, &file_name)
            .await?;
        info!(volume = %image.volume_id, host = %image.host, "installer image ready");
        self.image = Some(image);
        Ok(())
    }

    /// Create one VM per node, round-robin across the host list.
    async fn provision_nodes(&mut self) -> Result<(), DeployError> {
        let image = self
            .image
            .clone()
            .ok_or_else(|| DeployError::Discovery("no installer image acquired".to_string()))?;
        let hosts = self.hosts.clone();

        for i in 0..self.cluster.nodes().len() {
            let node_name = self.cluster.nodes()[i].name().to_string();
            let spec = VmSpec {
                name: node_name.clone(),
                host: hosts[i % hosts.len()].name.clone(),
                cores: self.settings.cores,
                memory_mb: self.settings.memory_mb,
                disk_gb: self.settings.disk_gb,
                network_bridge: self.settings.network_bridge.clone(),
                image: image.clone(),
            };
            let handle = self.hypervisor.create_vm(&spec).await.map_err(|e| {
                DeployError::Provisioning {
                    node: node_name.clone(),
                    detail: e.to_string(),
                }
            })?;
            info!(node = %node_name, vm_id = handle.id, host = %handle.host, "vm created");

            let node = &mut self.cluster.nodes_mut()[i];
            node.bind_address(handle.address.clone())?;
            node.bind_vm(handle)?;
        }
        Ok(())
    }

    /// Apply machine configuration to every node and bootstrap consensus.
    async fn configure_nodes(&mut self) -> Result<(), DeployError> {
        let secrets = self
            .cluster
            .secrets()
            .cloned()
            .ok_or_else(|| DeployError::Configuration("cluster secrets missing".to_string()))?;
        let identity = self.cluster.client_identity().cloned().ok_or_else(|| {
            DeployError::Configuration("client identity missing".to_string())
        })?;

        for node in self.cluster.nodes() {
            let base = self
                .machine
                .base_config(
                    self.cluster.name(),
                    node.role(),
                    self.cluster.api_endpoint(),
                    &secrets,
                )
                .await?;

            let address = node
                .address()
                .ok_or_else(|| DeployError::Provisioning {
                    node: node.name().to_string(),
                    detail: "no address bound".to_string(),
                })?
                .resolve()
                .await?;

            let files = discover_patch_files(&self.settings.patch_dir, node.role())?;
            let merged = merge_documents(&files)?;
            let rendered = render_template(&merged, &NodeContext::new(node, &address))?;
            let role_patch = yaml_to_json(&rendered)?;
            let patches = vec![
                install_disk_patch(&self.settings.install_disk)?,
                role_patch,
            ];

            self.machine
                .apply_configuration(&identity, &base, node.name(), &patches, &address)
                .await?;
            info!(node = %node.name(), address = %address, "configuration applied");

            if node.is_bootstrap() {
                self.machine
                    .bootstrap(
                        &identity,
                        &address,
                        Duration::from_secs(self.settings.bootstrap_timeout_secs),
                    )
                    .await
                    .map_err(|e| DeployError::Bootstrap {
                        node: node.name().to_string(),
                        source: e,
                    })?;
                info!(node = %node.name(), "cluster bootstrapped");
            }
        }
        Ok(())
    }

    /// Single readiness query; advisory unless configured to gate export.
    async fn await_ready(&self) -> Result<(), DeployError> {
        match self.cluster.wait_for_ready(self.machine.as_ref()).await {
            Ok(()) => {
                info!("cluster reported healthy");
                Ok(())
            }
            Err(e) if self.settings.readiness_gates_export => Err(e),
            Err(e) => {
                warn!(error = %e, "readiness check failed, continuing to export");
                Ok(())
            }
        }
    }

    /// Persist credentials and hand back the run outputs.
    ///
    /// The kubeconfig is retrieved through the first node of the node set;
    /// any functioning control-plane member would serve.
    async fn export(&self) -> Result<DeployOutputs, DeployError> {
        let identity = self.cluster.client_identity().cloned().ok_or_else(|| {
            DeployError::Configuration("client identity missing".to_string())
        })?;
        let first = self
            .cluster
            .nodes()
            .first()
            .ok_or_else(|| DeployError::Discovery("cluster has no nodes".to_string()))?;
        let address = first
            .address()
            .ok_or_else(|| DeployError::Provisioning {
                node: first.name().to_string(),
                detail: "no address bound".to_string(),
            })?
            .resolve()
            .await?;

        let kubeconfig = self.machine.kubeconfig(&identity, &address).await?;
        write_durable(&self.settings.kubeconfig_path, &kubeconfig)?;
        write_durable(&self.settings.talosconfig_path, &identity.raw)?;
        info!(
            kubeconfig = %self.settings.kubeconfig_path.display(),
            talosconfig = %self.settings.talosconfig_path.display(),
            "credentials persisted"
        );

        Ok(DeployOutputs {
            talosconfig: identity.raw,
            kubeconfig,
            kubeconfig_path: self.settings.kubeconfig_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names() {
        assert_eq!(DeployStage::SetupCluster.to_string(), "setup-cluster");
        assert_eq!(DeployStage::ConfigureNodes.to_string(), "configure-nodes");
        assert_eq!(DeployStage::Export.to_string(), "export");
    }
}
