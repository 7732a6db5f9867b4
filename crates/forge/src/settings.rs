//! Deployment settings.
//!
//! All configuration is carried by an explicit [`Settings`] value
//! constructed once at startup and handed to the pipeline; there are no
//! process-wide defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DeployError;

fn default_control_plane_count() -> usize {
    3
}
fn default_worker_count() -> usize {
    3
}
fn default_cores() -> u32 {
    4
}
fn default_memory_mb() -> u32 {
    8096
}
fn default_disk_gb() -> u32 {
    100
}
fn default_network_bridge() -> String {
    "vmbr1".to_string()
}
fn default_arch() -> String {
    "amd64".to_string()
}
fn default_platform() -> String {
    "metal".to_string()
}
fn default_cluster_name() -> String {
    "talos".to_string()
}
fn default_talos_version() -> String {
    "v1.10.0".to_string()
}
fn default_kubernetes_version() -> String {
    "v1.33.0".to_string()
}
fn default_api_endpoint() -> String {
    "https://192.168.4.9:6443".to_string()
}
fn default_extensions() -> Vec<String> {
    vec![
        "siderolabs/amdgpu".to_string(),
        "siderolabs/amd-ucode".to_string(),
        "siderolabs/stargz-snapshotter".to_string(),
        "siderolabs/util-linux-tools".to_string(),
        "siderolabs/qemu-guest-agent".to_string(),
    ]
}
fn default_patch_dir() -> PathBuf {
    PathBuf::from("talos-config")
}
fn default_install_disk() -> String {
    "/dev/vda".to_string()
}
fn default_datastore() -> String {
    "local".to_string()
}
fn default_kubeconfig_path() -> PathBuf {
    PathBuf::from("kubeconfig.yaml")
}
fn default_talosconfig_path() -> PathBuf {
    PathBuf::from("talosconfig")
}
fn default_bootstrap_timeout_secs() -> u64 {
    600
}

/// Cluster deployment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Number of control-plane nodes; must be odd to support quorum.
    pub control_plane_count: usize,
    /// Number of worker nodes.
    pub worker_count: usize,
    /// CPU cores per VM.
    pub cores: u32,
    /// Dedicated memory per VM in MB.
    pub memory_mb: u32,
    /// Boot disk size per VM in GB.
    pub disk_gb: u32,
    /// Network bridge the VMs attach to.
    pub network_bridge: String,
    /// Image architecture (e.g. `amd64`).
    pub arch: String,
    /// Image platform (e.g. `metal`).
    pub platform: String,
    /// Cluster name; prefixes every node name.
    pub cluster_name: String,
    /// Talos version (e.g. `v1.10.0`).
    pub talos_version: String,
    /// Kubernetes version (e.g. `v1.33.0`).
    pub kubernetes_version: String,
    /// Stable API endpoint clients use (the VIP).
    pub api_endpoint: String,
    /// Official system extensions baked into the image.
    pub extensions: Vec<String>,
    /// Base directory holding per-role patch directories.
    pub patch_dir: PathBuf,
    /// Disk Talos installs onto inside the VM.
    pub install_disk: String,
    /// Proxmox datastore for disks and the downloaded image.
    pub datastore: String,
    /// Where the kubeconfig is persisted.
    pub kubeconfig_path: PathBuf,
    /// Where the talosconfig (client identity) is persisted.
    pub talosconfig_path: PathBuf,
    /// Hard ceiling on the bootstrap operation.
    pub bootstrap_timeout_secs: u64,
    /// Whether a failed readiness check blocks credential export.
    pub readiness_gates_export: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_plane_count: default_control_plane_count(),
            worker_count: default_worker_count(),
            cores: default_cores(),
            memory_mb: default_memory_mb(),
            disk_gb: default_disk_gb(),
            network_bridge: default_network_bridge(),
            arch: default_arch(),
            platform: default_platform(),
            cluster_name: default_cluster_name(),
            talos_version: default_talos_version(),
            kubernetes_version: default_kubernetes_version(),
            api_endpoint: default_api_endpoint(),
            extensions: default_extensions(),
            patch_dir: default_patch_dir(),
            install_disk: default_install_disk(),
            datastore: default_datastore(),
            kubeconfig_path: default_kubeconfig_path(),
            talosconfig_path: default_talosconfig_path(),
            bootstrap_timeout_secs: default_bootstrap_timeout_secs(),
            readiness_gates_export: false,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults for
    /// missing keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, DeployError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| DeployError::io(path, e))?;
        toml::from_str(&content)
            .map_err(|e| DeployError::Configuration(format!("{}: {e}", path.display())))
    }

    /// Validate the settings before any resource is created.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Configuration`] for an even control-plane
    /// count or zero-sized resources.
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.control_plane_count % 2 == 0 {
            return Err(DeployError::Configuration(format!(
                "control plane count must be odd, got {}",
                self.control_plane_count
            )));
        }
        if self.cores == 0 || self.memory_mb == 0 || self.disk_gb == 0 {
            return Err(DeployError::Configuration(
                "cores, memory and disk size must be non-zero".to_string(),
            ));
        }
        if self.cluster_name.is_empty() {
            return Err(DeployError::Configuration(
                "cluster name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn even_control_plane_count_is_rejected() {
        let settings = Settings {
            control_plane_count: 4,
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("must be odd"));
    }

    #[test]
    fn single_control_plane_is_valid() {
        let settings = Settings {
            control_plane_count: 1,
            worker_count: 0,
            ..Settings::default()
        };
        settings.validate().unwrap();
    }

    #[test]
    fn parses_partial_toml() {
        let settings: Settings =
            toml::from_str("control_plane_count = 5\ncluster_name = \"lab\"\n").unwrap();
        assert_eq!(settings.control_plane_count, 5);
        assert_eq!(settings.cluster_name, "lab");
        assert_eq!(settings.worker_count, 3);
    }
}
