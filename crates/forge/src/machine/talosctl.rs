//! `talosctl`-backed implementation of the machine service.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ClientIdentity, ClusterSecrets, MachineError, MachineService};
use crate::node::Role;

/// Machine service driving the `talosctl` binary.
pub struct Talosctl {
    binary: PathBuf,
    work_dir: PathBuf,
}

impl Talosctl {
    /// Create a service writing its scratch files under `work_dir`.
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: PathBuf::from("talosctl"),
            work_dir: work_dir.into(),
        }
    }

    /// Override the `talosctl` binary path.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Check the binary is present and working.
    ///
    /// # Errors
    ///
    /// Returns an error if `talosctl version --client` fails to run.
    pub async fn check(&self) -> Result<(), MachineError> {
        let version = self.run(&["version", "--client"]).await?;
        debug!(version = version.trim(), "talosctl available");
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<String, MachineError> {
        debug!(?args, "running talosctl");
        let output = Command::new(&self.binary).args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(MachineError::Command {
                program: format!("talosctl {}", args.first().copied().unwrap_or_default()),
                detail: stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Unique scratch path under the work directory.
    async fn scratch_path(&self, prefix: &str, suffix: &str) -> Result<PathBuf, MachineError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Ok(self.work_dir.join(format!("{prefix}-{nanos}{suffix}")))
    }

    async fn write_scratch(
        &self,
        prefix: &str,
        suffix: &str,
        contents: &str,
    ) -> Result<PathBuf, MachineError> {
        let path = self.scratch_path(prefix, suffix).await?;
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    async fn gen_config(
        &self,
        cluster_name: &str,
        api_endpoint: &str,
        secrets: &ClusterSecrets,
        output_type: &str,
    ) -> Result<(PathBuf, String), MachineError> {
        let secrets_path = self.write_scratch("secrets", ".yaml", &secrets.yaml).await?;
        let out_dir = self.scratch_path("gen", "").await?;
        tokio::fs::create_dir_all(&out_dir).await?;

        self.run(&[
            "gen",
            "config",
            cluster_name,
            api_endpoint,
            "--with-secrets",
            &secrets_path.to_string_lossy(),
            "--output-types",
            output_type,
            "--output",
            &out_dir.to_string_lossy(),
            "--force",
        ])
        .await?;

        let file = match output_type {
            "talosconfig" => out_dir.join("talosconfig"),
            other => out_dir.join(format!("{other}.yaml")),
        };
        let contents = tokio::fs::read_to_string(&file).await?;
        Ok((file, contents))
    }
}

/// Extract the client identity fields from a talosconfig document.
fn parse_talosconfig(raw: &str) -> Result<ClientIdentity, MachineError> {
    let parse_err = |detail: &str| MachineError::Parse {
        what: "talosconfig".to_string(),
        detail: detail.to_string(),
    };

    let doc: serde_yaml::Value =
        serde_yaml::from_str(raw).map_err(|e| parse_err(&e.to_string()))?;
    let context = doc["context"]
        .as_str()
        .ok_or_else(|| parse_err("missing context"))?;
    let entry = &doc["contexts"][context];

    let field = |name: &str| {
        entry[name]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| parse_err(&format!("context {context} missing `{name}`")))
    };

    Ok(ClientIdentity {
        ca_certificate: field("ca")?,
        client_certificate: field("crt")?,
        client_key: field("key")?,
        raw: raw.to_string(),
    })
}

fn role_output_type(role: Role) -> Result<&'static str, MachineError> {
    match role {
        Role::ControlPlane => Ok("controlplane"),
        Role::Worker => Ok("worker"),
        Role::Infrastructure | Role::Other => Err(MachineError::UnsupportedRole(role)),
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[async_trait]
impl MachineService for Talosctl {
    async fn generate_secrets(&self, talos_version: &str) -> Result<ClusterSecrets, MachineError> {
        let path = self.scratch_path("secrets", ".yaml").await?;
        info!(talos_version, "generating cluster secrets");
        self.run(&[
            "gen",
            "secrets",
            "--talos-version",
            talos_version,
            "-o",
            &path_str(&path),
        ])
        .await?;
        let yaml = tokio::fs::read_to_string(&path).await?;
        Ok(ClusterSecrets { yaml })
    }

    async fn client_configuration(
        &self,
        cluster_name: &str,
        api_endpoint: &str,
        secrets: &ClusterSecrets,
    ) -> Result<ClientIdentity, MachineError> {
        let (_, raw) = self
            .gen_config(cluster_name, api_endpoint, secrets, "talosconfig")
            .await?;
        parse_talosconfig(&raw)
    }

    async fn base_config(
        &self,
        cluster_name: &str,
        role: Role,
        api_endpoint: &str,
        secrets: &ClusterSecrets,
    ) -> Result<String, MachineError> {
        let output_type = role_output_type(role)?;
        let (_, config) = self
            .gen_config(cluster_name, api_endpoint, secrets, output_type)
            .await?;
        Ok(config)
    }

    async fn apply_configuration(
        &self,
        _identity: &ClientIdentity,
        base_config: &str,
        node_name: &str,
        patches: &[String],
        address: &str,
    ) -> Result<(), MachineError> {
        let config_path = self.write_scratch("machineconfig", ".yaml", base_config).await?;
        let config_path = path_str(&config_path);

        // Nodes are in maintenance mode at first apply, hence --insecure.
        let mut args = vec![
            "apply-config",
            "--insecure",
            "--nodes",
            address,
            "--file",
            &config_path,
        ];
        for patch in patches {
            args.push("--config-patch");
            args.push(patch.as_str());
        }

        info!(node = node_name, address, patches = patches.len(), "applying configuration");
        self.run(&args).await?;
        Ok(())
    }

    async fn bootstrap(
        &self,
        identity: &ClientIdentity,
        address: &str,
        timeout: Duration,
    ) -> Result<(), MachineError> {
        let talosconfig = self.write_scratch("talosconfig", "", &identity.raw).await?;
        let talosconfig = path_str(&talosconfig);

        info!(address, "bootstrapping cluster");
        let result = tokio::time::timeout(
            timeout,
            self.run(&[
                "--talosconfig",
                &talosconfig,
                "-e",
                address,
                "-n",
                address,
                "bootstrap",
            ]),
        )
        .await
        .map_err(|_| MachineError::Timeout(timeout.as_secs()))?;

        match result {
            Ok(_) => Ok(()),
            Err(MachineError::Command { detail, .. })
                if detail.contains("already bootstrapped")
                    || detail.contains("etcd is already running") =>
            {
                warn!(address, "cluster appears to already be bootstrapped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn kubeconfig(
        &self,
        identity: &ClientIdentity,
        address: &str,
    ) -> Result<String, MachineError> {
        let talosconfig = self.write_scratch("talosconfig", "", &identity.raw).await?;
        let out_path = self.scratch_path("kubeconfig", ".yaml").await?;

        self.run(&[
            "--talosconfig",
            &path_str(&talosconfig),
            "-e",
            address,
            "-n",
            address,
            "kubeconfig",
            "--force",
            &path_str(&out_path),
        ])
        .await?;

        Ok(tokio::fs::read_to_string(&out_path).await?)
    }

    async fn cluster_health(
        &self,
        identity: &ClientIdentity,
        control_planes: &[String],
        workers: &[String],
        endpoints: &[String],
    ) -> Result<(), MachineError> {
        let talosconfig = self.write_scratch("talosconfig", "", &identity.raw).await?;
        let talosconfig = path_str(&talosconfig);
        let endpoint_list = endpoints.join(",");
        let control_plane_list = control_planes.join(",");
        let worker_list = workers.join(",");

        let mut args = vec![
            "--talosconfig",
            talosconfig.as_str(),
            "-e",
            &endpoint_list,
            "health",
            "--control-plane-nodes",
            &control_plane_list,
        ];
        if !workers.is_empty() {
            args.push("--worker-nodes");
            args.push(&worker_list);
        }

        self.run(&args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TALOSCONFIG: &str = "\
context: talos
contexts:
  talos:
    endpoints: []
    ca: Y2EtYnl0ZXM=
    crt: Y3J0LWJ5dGVz
    key: a2V5LWJ5dGVz
";

    #[test]
    fn parses_talosconfig_identity() {
        let identity = parse_talosconfig(SAMPLE_TALOSCONFIG).unwrap();
        assert_eq!(identity.ca_certificate, "Y2EtYnl0ZXM=");
        assert_eq!(identity.client_certificate, "Y3J0LWJ5dGVz");
        assert_eq!(identity.client_key, "a2V5LWJ5dGVz");
        assert_eq!(identity.raw, SAMPLE_TALOSCONFIG);
    }

    #[test]
    fn rejects_talosconfig_without_context() {
        let err = parse_talosconfig("contexts: {}\n").unwrap_err();
        assert!(err.to_string().contains("missing context"));
    }

    #[test]
    fn only_control_plane_and_worker_have_base_configs() {
        assert_eq!(role_output_type(Role::ControlPlane).unwrap(), "controlplane");
        assert_eq!(role_output_type(Role::Worker).unwrap(), "worker");
        assert!(matches!(
            role_output_type(Role::Infrastructure),
            Err(MachineError::UnsupportedRole(Role::Infrastructure))
        ));
    }
}
