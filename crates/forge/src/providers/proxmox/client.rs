//! Proxmox VE API client implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use super::models::{AgentInterfaces, ApiResponse, NodeEntry, TaskStatus, Ticket};
use crate::output::{Output, OutputError};
use crate::providers::traits::{
    ComputeHost, Hypervisor, HypervisorError, ImageRef, VmHandle, VmSpec,
};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Polling interval for long-running tasks.
const TASK_POLL_INTERVAL_SECS: u64 = 2;

/// Polling interval while waiting for the guest agent to report addresses.
const AGENT_POLL_INTERVAL_SECS: u64 = 10;

/// Ceiling on guest-agent address resolution.
const AGENT_RESOLVE_TIMEOUT_SECS: u64 = 900;

/// Proxmox VE virtualization provider.
#[derive(Clone)]
pub struct Proxmox {
    /// HTTP client.
    client: Client,
    /// API base, e.g. `https://pve.example.com:8006`.
    base_url: String,
    /// Username in `user@realm` form.
    username: String,
    /// Password or API token secret.
    password: String,
    /// Datastore for VM disks and downloaded images.
    datastore: String,
    /// Session ticket obtained by [`Hypervisor::authenticate`].
    ticket: Arc<RwLock<Option<Ticket>>>,
}

impl Proxmox {
    /// Create a new Proxmox client.
    ///
    /// TLS verification is disabled; self-signed certificates are the norm
    /// on lab Proxmox hosts.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid URL or the HTTP
    /// client cannot be built.
    pub fn new(
        endpoint: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        datastore: impl Into<String>,
    ) -> Result<Self, HypervisorError> {
        let base = Url::parse(endpoint)
            .map_err(|e| HypervisorError::Config(format!("invalid endpoint {endpoint}: {e}")))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            base_url: base.as_str().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            datastore: datastore.into(),
            ticket: Arc::new(RwLock::new(None)),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api2/json{path}", self.base_url)
    }

    async fn session(&self) -> Result<Ticket, HypervisorError> {
        self.ticket
            .read()
            .await
            .clone()
            .ok_or_else(|| HypervisorError::Auth("not authenticated".to_string()))
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, HypervisorError> {
        let session = self.session().await?;
        let url = self.api_url(path);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .header("Cookie", format!("PVEAuthCookie={}", session.ticket))
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated, form-encoded POST request.
    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T, HypervisorError> {
        let session = self.session().await?;
        let url = self.api_url(path);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .header("Cookie", format!("PVEAuthCookie={}", session.ticket))
            .header("CSRFPreventionToken", &session.csrf_token)
            .form(form)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HypervisorError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HypervisorError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let body: ApiResponse<T> = response.json().await?;
        Ok(body.data)
    }

    /// Poll a task until it stops; error unless it exited `OK`.
    async fn wait_task(&self, host: &str, upid: &str) -> Result<(), HypervisorError> {
        loop {
            let status: TaskStatus = self
                .get(&format!("/nodes/{host}/tasks/{upid}/status"))
                .await?;
            if status.status == "stopped" {
                return match status.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    other => Err(HypervisorError::Task {
                        upid: upid.to_string(),
                        status: other.unwrap_or("unknown").to_string(),
                    }),
                };
            }
            tokio::time::sleep(Duration::from_secs(TASK_POLL_INTERVAL_SECS)).await;
        }
    }

    async fn next_vm_id(&self) -> Result<u32, HypervisorError> {
        let id: String = self.get("/cluster/nextid").await?;
        id.parse()
            .map_err(|e| HypervisorError::Config(format!("unparseable VM id {id}: {e}")))
    }

    /// Resolve the VM's address from the guest agent.
    ///
    /// Policy: the last non-empty IPv4 address on the last reported
    /// interface, polled until the agent reports one.
    async fn resolve_address(self, host: String, vmid: u32) -> Result<String, OutputError> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(AGENT_RESOLVE_TIMEOUT_SECS);
        let path = format!("/nodes/{host}/qemu/{vmid}/agent/network-get-interfaces");

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(OutputError::new(format!(
                    "guest agent on VM {vmid} reported no address within {AGENT_RESOLVE_TIMEOUT_SECS}s"
                )));
            }

            match self.get::<AgentInterfaces>(&path).await {
                Ok(interfaces) => {
                    if let Some(address) = last_reported_address(&interfaces) {
                        return Ok(address);
                    }
                    debug!(vmid, "guest agent has not reported an address yet");
                }
                // The agent endpoint errors until the guest is fully up.
                Err(e) => debug!(vmid, error = %e, "guest agent not reachable yet"),
            }

            tokio::time::sleep(Duration::from_secs(AGENT_POLL_INTERVAL_SECS)).await;
        }
    }
}

fn last_reported_address(interfaces: &AgentInterfaces) -> Option<String> {
    let last = interfaces.result.last()?;
    last.ip_addresses
        .iter()
        .rfind(|a| a.ip_address_type == "ipv4" && !a.ip_address.is_empty())
        .map(|a| a.ip_address.clone())
}

#[async_trait]
impl Hypervisor for Proxmox {
    async fn authenticate(&self) -> Result<(), HypervisorError> {
        let url = self.api_url("/access/ticket");
        debug!(url = %url, "authenticating");

        let response = self
            .client
            .post(&url)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let ticket: Ticket = Self::handle_response(response).await?;
        *self.ticket.write().await = Some(ticket);
        info!(endpoint = %self.base_url, "authenticated against Proxmox");
        Ok(())
    }

    async fn list_hosts(&self) -> Result<Vec<ComputeHost>, HypervisorError> {
        let entries: Vec<NodeEntry> = self.get("/nodes").await?;
        Ok(entries
            .into_iter()
            .map(|entry| ComputeHost {
                name: entry.node,
                online: entry.status == "online",
                cpu_count: entry.maxcpu,
                memory_available: entry.maxmem.saturating_sub(entry.mem),
            })
            .collect())
    }

    async fn download_image(
        &self,
        url: &str,
        host: &str,
        file_name: &str,
    ) -> Result<ImageRef, HypervisorError> {
        info!(host, file_name, "downloading image");
        let upid: String = self
            .post(
                &format!("/nodes/{host}/storage/{}/download-url", self.datastore),
                &[
                    ("content", "iso".to_string()),
                    ("filename", file_name.to_string()),
                    ("url", url.to_string()),
                ],
            )
            .await?;
        self.wait_task(host, &upid).await?;

        Ok(ImageRef {
            volume_id: format!("{}:iso/{file_name}", self.datastore),
            host: host.to_string(),
        })
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<VmHandle, HypervisorError> {
        let vmid = self.next_vm_id().await?;
        info!(name = %spec.name, host = %spec.host, vmid, "creating VM");

        let upid: String = self
            .post(
                &format!("/nodes/{}/qemu", spec.host),
                &[
                    ("vmid", vmid.to_string()),
                    ("name", spec.name.clone()),
                    ("machine", "q35".to_string()),
                    ("cores", spec.cores.to_string()),
                    ("sockets", "1".to_string()),
                    ("numa", "1".to_string()),
                    ("cpu", "x86-64-v2-AES".to_string()),
                    ("memory", spec.memory_mb.to_string()),
                    ("ostype", "l26".to_string()),
                    ("agent", "enabled=1".to_string()),
                    (
                        "virtio0",
                        format!("{}:{}", self.datastore, spec.disk_gb),
                    ),
                    ("ide3", format!("{},media=cdrom", spec.image.volume_id)),
                    ("boot", "order=virtio0;ide3".to_string()),
                    ("net0", format!("virtio,bridge={}", spec.network_bridge)),
                ],
            )
            .await?;
        self.wait_task(&spec.host, &upid).await?;

        let upid: String = self
            .post(
                &format!("/nodes/{}/qemu/{vmid}/status/start", spec.host),
                &[],
            )
            .await?;
        self.wait_task(&spec.host, &upid).await?;

        let poller = self.clone();
        let host = spec.host.clone();
        let address = Output::new(async move { poller.resolve_address(host, vmid).await });

        Ok(VmHandle {
            id: vmid,
            host: spec.host.clone(),
            address,
        })
    }
}
