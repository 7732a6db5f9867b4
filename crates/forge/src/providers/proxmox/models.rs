//! Proxmox VE API wire types.

use serde::Deserialize;

/// Every Proxmox API response wraps its payload in a `data` field.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Session ticket returned by `/access/ticket`.
#[derive(Debug, Clone, Deserialize)]
pub struct Ticket {
    pub ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_token: String,
}

/// One entry from `/nodes`.
#[derive(Debug, Deserialize)]
pub struct NodeEntry {
    pub node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub maxcpu: u32,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
}

/// Status of a long-running task.
#[derive(Debug, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

/// Guest agent `network-get-interfaces` payload.
#[derive(Debug, Deserialize)]
pub struct AgentInterfaces {
    #[serde(default)]
    pub result: Vec<AgentInterface>,
}

/// One guest network interface.
#[derive(Debug, Deserialize)]
pub struct AgentInterface {
    #[allow(dead_code)]
    pub name: String,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<AgentIpAddress>,
}

/// One address reported on a guest interface.
#[derive(Debug, Deserialize)]
pub struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    #[serde(rename = "ip-address-type")]
    pub ip_address_type: String,
}
