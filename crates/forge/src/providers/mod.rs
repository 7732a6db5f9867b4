//! Virtualization provider abstractions.

pub mod proxmox;
mod traits;

pub use traits::{ComputeHost, Hypervisor, HypervisorError, ImageRef, VmHandle, VmSpec};
