//! Talos Kubernetes cluster deployment on Proxmox VE.
//!
//! `forge` declares a cluster (node counts, VM sizing, versions), builds a
//! Talos installer image with the requested system extensions, provisions
//! one VM per node across the Proxmox hosts, applies merged and rendered
//! machine-configuration patches, bootstraps consensus and exports the
//! cluster credentials.
//!
//! The [`pipeline::Pipeline`] is the entry point; it runs a fixed stage
//! sequence over three swappable collaborators: a
//! [`providers::Hypervisor`], an [`image::ImageService`] and a
//! [`machine::MachineService`].

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod error;
pub mod image;
pub mod machine;
pub mod node;
pub mod output;
pub mod patch;
pub mod persist;
pub mod pipeline;
pub mod providers;
pub mod settings;

pub use cluster::Cluster;
pub use error::DeployError;
pub use node::{Node, Role};
pub use output::Output;
pub use pipeline::{DeployOutputs, DeployStage, Pipeline};
pub use settings::Settings;
