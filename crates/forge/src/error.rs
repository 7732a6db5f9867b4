//! Error taxonomy for the deployment pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::image::ImageError;
use crate::machine::MachineError;
use crate::node::Role;
use crate::output::OutputError;
use crate::pipeline::DeployStage;
use crate::providers::HypervisorError;

/// Errors surfaced by the deployment pipeline and its components.
///
/// Every variant carries enough context to be logged on its own; the
/// [`DeployError::Stage`] wrapper adds the pipeline stage on top.
#[derive(Error, Debug)]
pub enum DeployError {
    /// Invalid cluster specification; surfaced before any resource creation.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Nothing to work with: no online compute hosts, no patch files.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Two patch documents are structurally incompatible.
    #[error("cannot merge patch documents at `{path}`: {detail}")]
    Merge { path: String, detail: String },

    /// Template rendering failed (syntax error or unresolved reference).
    #[error("template rendering failed: {0}")]
    Template(#[from] Box<handlebars::RenderError>),

    /// A YAML value has no JSON representation.
    #[error("cannot represent YAML value as JSON: {0}")]
    JsonIncompatible(String),

    /// VM creation or post-creation binding failed for a node.
    #[error("provisioning node {node} failed: {detail}")]
    Provisioning { node: String, detail: String },

    /// Bootstrap of the cluster's bootstrap node failed.
    #[error("bootstrap failed on {node}: {source}")]
    Bootstrap {
        node: String,
        #[source]
        source: MachineError,
    },

    /// Cluster health query failed.
    #[error("readiness check failed: {0}")]
    Readiness(String),

    /// Cluster secrets are generated exactly once per run.
    #[error("cluster secrets already generated")]
    SecretsAlreadyGenerated,

    /// The node generator has no handler for this role.
    #[error("cannot generate nodes for role {0}")]
    InvalidRole(Role),

    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("image service error: {0}")]
    Image(#[from] ImageError),

    #[error("machine service error: {0}")]
    Machine(#[from] MachineError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// A pipeline stage failed; wraps the underlying error with the stage.
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: DeployStage,
        #[source]
        source: Box<DeployError>,
    },
}

impl DeployError {
    /// Wrap this error with the pipeline stage it occurred in.
    #[must_use]
    pub fn in_stage(self, stage: DeployStage) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<handlebars::RenderError> for DeployError {
    fn from(err: handlebars::RenderError) -> Self {
        Self::Template(Box::new(err))
    }
}
