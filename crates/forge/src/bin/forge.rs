//! Forge CLI - Talos cluster deployment on Proxmox VE.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use forge::image::ImageFactory;
use forge::machine::Talosctl;
use forge::providers::proxmox::Proxmox;
use forge::providers::Hypervisor;
use forge::{Pipeline, Settings};

/// Forge CLI - deploy Talos Kubernetes clusters on Proxmox VE.
#[derive(Parser)]
#[command(name = "forge")]
#[command(about = "Deploy Talos Kubernetes clusters on Proxmox VE")]
struct Cli {
    /// Proxmox API endpoint (or set `PROXMOX_ENDPOINT` env var).
    #[arg(long, env = "PROXMOX_ENDPOINT")]
    endpoint: String,

    /// Proxmox user, e.g. root@pam (or set `PROXMOX_USERNAME` env var).
    #[arg(long, env = "PROXMOX_USERNAME")]
    username: String,

    /// Proxmox password (or set `PROXMOX_PASSWORD` env var).
    #[arg(long, env = "PROXMOX_PASSWORD")]
    password: String,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the deployment settings and the Proxmox connection.
    Validate {
        /// Settings file (TOML); defaults apply for missing keys.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Deploy a cluster: image build, VMs, configuration, bootstrap,
    /// credential export.
    Deploy {
        /// Settings file (TOML); defaults apply for missing keys.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Scratch directory for generated configs.
        #[arg(long, default_value = "/tmp/forge")]
        work_dir: PathBuf,
    },
}

fn load_settings(config: Option<&PathBuf>) -> Result<Settings> {
    match config {
        Some(path) => {
            Settings::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(Settings::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { config } => {
            let settings = load_settings(config.as_ref())?;
            settings.validate()?;

            let proxmox = Proxmox::new(
                &cli.endpoint,
                &cli.username,
                &cli.password,
                &settings.datastore,
            )
            .context("Failed to create Proxmox client")?;
            proxmox.authenticate().await?;
            let hosts = proxmox.list_hosts().await?;
            let online = hosts.iter().filter(|h| h.online).count();
            info!(
                cluster = %settings.cluster_name,
                hosts = hosts.len(),
                online,
                "settings and connection OK"
            );
            Ok(())
        }

        Commands::Deploy { config, work_dir } => {
            let settings = load_settings(config.as_ref())?;

            let proxmox = Proxmox::new(
                &cli.endpoint,
                &cli.username,
                &cli.password,
                &settings.datastore,
            )
            .context("Failed to create Proxmox client")?;
            let factory = ImageFactory::new().context("Failed to create image factory client")?;
            let talosctl = Talosctl::new(work_dir);
            talosctl.check().await.context("talosctl not usable")?;

            let mut pipeline = Pipeline::new(
                settings,
                Arc::new(proxmox),
                Arc::new(factory),
                Arc::new(talosctl),
            )?;
            let outputs = pipeline.execute().await?;

            println!(
                "cluster ready; kubeconfig written to {}",
                outputs.kubeconfig_path.display()
            );
            Ok(())
        }
    }
}
