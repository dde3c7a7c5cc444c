//! vsphere-publish: publish a built VM image as a vSphere template.
//!
//! ```text
//! vsphere-publish [--config publish.toml] publish --builder-id mitchellh.vmware out/box.vmx out/box-disk1.vmdk
//! vsphere-publish [--config publish.toml] check
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use vsphere_publish::artifact::Artifact;
use vsphere_publish::config::{ConfigError, ConfigErrors, PublishConfig, RawConfig};
use vsphere_publish::error::{PublishError, Stage, StageExt};
use vsphere_publish::logging;
use vsphere_publish::paths::PublishPaths;
use vsphere_publish::publish::Publisher;
use vsphere_publish::publish::converter::{SystemRunner, find_ovftool};
use vsphere_publish::publish::upload::HttpsUploader;
use vsphere_publish::publish::vsphere::VsphereClient;

/// Publish VM images to vSphere
#[derive(Parser, Debug)]
#[command(name = "vsphere-publish", version, about = "Publish VM images to vSphere")]
struct Args {
    /// Configuration file (default: ~/.config/vsphere-publish/publish.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one build artifact
    Publish {
        /// Id of the builder that produced the files
        #[arg(long)]
        builder_id: String,

        /// Files of the artifact (.ova, or .vmx with its disks)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print the published artifact as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and look for ovftool
    Check,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init();

    let config_path = match args.config {
        Some(path) => path,
        None => PublishPaths::resolve()
            .map(|p| p.config_file())
            .context("HOME is not set; pass --config")?,
    };
    let raw = RawConfig::load(&config_path)?;

    match args.command {
        Command::Check => check(raw, &config_path),
        Command::Publish {
            builder_id,
            files,
            json,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("create tokio runtime")?;
            runtime.block_on(publish(raw, Artifact::new(builder_id, files), json))
        }
    }
}

/// Report every configuration problem plus a missing ovftool.
fn check(raw: RawConfig, path: &std::path::Path) -> Result<()> {
    let mut problems: Vec<ConfigError> = Vec::new();
    if let Err(ConfigErrors(errs)) = PublishConfig::from_raw(raw) {
        problems.extend(errs);
    }
    match find_ovftool() {
        Ok(tool) => info!(ovftool = %tool.display(), "Found ovftool"),
        Err(e) => problems.push(e),
    }

    if problems.is_empty() {
        println!("{}: ok", path.display());
        return Ok(());
    }
    for problem in &problems {
        error!("{problem}");
    }
    bail!("{}", ConfigErrors(problems))
}

async fn publish(raw: RawConfig, artifact: Artifact, json: bool) -> Result<()> {
    let config = PublishConfig::from_raw(raw)
        .map_err(PublishError::from)
        .stage(Stage::Configure)?;
    // A .vmx published by upload never runs ovftool, so a missing tool only
    // fails the stages that need it.
    let runner = match find_ovftool() {
        Ok(ovftool) => {
            info!(ovftool = %ovftool.display(), "Using ovftool");
            SystemRunner::with_ovftool(ovftool)
        }
        Err(e) => {
            warn!("{e}");
            SystemRunner::default()
        }
    };
    let uploader = HttpsUploader::new()?;
    let hypervisor = VsphereClient::new(&config)?;

    let publisher = Publisher::new(&config, &runner, &uploader, &hypervisor);
    let published = publisher
        .run(&artifact)
        .await
        .with_context(|| format!("publish {}", artifact.builder_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&published)?);
    } else {
        println!("{published}");
    }
    Ok(())
}
