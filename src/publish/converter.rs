//! ovftool invocation.
//!
//! Argument lists are built by pure functions so they can be checked without
//! the tool installed; execution goes through a [`ToolRunner`].
//!
//! ## External Requirements
//!
//! - `ovftool`: must be on `$PATH` or in one of [`OVFTOOL_CANDIDATES`].
//!
//! ```text
//! import:  ovftool --acceptAllEulas --lax [--network=N] [--diskMode=M] box.ova box.vmx
//! export:  ovftool --acceptAllEulas --targetType=OVA [--diskMode=M] [--compress=L] box.vmx out/box.ova
//! direct:  ovftool --acceptAllEulas [--noSSLVerify] --name=box --datastore=ds ... box.vmx vi://u:p@host/dc/host/cluster
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

use crate::config::{ConfigError, DiskMode, PublishConfig};
use crate::error::{PublishError, Result};

pub const OVFTOOL: &str = "ovftool";

/// Install locations checked after `$PATH`.
pub const OVFTOOL_CANDIDATES: &[&str] = &[
    "/usr/bin/ovftool",
    "/usr/local/bin/ovftool",
    "/Applications/VMware OVF Tool/ovftool",
    "/Applications/VMware Fusion.app/Contents/Library/VMware OVF Tool/ovftool",
];

// ---------------------------------------------------------------------------
// Running external tools
// ---------------------------------------------------------------------------

/// Runs one external command to completion and returns its combined output.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], label: &str) -> Result<String>;
}

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    /// Resolved `ovftool` binary, used in place of a `$PATH` lookup.
    ovftool: Option<PathBuf>,
}

impl SystemRunner {
    pub fn with_ovftool(path: PathBuf) -> Self {
        Self {
            ovftool: Some(path),
        }
    }

    fn resolve<'a>(&'a self, program: &'a str) -> &'a std::ffi::OsStr {
        match &self.ovftool {
            Some(path) if program == OVFTOOL => path.as_os_str(),
            _ => program.as_ref(),
        }
    }
}

#[async_trait]
impl ToolRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String], label: &str) -> Result<String> {
        debug!(program, ?args, label, "Spawning");
        let output = Command::new(self.resolve(program))
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| PublishError::Spawn {
                program: program.to_string(),
                label: label.to_string(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(PublishError::Process {
                program: program.to_string(),
                label: label.to_string(),
                code: output.status.code().unwrap_or(-1),
                output: combined,
            })
        }
    }
}

/// Resolve the path to the `ovftool` binary.
pub fn find_ovftool() -> std::result::Result<PathBuf, ConfigError> {
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(OVFTOOL);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    OVFTOOL_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .ok_or_else(|| {
            ConfigError::ToolNotFound(
                "ovftool not found on PATH. Install the VMware OVF Tool \
                 or add its directory to PATH."
                    .to_string(),
            )
        })
}

// ---------------------------------------------------------------------------
// Argument builders
// ---------------------------------------------------------------------------

fn disk_mode_arg(mode: Option<DiskMode>) -> Option<String> {
    mode.map(|m| format!("--diskMode={m}"))
}

/// Descriptor path ovftool writes when importing `ova`.
pub fn imported_descriptor_path(ova: &Path) -> PathBuf {
    ova.with_extension("vmx")
}

/// Package path for exporting `vmx` into `output_dir` (or next to it).
pub fn exported_package_path(vmx: &Path, output_dir: Option<&Path>) -> PathBuf {
    let file = vmx.with_extension("ova");
    match (output_dir, file.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => file,
    }
}

/// package -> descriptor + disks.
pub fn build_import_args(config: &PublishConfig, ova: &Path, vmx: &Path) -> Vec<String> {
    let mut args = vec!["--acceptAllEulas".to_string(), "--lax".to_string()];
    if let Some(net) = &config.vm_network {
        args.push(format!("--network={net}"));
    }
    args.extend(disk_mode_arg(config.disk_mode));
    args.push(ova.display().to_string());
    args.push(vmx.display().to_string());
    args
}

/// descriptor -> package.
pub fn build_export_args(config: &PublishConfig, vmx: &Path, ova: &Path) -> Vec<String> {
    let mut args = vec![
        "--acceptAllEulas".to_string(),
        "--targetType=OVA".to_string(),
    ];
    args.extend(disk_mode_arg(config.disk_mode));
    if let Some(level) = config.compression {
        args.push(format!("--compress={level}"));
    }
    args.push(vmx.display().to_string());
    args.push(ova.display().to_string());
    args
}

/// `vi://` locator for a direct import into a cluster or resource pool.
pub fn direct_import_target(config: &PublishConfig) -> Result<Url> {
    let mut url =
        Url::parse("vi://placeholder/").map_err(|e| PublishError::InvalidUrl(e.to_string()))?;
    let invalid = |what: &str| PublishError::InvalidUrl(format!("vi:// locator: invalid {what}"));

    url.set_host(Some(&config.host)).map_err(|_| invalid("host"))?;
    url.set_username(&config.username)
        .map_err(|_| invalid("username"))?;
    url.set_password(Some(&config.password))
        .map_err(|_| invalid("password"))?;
    {
        let mut segments = url.path_segments_mut().map_err(|_| invalid("path"))?;
        segments.clear();
        segments.push(&config.datacenter).push("host");
        if let Some(cluster) = &config.cluster {
            segments.push(cluster);
        }
        if let Some(pool) = &config.resource_pool {
            segments.push("Resources").push(pool);
        }
    }
    Ok(url)
}

/// descriptor -> remote vCenter, bypassing datastore upload and registration.
pub fn build_direct_import_args(
    config: &PublishConfig,
    vmx: &Path,
    name: &str,
    target: &Url,
) -> Vec<String> {
    let mut args = vec!["--acceptAllEulas".to_string()];
    if config.insecure {
        args.push("--noSSLVerify".to_string());
    }
    args.push(format!("--name={name}"));
    args.push(format!("--datastore={}", config.datastore));
    if let Some(net) = &config.vm_network {
        args.push(format!("--network={net}"));
    }
    args.extend(disk_mode_arg(config.disk_mode));
    args.push(format!("--vmFolder={}", config.vm_folder));
    args.push(vmx.display().to_string());
    args.push(target.to_string());
    args
}

// ---------------------------------------------------------------------------
// Invocations
// ---------------------------------------------------------------------------

/// Import `ova` and return the path of the produced descriptor.
pub async fn import(runner: &dyn ToolRunner, config: &PublishConfig, ova: &Path) -> Result<PathBuf> {
    let vmx = imported_descriptor_path(ova);
    let args = build_import_args(config, ova, &vmx);
    let output = runner
        .run(OVFTOOL, &args, &format!("import {}", ova.display()))
        .await?;
    info!(target: "ovftool", source = %ova.display(), descriptor = %vmx.display(), "{}", output.trim());
    Ok(vmx)
}

/// Export `vmx` to an OVA package and return its path.
pub async fn export(runner: &dyn ToolRunner, config: &PublishConfig, vmx: &Path) -> Result<PathBuf> {
    let ova = exported_package_path(vmx, config.output_dir.as_deref());
    if let Some(dir) = ova.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PublishError::io(format!("create output dir {}", dir.display()), e))?;
    }
    let args = build_export_args(config, vmx, &ova);
    let output = runner
        .run(OVFTOOL, &args, &format!("export {}", vmx.display()))
        .await?;
    info!(target: "ovftool", package = %ova.display(), "{}", output.trim());
    Ok(ova)
}

/// Import `vmx` straight into vCenter as `name`.
pub async fn direct_import(
    runner: &dyn ToolRunner,
    config: &PublishConfig,
    vmx: &Path,
    name: &str,
) -> Result<()> {
    let target = direct_import_target(config)?;
    let args = build_direct_import_args(config, vmx, name, &target);
    let output = runner
        .run(OVFTOOL, &args, &format!("direct import of {name}"))
        .await?;
    info!(target: "ovftool", vm = name, "{}", output.trim());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
