//! Publish configuration.
//!
//! The TOML file deserializes into [`RawConfig`], where every field is
//! optional. [`PublishConfig::from_raw`] turns it into an immutable, fully
//! resolved value or returns every problem it found at once.
//!
//! ```toml
//! datacenter = "dc1"
//! host = "vcenter.example.com"
//! username = "administrator@vsphere.local"
//! password = "secret"
//! datastore = "datastore1"
//! vm_folder = "templates"
//! disk_mode = "thin"
//! output = ["template", "ova"]
//!
//! [timeouts]
//! guest_tools_secs = 300
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Raw (file) form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub datacenter: Option<String>,
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub datastore: Option<String>,
    pub vm_folder: Option<String>,

    pub cluster: Option<String>,
    pub resource_pool: Option<String>,
    pub vm_network: Option<String>,
    pub disk_mode: Option<String>,
    pub hardware_version: Option<String>,
    pub guest_os_type: Option<String>,

    pub remove_floppy: bool,
    pub remove_ethernet: bool,
    pub remove_optical_drive: bool,
    pub clone_policy: Option<String>,

    pub insecure: bool,
    pub output: Option<Vec<String>>,
    pub import_mode: Option<String>,
    pub template_prefix: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub compression: Option<i64>,

    pub repository_command: Option<String>,
    pub repository_args: Option<String>,

    pub timeouts: RawTimeouts,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawTimeouts {
    pub guest_tools_secs: Option<u64>,
    pub guest_tools_poll_ms: Option<u64>,
    pub task_poll_ms: Option<u64>,
}

impl RawConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parse config {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Enumerated values
// ---------------------------------------------------------------------------

/// Virtual disk provisioning mode understood by `ovftool --diskMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskMode {
    Thick,
    Thin,
    MonolithicSparse,
    MonolithicFlat,
    TwoGbMaxExtentSparse,
    TwoGbMaxExtentFlat,
    SeSparse,
    EagerZeroedThick,
    Sparse,
    Flat,
}

impl DiskMode {
    pub const ALL: [DiskMode; 10] = [
        DiskMode::Thick,
        DiskMode::Thin,
        DiskMode::MonolithicSparse,
        DiskMode::MonolithicFlat,
        DiskMode::TwoGbMaxExtentSparse,
        DiskMode::TwoGbMaxExtentFlat,
        DiskMode::SeSparse,
        DiskMode::EagerZeroedThick,
        DiskMode::Sparse,
        DiskMode::Flat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DiskMode::Thick => "thick",
            DiskMode::Thin => "thin",
            DiskMode::MonolithicSparse => "monolithicSparse",
            DiskMode::MonolithicFlat => "monolithicFlat",
            DiskMode::TwoGbMaxExtentSparse => "twoGbMaxExtentSparse",
            DiskMode::TwoGbMaxExtentFlat => "twoGbMaxExtentFlat",
            DiskMode::SeSparse => "seSparse",
            DiskMode::EagerZeroedThick => "eagerZeroedThick",
            DiskMode::Sparse => "sparse",
            DiskMode::Flat => "flat",
        }
    }
}

impl fmt::Display for DiskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskMode {
    type Err = ConfigError;

    /// Exact, case-sensitive match against the ovftool spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiskMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidDiskMode(s.to_string()))
    }
}

/// Whether the registered VM is cloned and power-cycled before it becomes
/// the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClonePolicy {
    Always,
    Never,
    /// Clone unless every device-removal flag is set.
    #[default]
    CloneUnlessFullyStripped,
}

impl FromStr for ClonePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(ClonePolicy::Always),
            "never" => Ok(ClonePolicy::Never),
            "unless-fully-stripped" => Ok(ClonePolicy::CloneUnlessFullyStripped),
            other => Err(ConfigError::InvalidClonePolicy(other.to_string())),
        }
    }
}

/// How the descriptor reaches the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportMode {
    /// Upload to the datastore, then register through the management API.
    #[default]
    Upload,
    /// Let ovftool import straight into vCenter.
    Direct,
}

impl FromStr for ImportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(ImportMode::Upload),
            "direct" => Ok(ImportMode::Direct),
            other => Err(ConfigError::InvalidImportMode(other.to_string())),
        }
    }
}

/// Which artifacts a run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputMode {
    pub template: bool,
    pub ova: bool,
}

impl Default for OutputMode {
    fn default() -> Self {
        Self {
            template: true,
            ova: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("cluster must be set when import_mode is \"direct\"")]
    ClusterRequiredForDirect,
    #[error("invalid disk_mode {0:?}")]
    InvalidDiskMode(String),
    #[error("invalid clone_policy {0:?} (expected always, never or unless-fully-stripped)")]
    InvalidClonePolicy(String),
    #[error("invalid import_mode {0:?} (expected upload or direct)")]
    InvalidImportMode(String),
    #[error("invalid output {0:?} (expected template or ova)")]
    InvalidOutput(String),
    #[error("output must name at least one of template or ova")]
    EmptyOutput,
    #[error("compression must be between 0 and 9, got {0}")]
    CompressionOutOfRange(i64),
    #[error("hardware_version must be a positive integer, got {0:?}")]
    InvalidHardwareVersion(String),
    #[error("repository_args is set but repository_command is not")]
    RepositoryArgsWithoutCommand,
    #[error("{0}")]
    ToolNotFound(String),
}

/// Every problem found while validating a [`RawConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} configuration error(s):", self.0.len())?;
        for err in &self.0 {
            writeln!(f, "* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

// ---------------------------------------------------------------------------
// Validated form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub guest_tools: Duration,
    pub guest_tools_poll: Duration,
    pub task_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            guest_tools: Duration::from_secs(300),
            guest_tools_poll: Duration::from_millis(500),
            task_poll: Duration::from_millis(1000),
        }
    }
}

/// External command that receives the exported OVA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryUpload {
    pub command: String,
    pub args: String,
}

/// Device-removal flags applied to the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceRemoval {
    pub floppy: bool,
    pub ethernet: bool,
    pub optical_drive: bool,
}

impl DeviceRemoval {
    pub fn all(self) -> bool {
        self.floppy && self.ethernet && self.optical_drive
    }
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub datacenter: String,
    pub host: String,
    pub username: String,
    pub password: String,
    pub datastore: String,
    pub vm_folder: String,

    pub cluster: Option<String>,
    pub resource_pool: Option<String>,
    pub vm_network: Option<String>,
    pub disk_mode: Option<DiskMode>,
    pub hardware_version: Option<String>,
    pub guest_os_type: Option<String>,

    pub remove: DeviceRemoval,
    pub clone_policy: ClonePolicy,

    pub insecure: bool,
    pub output: OutputMode,
    pub import_mode: ImportMode,
    pub template_prefix: String,
    pub output_dir: Option<PathBuf>,
    pub compression: Option<u8>,
    pub repository: Option<RepositoryUpload>,
    pub timeouts: Timeouts,
}

/// Treat empty and whitespace-only strings as unset.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl PublishConfig {
    /// Validate `raw`. Never stops at the first problem.
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigErrors> {
        let mut errs = Vec::new();

        let mut required = |key: &'static str, value: Option<String>| -> String {
            match non_empty(value) {
                Some(v) => v,
                None => {
                    errs.push(ConfigError::Missing(key));
                    String::new()
                }
            }
        };

        let datacenter = required("datacenter", raw.datacenter);
        let host = required("host", raw.host);
        let username = required("username", raw.username);
        let password = required("password", raw.password);
        let datastore = required("datastore", raw.datastore);
        let vm_folder = required("vm_folder", raw.vm_folder);

        let cluster = non_empty(raw.cluster);

        let import_mode = match non_empty(raw.import_mode) {
            Some(s) => s.parse().unwrap_or_else(|e| {
                errs.push(e);
                ImportMode::default()
            }),
            None => ImportMode::default(),
        };
        if import_mode == ImportMode::Direct && cluster.is_none() {
            errs.push(ConfigError::ClusterRequiredForDirect);
        }

        let disk_mode = match non_empty(raw.disk_mode) {
            Some(s) => match s.parse::<DiskMode>() {
                Ok(mode) => Some(mode),
                Err(e) => {
                    errs.push(e);
                    None
                }
            },
            None => None,
        };

        let hardware_version = non_empty(raw.hardware_version);
        if let Some(v) = &hardware_version {
            if !matches!(v.parse::<u32>(), Ok(n) if n > 0) {
                errs.push(ConfigError::InvalidHardwareVersion(v.clone()));
            }
        }

        let clone_policy = match non_empty(raw.clone_policy) {
            Some(s) => s.parse().unwrap_or_else(|e| {
                errs.push(e);
                ClonePolicy::default()
            }),
            None => ClonePolicy::default(),
        };

        let output = match raw.output {
            Some(entries) => {
                let mut mode = OutputMode {
                    template: false,
                    ova: false,
                };
                for entry in &entries {
                    match entry.as_str() {
                        "template" => mode.template = true,
                        "ova" => mode.ova = true,
                        other => errs.push(ConfigError::InvalidOutput(other.to_string())),
                    }
                }
                if entries.is_empty() {
                    errs.push(ConfigError::EmptyOutput);
                }
                mode
            }
            None => OutputMode::default(),
        };

        let compression = match raw.compression {
            Some(level @ 0..=9) => Some(level as u8),
            Some(level) => {
                errs.push(ConfigError::CompressionOutOfRange(level));
                None
            }
            None => None,
        };

        let repository_args = non_empty(raw.repository_args);
        let repository = match non_empty(raw.repository_command) {
            Some(command) => Some(RepositoryUpload {
                command,
                args: repository_args.unwrap_or_default(),
            }),
            None => {
                if repository_args.is_some() {
                    errs.push(ConfigError::RepositoryArgsWithoutCommand);
                }
                None
            }
        };

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            guest_tools: raw
                .timeouts
                .guest_tools_secs
                .map_or(defaults.guest_tools, Duration::from_secs),
            guest_tools_poll: raw
                .timeouts
                .guest_tools_poll_ms
                .map_or(defaults.guest_tools_poll, Duration::from_millis),
            task_poll: raw
                .timeouts
                .task_poll_ms
                .map_or(defaults.task_poll, Duration::from_millis),
        };

        if !errs.is_empty() {
            return Err(ConfigErrors(errs));
        }

        Ok(Self {
            datacenter,
            host,
            username,
            password,
            datastore,
            vm_folder,
            cluster,
            resource_pool: non_empty(raw.resource_pool),
            vm_network: non_empty(raw.vm_network),
            disk_mode,
            hardware_version,
            guest_os_type: non_empty(raw.guest_os_type),
            remove: DeviceRemoval {
                floppy: raw.remove_floppy,
                ethernet: raw.remove_ethernet,
                optical_drive: raw.remove_optical_drive,
            },
            clone_policy,
            insecure: raw.insecure,
            output,
            import_mode,
            template_prefix: raw.template_prefix.unwrap_or_default(),
            output_dir: raw.output_dir,
            compression,
            repository,
            timeouts,
        })
    }

    /// Evaluate the clone policy against the device-removal flags.
    ///
    /// `CloneUnlessFullyStripped` clones whenever any removal flag is off.
    pub fn clone_required(&self) -> bool {
        match self.clone_policy {
            ClonePolicy::Always => true,
            ClonePolicy::Never => false,
            ClonePolicy::CloneUnlessFullyStripped => !self.remove.all(),
        }
    }

    /// Whether this run talks to the vCenter management API.
    pub fn needs_session(&self) -> bool {
        self.output.template && self.import_mode == ImportMode::Upload
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
