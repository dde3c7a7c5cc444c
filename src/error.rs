//! Error types for the publishing pipeline.
//!
//! Library code returns [`PublishError`]; the pipeline wraps it in a
//! [`StageError`] naming the stage that failed. Only the binary converts to
//! `anyhow::Error`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigErrors;

pub type Result<T, E = PublishError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PublishError {
    /// Every configuration problem found, reported together.
    #[error(transparent)]
    Config(#[from] ConfigErrors),

    #[error("unknown artifact type, can't publish: {0}")]
    UnknownBuilder(String),

    #[error("no usable artifact found (expected a .ova or .vmx file)")]
    NoUsableArtifact,

    #[error("descriptor {} references no .vmdk disk", .0.display())]
    MissingDisks(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn `{program}` for {label}: {source}")]
    Spawn {
        program: String,
        label: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit from an external tool. `output` is the captured
    /// stdout and stderr.
    #[error("`{program}` failed (exit {code}) during {label}\noutput:\n{output}")]
    Process {
        program: String,
        label: String,
        code: i32,
        output: String,
    },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("management API {operation} returned HTTP {status}: {body}")]
    Api {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },

    #[error("remote task `{operation}` failed: {message}")]
    RemoteTask { operation: String, message: String },

    #[error("guest tools on `{vm}` not running after {waited:?}; the VM was powered off")]
    GuestToolsTimeout { vm: String, waited: Duration },
}

impl PublishError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.into(),
            source,
        }
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configure,
    Locate,
    Import,
    EditDescriptor,
    Upload,
    Lifecycle,
    DirectImport,
    Export,
    RepositoryUpload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configure => "configure",
            Stage::Locate => "locate artifact",
            Stage::Import => "import package",
            Stage::EditDescriptor => "edit descriptor",
            Stage::Upload => "datastore upload",
            Stage::Lifecycle => "template lifecycle",
            Stage::DirectImport => "direct import",
            Stage::Export => "export package",
            Stage::RepositoryUpload => "repository upload",
        };
        f.write_str(name)
    }
}

/// A pipeline failure tagged with the stage that produced it.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: PublishError,
}

impl StageError {
    pub fn new(stage: Stage, source: PublishError) -> Self {
        Self { stage, source }
    }
}

/// Attach a [`Stage`] to a library result.
pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T, StageError>;
}

impl<T> StageExt<T> for Result<T, PublishError> {
    fn stage(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|source| StageError::new(stage, source))
    }
}
