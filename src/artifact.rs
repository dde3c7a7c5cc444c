//! Build artifacts consumed and produced by the pipeline.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{PublishError, Result};

/// Builder id stamped on every [`PublishedArtifact`].
pub const BUILDER_ID: &str = "vsphere-publish.post-processor";

/// Upstream builders whose output this pipeline knows how to publish.
pub const KNOWN_BUILDERS: &[&str] = &[
    "mitchellh.virtualbox",
    "mitchellh.vmware",
    "mitchellh.vmware-esx",
    "packer.post-processor.artifice",
];

/// The result handed in by the upstream image builder.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub builder_id: String,
    pub files: Vec<PathBuf>,
}

/// The file the pipeline starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceImage {
    /// A single-file package that must be imported first.
    Ova(PathBuf),
    /// A descriptor that is already on disk next to its disks.
    Vmx(PathBuf),
}

impl SourceImage {
    pub fn path(&self) -> &Path {
        match self {
            SourceImage::Ova(p) | SourceImage::Vmx(p) => p,
        }
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

impl Artifact {
    pub fn new(builder_id: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            builder_id: builder_id.into(),
            files,
        }
    }

    /// Pick the file to publish. The first `.ova` wins, then the first
    /// `.vmx`.
    pub fn source_image(&self) -> Result<SourceImage> {
        if !KNOWN_BUILDERS.contains(&self.builder_id.as_str()) {
            return Err(PublishError::UnknownBuilder(self.builder_id.clone()));
        }

        if let Some(ova) = self.files.iter().find(|f| has_extension(f, "ova")) {
            return Ok(SourceImage::Ova(ova.clone()));
        }
        if let Some(vmx) = self.files.iter().find(|f| has_extension(f, "vmx")) {
            return Ok(SourceImage::Vmx(vmx.clone()));
        }
        Err(PublishError::NoUsableArtifact)
    }
}

/// What a successful run leaves behind.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedArtifact {
    pub builder_id: &'static str,
    /// Name of the template in vCenter, or of the exported package when no
    /// template was produced.
    pub name: String,
    /// Local files produced by the run (the exported OVA, if any).
    pub files: Vec<PathBuf>,
    pub published_at: DateTime<Utc>,
}

impl PublishedArtifact {
    pub fn new(name: String, files: Vec<PathBuf>) -> Self {
        Self {
            builder_id: BUILDER_ID,
            name,
            files,
            published_at: Utc::now(),
        }
    }
}

impl fmt::Display for PublishedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for file in &self.files {
            write!(f, " ({})", file.display())?;
        }
        Ok(())
    }
}
