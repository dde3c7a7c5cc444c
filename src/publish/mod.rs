//! Publishing stages for vsphere-publish.
//!
//! Converts the build output with ovftool, normalizes the `.vmx` descriptor,
//! uploads it to a datastore and turns it into a vCenter template, with an
//! optional OVA export handed to a repository command.

use std::path::Path;

pub mod converter;
pub mod descriptor;
pub mod hypervisor;
pub mod lifecycle;
pub mod pipeline;
pub mod repository;
pub mod upload;
pub mod vsphere;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Appended to the registered name to form the clone's name.
pub const CLONE_SUFFIX: &str = "-template";

/// Names derived from the descriptor for one run.
///
/// Everything is keyed off the descriptor's file stem; two runs with the
/// same stem and prefix target the same VMs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmNames {
    /// Descriptor file stem, e.g. `box` for `box.vmx`.
    pub base: String,
    /// Name given to the registered VM: `template_prefix + base`.
    pub registered: String,
    /// Name of the clone: `registered + CLONE_SUFFIX`.
    pub clone: String,
}

impl VmNames {
    pub fn from_descriptor(vmx: &Path, template_prefix: &str) -> Self {
        let base = vmx
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let registered = format!("{template_prefix}{base}");
        let clone = format!("{registered}{CLONE_SUFFIX}");
        Self {
            base,
            registered,
            clone,
        }
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use pipeline::Publisher;
