//! vsphere-publish: turn a built VM image into a vSphere template.
//!
//! The pipeline imports the build output with ovftool, normalizes the `.vmx`
//! descriptor, uploads it to a datastore and drives vCenter through
//! register, clone, power cycle and mark-as-template. An OVA export can be
//! handed to a repository command afterwards.

pub mod artifact;
pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod publish;
pub mod state_machine;

pub use artifact::{Artifact, PublishedArtifact};
pub use config::{PublishConfig, RawConfig};
pub use error::{PublishError, Stage, StageError};
pub use publish::Publisher;
