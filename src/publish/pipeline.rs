//! The publishing pipeline.
//!
//! ```text
//! Locate ─► Import (ova only) ─► EditDescriptor ─┬─► Upload ─► Lifecycle   (template, upload mode)
//!                                                └─► DirectImport          (template, direct mode)
//!                                 ─► Export ─► RepositoryUpload            (ova output)
//! ```
//!
//! Stages run strictly in order and the first failure ends the run. Nothing
//! done remotely before the failure is undone.

use std::path::{Path, PathBuf};

use tracing::{info, info_span, Instrument};

use crate::artifact::{Artifact, PublishedArtifact, SourceImage};
use crate::config::{ImportMode, PublishConfig};
use crate::error::{Result, Stage, StageError, StageExt};
use crate::publish::converter::{self, ToolRunner};
use crate::publish::descriptor::{self, FLOPPY_PREFIX, ETHERNET_PREFIX, OPTICAL_DRIVE_PREFIX};
use crate::publish::hypervisor::Hypervisor;
use crate::publish::lifecycle::{self, TemplateOutcome};
use crate::publish::upload::{self, DatastoreUploader};
use crate::publish::{VmNames, repository};

/// Runs one artifact through every configured stage.
///
/// The collaborators are borrowed so tests can pass fakes.
pub struct Publisher<'a> {
    pub config: &'a PublishConfig,
    pub runner: &'a dyn ToolRunner,
    pub uploader: &'a dyn DatastoreUploader,
    pub hypervisor: &'a dyn Hypervisor,
}

impl<'a> Publisher<'a> {
    pub fn new(
        config: &'a PublishConfig,
        runner: &'a dyn ToolRunner,
        uploader: &'a dyn DatastoreUploader,
        hypervisor: &'a dyn Hypervisor,
    ) -> Self {
        Self {
            config,
            runner,
            uploader,
            hypervisor,
        }
    }

    pub async fn run(&self, artifact: &Artifact) -> Result<PublishedArtifact, StageError> {
        let source = step(Stage::Locate, async { artifact.source_image() }).await?;
        info!(source = %source.path().display(), "Located source image");

        let vmx = match source {
            SourceImage::Ova(ova) => {
                step(Stage::Import, converter::import(self.runner, self.config, &ova)).await?
            }
            SourceImage::Vmx(vmx) => vmx,
        };

        step(Stage::EditDescriptor, self.edit_descriptor(&vmx)).await?;

        let names = VmNames::from_descriptor(&vmx, &self.config.template_prefix);
        let mut published_name = None;

        if self.config.output.template {
            match self.config.import_mode {
                ImportMode::Upload => {
                    step(Stage::Upload, self.upload(&vmx)).await?;
                    let outcome = step(Stage::Lifecycle, self.lifecycle(&vmx, &names)).await?;
                    published_name = Some(outcome.template_name);
                }
                ImportMode::Direct => {
                    step(
                        Stage::DirectImport,
                        converter::direct_import(self.runner, self.config, &vmx, &names.registered),
                    )
                    .await?;
                    published_name = Some(names.registered.clone());
                }
            }
        }

        let mut files = Vec::new();
        if self.config.output.ova {
            let ova = step(Stage::Export, converter::export(self.runner, self.config, &vmx)).await?;
            if let Some(repo) = &self.config.repository {
                step(
                    Stage::RepositoryUpload,
                    async { repository::upload(self.runner, repo, &ova).await.map(drop) },
                )
                .await?;
            }
            files.push(ova);
        }

        let name = published_name.unwrap_or_else(|| package_name(&files, &names));
        let published = PublishedArtifact::new(name, files);
        info!(artifact = %published, "Published");
        Ok(published)
    }

    /// Apply the configured descriptor edits, one load-edit-save cycle each.
    async fn edit_descriptor(&self, vmx: &Path) -> Result<()> {
        let remove = self.config.remove;
        let devices = [
            (remove.floppy, FLOPPY_PREFIX),
            (remove.ethernet, ETHERNET_PREFIX),
            (remove.optical_drive, OPTICAL_DRIVE_PREFIX),
        ];
        for (_, prefix) in devices.into_iter().filter(|(flag, _)| *flag) {
            descriptor::remove_device(vmx, prefix)?;
        }
        if let Some(version) = &self.config.hardware_version {
            descriptor::set_hardware_version(vmx, version)?;
        }
        if let Some(guest_os) = &self.config.guest_os_type {
            descriptor::set_guest_os(vmx, guest_os)?;
        }
        Ok(())
    }

    /// Push every referenced disk, then the descriptor.
    async fn upload(&self, vmx: &Path) -> Result<()> {
        let mut files: Vec<PathBuf> = descriptor::disk_files(vmx)?;
        files.push(vmx.to_path_buf());
        for file in &files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let url = upload::datastore_url(self.config, &name)?;
            let report = |sent: u64, total: u64| {
                info!(file = %name, sent, total, "Upload progress");
            };
            self.uploader.upload(&url, file, &report).await?;
        }
        Ok(())
    }

    async fn lifecycle(&self, vmx: &Path, names: &VmNames) -> Result<TemplateOutcome> {
        let path = lifecycle::datastore_path(self.config, vmx);
        lifecycle::run_lifecycle(self.hypervisor, self.config, names, &path).await
    }
}

/// Run one stage with start and completion logs, tagging any error.
async fn step<T>(
    stage: Stage,
    work: impl std::future::Future<Output = Result<T>>,
) -> Result<T, StageError> {
    let span = info_span!("stage", stage = %stage);
    async {
        info!("Starting");
        let value = work.await.stage(stage)?;
        info!("Completed");
        Ok(value)
    }
    .instrument(span)
    .await
}

fn package_name(files: &[PathBuf], names: &VmNames) -> String {
    files
        .first()
        .and_then(|f| f.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| names.registered.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
