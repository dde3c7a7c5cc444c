//! Hands the exported package to an external repository command.

use std::path::Path;

use tracing::info;

use crate::config::RepositoryUpload;
use crate::error::Result;
use crate::publish::converter::ToolRunner;

/// Arguments for the repository command: the configured arguments split on
/// whitespace, followed by the package path.
pub fn build_args(repository: &RepositoryUpload, package: &Path) -> Vec<String> {
    repository
        .args
        .split_whitespace()
        .map(str::to_owned)
        .chain(std::iter::once(package.display().to_string()))
        .collect()
}

/// Run the repository command on `package`. Returns the captured output.
pub async fn upload(
    runner: &dyn ToolRunner,
    repository: &RepositoryUpload,
    package: &Path,
) -> Result<String> {
    let args = build_args(repository, package);
    let output = runner
        .run(
            &repository.command,
            &args,
            &format!("repository upload of {}", package.display()),
        )
        .await?;
    info!(
        target: "repository",
        command = %repository.command,
        package = %package.display(),
        "{}",
        output.trim()
    );
    Ok(output)
}
