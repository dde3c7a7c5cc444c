//! Standard locations for vsphere-publish.
//!
//! - Config: `$XDG_CONFIG_HOME/vsphere-publish/` or `~/.config/vsphere-publish/`
//! - Logs:   `~/Library/Logs/vsphere-publish/` on macOS, otherwise
//!   `$XDG_DATA_HOME/vsphere-publish/logs/` or `~/.local/share/vsphere-publish/logs/`

use std::path::{Path, PathBuf};

const APP_NAME: &str = "vsphere-publish";

/// File name of the configuration inside [`PublishPaths::config`].
pub const CONFIG_FILE: &str = "publish.toml";

/// Resolved directories.
#[derive(Debug, Clone)]
pub struct PublishPaths {
    pub config: PathBuf,
    pub logs: PathBuf,
}

impl PublishPaths {
    /// Resolve from `$HOME` and the XDG variables. Creates nothing.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self {
            config: resolve_config_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    /// Default configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE)
    }
}

fn resolve_config_dir(home: &Path) -> PathBuf {
    match std::env::var("XDG_CONFIG_HOME") {
        Ok(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join(APP_NAME),
        _ => home.join(".config").join(APP_NAME),
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    match std::env::var("XDG_DATA_HOME") {
        Ok(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join(APP_NAME).join("logs"),
        _ => home.join(".local").join("share").join(APP_NAME).join("logs"),
    }
}
