//! `.vmx` descriptor editing.
//!
//! The descriptor is a line-oriented `key = "value"` file. [`Descriptor`]
//! keeps every line in order: entries are parsed, anything else (blank lines,
//! comments) is carried verbatim. Entries nobody edited are written back as
//! they were read. Each public edit loads the file, applies one change and
//! rewrites the whole file atomically.
//!
//! ```text
//! .encoding = "UTF-8"
//! virtualhw.version = "10"
//! floppy0.present = "TRUE"
//! floppy0.fileName = "/dev/fd0"
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{PublishError, Result};

/// Value written to `{prefix}present` when a device is removed.
pub const INACTIVE: &str = "FALSE";

pub const HARDWARE_VERSION_KEY: &str = "virtualhw.version";
pub const GUEST_OS_KEY: &str = "guestos";

pub const FLOPPY_PREFIX: &str = "floppy0.";
pub const ETHERNET_PREFIX: &str = "ethernet0.";
pub const OPTICAL_DRIVE_PREFIX: &str = "ide1:0.";

/// What to do when a scalar key is not in the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingKey {
    Append,
    Ignore,
}

/// Result of a scalar edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Updated,
    Appended,
    /// The key was absent and the policy was [`MissingKey::Ignore`].
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry {
        key: String,
        value: String,
        /// Text as read; `None` once the entry is edited or when it is new.
        text: Option<String>,
    },
    Raw(String),
}

impl Line {
    fn entry(key: impl Into<String>, value: impl Into<String>) -> Self {
        Line::Entry {
            key: key.into(),
            value: value.into(),
            text: None,
        }
    }
}

/// In-memory form of a descriptor file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descriptor {
    lines: Vec<Line>,
}

fn parse_line(line: &str) -> Line {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Raw(line.to_string());
    }
    match trimmed.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Line::Entry {
                key: key.trim().to_string(),
                value: value.to_string(),
                text: Some(line.to_string()),
            }
        }
        _ => Line::Raw(line.to_string()),
    }
}

impl Descriptor {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(parse_line).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PublishError::io(format!("read descriptor {}", path.display()), e))?;
        Ok(Self::parse(&content))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry {
                    text: Some(text), ..
                } => out.push_str(text),
                Line::Entry { key, value, .. } => {
                    out.push_str(key);
                    out.push_str(" = \"");
                    out.push_str(value);
                    out.push('"');
                }
                Line::Raw(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }

    /// Replace `path` with the rendered descriptor.
    ///
    /// The content goes to a temporary file in the same directory which is
    /// then renamed over `path`, so readers see either the old or the new
    /// file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let context = || format!("write descriptor {}", path.display());

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| PublishError::io(context(), e))?;
        tmp.write_all(self.render().as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| PublishError::io(context(), e))?;
        tmp.persist(path)
            .map_err(|e| PublishError::io(context(), e.error))?;
        Ok(())
    }

    /// Value of the first entry whose key equals `key`, ignoring ASCII case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Entry { key: k, value, .. } if k.eq_ignore_ascii_case(key) => {
                Some(value.as_str())
            }
            _ => None,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|line| match line {
            Line::Entry { key, value, .. } => Some((key.as_str(), value.as_str())),
            Line::Raw(_) => None,
        })
    }

    /// Overwrite every entry matching `key` in place; otherwise apply
    /// `policy`.
    pub fn set(&mut self, key: &str, value: &str, policy: MissingKey) -> SetOutcome {
        let mut found = false;
        for line in &mut self.lines {
            if let Line::Entry {
                key: k,
                value: v,
                text,
            } = line
            {
                if k.eq_ignore_ascii_case(key) {
                    *v = value.to_string();
                    *text = None;
                    found = true;
                }
            }
        }
        if found {
            return SetOutcome::Updated;
        }
        match policy {
            MissingKey::Append => {
                self.lines.push(Line::entry(key, value));
                SetOutcome::Appended
            }
            MissingKey::Ignore => SetOutcome::Unchanged,
        }
    }

    /// Drop every entry under `prefix` and mark the device inactive.
    ///
    /// Returns how many entries were removed.
    pub fn remove_device(&mut self, prefix: &str) -> usize {
        let before = self.lines.len();
        self.lines.retain(|line| match line {
            Line::Entry { key, .. } => !key.starts_with(prefix),
            Line::Raw(_) => true,
        });
        let removed = before - self.lines.len();
        self.lines.push(Line::entry(format!("{prefix}present"), INACTIVE));
        removed
    }

    /// Disk images referenced through `*.fileName` entries.
    pub fn disk_file_names(&self) -> Vec<String> {
        self.entries()
            .filter(|(key, value)| {
                key.to_ascii_lowercase().ends_with(".filename")
                    && value.to_ascii_lowercase().ends_with(".vmdk")
            })
            .map(|(_, value)| value.to_string())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// File-level edits
// ---------------------------------------------------------------------------

/// Remove a device from the descriptor at `path`.
pub fn remove_device(path: &Path, prefix: &str) -> Result<()> {
    let mut descriptor = Descriptor::load(path)?;
    let removed = descriptor.remove_device(prefix);
    descriptor.save(path)?;
    info!(descriptor = %path.display(), prefix, removed, "Removed device");
    Ok(())
}

/// Set the virtual hardware version. A descriptor without a version line is
/// left untouched.
pub fn set_hardware_version(path: &Path, version: &str) -> Result<SetOutcome> {
    set_scalar(path, HARDWARE_VERSION_KEY, version, MissingKey::Ignore)
}

/// Set the guest OS identifier, appending the line if needed.
pub fn set_guest_os(path: &Path, guest_os: &str) -> Result<SetOutcome> {
    set_scalar(path, GUEST_OS_KEY, guest_os, MissingKey::Append)
}

fn set_scalar(path: &Path, key: &str, value: &str, policy: MissingKey) -> Result<SetOutcome> {
    let mut descriptor = Descriptor::load(path)?;
    let outcome = descriptor.set(key, value, policy);
    if outcome == SetOutcome::Unchanged {
        debug!(descriptor = %path.display(), key, "Key absent, descriptor left as is");
        return Ok(outcome);
    }
    descriptor.save(path)?;
    info!(descriptor = %path.display(), key, value, ?outcome, "Descriptor updated");
    Ok(outcome)
}

/// Disk files referenced by the descriptor, resolved against its directory.
pub fn disk_files(path: &Path) -> Result<Vec<PathBuf>> {
    let descriptor = Descriptor::load(path)?;
    let dir = path.parent().unwrap_or(Path::new(""));
    let disks: Vec<PathBuf> = descriptor
        .disk_file_names()
        .into_iter()
        .map(|name| dir.join(name))
        .collect();
    if disks.is_empty() {
        return Err(PublishError::MissingDisks(path.to_path_buf()));
    }
    Ok(disks)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
