//! Sandbox scaffold inside a materialized rootfs.
//!
//! A user-space sandbox binds `/proc`, `/sys` and `/dev` over the rootfs and
//! expects a few writable directories to exist. Device nodes cannot be
//! created without privileges, so `/dev` gets empty placeholder files that
//! the sandbox binds over.

use std::fs;
use std::path::{Path, PathBuf};

use boxroot_core::error::{BoxError, Result};

/// Directories and device placeholders a sandbox expects.
#[derive(Debug, Clone)]
pub struct SandboxLayout {
    /// Directories, relative to the rootfs
    pub dirs: Vec<&'static str>,

    /// Placeholder files under `dev/`
    pub devices: Vec<&'static str>,
}

impl Default for SandboxLayout {
    fn default() -> Self {
        Self {
            dirs: vec![
                "proc", "sys", "dev", "tmp", "run", "var/tmp", "var/log", "var/run",
            ],
            devices: vec!["null", "zero", "random", "urandom"],
        }
    }
}

/// Ensures the [`SandboxLayout`] inside a rootfs.
pub struct RootfsScaffold {
    rootfs_path: PathBuf,
    layout: SandboxLayout,
}

impl RootfsScaffold {
    pub fn new(rootfs_path: impl Into<PathBuf>) -> Self {
        Self {
            rootfs_path: rootfs_path.into(),
            layout: SandboxLayout::default(),
        }
    }

    /// Set a custom layout.
    pub fn with_layout(mut self, layout: SandboxLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Create missing directories and placeholders. Existing content is kept.
    pub fn build(&self) -> Result<()> {
        if !self.rootfs_path.is_dir() {
            return Err(BoxError::Other(format!(
                "Rootfs directory {} does not exist",
                self.rootfs_path.display()
            )));
        }
        tracing::info!(rootfs = %self.rootfs_path.display(), "Preparing sandbox scaffold");

        for dir in &self.layout.dirs {
            self.ensure_dir(dir);
        }
        self.create_device_placeholders();
        Ok(())
    }

    /// A regular file in the way of a directory is replaced. Failures are
    /// logged; the sandbox can still start without most of these.
    fn ensure_dir(&self, relative: &str) {
        if has_symlinked_parent(&self.rootfs_path, relative) {
            tracing::debug!(dir = relative, "Parent is a symlink, leaving as is");
            return;
        }
        let full_path = self.rootfs_path.join(relative);
        match fs::symlink_metadata(&full_path) {
            Ok(meta) if meta.is_dir() => return,
            // `var/run -> /run` and friends resolve once the sandbox is up
            Ok(meta) if meta.file_type().is_symlink() => return,
            Ok(_) => {
                if let Err(e) = fs::remove_file(&full_path) {
                    tracing::warn!(dir = relative, error = %e, "Unable to replace file with directory");
                    return;
                }
                tracing::debug!(dir = relative, "Replacing file with directory");
            }
            Err(_) => {}
        }
        match create_dir_within(&self.rootfs_path, relative) {
            Ok(()) => tracing::debug!(dir = relative, "Ensured directory"),
            Err(e) => tracing::warn!(dir = relative, error = %e, "Unable to create directory"),
        }
    }

    fn create_device_placeholders(&self) {
        let dev_dir = self.rootfs_path.join("dev");
        match fs::symlink_metadata(&dev_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() => {
                tracing::warn!(dev = %dev_dir.display(), "dev is a symlink, skipping device placeholders");
                return;
            }
            _ => return,
        }
        for device in &self.layout.devices {
            let path = dev_dir.join(device);
            if fs::symlink_metadata(&path).is_ok() {
                continue;
            }
            // create_new never follows an existing symlink
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => tracing::debug!(device = *device, "Created device placeholder"),
                Err(e) => {
                    tracing::debug!(device = *device, error = %e, "Unable to create device placeholder")
                }
            }
        }
    }
}

fn has_symlinked_parent(root: &Path, relative: &str) -> bool {
    let parts: Vec<&str> = relative.split('/').filter(|p| !p.is_empty()).collect();
    let mut current = root.to_path_buf();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        current.push(part);
        if fs::symlink_metadata(&current)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
        {
            return true;
        }
    }
    false
}

/// `create_dir_all` that refuses to walk through symlinked parents, which
/// could point anywhere on the host.
fn create_dir_within(root: &Path, relative: &str) -> std::io::Result<()> {
    let mut current = root.to_path_buf();
    for part in relative.split('/').filter(|p| !p.is_empty()) {
        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} is not a directory", current.display()),
                ))
            }
            Err(_) => fs::create_dir(&current)?,
        }
    }
    Ok(())
}
