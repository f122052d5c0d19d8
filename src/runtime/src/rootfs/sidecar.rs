//! Image config sidecar written into the rootfs.
//!
//! Whatever later runs the rootfs reads its entrypoint, command, working
//! directory and environment from this file instead of the OCI layout.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use boxroot_core::error::Result;

use crate::oci::OciImage;

/// File name of the sidecar, at the rootfs root.
pub const IMAGE_CONFIG_FILE: &str = ".image_config.json";

/// Write the image's (normalized) config document into `rootfs`.
pub fn write_image_config(image: &OciImage, rootfs: &Path) -> Result<PathBuf> {
    let path = rootfs.join(IMAGE_CONFIG_FILE);
    let content = serde_json::to_string_pretty(image.config_json())?;

    // A layer may have shipped a link or directory under this name. The
    // rename below replaces the entry itself instead of writing through it.
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path)?,
        Ok(meta) if !meta.is_file() => fs::remove_file(&path)?,
        _ => {}
    }
    let mut staged = tempfile::NamedTempFile::new_in(rootfs)?;
    staged.write_all(content.as_bytes())?;
    // Staged files are created 0600
    staged.as_file().set_permissions(fs::Permissions::from_mode(0o644))?;
    staged.persist(&path).map_err(|e| e.error)?;
    tracing::info!(path = %path.display(), "Image configuration saved");

    if let Some(cmd) = image.cmd() {
        tracing::info!(cmd = ?cmd, "Default command");
    }
    if let Some(entrypoint) = image.entrypoint() {
        tracing::info!(entrypoint = ?entrypoint, "Entrypoint");
    }
    if let Some(working_dir) = image.working_dir() {
        tracing::info!(working_dir, "Working directory");
    }
    if !image.env().is_empty() {
        tracing::info!(count = image.env().len(), "Environment variables");
    }

    Ok(path)
}

/// Read a sidecar back. `None` when the rootfs has none or the entry is not
/// a regular file.
pub fn read_image_config(rootfs: &Path) -> Result<Option<serde_json::Value>> {
    let path = rootfs.join(IMAGE_CONFIG_FILE);
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_file() => {}
        _ => return Ok(None),
    }
    let content = fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&content)?))
}
