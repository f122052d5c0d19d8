//! Packing a rootfs directory into a gzip tarball.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use boxroot_core::error::{BoxError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

/// Pack `rootfs` into `output` as `tar.gz`, member names relative to the rootfs.
///
/// Symlinks are stored as links. The archive is written next to `output`
/// and renamed into place once complete. Returns the archive size.
pub fn create_rootfs_archive(rootfs: &Path, output: &Path) -> Result<u64> {
    if !rootfs.is_dir() {
        return Err(BoxError::Other(format!(
            "Rootfs directory {} does not exist",
            rootfs.display()
        )));
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let partial = output.with_extension("partial");
    let result = write_archive(rootfs, &partial);
    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, output)?;

    let size = fs::metadata(output)?.len();
    tracing::info!(
        rootfs = %rootfs.display(),
        archive = %output.display(),
        size_mb = %format!("{:.2}", size as f64 / 1024.0 / 1024.0),
        "Root filesystem archive created"
    );
    Ok(size)
}

fn write_archive(rootfs: &Path, destination: &Path) -> Result<()> {
    let file = BufWriter::new(File::create(destination)?);
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", rootfs).map_err(|e| {
        BoxError::Other(format!("Failed to archive {}: {}", rootfs.display(), e))
    })?;
    let encoder = builder.into_inner()?;
    encoder.finish()?.flush()?;
    Ok(())
}
