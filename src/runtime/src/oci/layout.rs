//! OCI image layout assembly.
//!
//! Writes `oci-layout`, `index.json` and `blobs/sha256/<hex>` for one image.
//! `index.json` is written last: a layout without it is incomplete and is
//! never treated as a usable image.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use boxroot_core::error::{BoxError, Result};

use super::manifest::{digest_hex, sha256_digest, ImageManifest, Manifest};
use super::normalize::{normalize_config, to_oci};
use super::registry::{BlobFetch, BlobSource};

/// Annotation naming the single image in `index.json`.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Summary of an assembled layout.
#[derive(Debug, Clone)]
pub struct LayoutAssembly {
    /// Digest of the stored (normalized) manifest
    pub manifest_digest: String,
    /// The stored manifest
    pub manifest: ImageManifest,
    /// The stored (normalized) image config
    pub config: Value,
    /// Blobs fetched from the source
    pub downloaded: usize,
    /// Blobs already present
    pub skipped: usize,
}

/// Writer for an OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciLayoutWriter {
    root: PathBuf,
}

impl OciLayoutWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.blobs_dir().join(digest_hex(digest)?))
    }

    /// Whether a previous assembly ran to completion.
    pub fn is_complete(&self) -> bool {
        self.root.join("index.json").is_file() && self.root.join("oci-layout").is_file()
    }

    /// Normalize `manifest`, fetch every blob it references and commit the layout.
    ///
    /// Any blob failure aborts before `index.json` is written.
    pub fn assemble(
        &self,
        manifest: Manifest,
        media_type: &str,
        source: &mut dyn BlobSource,
    ) -> Result<LayoutAssembly> {
        let index_path = self.root.join("index.json");
        if index_path.exists() {
            std::fs::remove_file(&index_path)?;
        }

        let converted = to_oci(manifest, media_type)?;
        let mut image = match converted.manifest {
            Manifest::Image(image) => image,
            other => {
                return Err(BoxError::AssemblyError(format!(
                    "Expected an image manifest, got {:?}; resolve a platform first",
                    other.kind()
                )))
            }
        };

        std::fs::create_dir_all(self.blobs_dir())?;
        let mut downloaded = 0;
        let mut skipped = 0;
        let mut record = |fetch: BlobFetch| match fetch {
            BlobFetch::Downloaded { .. } => downloaded += 1,
            BlobFetch::Skipped => skipped += 1,
        };

        if let Some(bytes) = converted.synthesized_config {
            let path = self.blob_path(&image.config.digest)?;
            write_if_absent(&path, &bytes)?;
        }

        tracing::info!(
            layers = image.layers.len(),
            root = %self.root.display(),
            "Assembling OCI layout"
        );
        for (index, layer) in image.layers.iter().enumerate() {
            let path = self.blob_path(&layer.digest)?;
            tracing::debug!(index, digest = %layer.digest, "Fetching layer");
            record(source.fetch_blob(&layer.digest, &path)?);
        }

        let config_path = self.blob_path(&image.config.digest)?;
        record(source.fetch_blob(&image.config.digest, &config_path)?);

        let raw_config = std::fs::read(&config_path)?;
        let config: Value = serde_json::from_slice(&raw_config).map_err(|e| {
            BoxError::AssemblyError(format!(
                "Config blob {} is not valid JSON: {}",
                image.config.digest, e
            ))
        })?;
        let (config, changed) = normalize_config(config)?;
        if changed {
            let bytes = serde_json::to_vec(&config)?;
            let digest = sha256_digest(&bytes);
            write_if_absent(&self.blob_path(&digest)?, &bytes)?;
            tracing::debug!(
                original = %image.config.digest,
                normalized = %digest,
                "Stored normalized image config"
            );
            image.config.digest = digest;
            image.config.size = Some(bytes.len() as u64);
        } else if image.config.size.is_none() {
            image.config.size = Some(raw_config.len() as u64);
        }

        for layer in image.layers.iter_mut().filter(|l| l.size.is_none()) {
            layer.size = Some(std::fs::metadata(self.blob_path(&layer.digest)?)?.len());
        }

        let manifest_bytes = serde_json::to_vec(&image)?;
        let manifest_digest = sha256_digest(&manifest_bytes);
        let manifest_path = self.blob_path(&manifest_digest)?;
        write_if_absent(&manifest_path, &manifest_bytes)?;

        std::fs::write(self.root.join("oci-layout"), OCI_LAYOUT_CONTENT)?;

        let index = json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": converted.media_type,
                "digest": manifest_digest,
                "size": std::fs::metadata(&manifest_path)?.len(),
                "annotations": { REF_NAME_ANNOTATION: "latest" }
            }]
        });
        let tmp_index = self.root.join("index.json.tmp");
        std::fs::write(&tmp_index, serde_json::to_string_pretty(&index)?)?;
        std::fs::rename(&tmp_index, &index_path)?;

        tracing::info!(
            digest = %manifest_digest,
            downloaded,
            skipped,
            "OCI layout committed"
        );

        Ok(LayoutAssembly {
            manifest_digest,
            manifest: image,
            config,
            downloaded,
            skipped,
        })
    }
}

fn write_if_absent(path: &Path, bytes: &[u8]) -> Result<()> {
    if !path.exists() {
        std::fs::write(path, bytes)?;
    }
    Ok(())
}
