//! Reading an assembled OCI image layout.
//!
//! The extractor works from the layout on disk, not from registry responses,
//! so a cached layout can be materialized again without network access.

use std::path::{Path, PathBuf};

use boxroot_core::error::{BoxError, Result};
use oci_spec::image::{ImageIndex, ImageManifest};
use serde_json::Value;

use super::manifest::digest_hex;

/// A layer blob of the image, bottom to top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBlob {
    pub digest: String,
    pub path: PathBuf,
}

/// Runtime settings from the image config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OciImageConfig {
    /// Entrypoint command
    pub entrypoint: Option<Vec<String>>,

    /// Default command arguments
    pub cmd: Option<Vec<String>>,

    /// Environment as `KEY=VALUE` strings, in image order
    pub env: Vec<String>,

    /// Working directory
    pub working_dir: Option<String>,

    /// User to run as
    pub user: Option<String>,
}

impl OciImageConfig {
    /// Extract the runtime section (`config`) of an image configuration document.
    pub fn from_config_json(config: &Value) -> Self {
        let runtime = config.get("config");
        let field = |name: &str| runtime.and_then(|c| c.get(name));

        Self {
            entrypoint: field("Entrypoint").and_then(string_array),
            cmd: field("Cmd").and_then(string_array),
            env: field("Env").and_then(string_array).unwrap_or_default(),
            working_dir: field("WorkingDir")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            user: field("User")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }
}

fn string_array(value: &Value) -> Option<Vec<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

/// An OCI image loaded from a layout directory.
#[derive(Debug)]
pub struct OciImage {
    root_dir: PathBuf,
    manifest_digest: String,
    manifest: ImageManifest,
    config_json: Value,
    config: OciImageConfig,
    layers: Vec<LayerBlob>,
}

impl OciImage {
    /// Load the image referenced by the first `index.json` entry.
    ///
    /// Fails when the layout is incomplete or any referenced blob is missing.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();
        Self::validate_oci_layout(&root_dir)?;

        let index = Self::load_index(&root_dir)?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| BoxError::OciImageError("No manifests in index.json".to_string()))?
            .digest()
            .to_string();

        let manifest = Self::load_manifest(&root_dir, &manifest_digest)?;
        let config_json = Self::load_config(&root_dir, manifest.config().digest())?;
        let config = OciImageConfig::from_config_json(&config_json);

        let layers = manifest
            .layers()
            .iter()
            .map(|layer| {
                let digest = layer.digest().to_string();
                let path = Self::blob_path(&root_dir, &digest)?;
                if !path.is_file() {
                    return Err(BoxError::OciImageError(format!(
                        "Layer blob {} missing from {}",
                        digest,
                        root_dir.display()
                    )));
                }
                Ok(LayerBlob { digest, path })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root_dir,
            manifest_digest,
            manifest,
            config_json,
            config,
            layers,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// Layer blobs in application order.
    pub fn layers(&self) -> &[LayerBlob] {
        &self.layers
    }

    /// The full image config document.
    pub fn config_json(&self) -> &Value {
        &self.config_json
    }

    pub fn config(&self) -> &OciImageConfig {
        &self.config
    }

    pub fn entrypoint(&self) -> Option<&[String]> {
        self.config.entrypoint.as_deref()
    }

    pub fn cmd(&self) -> Option<&[String]> {
        self.config.cmd.as_deref()
    }

    pub fn env(&self) -> &[String] {
        &self.config.env
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.config.working_dir.as_deref()
    }

    pub fn architecture(&self) -> Option<&str> {
        self.config_json.get("architecture").and_then(Value::as_str)
    }

    fn validate_oci_layout(root_dir: &Path) -> Result<()> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root_dir.join(required).exists() {
                return Err(BoxError::OciImageError(format!(
                    "Not a complete OCI layout: missing {} in {}",
                    required,
                    root_dir.display()
                )));
            }
        }
        Ok(())
    }

    fn load_index(root_dir: &Path) -> Result<ImageIndex> {
        let index_path = root_dir.join("index.json");
        let content = std::fs::read_to_string(&index_path)?;
        serde_json::from_str(&content)
            .map_err(|e| BoxError::OciImageError(format!("Failed to parse index.json: {}", e)))
    }

    fn load_manifest(root_dir: &Path, digest: &str) -> Result<ImageManifest> {
        let content = std::fs::read_to_string(Self::blob_path(root_dir, digest)?)?;
        serde_json::from_str(&content).map_err(|e| {
            BoxError::OciImageError(format!("Failed to parse manifest {}: {}", digest, e))
        })
    }

    fn load_config(root_dir: &Path, digest: &str) -> Result<Value> {
        let content = std::fs::read(Self::blob_path(root_dir, digest)?)?;
        let config: Value = serde_json::from_slice(&content).map_err(|e| {
            BoxError::OciImageError(format!("Failed to parse config {}: {}", digest, e))
        })?;
        if !config.is_object() {
            return Err(BoxError::OciImageError(format!(
                "Config {} is not a JSON object",
                digest
            )));
        }
        Ok(config)
    }

    fn blob_path(root_dir: &Path, digest: &str) -> Result<PathBuf> {
        Ok(root_dir.join("blobs").join("sha256").join(digest_hex(digest)?))
    }
}
