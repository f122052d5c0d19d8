//! Docker → OCI format conversion.
//!
//! Pure functions: nothing here touches the network or the filesystem.

use serde_json::{json, Map, Value};

use boxroot_core::error::{BoxError, Result};

use super::manifest::media_types::{self, *};
use super::manifest::{sha256_digest, Descriptor, ImageManifest, LegacyManifest, Manifest};

/// Result of converting a manifest to OCI form.
#[derive(Debug, Clone, PartialEq)]
pub struct OciManifest {
    pub manifest: Manifest,
    pub media_type: String,
    /// Config blob built from a legacy manifest's history. It is not on the
    /// registry and must be written by the caller under the config digest.
    pub synthesized_config: Option<Vec<u8>>,
}

/// Convert a manifest to its OCI equivalent.
///
/// OCI input is returned unchanged. Docker schema 2 manifests and lists get
/// OCI media types. Legacy schema 1 manifests become image manifests with
/// layers oldest-first and a config synthesized from the newest history entry.
pub fn to_oci(manifest: Manifest, media_type: &str) -> Result<OciManifest> {
    if media_types::is_oci(media_type) {
        return Ok(OciManifest {
            manifest,
            media_type: media_type.to_string(),
            synthesized_config: None,
        });
    }

    match manifest {
        Manifest::Image(mut image) => {
            image.media_type = Some(OCI_MANIFEST.to_string());
            image.config.media_type = oci_config_type(&image.config.media_type);
            for layer in &mut image.layers {
                layer.media_type = oci_layer_type(&layer.media_type);
            }
            tracing::debug!("Converted Docker manifest to OCI");
            Ok(OciManifest {
                manifest: Manifest::Image(image),
                media_type: OCI_MANIFEST.to_string(),
                synthesized_config: None,
            })
        }
        Manifest::Index(mut index) => {
            index.media_type = Some(OCI_INDEX.to_string());
            for entry in &mut index.manifests {
                if entry.media_type == DOCKER_MANIFEST {
                    entry.media_type = OCI_MANIFEST.to_string();
                } else if entry.media_type == DOCKER_MANIFEST_LIST {
                    entry.media_type = OCI_INDEX.to_string();
                }
            }
            Ok(OciManifest {
                manifest: Manifest::Index(index),
                media_type: OCI_INDEX.to_string(),
                synthesized_config: None,
            })
        }
        Manifest::Legacy(legacy) => from_legacy(&legacy),
    }
}

fn oci_layer_type(media_type: &str) -> String {
    match media_type {
        DOCKER_LAYER_GZIP => OCI_LAYER_GZIP,
        DOCKER_LAYER_TAR => OCI_LAYER_TAR,
        DOCKER_LAYER_FOREIGN_GZIP => OCI_LAYER_NONDIST_GZIP,
        "" => OCI_LAYER_GZIP,
        other => other,
    }
    .to_string()
}

fn oci_config_type(media_type: &str) -> String {
    match media_type {
        DOCKER_CONFIG | "" => OCI_CONFIG,
        other => other,
    }
    .to_string()
}

fn from_legacy(legacy: &LegacyManifest) -> Result<OciManifest> {
    if legacy.fs_layers.is_empty() {
        return Err(BoxError::AssemblyError(
            "Legacy manifest has no fsLayers".to_string(),
        ));
    }

    let history: Vec<Value> = legacy
        .history
        .iter()
        .map(|h| serde_json::from_str(&h.v1_compatibility).unwrap_or(Value::Null))
        .collect();
    let newest = history.first().cloned().unwrap_or(Value::Null);

    let mut config = Map::new();
    if let Some(arch) = newest
        .get("architecture")
        .and_then(Value::as_str)
        .or(legacy.architecture.as_deref())
    {
        config.insert("architecture".into(), json!(arch));
    }
    for key in ["os", "created", "author"] {
        if let Some(value) = newest.get(key).filter(|v| !v.is_null()) {
            config.insert(key.into(), value.clone());
        }
    }
    if let Some(runtime) = newest.get("config").filter(|v| v.is_object()) {
        config.insert("config".into(), runtime.clone());
    }

    // One history entry per layer, oldest first.
    let entries: Vec<Value> = history
        .iter()
        .rev()
        .map(|h| {
            let mut entry = Map::new();
            if let Some(created) = h.get("created").filter(|v| v.is_string()) {
                entry.insert("created".into(), created.clone());
            }
            if let Some(cmd) = h
                .get("container_config")
                .and_then(|c| c.get("Cmd"))
                .and_then(Value::as_array)
            {
                let created_by: Vec<&str> = cmd.iter().filter_map(Value::as_str).collect();
                entry.insert("created_by".into(), json!(created_by.join(" ")));
            }
            Value::Object(entry)
        })
        .collect();
    config.insert("history".into(), Value::Array(entries));

    let (config, _) = normalize_config(Value::Object(config))?;
    let config_bytes = serde_json::to_vec(&config)?;
    let config_descriptor = Descriptor::new(
        OCI_CONFIG,
        sha256_digest(&config_bytes),
        config_bytes.len() as u64,
    );

    let layers = legacy
        .layers_oldest_first()
        .into_iter()
        .map(|digest| Descriptor {
            media_type: OCI_LAYER_GZIP.to_string(),
            digest: digest.to_string(),
            size: None,
            platform: None,
            extra: Map::new(),
        })
        .collect();

    tracing::debug!(
        layers = legacy.fs_layers.len(),
        "Converted legacy schema 1 manifest to OCI"
    );

    Ok(OciManifest {
        manifest: Manifest::Image(ImageManifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST.to_string()),
            config: config_descriptor,
            layers,
            extra: Map::new(),
        }),
        media_type: OCI_MANIFEST.to_string(),
        synthesized_config: Some(config_bytes),
    })
}

/// Fill in the fields every OCI config must carry.
///
/// Returns the config and whether anything was added.
pub fn normalize_config(config: Value) -> Result<(Value, bool)> {
    let mut object = match config {
        Value::Object(object) => object,
        other => {
            return Err(BoxError::AssemblyError(format!(
                "Image config is not a JSON object: {}",
                type_name(&other)
            )))
        }
    };

    let defaults = [
        ("architecture", json!("amd64")),
        ("os", json!("linux")),
        ("config", json!({})),
        ("rootfs", json!({"type": "layers", "diff_ids": []})),
        ("history", json!([])),
    ];

    let mut changed = false;
    for (key, default) in defaults {
        if !object.contains_key(key) {
            object.insert(key.to_string(), default);
            changed = true;
        }
    }
    Ok((Value::Object(object), changed))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
