//! Registry manifest documents.
//!
//! Image manifests, manifest indexes (multi-architecture lists) and legacy
//! schema 1 manifests share one [`Manifest`] enum. Fields this crate does not
//! interpret (annotations, urls, signatures, ...) are kept in `extra` maps so
//! re-encoding a document does not lose them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use boxroot_core::error::{BoxError, Result};

use super::platform::Platform;

/// Well-known media types.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_NONDIST_GZIP: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    pub const DOCKER_MANIFEST_V1_SIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_LAYER_FOREIGN_GZIP: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

    /// `Accept` set sent with every manifest request.
    pub const MANIFEST_ACCEPT: [&str; 4] =
        [OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST];

    pub fn is_oci(media_type: &str) -> bool {
        media_type.starts_with("application/vnd.oci.")
    }
}

use media_types::*;

/// Content descriptor (`mediaType`, `digest`, `size`, optional `platform`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub digest: String,
    /// Unknown for layers of legacy manifests until the blob is on disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: digest.into(),
            size: Some(size),
            platform: None,
            extra: Map::new(),
        }
    }

    pub fn architecture(&self) -> Option<&str> {
        self.platform.as_ref().and_then(|p| p.architecture.as_deref())
    }
}

/// Platform object of a manifest list entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlatformSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Single-platform image manifest (OCI or Docker schema 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default = "schema_two")]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Multi-platform manifest index (OCI index or Docker manifest list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    #[serde(default = "schema_two")]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Docker schema 1 manifest. `fs_layers` and `history` are newest-first on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyManifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default)]
    pub fs_layers: Vec<FsLayer>,
    #[serde(default)]
    pub history: Vec<LegacyHistory>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyHistory {
    /// JSON-encoded v1 image configuration
    pub v1_compatibility: String,
}

impl LegacyManifest {
    /// Layer digests bottom to top.
    pub fn layers_oldest_first(&self) -> Vec<&str> {
        self.fs_layers
            .iter()
            .rev()
            .map(|l| l.blob_sum.as_str())
            .collect()
    }
}

fn schema_two() -> u32 {
    2
}

/// Which kind of document a manifest is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Image,
    Index,
    Legacy,
}

impl ManifestKind {
    /// Kind implied by a media type, `None` for unrelated types (`application/json`, ...).
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            OCI_MANIFEST | DOCKER_MANIFEST => Some(ManifestKind::Image),
            OCI_INDEX | DOCKER_MANIFEST_LIST => Some(ManifestKind::Index),
            DOCKER_MANIFEST_V1 | DOCKER_MANIFEST_V1_SIGNED => Some(ManifestKind::Legacy),
            _ => None,
        }
    }

    /// Guess the kind from the top-level keys of the document.
    fn sniff(doc: &Value) -> Option<Self> {
        if doc.get("manifests").is_some() {
            Some(ManifestKind::Index)
        } else if doc.get("fsLayers").is_some() {
            Some(ManifestKind::Legacy)
        } else if doc.get("config").is_some() || doc.get("layers").is_some() {
            Some(ManifestKind::Image)
        } else {
            None
        }
    }

    fn default_media_type(self) -> &'static str {
        match self {
            ManifestKind::Image => OCI_MANIFEST,
            ManifestKind::Index => OCI_INDEX,
            ManifestKind::Legacy => DOCKER_MANIFEST_V1,
        }
    }
}

/// A parsed manifest document.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Image(ImageManifest),
    Index(ManifestIndex),
    Legacy(LegacyManifest),
}

impl Manifest {
    /// Parse a manifest body.
    ///
    /// The media type is taken from `content_type` when it names a manifest
    /// type, then from the document's own `mediaType`, then guessed from its
    /// shape. Returns the manifest together with that media type.
    pub fn parse(body: &str, content_type: Option<&str>) -> Result<(Manifest, String)> {
        let doc: Value = serde_json::from_str(body).map_err(|e| {
            BoxError::OciImageError(format!("Manifest is not valid JSON: {}", e))
        })?;

        let header_type = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
            .filter(|ct| ManifestKind::from_media_type(ct).is_some());
        let doc_type = doc
            .get("mediaType")
            .and_then(Value::as_str)
            .filter(|mt| ManifestKind::from_media_type(mt).is_some());

        let (kind, media_type) = match header_type.or(doc_type) {
            Some(mt) => (ManifestKind::from_media_type(mt), mt.to_string()),
            None => {
                let kind = ManifestKind::sniff(&doc);
                let media_type = kind.map(|k| k.default_media_type().to_string());
                (kind, media_type.unwrap_or_default())
            }
        };

        let manifest = match kind {
            Some(ManifestKind::Image) => Manifest::Image(from_value(doc, "image manifest")?),
            Some(ManifestKind::Index) => Manifest::Index(from_value(doc, "manifest index")?),
            Some(ManifestKind::Legacy) => Manifest::Legacy(from_value(doc, "legacy manifest")?),
            None => {
                return Err(BoxError::OciImageError(
                    "Unrecognized manifest: no 'layers', 'manifests' or 'fsLayers' field"
                        .to_string(),
                ))
            }
        };
        Ok((manifest, media_type))
    }

    pub fn kind(&self) -> ManifestKind {
        match self {
            Manifest::Image(_) => ManifestKind::Image,
            Manifest::Index(_) => ManifestKind::Index,
            Manifest::Legacy(_) => ManifestKind::Legacy,
        }
    }

    /// Compact JSON encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Manifest::Image(m) => serde_json::to_vec(m)?,
            Manifest::Index(m) => serde_json::to_vec(m)?,
            Manifest::Legacy(m) => serde_json::to_vec(m)?,
        })
    }
}

fn from_value<T: serde::de::DeserializeOwned>(doc: Value, what: &str) -> Result<T> {
    serde_json::from_value(doc)
        .map_err(|e| BoxError::OciImageError(format!("Invalid {}: {}", what, e)))
}

/// Pick the first index entry runnable on `platform`.
pub fn select_platform<'a>(index: &'a ManifestIndex, platform: &Platform) -> Result<&'a Descriptor> {
    index
        .manifests
        .iter()
        .find(|entry| {
            let spec = entry.platform.as_ref();
            platform.matches(
                spec.and_then(|p| p.os.as_deref()),
                spec.and_then(|p| p.architecture.as_deref()),
            )
        })
        .ok_or_else(|| BoxError::ResolutionError {
            architecture: platform.architecture.clone(),
            available: index
                .manifests
                .iter()
                .filter_map(|entry| entry.architecture().map(str::to_string))
                .collect(),
        })
}

/// Hex part of a `sha256:<hex>` digest, validated so it is safe as a file name.
pub fn digest_hex(digest: &str) -> Result<&str> {
    match digest.split_once(':') {
        Some(("sha256", hex))
            if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            Ok(hex)
        }
        _ => Err(BoxError::OciImageError(format!(
            "Unsupported digest '{}': expected sha256:<hex>",
            digest
        ))),
    }
}

/// `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKER_INDEX: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
        "manifests": [
            {"mediaType": "application/vnd.docker.distribution.manifest.v2+json",
             "digest": "sha256:aaaa", "size": 528,
             "platform": {"architecture": "amd64", "os": "linux"}},
            {"mediaType": "application/vnd.docker.distribution.manifest.v2+json",
             "digest": "sha256:bbbb", "size": 528,
             "platform": {"architecture": "aarch64", "os": "linux", "variant": "v8"}},
            {"mediaType": "application/vnd.docker.distribution.manifest.v2+json",
             "digest": "sha256:cccc", "size": 528,
             "platform": {"architecture": "arm64", "os": "linux"}}
        ]
    }"#;

    const OCI_IMAGE: &str = r#"{
        "schemaVersion": 2,
        "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:c0", "size": 10},
        "layers": [
            {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:l1", "size": 5,
             "annotations": {"org.example": "kept"}},
            {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:l2", "size": 6}
        ],
        "annotations": {"org.opencontainers.image.created": "2024-01-01"}
    }"#;

    #[test]
    fn test_parse_uses_content_type() {
        let (manifest, media_type) = Manifest::parse(
            OCI_IMAGE,
            Some("application/vnd.oci.image.manifest.v1+json; charset=utf-8"),
        )
        .unwrap();
        assert_eq!(media_type, OCI_MANIFEST);
        assert_eq!(manifest.kind(), ManifestKind::Image);
    }

    #[test]
    fn test_parse_falls_back_to_document_media_type() {
        let (manifest, media_type) =
            Manifest::parse(DOCKER_INDEX, Some("application/json")).unwrap();
        assert_eq!(media_type, DOCKER_MANIFEST_LIST);
        assert!(matches!(manifest, Manifest::Index(ref i) if i.manifests.len() == 3));
    }

    #[test]
    fn test_parse_sniffs_shape() {
        let (manifest, media_type) = Manifest::parse(OCI_IMAGE, None).unwrap();
        assert_eq!(media_type, OCI_MANIFEST);
        match manifest {
            Manifest::Image(m) => {
                assert_eq!(m.layers.len(), 2);
                assert_eq!(m.layers[0].digest, "sha256:l1");
                assert_eq!(m.layers[1].digest, "sha256:l2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_shapes() {
        assert!(Manifest::parse(r#"{"errors": []}"#, None).is_err());
        assert!(Manifest::parse("not json", None).is_err());
    }

    #[test]
    fn test_unknown_fields_survive_reencoding() {
        let (manifest, _) = Manifest::parse(OCI_IMAGE, None).unwrap();
        let value: Value = serde_json::from_slice(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(value["annotations"]["org.opencontainers.image.created"], "2024-01-01");
        assert_eq!(value["layers"][0]["annotations"]["org.example"], "kept");
        assert!(value.get("mediaType").is_none());
    }

    #[test]
    fn test_legacy_layers_oldest_first() {
        let body = r#"{
            "schemaVersion": 1, "name": "library/busybox", "tag": "old", "architecture": "amd64",
            "fsLayers": [{"blobSum": "sha256:top"}, {"blobSum": "sha256:mid"}, {"blobSum": "sha256:base"}],
            "history": [{"v1Compatibility": "{\"id\":\"3\"}"}, {"v1Compatibility": "{\"id\":\"2\"}"}, {"v1Compatibility": "{\"id\":\"1\"}"}],
            "signatures": [{"header": {}}]
        }"#;
        let (manifest, media_type) = Manifest::parse(
            body,
            Some("application/vnd.docker.distribution.manifest.v1+prettyjws"),
        )
        .unwrap();
        assert_eq!(media_type, DOCKER_MANIFEST_V1_SIGNED);
        match manifest {
            Manifest::Legacy(m) => {
                assert_eq!(
                    m.layers_oldest_first(),
                    vec!["sha256:base", "sha256:mid", "sha256:top"]
                );
                assert!(m.extra.contains_key("signatures"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_select_platform_arm64_picks_aarch64_entry() {
        let (manifest, _) = Manifest::parse(DOCKER_INDEX, None).unwrap();
        let index = match manifest {
            Manifest::Index(i) => i,
            other => panic!("unexpected {:?}", other),
        };
        let chosen = select_platform(&index, &Platform::linux("arm64")).unwrap();
        assert_eq!(chosen.digest, "sha256:bbbb");

        let chosen = select_platform(&index, &Platform::linux("x86_64")).unwrap();
        assert_eq!(chosen.digest, "sha256:aaaa");
    }

    #[test]
    fn test_select_platform_no_match_lists_available() {
        let (manifest, _) = Manifest::parse(DOCKER_INDEX, None).unwrap();
        let index = match manifest {
            Manifest::Index(i) => i,
            other => panic!("unexpected {:?}", other),
        };
        let err = select_platform(&index, &Platform::linux("riscv64")).unwrap_err();
        match err {
            BoxError::ResolutionError {
                architecture,
                available,
            } => {
                assert_eq!(architecture, "riscv64");
                assert_eq!(available, vec!["amd64", "aarch64", "arm64"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_select_platform_skips_other_os_and_accepts_missing_os() {
        let index: ManifestIndex = serde_json::from_str(
            r#"{"manifests": [
                {"digest": "sha256:01", "size": 1, "platform": {"architecture": "amd64", "os": "windows"}},
                {"digest": "sha256:02", "size": 1, "platform": {"architecture": "amd64"}}
            ]}"#,
        )
        .unwrap();
        let chosen = select_platform(&index, &Platform::linux("amd64")).unwrap();
        assert_eq!(chosen.digest, "sha256:02");
    }

    #[test]
    fn test_digest_hex() {
        assert_eq!(digest_hex("sha256:abc123").unwrap(), "abc123");
        assert!(digest_hex("sha512:abc").is_err());
        assert!(digest_hex("sha256:../../etc").is_err());
        assert!(digest_hex("abc").is_err());
        assert!(digest_hex("sha256:").is_err());
    }

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
