//! Registry v2 client.
//!
//! One client serves one repository. Its first request negotiates
//! authentication (see [`AuthNegotiator`]); manifests and blobs are then
//! fetched with the negotiated authorization.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use boxroot_core::config::PullConfig;
use boxroot_core::error::{BoxError, Result};
use sha2::{Digest, Sha256};

use super::auth::{AuthNegotiator, AuthState, RegistryAuth};
use super::manifest::{digest_hex, media_types, select_platform, Manifest};
use super::platform::Platform;
use super::reference::ImageReference;
use super::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Longest slice of an error body carried into a [`BoxError::RegistryError`].
const ERROR_BODY_LIMIT: usize = 512;

/// Outcome of a blob download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobFetch {
    /// The blob was written to its destination
    Downloaded { bytes: u64 },
    /// The destination already existed; nothing was written
    Skipped,
}

/// Anything that can place a blob at a path. Implemented by [`RegistryClient`].
pub trait BlobSource {
    fn fetch_blob(&mut self, digest: &str, destination: &Path) -> Result<BlobFetch>;
}

/// Registry client bound to one repository.
pub struct RegistryClient {
    registry: String,
    repository: String,
    transport: Arc<dyn HttpTransport>,
    auth: AuthNegotiator,
    request_timeout_secs: u64,
    blob_timeout_secs: u64,
    verify_digests: bool,
}

impl RegistryClient {
    pub fn new(
        reference: &ImageReference,
        transport: Arc<dyn HttpTransport>,
        auth: RegistryAuth,
    ) -> Self {
        Self {
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            transport,
            auth: AuthNegotiator::new(auth),
            request_timeout_secs: 0,
            blob_timeout_secs: 0,
            verify_digests: true,
        }
    }

    /// Apply timeouts and digest verification from the pull configuration.
    pub fn with_config(mut self, config: &PullConfig) -> Self {
        self.request_timeout_secs = config.request_timeout_secs;
        self.blob_timeout_secs = config.blob_timeout_secs;
        self.verify_digests = config.verify_digests;
        self.auth = self.auth.with_timeout(config.request_timeout_secs);
        self
    }

    pub fn auth_state(&self) -> &AuthState {
        self.auth.state()
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v2/{}/{}",
            self.registry.trim_end_matches('/'),
            self.repository,
            path
        )
    }

    /// Send `GET /v2/<repository>/<path>`.
    ///
    /// With `output` the body goes to that file. A non-2xx status is a
    /// [`BoxError::RegistryError`]; status 0 (nothing parseable received) is
    /// returned as is.
    pub fn request(
        &mut self,
        path: &str,
        headers: &[(&str, &str)],
        output: Option<&Path>,
        max_time_secs: u64,
    ) -> Result<HttpResponse> {
        let url = self.url(path);
        if self.auth.needs_probe() {
            self.auth.negotiate(self.transport.as_ref(), &url)?;
        }

        let mut request = HttpRequest::get(&url).max_time(max_time_secs);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(output) = output {
            request = request.output(output);
        }
        let request = self.auth.authorize(request);

        let response = self.transport.execute(&request)?;
        if response.status != 0 && !response.is_success() {
            return Err(BoxError::RegistryError {
                registry: self.registry.clone(),
                status: response.status,
                message: truncate(response.body.trim(), ERROR_BODY_LIMIT),
            });
        }
        Ok(response)
    }

    /// Fetch a manifest by tag or digest. Returns the manifest and its media type.
    pub fn get_manifest(&mut self, tag_or_digest: &str) -> Result<(Manifest, String)> {
        let accept = media_types::MANIFEST_ACCEPT.join(", ");
        let response = self.request(
            &format!("manifests/{}", tag_or_digest),
            &[("Accept", accept.as_str())],
            None,
            self.request_timeout_secs,
        )?;
        let (manifest, media_type) = Manifest::parse(&response.body, response.content_type())?;
        tracing::debug!(
            repository = %self.repository,
            reference = tag_or_digest,
            media_type = %media_type,
            "Fetched manifest"
        );
        Ok((manifest, media_type))
    }

    /// Fetch the manifest for `reference`, descending into a manifest list
    /// to the entry matching `platform`.
    pub fn resolve_manifest(
        &mut self,
        reference: &ImageReference,
        platform: &Platform,
    ) -> Result<(Manifest, String)> {
        let (manifest, media_type) = self.get_manifest(reference.tag_or_digest())?;
        let index = match manifest {
            Manifest::Index(index) => index,
            other => return Ok((other, media_type)),
        };

        let entry = select_platform(&index, platform)?;
        tracing::info!(
            reference = %reference,
            platform = %platform,
            digest = %entry.digest,
            "Selected platform manifest"
        );

        let (manifest, media_type) = self.get_manifest(&entry.digest)?;
        if let Manifest::Index(_) = manifest {
            return Err(BoxError::OciImageError(format!(
                "Manifest {} for {} is itself an index",
                entry.digest, platform
            )));
        }
        Ok((manifest, media_type))
    }

    /// Download a blob to `destination`.
    ///
    /// An existing destination is left alone. Content is written to
    /// `<destination>.partial` and only renamed into place once complete and,
    /// if enabled, verified against the digest.
    pub fn download_blob(&mut self, digest: &str, destination: &Path) -> Result<BlobFetch> {
        if destination.exists() {
            tracing::debug!(digest, "Blob already present, skipping download");
            return Ok(BlobFetch::Skipped);
        }
        digest_hex(digest)?;

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let partial = partial_path(destination);
        if partial.exists() {
            std::fs::remove_file(&partial)?;
        }

        tracing::info!(digest, "Downloading blob");
        let result = self.request(
            &format!("blobs/{}", digest),
            &[],
            Some(&partial),
            self.blob_timeout_secs,
        );
        if let Err(e) = result {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }

        if !partial.exists() {
            return Err(BoxError::AssemblyError(format!(
                "No content received for blob {}",
                digest
            )));
        }

        if self.verify_digests {
            let actual = file_digest(&partial)?;
            if actual != digest {
                let _ = std::fs::remove_file(&partial);
                return Err(BoxError::DigestMismatch {
                    digest: digest.to_string(),
                    actual,
                });
            }
        }

        std::fs::rename(&partial, destination)?;
        let bytes = std::fs::metadata(destination)?.len();
        tracing::debug!(digest, bytes, "Blob stored");
        Ok(BlobFetch::Downloaded { bytes })
    }
}

impl BlobSource for RegistryClient {
    fn fetch_blob(&mut self, digest: &str, destination: &Path) -> Result<BlobFetch> {
        self.download_blob(digest, destination)
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}

/// `sha256:<hex>` of a file's content.
pub fn file_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::manifest::sha256_digest;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Minimal in-memory registry: routes by URL suffix.
    #[derive(Default)]
    struct FakeRegistry {
        manifests: HashMap<String, (String, String)>,
        blobs: HashMap<String, Vec<u8>>,
        challenge: bool,
        log: Mutex<Vec<HttpRequest>>,
    }

    impl FakeRegistry {
        /// Blob requests that asked for a body on disk (the auth probe does not).
        fn blob_writes(&self) -> usize {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.url.contains("/blobs/") && r.output.is_some())
                .count()
        }
    }

    impl HttpTransport for FakeRegistry {
        fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.log.lock().unwrap().push(request.clone());
            let authorized = request.headers.iter().any(|(k, _)| k == "Authorization");

            if request.url.starts_with("https://auth.example/token") {
                return Ok(HttpResponse {
                    status: 200,
                    headers: HashMap::new(),
                    body: r#"{"token":"t0k"}"#.to_string(),
                });
            }
            if self.challenge && !authorized {
                let mut headers = HashMap::new();
                headers.insert(
                    "www-authenticate".to_string(),
                    r#"Bearer realm="https://auth.example/token",service="reg""#.to_string(),
                );
                return Ok(HttpResponse {
                    status: 401,
                    headers,
                    body: "unauthorized".to_string(),
                });
            }

            if let Some((_, reference)) = request.url.split_once("/manifests/") {
                return Ok(match self.manifests.get(reference) {
                    Some((content_type, body)) => {
                        let mut headers = HashMap::new();
                        headers.insert("content-type".to_string(), content_type.clone());
                        HttpResponse {
                            status: 200,
                            headers,
                            body: body.clone(),
                        }
                    }
                    None => HttpResponse {
                        status: 404,
                        headers: HashMap::new(),
                        body: r#"{"errors":[{"code":"MANIFEST_UNKNOWN"}]}"#.to_string(),
                    },
                });
            }

            if let Some((_, digest)) = request.url.split_once("/blobs/") {
                return match (self.blobs.get(digest), &request.output) {
                    (Some(data), Some(path)) => {
                        std::fs::write(path, data)?;
                        Ok(HttpResponse {
                            status: 200,
                            ..Default::default()
                        })
                    }
                    _ => Ok(HttpResponse {
                        status: 404,
                        ..Default::default()
                    }),
                };
            }
            Ok(HttpResponse::default())
        }
    }

    fn client(registry: FakeRegistry) -> (RegistryClient, Arc<FakeRegistry>) {
        let registry = Arc::new(registry);
        let reference = ImageReference::parse("r.example/team/app:1.0").unwrap();
        let client = RegistryClient::new(&reference, registry.clone(), RegistryAuth::anonymous());
        (client, registry)
    }

    #[test]
    fn test_download_blob_is_idempotent() {
        let data = b"layer bytes".to_vec();
        let digest = sha256_digest(&data);
        let mut fake = FakeRegistry::default();
        fake.blobs.insert(digest.clone(), data.clone());
        let (mut client, fake) = client(fake);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("blobs").join("sha256").join(digest_hex(&digest).unwrap());

        let first = client.download_blob(&digest, &dest).unwrap();
        assert_eq!(first, BlobFetch::Downloaded { bytes: data.len() as u64 });
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!partial_path(&dest).exists());

        let second = client.download_blob(&digest, &dest).unwrap();
        assert_eq!(second, BlobFetch::Skipped);
        assert_eq!(fake.blob_writes(), 1);
    }

    #[test]
    fn test_download_blob_digest_mismatch() {
        let digest = sha256_digest(b"expected");
        let mut fake = FakeRegistry::default();
        fake.blobs.insert(digest.clone(), b"tampered".to_vec());
        let (mut client, _) = client(fake);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("blob");
        let err = client.download_blob(&digest, &dest).unwrap_err();

        assert!(matches!(err, BoxError::DigestMismatch { .. }));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_download_blob_without_verification() {
        let digest = sha256_digest(b"expected");
        let mut fake = FakeRegistry::default();
        fake.blobs.insert(digest.clone(), b"other".to_vec());
        let (client, _) = client(fake);
        let mut client = client.with_config(&PullConfig {
            verify_digests: false,
            ..Default::default()
        });

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("blob");
        assert!(matches!(
            client.download_blob(&digest, &dest).unwrap(),
            BlobFetch::Downloaded { bytes: 5 }
        ));
    }

    #[test]
    fn test_download_missing_blob_is_registry_error() {
        let (mut client, _) = client(FakeRegistry::default());
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("blob");
        let err = client
            .download_blob(&sha256_digest(b"nope"), &dest)
            .unwrap_err();
        assert!(matches!(err, BoxError::RegistryError { status: 404, .. }));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_download_rejects_bad_digest() {
        let (mut client, fake) = client(FakeRegistry::default());
        let dir = TempDir::new().unwrap();
        assert!(client
            .download_blob("sha256:../../x", &dir.path().join("blob"))
            .is_err());
        assert!(fake.log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_get_manifest_sends_accept_and_token() {
        let body = r#"{"schemaVersion":2,"config":{"digest":"sha256:c","size":1},"layers":[]}"#;
        let mut fake = FakeRegistry {
            challenge: true,
            ..Default::default()
        };
        fake.manifests.insert(
            "1.0".to_string(),
            (media_types::OCI_MANIFEST.to_string(), body.to_string()),
        );
        let (mut client, fake) = client(fake);

        let (manifest, media_type) = client.get_manifest("1.0").unwrap();
        assert!(matches!(manifest, Manifest::Image(_)));
        assert_eq!(media_type, media_types::OCI_MANIFEST);
        assert_eq!(client.auth_state(), &AuthState::Tokenized("t0k".to_string()));

        let log = fake.log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].url, "https://r.example/v2/team/app/manifests/1.0");
        let last = &log[2];
        let accept = last
            .headers
            .iter()
            .find(|(k, _)| k == "Accept")
            .map(|(_, v)| v.clone())
            .unwrap();
        for media_type in media_types::MANIFEST_ACCEPT {
            assert!(accept.contains(media_type));
        }
        assert!(last
            .headers
            .contains(&("Authorization".to_string(), "Bearer t0k".to_string())));
    }

    #[test]
    fn test_get_manifest_not_found() {
        let (mut client, _) = client(FakeRegistry::default());
        match client.get_manifest("missing").unwrap_err() {
            BoxError::RegistryError {
                registry,
                status,
                message,
            } => {
                assert_eq!(registry, "https://r.example");
                assert_eq!(status, 404);
                assert!(message.contains("MANIFEST_UNKNOWN"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resolve_manifest_descends_into_index() {
        let index = r#"{"schemaVersion":2,"manifests":[
            {"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:aa","size":1,"platform":{"architecture":"amd64","os":"linux"}},
            {"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:bb","size":1,"platform":{"architecture":"aarch64","os":"linux"}}
        ]}"#;
        let image = r#"{"schemaVersion":2,"config":{"digest":"sha256:c","size":1},"layers":[{"digest":"sha256:l","size":1}]}"#;
        let mut fake = FakeRegistry::default();
        fake.manifests.insert(
            "1.0".to_string(),
            (media_types::OCI_INDEX.to_string(), index.to_string()),
        );
        fake.manifests.insert(
            "sha256:bb".to_string(),
            (media_types::OCI_MANIFEST.to_string(), image.to_string()),
        );
        let (mut client, _) = client(fake);
        let reference = ImageReference::parse("r.example/team/app:1.0").unwrap();

        let (manifest, _) = client
            .resolve_manifest(&reference, &Platform::linux("arm64"))
            .unwrap();
        match manifest {
            Manifest::Image(m) => assert_eq!(m.layers[0].digest, "sha256:l"),
            other => panic!("unexpected {:?}", other),
        }

        let err = client
            .resolve_manifest(&reference, &Platform::linux("s390x"))
            .unwrap_err();
        assert!(matches!(err, BoxError::ResolutionError { .. }));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééé", 3), "é...");
    }
}
