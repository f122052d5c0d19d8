//! High-level pull orchestrator.
//!
//! Reference → resolved manifest → OCI layout → extracted rootfs →
//! validation, scaffold and config sidecar → gzip archive. Finished archives
//! are kept in the flat [`ImageCache`]; `force` bypasses it and discards the
//! per-reference layout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use boxroot_core::config::PullConfig;
use boxroot_core::error::{BoxError, Result};
use boxroot_core::profile::HostProfile;

use super::auth::RegistryAuth;
use super::credentials::CredentialStore;
use super::image::OciImage;
use super::layout::OciLayoutWriter;
use super::platform::Platform;
use super::reference::ImageReference;
use super::registry::RegistryClient;
use super::transport::{CurlTransport, HttpTransport};
use crate::cache::{CacheInfo, ImageCache};
use crate::host_check::resolve_host_profile;
use crate::rootfs::{
    create_rootfs_archive, write_image_config, LayerExtractor, LayerReport, RootfsScaffold,
    RootfsValidator,
};
use crate::tools::ToolCapabilities;

/// Result of [`ImagePuller::pull`].
#[derive(Debug, Clone)]
pub struct PulledImage {
    pub reference: ImageReference,
    /// The rootfs archive
    pub archive: PathBuf,
    /// Whether the archive came from the cache without any work
    pub from_cache: bool,
    pub info: CacheInfo,
}

/// Image puller with a rootfs archive cache.
pub struct ImagePuller {
    config: PullConfig,
    profile: HostProfile,
    tools: Arc<ToolCapabilities>,
    transport: Arc<dyn HttpTransport>,
    /// False once a custom transport replaces curl
    uses_curl: bool,
    credentials: CredentialStore,
    auth: Option<RegistryAuth>,
}

impl ImagePuller {
    /// Puller talking to registries through `curl`.
    pub fn new(config: PullConfig) -> Self {
        let profile = resolve_host_profile(&config);
        let tools = Arc::new(ToolCapabilities::from_config(&config));
        let transport: Arc<dyn HttpTransport> = Arc::new(CurlTransport::from_config(&config));
        let credentials = CredentialStore::from_config(&config);
        Self {
            config,
            profile,
            tools,
            transport,
            uses_curl: true,
            credentials,
            auth: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self.uses_curl = false;
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolCapabilities>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_profile(mut self, profile: HostProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Use these credentials for every registry instead of the credential
    /// store and environment.
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn config(&self) -> &PullConfig {
        &self.config
    }

    pub fn profile(&self) -> HostProfile {
        self.profile
    }

    fn cache(&self) -> Result<ImageCache> {
        ImageCache::new(&self.config.rootfs_cache_dir())
    }

    /// Directory of the OCI layout kept for a reference.
    pub fn layout_dir(&self, reference: &ImageReference) -> PathBuf {
        self.config.layout_dir().join(reference.cache_key())
    }

    /// Pull an image, using the archive cache if available.
    ///
    /// Returns the cached rootfs archive.
    pub fn pull(&self, reference: &str, force: bool) -> Result<PulledImage> {
        let parsed = ImageReference::parse(reference)?;
        let cache = self.cache()?;

        if force {
            cache.invalidate(&parsed)?;
        } else if let Some(info) = cache.get(&parsed)? {
            tracing::info!(
                reference = %parsed,
                archive = %info.cache_path.display(),
                created = %info.created_time_str,
                "Using cached image"
            );
            return Ok(PulledImage {
                archive: info.cache_path.clone(),
                reference: parsed,
                from_cache: true,
                info,
            });
        }

        let archive = cache.cache_path(&parsed);
        self.build_archive(&parsed, &archive, force)?;
        let info = cache.record(&parsed)?;
        Ok(PulledImage {
            reference: parsed,
            archive,
            from_cache: false,
            info,
        })
    }

    /// Pull an image and write its rootfs archive to `output`.
    ///
    /// Served from the cache when possible; the cache itself is left unchanged.
    pub fn export(&self, reference: &str, output: &Path, force: bool) -> Result<PathBuf> {
        let parsed = ImageReference::parse(reference)?;
        let cache = self.cache()?;

        if !force {
            if let Some(info) = cache.get(&parsed)? {
                tracing::info!(
                    reference = %parsed,
                    output = %output.display(),
                    "Copying cached image"
                );
                if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&info.cache_path, output)?;
                return Ok(output.to_path_buf());
            }
        }

        self.build_archive(&parsed, output, force)?;
        Ok(output.to_path_buf())
    }

    /// Check if an image is already cached.
    pub fn is_cached(&self, reference: &str) -> bool {
        let parsed = match ImageReference::parse(reference) {
            Ok(p) => p,
            Err(_) => return false,
        };
        match self.cache() {
            Ok(cache) => cache.is_cached(&parsed),
            Err(_) => false,
        }
    }

    /// Acquire the image and materialize it into `rootfs`, without archiving.
    pub fn pull_to_dir(&self, reference: &str, rootfs: &Path, force: bool) -> Result<OciImage> {
        let parsed = ImageReference::parse(reference)?;
        let image = self.acquire_layout(&parsed, force)?;
        self.materialize(&image, rootfs)?;
        Ok(image)
    }

    /// Make sure a complete OCI layout for `reference` exists locally.
    ///
    /// A committed layout is reused unless `force` is set.
    pub fn acquire_layout(&self, reference: &ImageReference, force: bool) -> Result<OciImage> {
        let root = self.layout_dir(reference);
        let writer = OciLayoutWriter::new(&root);

        if force && root.exists() {
            tracing::debug!(layout = %root.display(), "Discarding OCI layout");
            std::fs::remove_dir_all(&root).map_err(|e| {
                BoxError::AssemblyError(format!(
                    "Failed to remove layout {}: {}",
                    root.display(),
                    e
                ))
            })?;
        }

        if writer.is_complete() {
            match OciImage::from_path(&root) {
                Ok(image) => {
                    tracing::info!(
                        reference = %reference,
                        digest = %image.manifest_digest(),
                        "Reusing OCI layout"
                    );
                    return Ok(image);
                }
                Err(e) => {
                    tracing::warn!(
                        reference = %reference,
                        error = %e,
                        "Stored OCI layout is unusable, fetching again"
                    );
                }
            }
        }

        if self.uses_curl {
            self.tools.ensure_curl()?;
        }

        let auth = match &self.auth {
            Some(auth) => auth.clone(),
            None => RegistryAuth::resolve(reference.registry_host(), &self.credentials),
        };
        let platform = Platform::from_config(&self.config);
        tracing::info!(reference = %reference, platform = %platform, "Pulling image");

        let mut client = RegistryClient::new(reference, self.transport.clone(), auth)
            .with_config(&self.config);
        let (manifest, media_type) = client.resolve_manifest(reference, &platform)?;
        let assembly = writer.assemble(manifest, &media_type, &mut client)?;
        tracing::info!(
            reference = %reference,
            digest = %assembly.manifest_digest,
            layers = assembly.manifest.layers.len(),
            "Image pulled"
        );

        OciImage::from_path(&root)
    }

    /// Extract, validate, scaffold and annotate `rootfs` from an acquired image.
    pub fn materialize(&self, image: &OciImage, rootfs: &Path) -> Result<Vec<LayerReport>> {
        let extractor = LayerExtractor::new(self.profile, self.tools.clone())
            .with_whiteouts(self.config.apply_whiteouts);
        let reports = extractor.extract_image(image, rootfs)?;

        RootfsValidator::new(self.profile).validate(rootfs)?;
        write_image_config(image, rootfs)?;
        RootfsScaffold::new(rootfs).build()?;
        Ok(reports)
    }

    /// Acquire, materialize into a scratch directory and archive to `output`.
    fn build_archive(&self, reference: &ImageReference, output: &Path, force: bool) -> Result<()> {
        let image = self.acquire_layout(reference, force)?;

        let scratch_parent = self.config.cache_dir.join("tmp");
        std::fs::create_dir_all(&scratch_parent)?;
        let scratch = tempfile::Builder::new()
            .prefix("rootfs-")
            .tempdir_in(&scratch_parent)?;
        let rootfs = scratch.path().join("rootfs");
        std::fs::create_dir_all(&rootfs)?;

        self.materialize(&image, &rootfs)?;
        create_rootfs_archive(&rootfs, output)?;
        Ok(())
    }
}
