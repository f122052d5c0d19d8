use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BoxError, Result};
use crate::profile::HostProfile;

/// Environment variable overriding [`PullConfig::cache_dir`].
pub const ENV_CACHE_DIR: &str = "BOXROOT_CACHE_DIR";
/// Environment variable overriding [`PullConfig::architecture`].
pub const ENV_ARCH: &str = "BOXROOT_ARCH";
/// Environment variable overriding [`PullConfig::proxy`].
pub const ENV_PROXY: &str = "BOXROOT_PROXY";
/// Environment variable overriding [`PullConfig::host_profile`].
pub const ENV_HOST_PROFILE: &str = "BOXROOT_HOST_PROFILE";

/// Image acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    /// Root of the rootfs cache, OCI layouts and credentials
    pub cache_dir: PathBuf,

    /// Target architecture (auto-detected from the host when unset)
    pub architecture: Option<String>,

    /// Proxy URL handed to the HTTP client (e.g. "http://host:3128", "socks5://host:1080")
    pub proxy: Option<String>,

    /// External HTTP client binary
    pub curl_path: String,

    /// External archive tool binary
    pub tar_path: String,

    /// User-Agent sent to registries
    pub user_agent: String,

    /// Connection timeout per HTTP client invocation
    pub connect_timeout_secs: u64,

    /// Total time limit for manifest and token requests (0 = unlimited)
    pub request_timeout_secs: u64,

    /// Total time limit for a single blob download (0 = unlimited)
    pub blob_timeout_secs: u64,

    /// Re-hash downloaded blobs against their digest
    pub verify_digests: bool,

    /// Delete lower-layer paths named by whiteout markers
    pub apply_whiteouts: bool,

    /// Force a host profile instead of detecting it
    pub host_profile: Option<HostProfile>,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            architecture: None,
            proxy: None,
            curl_path: "curl".to_string(),
            tar_path: "tar".to_string(),
            user_agent: format!("boxroot/{}", crate::VERSION),
            connect_timeout_secs: 30,
            request_timeout_secs: 300,
            blob_timeout_secs: 0,
            verify_digests: true,
            apply_whiteouts: true,
            host_profile: None,
        }
    }
}

impl PullConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoxError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BoxError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Apply `BOXROOT_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = non_empty(ENV_CACHE_DIR) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(arch) = non_empty(ENV_ARCH) {
            self.architecture = Some(arch.trim().to_string());
        }
        if let Some(proxy) = non_empty(ENV_PROXY) {
            self.proxy = Some(proxy.trim().to_string());
        }
        if let Some(profile) = non_empty(ENV_HOST_PROFILE) {
            self.host_profile = Some(profile.parse()?);
        }
        Ok(self)
    }

    /// Directory holding finished rootfs tarballs.
    pub fn rootfs_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("rootfs")
    }

    /// Directory holding per-reference OCI layouts.
    pub fn layout_dir(&self) -> PathBuf {
        self.cache_dir.join("oci")
    }

    /// Path of the persistent registry credential file.
    pub fn credentials_path(&self) -> PathBuf {
        self.cache_dir.join("auth").join("credentials.json")
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".boxroot")
}
