//! Persistent registry credentials.
//!
//! One JSON file (`<cache_dir>/auth/credentials.json`) maps a registry host to
//! basic credentials. `login` adds or replaces an entry, `logout` drops it.
//! The file is rewritten through a temporary file and a rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use boxroot_core::config::PullConfig;
use boxroot_core::error::{BoxError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Login {
    username: String,
    password: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    logins: BTreeMap<String, Login>,
}

/// Registry credential store backed by a single JSON file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store located under the configured cache directory.
    pub fn from_config(config: &PullConfig) -> Self {
        Self::new(config.credentials_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save credentials for a registry, replacing any previous login.
    pub fn login(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.read()?;
        file.logins.insert(
            registry_key(registry),
            Login {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.write(&file)?;
        tracing::info!(registry = %registry_key(registry), "Stored registry login");
        Ok(())
    }

    /// Forget a registry. Returns whether a login existed.
    pub fn logout(&self, registry: &str) -> Result<bool> {
        let mut file = self.read()?;
        let existed = file.logins.remove(&registry_key(registry)).is_some();
        if existed {
            self.write(&file)?;
        }
        Ok(existed)
    }

    /// Look up `(username, password)` for a registry (scheme and case ignored).
    pub fn lookup(&self, registry: &str) -> Result<Option<(String, String)>> {
        Ok(self
            .read()?
            .logins
            .remove(&registry_key(registry))
            .map(|login| (login.username, login.password)))
    }

    /// Registries with a stored login, sorted.
    pub fn registries(&self) -> Result<Vec<String>> {
        Ok(self.read()?.logins.into_keys().collect())
    }

    fn read(&self) -> Result<CredentialFile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialFile::default())
            }
            Err(e) => {
                return Err(BoxError::ConfigError(format!(
                    "Failed to read credential store {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            BoxError::ConfigError(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(file)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            BoxError::ConfigError(format!(
                "Failed to replace credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Canonical key for a registry: lowercase host, no scheme, Docker Hub aliases merged.
fn registry_key(registry: &str) -> String {
    let host = registry.trim().to_ascii_lowercase();
    let host = host
        .split_once("://")
        .map(|(_, rest)| rest.to_string())
        .unwrap_or(host);
    let host = host.trim_end_matches('/');
    match host {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => "docker.io".to_string(),
        other => other.to_string(),
    }
}
