//! External tool detection.
//!
//! The registry client shells out to `curl` and the extractor may shell out to
//! `tar`. Probing them is not free, so each answer is computed at most once per
//! [`ToolCapabilities`] instance and the instance is shared by constructor.

use std::process::{Command, Stdio};
use std::sync::OnceLock;

use boxroot_core::config::PullConfig;
use boxroot_core::error::{BoxError, Result};

/// Memoized knowledge about the external `curl` and `tar` binaries.
#[derive(Debug)]
pub struct ToolCapabilities {
    curl_path: String,
    tar_path: String,
    curl_available: OnceLock<bool>,
    tar_available: OnceLock<bool>,
    tar_help: OnceLock<String>,
}

impl ToolCapabilities {
    pub fn new(curl_path: impl Into<String>, tar_path: impl Into<String>) -> Self {
        Self {
            curl_path: curl_path.into(),
            tar_path: tar_path.into(),
            curl_available: OnceLock::new(),
            tar_available: OnceLock::new(),
            tar_help: OnceLock::new(),
        }
    }

    pub fn from_config(config: &PullConfig) -> Self {
        Self::new(config.curl_path.clone(), config.tar_path.clone())
    }

    /// Capabilities with every probe answered up front. Nothing is executed.
    pub fn preset(curl: bool, tar: bool, tar_help: &str) -> Self {
        let caps = Self::new("curl", "tar");
        let _ = caps.curl_available.set(curl);
        let _ = caps.tar_available.set(tar);
        let _ = caps.tar_help.set(tar_help.to_string());
        caps
    }

    pub fn curl_path(&self) -> &str {
        &self.curl_path
    }

    pub fn tar_path(&self) -> &str {
        &self.tar_path
    }

    /// `curl --version` runs successfully.
    pub fn has_curl(&self) -> bool {
        *self
            .curl_available
            .get_or_init(|| probe_version(&self.curl_path))
    }

    /// `tar --version` runs successfully.
    pub fn has_tar(&self) -> bool {
        *self
            .tar_available
            .get_or_init(|| probe_version(&self.tar_path))
    }

    /// Whether `tar --help` mentions the given long option (e.g. `--warning`).
    pub fn tar_supports(&self, option: &str) -> bool {
        let help = self.tar_help.get_or_init(|| {
            if !self.has_tar() {
                return String::new();
            }
            match Command::new(&self.tar_path)
                .arg("--help")
                .stdin(Stdio::null())
                .output()
            {
                Ok(output) => {
                    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                    text
                }
                Err(e) => {
                    tracing::debug!(tar = %self.tar_path, error = %e, "tar --help failed");
                    String::new()
                }
            }
        });
        help.contains(option)
    }

    /// Fail early when the HTTP client is missing.
    pub fn ensure_curl(&self) -> Result<()> {
        if self.has_curl() {
            Ok(())
        } else {
            Err(BoxError::TransportError(format!(
                "'{}' not found or not runnable; install curl to pull images",
                self.curl_path
            )))
        }
    }
}

fn probe_version(program: &str) -> bool {
    let available = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    tracing::debug!(program, available, "Probed external tool");
    available
}
