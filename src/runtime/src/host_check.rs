//! Host profile detection.
//!
//! Decides whether the current host is a regular Linux system or a
//! sandbox-only environment (Android/Termux under proot) where device nodes,
//! ownership changes and hard links are unavailable.

use std::path::Path;

use boxroot_core::config::PullConfig;
use boxroot_core::HostProfile;

/// Observable facts about the host used to pick a [`HostProfile`].
#[derive(Debug, Clone, Default)]
pub struct HostIndicators {
    /// Current working directory
    pub cwd: String,
    /// `/system/build.prop` exists
    pub has_build_prop: bool,
    /// `/data/data/com.termux` exists
    pub has_termux_data: bool,
    /// `ANDROID_DATA` is set
    pub android_data: bool,
    /// `TERMUX_VERSION` is set
    pub termux_version: bool,
    /// Value of `PREFIX`
    pub prefix: String,
}

impl HostIndicators {
    /// Gather indicators from the running process.
    pub fn from_host() -> Self {
        Self {
            cwd: std::env::current_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            has_build_prop: Path::new("/system/build.prop").exists(),
            has_termux_data: Path::new("/data/data/com.termux").exists(),
            android_data: std::env::var_os("ANDROID_DATA").is_some(),
            termux_version: std::env::var_os("TERMUX_VERSION").is_some(),
            prefix: std::env::var("PREFIX").unwrap_or_default(),
        }
    }

    /// Classify the host. Any single Android/Termux indicator is enough.
    pub fn profile(&self) -> HostProfile {
        let constrained = self.cwd.contains("/data/data/com.termux")
            || self.has_build_prop
            || self.has_termux_data
            || self.android_data
            || self.termux_version
            || self.prefix.contains("com.termux");

        if constrained {
            HostProfile::Constrained
        } else {
            HostProfile::Standard
        }
    }
}

/// Detect the host profile from the running environment.
pub fn detect_host_profile() -> HostProfile {
    let profile = HostIndicators::from_host().profile();
    tracing::debug!(profile = %profile, "Detected host profile");
    profile
}

/// Resolve the profile for a pull: an explicit config value wins over detection.
pub fn resolve_host_profile(config: &PullConfig) -> HostProfile {
    match config.host_profile {
        Some(profile) => {
            tracing::debug!(profile = %profile, "Using configured host profile");
            profile
        }
        None => detect_host_profile(),
    }
}
