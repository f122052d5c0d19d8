//! Target platform selection.

use std::fmt;

use boxroot_core::config::PullConfig;

/// Architecture used when the host machine is not recognized.
const FALLBACK_ARCH: &str = "amd64";

/// OS/architecture pair an image is pulled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    /// Linux on the given architecture (normalized to registry naming).
    pub fn linux(architecture: &str) -> Self {
        Self {
            os: "linux".to_string(),
            architecture: normalize_architecture(architecture),
        }
    }

    /// Linux on the host architecture.
    pub fn host() -> Self {
        Self::linux(&host_architecture())
    }

    /// Configured architecture if any, else the host's.
    pub fn from_config(config: &PullConfig) -> Self {
        match config.architecture.as_deref().map(str::trim) {
            Some(arch) if !arch.is_empty() => Self::linux(arch),
            _ => Self::host(),
        }
    }

    /// Whether a manifest list entry with the given platform fields can run here.
    ///
    /// The OS must be `linux` or absent.
    pub fn matches(&self, os: Option<&str>, architecture: Option<&str>) -> bool {
        let os_ok = match os {
            None | Some("") => true,
            Some(os) => os == self.os,
        };
        os_ok && architecture.map_or(false, |arch| architecture_matches(&self.architecture, arch))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Map machine names (`uname -m` style) onto registry architecture names.
///
/// Unknown names are returned lowercased and unchanged.
pub fn normalize_architecture(machine: &str) -> String {
    let machine = machine.trim().to_ascii_lowercase();
    match known_architecture(&machine) {
        Some(arch) => arch.to_string(),
        None => machine,
    }
}

fn known_architecture(machine: &str) -> Option<&'static str> {
    Some(match machine {
        "x86_64" | "amd64" | "x64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        "arm" | "armv7l" | "armv7" | "armv6l" | "armhf" => "arm",
        "x86" | "i386" | "i486" | "i586" | "i686" | "386" => "386",
        "ppc64le" => "ppc64le",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        _ => return None,
    })
}

/// Architecture of the running host, `amd64` when unrecognized.
pub fn host_architecture() -> String {
    host_architecture_from(std::env::consts::ARCH)
}

fn host_architecture_from(machine: &str) -> String {
    match known_architecture(machine) {
        Some(arch) => arch.to_string(),
        None => {
            tracing::warn!(
                machine,
                fallback = FALLBACK_ARCH,
                "Unrecognized host architecture"
            );
            FALLBACK_ARCH.to_string()
        }
    }
}

/// Architecture equality where `aarch64` and `arm64` are interchangeable.
pub fn architecture_matches(wanted: &str, offered: &str) -> bool {
    let is_arm64 = |a: &str| a == "arm64" || a == "aarch64";
    wanted == offered || (is_arm64(wanted) && is_arm64(offered))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm64_aarch64_interchangeable() {
        assert!(architecture_matches("arm64", "aarch64"));
        assert!(architecture_matches("aarch64", "arm64"));
        assert!(architecture_matches("arm64", "arm64"));
        assert!(architecture_matches("amd64", "amd64"));
    }

    #[test]
    fn test_other_architectures_need_exact_match() {
        assert!(!architecture_matches("amd64", "x86_64"));
        assert!(!architecture_matches("arm", "arm64"));
        assert!(!architecture_matches("386", "amd64"));
    }

    #[test]
    fn test_normalize_architecture() {
        assert_eq!(normalize_architecture("x86_64"), "amd64");
        assert_eq!(normalize_architecture("AARCH64"), "arm64");
        assert_eq!(normalize_architecture("armv7l"), "arm");
        assert_eq!(normalize_architecture("i686"), "386");
        assert_eq!(normalize_architecture("mips64le"), "mips64le");
    }

    #[test]
    fn test_host_architecture_fallback() {
        assert_eq!(host_architecture_from("x86_64"), "amd64");
        assert_eq!(host_architecture_from("aarch64"), "arm64");
        assert_eq!(host_architecture_from("arm"), "arm");
        assert_eq!(host_architecture_from("x86"), "386");
        assert_eq!(host_architecture_from("sparc64"), "amd64");
    }

    #[test]
    fn test_platform_matches_os() {
        let platform = Platform::linux("arm64");
        assert!(platform.matches(Some("linux"), Some("aarch64")));
        assert!(platform.matches(None, Some("arm64")));
        assert!(!platform.matches(Some("windows"), Some("arm64")));
        assert!(!platform.matches(Some("linux"), None));
    }

    #[test]
    fn test_from_config() {
        let config = PullConfig {
            architecture: Some("x86_64".to_string()),
            ..Default::default()
        };
        assert_eq!(Platform::from_config(&config), Platform::linux("amd64"));
        assert_eq!(Platform::from_config(&config).to_string(), "linux/amd64");
    }
}
