//! Host profile shared by extraction, permission handling and validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BoxError;

/// Capabilities class of the host the rootfs is materialized on.
///
/// Computed once at startup and passed explicitly to every component whose
/// behavior differs between hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostProfile {
    /// Regular Linux host: arbitrary modes allowed, external `tar` preferred.
    #[default]
    Standard,
    /// Sandbox-only host (Android/Termux, proot): no device nodes, unreliable
    /// chmod/chown and hard links.
    Constrained,
}

impl HostProfile {
    pub fn is_constrained(self) -> bool {
        matches!(self, HostProfile::Constrained)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HostProfile::Standard => "standard",
            HostProfile::Constrained => "constrained",
        }
    }
}

impl fmt::Display for HostProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostProfile {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(HostProfile::Standard),
            "constrained" | "android" | "termux" => Ok(HostProfile::Constrained),
            other => Err(BoxError::ConfigError(format!(
                "Unknown host profile '{}': expected 'standard' or 'constrained'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_profiles() {
        assert_eq!("standard".parse::<HostProfile>().unwrap(), HostProfile::Standard);
        assert_eq!(" Constrained ".parse::<HostProfile>().unwrap(), HostProfile::Constrained);
        assert_eq!("termux".parse::<HostProfile>().unwrap(), HostProfile::Constrained);
        assert!("lenient".parse::<HostProfile>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&HostProfile::Constrained).unwrap();
        assert_eq!(json, "\"constrained\"");
        let parsed: HostProfile = serde_json::from_str("\"standard\"").unwrap();
        assert_eq!(parsed, HostProfile::Standard);
    }

    #[test]
    fn test_default_is_standard() {
        assert_eq!(HostProfile::default(), HostProfile::Standard);
        assert!(!HostProfile::Standard.is_constrained());
        assert!(HostProfile::Constrained.is_constrained());
    }
}
