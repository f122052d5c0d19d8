//! Sanity checks on an extracted rootfs.

use std::fs;
use std::path::Path;

use boxroot_core::error::{BoxError, Result};
use boxroot_core::HostProfile;

use super::path::resolve_in_root;

const SHELLS: &[&str] = &["/bin/sh", "/bin/bash", "/bin/ash"];
const LIBRARY_DIRS: &[&str] = &["/lib", "/lib64", "/usr/lib"];
const BASIC_DIRS: &[&str] = &["bin", "usr", "lib", "etc", "var"];

/// Checks that an extracted tree can plausibly run a shell.
#[derive(Debug, Clone, Copy)]
pub struct RootfsValidator {
    profile: HostProfile,
}

impl RootfsValidator {
    pub fn new(profile: HostProfile) -> Self {
        Self { profile }
    }

    /// Descriptions of what is missing. Empty means the tree passed.
    ///
    /// On constrained hosts only an empty tree is reported; many images use
    /// non-standard layouts there, so missing basics are only a warning.
    pub fn missing(&self, rootfs: &Path) -> Vec<String> {
        match self.profile {
            HostProfile::Constrained => self.missing_constrained(rootfs),
            HostProfile::Standard => self.missing_standard(rootfs),
        }
    }

    /// Fail with [`BoxError::ValidationError`] listing everything missing.
    pub fn validate(&self, rootfs: &Path) -> Result<()> {
        let missing = self.missing(rootfs);
        if missing.is_empty() {
            tracing::debug!(rootfs = %rootfs.display(), profile = %self.profile, "Rootfs validation passed");
            return Ok(());
        }
        tracing::error!(
            rootfs = %rootfs.display(),
            missing = %missing.join(", "),
            "Missing critical files after extraction"
        );
        Err(BoxError::ValidationError(missing))
    }

    fn missing_constrained(&self, rootfs: &Path) -> Vec<String> {
        if !has_entries(rootfs) {
            return vec!["rootfs is empty".to_string()];
        }
        let has_basic = BASIC_DIRS
            .iter()
            .any(|dir| fs::symlink_metadata(rootfs.join(dir)).is_ok());
        if !has_basic {
            tracing::warn!(
                rootfs = %rootfs.display(),
                "Rootfs has none of the basic directories ({}); some images use non-standard layouts",
                BASIC_DIRS.join(", ")
            );
        }
        Vec::new()
    }

    fn missing_standard(&self, rootfs: &Path) -> Vec<String> {
        let mut missing = Vec::new();

        // Symlinked shells (`/bin/sh -> busybox`) count even when dangling on the host.
        let has_shell = SHELLS
            .iter()
            .filter_map(|shell| resolve_in_root(rootfs, shell.trim_start_matches('/')))
            .any(|path| fs::symlink_metadata(path).is_ok());
        if !has_shell {
            missing.push(format!("shell (checked: {})", SHELLS.join(", ")));
        }

        let has_libs = LIBRARY_DIRS
            .iter()
            .any(|dir| has_entries_in_root(rootfs, dir));
        if !has_libs {
            missing.push(format!(
                "library directory (checked: {})",
                LIBRARY_DIRS.join(", ")
            ));
        }

        if !has_entries_in_root(rootfs, "/usr/bin") {
            missing.push("/usr/bin directory".to_string());
        }

        missing
    }
}

/// A directory with at least one entry. Symlinks (`/lib -> usr/lib`) are
/// followed inside the rootfs, never on the host.
fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn has_entries_in_root(rootfs: &Path, absolute: &str) -> bool {
    let probe = format!("{}/probe", absolute.trim_start_matches('/'));
    resolve_in_root(rootfs, &probe)
        .and_then(|path| path.parent().map(Path::to_path_buf))
        .map(|dir| has_entries(&dir))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populated_rootfs() -> TempDir {
        let root = TempDir::new().unwrap();
        for dir in ["bin", "lib", "usr/bin"] {
            fs::create_dir_all(root.path().join(dir)).unwrap();
        }
        fs::write(root.path().join("bin/ash"), "").unwrap();
        fs::write(root.path().join("lib/libc.so"), "").unwrap();
        fs::write(root.path().join("usr/bin/env"), "").unwrap();
        root
    }

    #[test]
    fn test_standard_passes() {
        let root = populated_rootfs();
        let validator = RootfsValidator::new(HostProfile::Standard);
        assert!(validator.missing(root.path()).is_empty());
        assert!(validator.validate(root.path()).is_ok());
    }

    #[test]
    fn test_standard_failure_names_checked_shells() {
        let root = populated_rootfs();
        fs::remove_file(root.path().join("bin/ash")).unwrap();

        let err = RootfsValidator::new(HostProfile::Standard)
            .validate(root.path())
            .unwrap_err();
        match err {
            BoxError::ValidationError(missing) => {
                assert_eq!(missing, vec!["shell (checked: /bin/sh, /bin/bash, /bin/ash)"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_standard_empty_tree_reports_everything() {
        let root = TempDir::new().unwrap();
        let missing = RootfsValidator::new(HostProfile::Standard).missing(root.path());
        assert_eq!(
            missing,
            vec![
                "shell (checked: /bin/sh, /bin/bash, /bin/ash)",
                "library directory (checked: /lib, /lib64, /usr/lib)",
                "/usr/bin directory",
            ]
        );
    }

    #[test]
    fn test_empty_library_dir_does_not_count() {
        let root = populated_rootfs();
        fs::remove_file(root.path().join("lib/libc.so")).unwrap();
        let missing = RootfsValidator::new(HostProfile::Standard).missing(root.path());
        assert_eq!(missing.len(), 1);
        assert!(missing[0].starts_with("library directory"));
    }

    #[test]
    fn test_dangling_shell_symlink_counts() {
        let root = populated_rootfs();
        fs::remove_file(root.path().join("bin/ash")).unwrap();
        std::os::unix::fs::symlink("/bin/busybox", root.path().join("bin/sh")).unwrap();
        assert!(RootfsValidator::new(HostProfile::Standard)
            .missing(root.path())
            .is_empty());
    }

    #[test]
    fn test_library_symlink_resolved_inside_rootfs() {
        let root = populated_rootfs();
        fs::remove_dir_all(root.path().join("lib")).unwrap();
        fs::create_dir_all(root.path().join("usr/lib")).unwrap();
        fs::write(root.path().join("usr/lib/libc.so"), "").unwrap();
        std::os::unix::fs::symlink("/usr/lib", root.path().join("lib")).unwrap();
        assert!(RootfsValidator::new(HostProfile::Standard)
            .missing(root.path())
            .is_empty());

        fs::remove_file(root.path().join("usr/lib/libc.so")).unwrap();
        let missing = RootfsValidator::new(HostProfile::Standard).missing(root.path());
        assert_eq!(missing.len(), 1);
    }

    #[test]
    fn test_constrained_is_relaxed() {
        let root = TempDir::new().unwrap();
        let validator = RootfsValidator::new(HostProfile::Constrained);
        assert_eq!(validator.missing(root.path()), vec!["rootfs is empty"]);
        assert!(validator.validate(root.path()).is_err());

        // No shell, no libraries, no basic directories: still accepted
        fs::write(root.path().join("app"), "").unwrap();
        assert!(validator.missing(root.path()).is_empty());
        assert!(validator.validate(root.path()).is_ok());
    }
}
