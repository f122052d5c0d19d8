//! Union-filesystem whiteout markers.
//!
//! A layer deletes a path from the layers below it by shipping an empty
//! `.wh.<name>` entry next to it, and hides a whole lower directory with
//! `<dir>/.wh..wh..opq`. Markers themselves are never materialized.

use std::fs;
use std::io::Read;
use std::path::Path;

use super::path::resolve_in_root;

/// Prefix of every whiteout marker file name.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker that hides the lower contents of its directory.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// What a whiteout marker asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Whiteout {
    /// Remove this path (relative to the rootfs)
    Remove(String),
    /// Empty this directory (relative to the rootfs, "" for the root)
    Opaque(String),
}

/// Whether an archive member name is a whiteout marker.
pub fn is_whiteout(name: &str) -> bool {
    name.starts_with(WHITEOUT_PREFIX) || name.contains("/.wh.")
}

/// Interpret a marker name. `None` for ordinary members.
pub fn parse_whiteout(name: &str) -> Option<Whiteout> {
    if !is_whiteout(name) {
        return None;
    }
    let name = name.trim_start_matches("./");
    let (dir, file) = match name.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", name),
    };
    if file == OPAQUE_MARKER {
        return Some(Whiteout::Opaque(dir.to_string()));
    }
    let victim = file.strip_prefix(WHITEOUT_PREFIX)?;
    // `.wh.` in a parent directory name marks nothing we can act on
    if victim.is_empty() || dir.split('/').any(|part| part.starts_with(WHITEOUT_PREFIX)) {
        return None;
    }
    Some(Whiteout::Remove(if dir.is_empty() {
        victim.to_string()
    } else {
        format!("{}/{}", dir, victim)
    }))
}

/// Collect the whiteouts of one layer without extracting anything.
pub fn scan_whiteouts<R: Read>(archive: &mut tar::Archive<R>) -> std::io::Result<Vec<Whiteout>> {
    let mut found = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if let Some(whiteout) = parse_whiteout(&name) {
            found.push(whiteout);
        }
    }
    Ok(found)
}

/// Apply whiteouts to the rootfs built from the lower layers.
///
/// Returns the number of paths removed. Missing victims are not an error.
pub fn apply_whiteouts(rootfs: &Path, whiteouts: &[Whiteout]) -> usize {
    let mut removed = 0;
    for whiteout in whiteouts {
        match whiteout {
            Whiteout::Remove(victim) => {
                let Some(path) = resolve_in_root(rootfs, victim) else {
                    continue;
                };
                if path == rootfs {
                    continue;
                }
                match remove_path(&path) {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "Whiteout removal failed")
                    }
                }
            }
            Whiteout::Opaque(dir) => {
                let Some(path) = resolve_in_root(rootfs, dir) else {
                    continue;
                };
                let Ok(entries) = fs::read_dir(&path) else {
                    continue;
                };
                for entry in entries.flatten() {
                    match remove_path(&entry.path()) {
                        Ok(true) => removed += 1,
                        Ok(false) => {}
                        Err(e) => tracing::debug!(
                            path = %entry.path().display(),
                            error = %e,
                            "Opaque whiteout removal failed"
                        ),
                    }
                }
            }
        }
    }
    removed
}

/// Remove a file, symlink or directory tree without following links.
fn remove_path(path: &Path) -> std::io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map(|_| true),
        Ok(_) => fs::remove_file(path).map(|_| true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
