//! Archive member paths resolved inside a rootfs.
//!
//! Layers routinely contain symlinks such as `bin -> /usr/bin`. Joining a
//! member name onto the rootfs and letting the host follow those links would
//! write outside the tree, so intermediate symlinks are followed here with the
//! rootfs as `/`.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Symlink hops allowed while resolving one path (matches Linux `MAXSYMLINKS`).
const MAX_SYMLINK_HOPS: usize = 40;

enum Step {
    Name(OsString),
    Up,
}

/// Whether an archive member name may be materialized at all.
///
/// Absolute names and names with a `..` component are unsafe.
pub fn is_safe_member_name(name: &str) -> bool {
    !name.starts_with('/')
        && !Path::new(name)
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
}

fn member_components(name: &str) -> Option<Vec<OsString>> {
    if !is_safe_member_name(name) {
        return None;
    }
    Some(
        Path::new(name)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_os_string()),
                _ => None,
            })
            .collect(),
    )
}

/// Host path for `name` inside `root`.
///
/// Every component but the last is resolved against `root`: absolute symlink
/// targets are re-rooted and `..` never climbs above `root`. The final
/// component is not followed, so callers replace links instead of writing
/// through them. Returns `None` for unsafe names or symlink loops.
pub fn resolve_in_root(root: &Path, name: &str) -> Option<PathBuf> {
    let mut parts = member_components(name)?;
    let last = match parts.pop() {
        Some(last) => last,
        None => return Some(root.to_path_buf()),
    };

    let mut resolved: Vec<OsString> = Vec::new();
    let mut pending: VecDeque<Step> = parts.into_iter().map(Step::Name).collect();
    let mut hops = 0;

    while let Some(step) = pending.pop_front() {
        let part = match step {
            Step::Up => {
                resolved.pop();
                continue;
            }
            Step::Name(part) => part,
        };

        resolved.push(part);
        let candidate = join_all(root, &resolved);
        let is_link = std::fs::symlink_metadata(&candidate)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            tracing::debug!(member = name, "Symlink loop while resolving member path");
            return None;
        }
        let target = std::fs::read_link(&candidate).ok()?;
        resolved.pop();
        if target.is_absolute() {
            resolved.clear();
        }
        for component in target.components().rev() {
            match component {
                Component::Normal(p) => pending.push_front(Step::Name(p.to_os_string())),
                Component::ParentDir => pending.push_front(Step::Up),
                _ => {}
            }
        }
    }

    resolved.push(last);
    Some(join_all(root, &resolved))
}

fn join_all(root: &Path, parts: &[OsString]) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(parts);
    path
}
