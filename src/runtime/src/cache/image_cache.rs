//! Flat cache of rootfs archives.
//!
//! One gzip tarball per image reference, stored as
//! `<cache_dir>/<name>_<hash16>.tar.gz` with a JSON `.info` record next to
//! it. An entry counts as cached only when both files are readable.

use std::path::{Path, PathBuf};

use boxroot_core::error::{BoxError, Result};
use serde::{Deserialize, Serialize};

use crate::oci::ImageReference;

const ARCHIVE_SUFFIX: &str = ".tar.gz";
const INFO_SUFFIX: &str = ".info";

/// Record written next to a cached archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// Reference the archive was built from
    pub image_url: String,
    /// Archive location
    pub cache_path: PathBuf,
    /// Creation time as Unix seconds
    pub created_time: f64,
    /// Creation time, local, `%Y-%m-%d %H:%M:%S`
    pub created_time_str: String,
}

/// A listed cache entry.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// `None` when the `.info` record is missing or unreadable
    pub info: Option<CacheInfo>,
}

/// Cache of rootfs archives keyed by image reference.
pub struct ImageCache {
    cache_dir: PathBuf,
}

impl ImageCache {
    /// Open (and create) a cache directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            BoxError::CacheError(format!(
                "Failed to create image cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Archive path for a reference.
    pub fn cache_path(&self, reference: &ImageReference) -> PathBuf {
        self.cache_dir.join(format!(
            "{}_{}{}",
            reference.short_name(),
            reference.cache_key(),
            ARCHIVE_SUFFIX
        ))
    }

    fn info_path(&self, reference: &ImageReference) -> PathBuf {
        info_path_for(&self.cache_path(reference))
    }

    /// Cached archive info, if the reference is cached.
    pub fn get(&self, reference: &ImageReference) -> Result<Option<CacheInfo>> {
        let cache_path = self.cache_path(reference);
        if !cache_path.is_file() {
            return Ok(None);
        }
        match read_info(&self.info_path(reference)) {
            Some(info) => {
                tracing::debug!(
                    reference = %reference,
                    path = %cache_path.display(),
                    created = %info.created_time_str,
                    "Image cache hit"
                );
                Ok(Some(info))
            }
            None => {
                tracing::debug!(reference = %reference, "Cached archive has no readable info record");
                Ok(None)
            }
        }
    }

    pub fn is_cached(&self, reference: &ImageReference) -> bool {
        matches!(self.get(reference), Ok(Some(_)))
    }

    /// Write the `.info` record for an archive already placed at
    /// [`cache_path`](Self::cache_path).
    pub fn record(&self, reference: &ImageReference) -> Result<CacheInfo> {
        let cache_path = self.cache_path(reference);
        if !cache_path.is_file() {
            return Err(BoxError::CacheError(format!(
                "No archive at {} to record",
                cache_path.display()
            )));
        }

        let now = chrono::Utc::now();
        let info = CacheInfo {
            image_url: reference.to_string(),
            cache_path: cache_path.clone(),
            created_time: now.timestamp_millis() as f64 / 1000.0,
            created_time_str: now
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        };

        let info_path = self.info_path(reference);
        std::fs::write(&info_path, serde_json::to_string_pretty(&info)?).map_err(|e| {
            BoxError::CacheError(format!(
                "Failed to write cache info {}: {}",
                info_path.display(),
                e
            ))
        })?;

        tracing::debug!(reference = %reference, path = %cache_path.display(), "Cached rootfs archive");
        Ok(info)
    }

    /// Remove a reference's archive and record. Returns whether anything existed.
    pub fn invalidate(&self, reference: &ImageReference) -> Result<bool> {
        let mut removed = false;
        for path in [self.cache_path(reference), self.info_path(reference)] {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    BoxError::CacheError(format!("Failed to remove {}: {}", path.display(), e))
                })?;
                removed = true;
            }
        }
        if removed {
            tracing::info!(reference = %reference, "Removed image from cache");
        }
        Ok(removed)
    }

    /// All archives in the cache directory, sorted by path.
    pub fn list(&self) -> Result<Vec<CachedImage>> {
        let entries = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            BoxError::CacheError(format!(
                "Failed to read cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        let mut images = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_archive = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(ARCHIVE_SUFFIX));
            if !is_archive || !path.is_file() {
                continue;
            }
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let info = read_info(&info_path_for(&path));
            images.push(CachedImage {
                path,
                size_bytes,
                info,
            });
        }
        images.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(images)
    }

    /// Remove every archive and record. Returns the number of archives removed.
    pub fn clear(&self) -> Result<usize> {
        let images = self.list()?;
        for image in &images {
            std::fs::remove_file(&image.path)?;
            let info = info_path_for(&image.path);
            if info.exists() {
                std::fs::remove_file(info)?;
            }
        }
        tracing::info!(removed = images.len(), "Cleared image cache");
        Ok(images.len())
    }
}

fn info_path_for(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(INFO_SUFFIX);
    PathBuf::from(name)
}

fn read_info(path: &Path) -> Option<CacheInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(info) => Some(info),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read cache info");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reference(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    fn place_archive(cache: &ImageCache, reference: &ImageReference) -> PathBuf {
        let path = cache.cache_path(reference);
        std::fs::write(&path, b"archive").unwrap();
        path
    }

    #[test]
    fn test_cache_path_naming() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::new(tmp.path()).unwrap();
        let alpine = reference("alpine:3.19");

        let path = cache.cache_path(&alpine);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("alpine_"));
        assert!(name.ends_with(".tar.gz"));
        assert_eq!(name.len(), "alpine_".len() + 16 + ".tar.gz".len());

        // Equivalent spellings share an entry
        assert_eq!(path, cache.cache_path(&reference("docker.io/library/alpine:3.19")));
        assert_ne!(path, cache.cache_path(&reference("alpine:3.20")));
    }

    #[test]
    fn test_miss_until_recorded() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::new(tmp.path()).unwrap();
        let alpine = reference("alpine");

        assert!(cache.get(&alpine).unwrap().is_none());
        place_archive(&cache, &alpine);
        // Archive without info record is not a hit
        assert!(!cache.is_cached(&alpine));

        let info = cache.record(&alpine).unwrap();
        assert_eq!(info.cache_path, cache.cache_path(&alpine));
        assert!(info.created_time > 0.0);
        assert_eq!(info.created_time_str.len(), "2024-01-01 00:00:00".len());

        let hit = cache.get(&alpine).unwrap().unwrap();
        assert_eq!(hit, info);
    }

    #[test]
    fn test_record_without_archive_fails() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::new(tmp.path()).unwrap();
        assert!(cache.record(&reference("alpine")).is_err());
    }

    #[test]
    fn test_invalidate() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::new(tmp.path()).unwrap();
        let alpine = reference("alpine");
        place_archive(&cache, &alpine);
        cache.record(&alpine).unwrap();

        assert!(cache.invalidate(&alpine).unwrap());
        assert!(!cache.is_cached(&alpine));
        assert!(!cache.invalidate(&alpine).unwrap());
    }

    #[test]
    fn test_list_and_clear() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::new(tmp.path()).unwrap();
        let alpine = reference("alpine");
        let busybox = reference("busybox");
        place_archive(&cache, &alpine);
        cache.record(&alpine).unwrap();
        place_archive(&cache, &busybox);
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let listed = cache.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|image| image.size_bytes == 7));
        assert_eq!(listed.iter().filter(|image| image.info.is_some()).count(), 1);

        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.list().unwrap().is_empty());
        assert!(tmp.path().join("notes.txt").exists());
    }
}
