//! Cache of finished rootfs archives.
//!
//! OCI layouts are kept per reference under `<cache_dir>/oci/<hash16>` by the
//! puller; this module only tracks the final tarballs.

pub mod image_cache;

pub use image_cache::{CacheInfo, CachedImage, ImageCache};
