//! boxroot runtime - image acquisition and rootfs materialization.
//!
//! Pulls an image from a registry v2 endpoint, assembles it as an OCI layout
//! and extracts it into a root filesystem that a user-space sandbox can run,
//! on regular Linux hosts as well as constrained ones (Termux, proot).

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod host_check;
pub mod oci;
pub mod rootfs;
pub mod tools;

// Re-export common types
pub use cache::{CacheInfo, ImageCache};
pub use host_check::{detect_host_profile, resolve_host_profile};
pub use oci::{CredentialStore, ImagePuller, ImageReference, PulledImage, RegistryAuth};
pub use oci::{OciImage, OciImageConfig, OciLayoutWriter, Platform, RegistryClient};
pub use oci::{CurlTransport, HttpTransport};
pub use rootfs::{LayerExtractor, LayerReport, RootfsScaffold, RootfsValidator, Strategy};
pub use tools::ToolCapabilities;

/// boxroot runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
