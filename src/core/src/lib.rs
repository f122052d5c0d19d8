//! boxroot core - foundational types
//!
//! Error taxonomy, acquisition configuration and the host profile shared by
//! every stage of rootfs materialization.

pub mod config;
pub mod error;
pub mod profile;

// Re-export commonly used types
pub use config::PullConfig;
pub use error::{BoxError, Result};
pub use profile::HostProfile;

/// boxroot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
