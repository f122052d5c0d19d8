//! OCI image acquisition.
//!
//! Talks the registry v2 protocol through an external HTTP client, reconciles
//! Docker, legacy and OCI manifest formats, and assembles an on-disk OCI
//! image layout that the [`rootfs`](crate::rootfs) module extracts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    OCI Image Layout                          │
//! │                                                              │
//! │  oci/<hash16>/                                               │
//! │  ├── oci-layout           (OCI layout marker)               │
//! │  ├── index.json           (written last, commit marker)     │
//! │  └── blobs/                                                 │
//! │      └── sha256/                                            │
//! │          ├── <manifest>   (normalized image manifest)       │
//! │          ├── <config>     (normalized image configuration)  │
//! │          └── <layers>     (filesystem layers)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod credentials;
mod image;
pub mod layout;
pub mod manifest;
pub mod normalize;
pub mod platform;
mod pull;
pub mod reference;
pub mod registry;
pub mod transport;

pub use auth::{AuthNegotiator, AuthState, Challenge, RegistryAuth};
pub use credentials::CredentialStore;
pub use image::{LayerBlob, OciImage, OciImageConfig};
pub use layout::{LayoutAssembly, OciLayoutWriter};
pub use manifest::{Descriptor, ImageManifest, Manifest, ManifestIndex, ManifestKind};
pub use normalize::{normalize_config, to_oci, OciManifest};
pub use platform::Platform;
pub use pull::{ImagePuller, PulledImage};
pub use reference::ImageReference;
pub use registry::{BlobFetch, BlobSource, RegistryClient};
pub use transport::{CurlTransport, HttpRequest, HttpResponse, HttpTransport};
