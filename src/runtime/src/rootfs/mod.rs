//! Rootfs materialization.
//!
//! Turns the layers of an assembled OCI layout into a directory tree a
//! user-space sandbox can run: layer extraction with union-filesystem
//! semantics, validation, sandbox scaffold, config sidecar and archiving.

mod archive;
mod compression;
mod extract;
mod path;
mod scaffold;
mod sidecar;
mod tar_tool;
mod validate;
mod whiteout;

pub use archive::create_rootfs_archive;
pub use compression::Compression;
pub use extract::{
    classify_entry, constrained_mode, EntryDecision, LayerExtractor, LayerReport, Strategy,
    StrategyOutcome,
};
pub use path::{is_safe_member_name, resolve_in_root};
pub use scaffold::{RootfsScaffold, SandboxLayout};
pub use sidecar::{read_image_config, write_image_config, IMAGE_CONFIG_FILE};
pub use tar_tool::{TarExit, TarRun};
pub use validate::RootfsValidator;
pub use whiteout::{is_whiteout, parse_whiteout, Whiteout, OPAQUE_MARKER};
