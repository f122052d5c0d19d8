//! Layer extraction.
//!
//! Layers are applied bottom to top onto one directory. Each layer goes
//! through a chain of strategies chosen by the [`HostProfile`]:
//!
//! ```text
//! Constrained:  Stream -> NonStream -> ExternalTool -> ExtractionError
//! Standard:     ExternalTool -> Stream -> NonStream -> ExtractionError
//! ```
//!
//! The in-process strategies filter every member (whiteouts, device nodes,
//! unsafe names, hard links) and retry failed members with plain filesystem
//! calls, so a single bad member never fails a layer.

use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use boxroot_core::error::{BoxError, Result};
use boxroot_core::HostProfile;
use tar::{Archive, Entries, Entry, EntryType};

use super::compression::Compression;
use super::path::{is_safe_member_name, resolve_in_root};
use super::tar_tool::{extract_with_tar, TarExit};
use super::whiteout::{apply_whiteouts, is_whiteout, scan_whiteouts};
use crate::oci::OciImage;
use crate::tools::ToolCapabilities;

/// One way of applying a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Decode and unpack in a single pass
    Stream,
    /// Decode into a temporary file first, then unpack with seeking
    NonStream,
    /// Run the external `tar` binary
    ExternalTool,
}

impl Strategy {
    /// Order in which strategies are attempted on a host.
    pub fn chain(profile: HostProfile) -> &'static [Strategy] {
        match profile {
            HostProfile::Constrained => &[Strategy::Stream, Strategy::NonStream, Strategy::ExternalTool],
            HostProfile::Standard => &[Strategy::ExternalTool, Strategy::Stream, Strategy::NonStream],
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Stream => "stream",
            Strategy::NonStream => "non-stream",
            Strategy::ExternalTool => "external-tool",
        })
    }
}

/// Result of one strategy attempt.
#[derive(Debug)]
pub enum StrategyOutcome {
    Extracted,
    /// The external tool exited with status 2
    ExtractedWithWarnings,
    Failed(String),
}

/// What to do with one archive member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecision {
    Extract,
    /// Materialize as a copy of the already-extracted target
    HardlinkCopy,
    /// Union-filesystem marker, never written
    Whiteout,
    /// Device node, FIFO or archive metadata
    SkipSpecial,
    /// Absolute name or `..` component
    RejectUnsafe,
}

/// Classify a member by name and type.
pub fn classify_entry(name: &str, kind: EntryType) -> EntryDecision {
    if is_whiteout(name) {
        return EntryDecision::Whiteout;
    }
    match kind {
        EntryType::Char
        | EntryType::Block
        | EntryType::Fifo
        | EntryType::XGlobalHeader
        | EntryType::XHeader => return EntryDecision::SkipSpecial,
        _ => {}
    }
    if !is_safe_member_name(name) {
        return EntryDecision::RejectUnsafe;
    }
    if kind == EntryType::Link {
        EntryDecision::HardlinkCopy
    } else {
        EntryDecision::Extract
    }
}

/// Mode applied on constrained hosts: `0755` for directories and anything
/// with an execute bit, `0644` otherwise.
pub fn constrained_mode(mode: u32, is_dir: bool) -> u32 {
    if is_dir || mode & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

/// Per-layer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerReport {
    pub layer: String,
    pub strategy: Option<Strategy>,
    /// Members written (in-process strategies only)
    pub entries: usize,
    /// Whiteout markers seen and not materialized
    pub whiteouts: usize,
    /// Lower-layer paths deleted by whiteouts
    pub removed: usize,
    /// Device, FIFO, metadata and unsafe members
    pub skipped: usize,
    /// Members written by the manual fallback
    pub fallbacks: usize,
    /// Hard links whose target did not exist
    pub dropped_links: usize,
    /// The external tool reported warnings
    pub warnings: bool,
}

/// Applies image layers onto a rootfs directory.
pub struct LayerExtractor {
    profile: HostProfile,
    tools: Arc<ToolCapabilities>,
    apply_whiteouts: bool,
}

impl LayerExtractor {
    pub fn new(profile: HostProfile, tools: Arc<ToolCapabilities>) -> Self {
        Self {
            profile,
            tools,
            apply_whiteouts: true,
        }
    }

    /// Disable whiteout deletion; markers are then only skipped.
    pub fn with_whiteouts(mut self, apply: bool) -> Self {
        self.apply_whiteouts = apply;
        self
    }

    pub fn profile(&self) -> HostProfile {
        self.profile
    }

    /// Extract every layer of `image` into `rootfs`, in manifest order.
    pub fn extract_image(&self, image: &OciImage, rootfs: &Path) -> Result<Vec<LayerReport>> {
        fs::create_dir_all(rootfs)?;
        let total = image.layers().len();
        tracing::info!(
            rootfs = %rootfs.display(),
            layers = total,
            profile = %self.profile,
            "Extracting image layers"
        );

        let mut reports = Vec::with_capacity(total);
        for (index, layer) in image.layers().iter().enumerate() {
            tracing::info!(
                layer = %layer.digest,
                position = index + 1,
                total,
                "Extracting layer"
            );
            let mut report = self.extract_layer(&layer.path, rootfs, index == 0)?;
            report.layer = layer.digest.clone();
            reports.push(report);
        }
        Ok(reports)
    }

    /// Extract one layer blob into `rootfs`.
    pub fn extract_layer(&self, layer: &Path, rootfs: &Path, first_layer: bool) -> Result<LayerReport> {
        let compression = Compression::detect(layer).map_err(|e| BoxError::ExtractionError {
            layer: layer.display().to_string(),
            message: format!("cannot read layer: {}", e),
        })?;
        tracing::debug!(layer = %layer.display(), compression = %compression, "Detected layer compression");

        let mut report = LayerReport {
            layer: layer.display().to_string(),
            ..LayerReport::default()
        };

        if self.apply_whiteouts && !first_layer {
            report.removed = self.apply_layer_whiteouts(layer, compression, rootfs);
        }

        let mut failures = Vec::new();
        for &strategy in Strategy::chain(self.profile) {
            let mut attempt = LayerReport {
                layer: report.layer.clone(),
                removed: report.removed,
                ..LayerReport::default()
            };
            match self.run_strategy(strategy, layer, compression, rootfs, first_layer, &mut attempt) {
                StrategyOutcome::Extracted | StrategyOutcome::ExtractedWithWarnings => {
                    attempt.strategy = Some(strategy);
                    self.log_layer_summary(&attempt);
                    return Ok(attempt);
                }
                StrategyOutcome::Failed(reason) => {
                    tracing::warn!(
                        layer = %layer.display(),
                        strategy = %strategy,
                        reason = %reason,
                        "Extraction strategy failed"
                    );
                    failures.push(format!("{}: {}", strategy, reason));
                }
            }
        }

        Err(BoxError::ExtractionError {
            layer: layer.display().to_string(),
            message: failures.join("; "),
        })
    }

    fn run_strategy(
        &self,
        strategy: Strategy,
        layer: &Path,
        compression: Compression,
        rootfs: &Path,
        first_layer: bool,
        report: &mut LayerReport,
    ) -> StrategyOutcome {
        match strategy {
            Strategy::Stream => match compression.open(layer, false) {
                Ok(reader) => {
                    let mut archive = Archive::new(reader);
                    match archive.entries() {
                        Ok(entries) => self.apply_entries(entries, rootfs, report),
                        Err(e) => StrategyOutcome::Failed(e.to_string()),
                    }
                }
                Err(e) => StrategyOutcome::Failed(e.to_string()),
            },
            Strategy::NonStream => match decode_to_tempfile(layer, compression) {
                Ok(file) => {
                    let mut archive = Archive::new(file);
                    match archive.entries_with_seek() {
                        Ok(entries) => self.apply_entries(entries, rootfs, report),
                        Err(e) => StrategyOutcome::Failed(e.to_string()),
                    }
                }
                Err(e) => StrategyOutcome::Failed(e.to_string()),
            },
            Strategy::ExternalTool => {
                match extract_with_tar(&self.tools, layer, rootfs, compression, self.profile, first_layer) {
                    Ok(run) if run.exit.is_extracted() => {
                        report.warnings = run.exit == TarExit::Warnings;
                        if report.warnings {
                            StrategyOutcome::ExtractedWithWarnings
                        } else {
                            StrategyOutcome::Extracted
                        }
                    }
                    Ok(run) => StrategyOutcome::Failed(format!("tar exited with {:?}", run.exit)),
                    Err(reason) => StrategyOutcome::Failed(reason),
                }
            }
        }
    }

    fn apply_layer_whiteouts(&self, layer: &Path, compression: Compression, rootfs: &Path) -> usize {
        let scanned = compression
            .open(layer, true)
            .and_then(|reader| scan_whiteouts(&mut Archive::new(reader)));
        match scanned {
            Ok(whiteouts) if whiteouts.is_empty() => 0,
            Ok(whiteouts) => {
                let removed = apply_whiteouts(rootfs, &whiteouts);
                tracing::debug!(
                    layer = %layer.display(),
                    markers = whiteouts.len(),
                    removed,
                    "Applied whiteouts"
                );
                removed
            }
            Err(e) => {
                tracing::warn!(layer = %layer.display(), error = %e, "Could not scan layer for whiteouts");
                0
            }
        }
    }

    /// Walk the archive. Only an unreadable archive fails the strategy.
    fn apply_entries<R: Read>(
        &self,
        entries: Entries<'_, R>,
        rootfs: &Path,
        report: &mut LayerReport,
    ) -> StrategyOutcome {
        for entry in entries {
            let mut entry = match entry {
                Ok(entry) => entry,
                Err(e) => return StrategyOutcome::Failed(format!("corrupt archive: {}", e)),
            };
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let kind = entry.header().entry_type();

            match classify_entry(&name, kind) {
                EntryDecision::Whiteout => report.whiteouts += 1,
                EntryDecision::SkipSpecial => {
                    tracing::debug!(member = %name, "Skipping special member");
                    report.skipped += 1;
                }
                EntryDecision::RejectUnsafe => {
                    tracing::warn!(member = %name, "Skipping unsafe member path");
                    report.skipped += 1;
                }
                EntryDecision::HardlinkCopy => self.copy_hardlink(&entry, &name, rootfs, report),
                EntryDecision::Extract => self.unpack_member(&mut entry, &name, rootfs, report),
            }
        }
        StrategyOutcome::Extracted
    }

    fn unpack_member<R: Read>(
        &self,
        entry: &mut Entry<'_, R>,
        name: &str,
        rootfs: &Path,
        report: &mut LayerReport,
    ) {
        let Some(target) = resolve_in_root(rootfs, name) else {
            tracing::warn!(member = %name, "Member path escapes the rootfs");
            report.skipped += 1;
            return;
        };
        if target == rootfs {
            return;
        }
        let kind = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o644);

        // Unpacking a directory over a link would chmod the link's target
        if kind.is_dir() && is_symlink(&target) {
            tracing::debug!(member = %name, "Directory entry over a symlink, keeping the link");
            report.entries += 1;
            return;
        }

        let unpacked = ensure_parent(&target).and_then(|_| entry.unpack(&target).map(|_| ()));
        match unpacked {
            Ok(()) => {
                report.entries += 1;
                if self.profile.is_constrained() && !kind.is_symlink() {
                    set_mode_quietly(&target, constrained_mode(mode, kind.is_dir()));
                }
            }
            Err(e) => {
                tracing::debug!(member = %name, error = %e, "Member extraction failed, retrying manually");
                match self.manual_extract(entry, &target, kind, mode) {
                    Ok(()) => {
                        report.entries += 1;
                        report.fallbacks += 1;
                    }
                    Err(e) => {
                        tracing::debug!(member = %name, error = %e, "Manual extraction failed");
                        report.skipped += 1;
                    }
                }
            }
        }
    }

    /// Direct filesystem fallback for a member the archive reader could not write.
    fn manual_extract<R: Read>(
        &self,
        entry: &mut Entry<'_, R>,
        target: &Path,
        kind: EntryType,
        mode: u32,
    ) -> io::Result<()> {
        ensure_parent(target)?;
        if kind.is_dir() {
            if fs::symlink_metadata(target).map(|m| !m.is_dir()).unwrap_or(false) {
                fs::remove_file(target)?;
            }
            fs::create_dir_all(target)?;
            set_mode_quietly(target, 0o755);
        } else if kind.is_symlink() {
            let link = entry
                .link_name()?
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "symlink without target"))?
                .into_owned();
            remove_existing(target)?;
            std::os::unix::fs::symlink(link, target)?;
        } else {
            let size = entry.size();
            // A failed chmod after a complete write leaves the data in place.
            let already_written = fs::symlink_metadata(target)
                .map(|m| m.is_file() && m.len() == size)
                .unwrap_or(false);
            if !already_written {
                remove_existing(target)?;
                let mut file = fs::File::create(target)?;
                io::copy(entry, &mut file)?;
            }
            set_mode_quietly(target, constrained_mode(mode, false));
        }
        Ok(())
    }

    fn copy_hardlink<R: Read>(
        &self,
        entry: &Entry<'_, R>,
        name: &str,
        rootfs: &Path,
        report: &mut LayerReport,
    ) {
        let link = match entry.link_name() {
            Ok(Some(link)) => link.to_string_lossy().into_owned(),
            _ => {
                tracing::debug!(member = %name, "Hard link without a target");
                report.dropped_links += 1;
                return;
            }
        };
        let (Some(target), Some(source)) = (resolve_in_root(rootfs, name), resolve_in_root(rootfs, &link))
        else {
            tracing::warn!(member = %name, link = %link, "Skipping unsafe hard link");
            report.skipped += 1;
            return;
        };

        let source_is_file = fs::symlink_metadata(&source).map(|m| m.is_file()).unwrap_or(false);
        if !source_is_file {
            tracing::debug!(member = %name, link = %link, "Hard link target not extracted yet, dropping link");
            report.dropped_links += 1;
            return;
        }

        let copied = ensure_parent(&target)
            .and_then(|_| remove_existing(&target))
            .and_then(|_| fs::copy(&source, &target).map(|_| ()));
        match copied {
            Ok(()) => {
                report.entries += 1;
                tracing::trace!(member = %name, link = %link, "Hard link materialized as copy");
            }
            Err(e) => {
                tracing::debug!(member = %name, error = %e, "Hard link copy failed");
                report.skipped += 1;
            }
        }
    }

    fn log_layer_summary(&self, report: &LayerReport) {
        tracing::debug!(
            layer = %report.layer,
            entries = report.entries,
            skipped = report.skipped,
            fallbacks = report.fallbacks,
            dropped_links = report.dropped_links,
            "Layer extracted"
        );
        if report.whiteouts > 0 {
            if self.apply_whiteouts {
                tracing::info!(
                    layer = %report.layer,
                    markers = report.whiteouts,
                    removed = report.removed,
                    "Processed whiteout markers"
                );
            } else {
                tracing::warn!(
                    layer = %report.layer,
                    markers = report.whiteouts,
                    "Skipped whiteout markers; lower-layer deletions not applied"
                );
            }
        }
    }
}

/// Fully decode a layer into an anonymous temporary file, rewound to the start.
fn decode_to_tempfile(layer: &Path, compression: Compression) -> io::Result<fs::File> {
    let mut reader = compression.open(layer, true)?;
    let mut file = tempfile::tempfile()?;
    io::copy(&mut reader, &mut file)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Remove a non-directory at `path` so it can be replaced.
fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} is a directory", path.display()),
        )),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

fn set_mode_quietly(path: &Path, mode: u32) {
    if is_symlink(path) {
        return;
    }
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        tracing::debug!(path = %path.display(), mode = %format!("{:o}", mode), error = %e, "chmod failed");
    }
}
