//! Layer extraction through the external `tar` binary.

use std::path::Path;
use std::process::{Command, Stdio};

use boxroot_core::HostProfile;

use super::compression::Compression;
use crate::tools::ToolCapabilities;

/// Longest stderr excerpt carried into logs and error messages.
const STDERR_LIMIT: usize = 500;

/// Classified exit status of a `tar` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarExit {
    /// Exit 0
    Success,
    /// Exit 2: members were skipped (usually hard links), the bulk is extracted
    Warnings,
    /// Anything else; `None` when killed by a signal
    Failed(Option<i32>),
}

impl TarExit {
    pub fn classify(code: Option<i32>) -> Self {
        match code {
            Some(0) => TarExit::Success,
            Some(2) => TarExit::Warnings,
            other => TarExit::Failed(other),
        }
    }

    /// Whether the layer counts as extracted.
    pub fn is_extracted(self) -> bool {
        !matches!(self, TarExit::Failed(_))
    }
}

/// Result of [`extract_with_tar`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarRun {
    pub exit: TarExit,
    /// The permissive retry was needed
    pub retried: bool,
}

/// Arguments for the first attempt.
pub fn extract_args(
    layer: &Path,
    rootfs: &Path,
    compression: Compression,
    profile: HostProfile,
    first_layer: bool,
    quiet_unknown_keywords: bool,
) -> Vec<String> {
    let mut args = base_args(layer, rootfs, compression);
    if profile.is_constrained() {
        if quiet_unknown_keywords {
            args.push("--warning=no-unknown-keyword".to_string());
        }
        if !first_layer {
            args.push("--overwrite".to_string());
        }
        args.push("--skip-old-files".to_string());
    }
    args
}

/// Arguments for the single retry after a hard failure.
pub fn permissive_args(
    layer: &Path,
    rootfs: &Path,
    compression: Compression,
    quiet_unknown_keywords: bool,
) -> Vec<String> {
    let mut args = base_args(layer, rootfs, compression);
    if quiet_unknown_keywords {
        args.push("--warning=no-unknown-keyword".to_string());
    }
    args.push("--skip-old-files".to_string());
    args.push("--ignore-failed-read".to_string());
    args
}

fn base_args(layer: &Path, rootfs: &Path, compression: Compression) -> Vec<String> {
    let mode = match compression.tar_flag() {
        Some(flag) => format!("-x{}f", flag),
        None => "-xf".to_string(),
    };
    vec![
        mode,
        layer.to_string_lossy().into_owned(),
        "-C".to_string(),
        rootfs.to_string_lossy().into_owned(),
        "--no-same-owner".to_string(),
        "--no-same-permissions".to_string(),
        "--exclude=.wh.*".to_string(),
        "--exclude=.wh.wh.*".to_string(),
    ]
}

/// Extract `layer` into `rootfs` with `tar`, retrying once with the
/// permissive flag set when the first attempt fails outright.
///
/// `Err` means `tar` could not be launched at all.
pub fn extract_with_tar(
    tools: &ToolCapabilities,
    layer: &Path,
    rootfs: &Path,
    compression: Compression,
    profile: HostProfile,
    first_layer: bool,
) -> std::result::Result<TarRun, String> {
    if !tools.has_tar() {
        return Err(format!("'{}' is not available", tools.tar_path()));
    }
    let quiet = tools.tar_supports("--warning");

    let args = extract_args(layer, rootfs, compression, profile, first_layer, quiet);
    let exit = run_tar(tools.tar_path(), &args)?;
    match exit {
        TarExit::Success => {
            return Ok(TarRun {
                exit,
                retried: false,
            })
        }
        TarExit::Warnings => {
            tracing::info!(layer = %layer.display(), "tar finished with warnings");
            return Ok(TarRun {
                exit,
                retried: false,
            });
        }
        TarExit::Failed(code) => {
            tracing::warn!(
                layer = %layer.display(),
                exit_code = ?code,
                "tar failed, retrying with permissive options"
            );
        }
    }

    let args = permissive_args(layer, rootfs, compression, quiet);
    let exit = run_tar(tools.tar_path(), &args)?;
    if exit == TarExit::Warnings {
        tracing::info!(layer = %layer.display(), "tar retry finished with warnings");
    }
    Ok(TarRun {
        exit,
        retried: true,
    })
}

fn run_tar(program: &str, args: &[String]) -> std::result::Result<TarExit, String> {
    tracing::debug!(command = %format!("{} {}", program, args.join(" ")), "Running tar");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("failed to run {}: {}", program, e))?;

    let exit = TarExit::classify(output.status.code());
    if exit != TarExit::Success && !output.stderr.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt: String = stderr.chars().take(STDERR_LIMIT).collect();
        tracing::debug!(exit = ?exit, stderr = %excerpt.trim_end(), "tar diagnostics");
    }
    Ok(exit)
}
