//! Typed build failures.
//!
//! Everything else flows through `anyhow`; these are the conditions callers
//! (and tests) need to tell apart.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing required host tools:\n{}", format_missing(.0))]
    MissingTools(Vec<(String, String)>),

    #[error("no {what} found; probed:\n{}", format_probed(.probed))]
    NoMatchingLayout {
        what: &'static str,
        probed: Vec<PathBuf>,
    },

    #[error("{tool} failed: {diagnostics}")]
    ToolFailed {
        tool: &'static str,
        diagnostics: String,
    },

    #[error(
        "image has neither boot menus nor boot loader material (probed legacy {legacy:?}, uefi {uefi:?})"
    )]
    NoBootMaterial {
        legacy: Vec<PathBuf>,
        uefi: Vec<PathBuf>,
    },

    #[error("build directory is locked by another process: {}", .0.display())]
    Locked(PathBuf),
}

fn format_missing(missing: &[(String, String)]) -> String {
    missing
        .iter()
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_probed(probed: &[PathBuf]) -> String {
    probed
        .iter()
        .map(|p| format!("  {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}
