//! Host tool checks.
//!
//! Runs before the pipeline touches the network or the disk, so a missing
//! tool never leaves partial state behind.

use anyhow::Result;

use crate::error::BuildError;

/// Tools every build needs. Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("xorriso", "xorriso"),
    ("cpio", "cpio"),
    ("gzip", "gzip"),
];

/// Check if a command resolves on PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Returns [`BuildError::MissingTools`] naming every missing command, not
/// just the first one.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<(String, String)> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| (tool.to_string(), package.to_string()))
        .collect();

    if !missing.is_empty() {
        return Err(BuildError::MissingTools(missing).into());
    }

    Ok(())
}

/// Per-tool availability, for the `preflight` report.
pub fn tool_report(tools: &[(&str, &str)]) -> Vec<(String, Option<String>)> {
    tools
        .iter()
        .map(|(tool, _)| {
            let found = which::which(tool)
                .ok()
                .map(|path| path.display().to_string());
            (tool.to_string(), found)
        })
        .collect()
}
