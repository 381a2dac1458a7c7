//! Inject the automation payload into the boot archive and repack it.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::filesystem::{copy_dir_recursive, visible_entries};
use crate::build::context::Payload;
use crate::error::BuildError;
use crate::stages::s03_boot_archive::BootArchive;
use crate::tools::ImageTools;

/// Name the installer looks for at the archive root.
pub const PAYLOAD_CONFIG_NAME: &str = "preseed.cfg";

/// Directory holding add-on artifacts inside the archive.
pub const ADDONS_DIR_NAME: &str = "addons";

/// What ended up in the staging tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injected {
    pub config: PathBuf,
    /// Top-level add-on entries copied, by name. Empty when there were none.
    pub addons: Vec<String>,
}

/// Copy the payload into `staging`.
pub fn stage_payload(payload: &Payload, staging: &Path) -> Result<Injected> {
    if !payload.config.is_file() {
        bail!(
            "automation config '{}' does not exist",
            payload.config.display()
        );
    }
    let config = staging.join(PAYLOAD_CONFIG_NAME);
    fs::copy(&payload.config, &config).with_context(|| {
        format!(
            "copying '{}' into the boot archive",
            payload.config.display()
        )
    })?;

    let entries = visible_entries(&payload.addons_dir)?;
    if entries.is_empty() {
        tracing::warn!(
            dir = %payload.addons_dir.display(),
            "no add-ons found; the installed system will contain only what the installer provides"
        );
        return Ok(Injected {
            config,
            addons: Vec::new(),
        });
    }

    let addons_dir = staging.join(ADDONS_DIR_NAME);
    fs::create_dir_all(&addons_dir)
        .with_context(|| format!("creating '{}'", addons_dir.display()))?;

    let mut addons = Vec::with_capacity(entries.len());
    for entry in entries {
        let target = addons_dir.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying add-on '{}'", entry.path().display()))?;
        }
        addons.push(entry.file_name().to_string_lossy().into_owned());
    }
    tracing::info!(count = addons.len(), "staged add-ons");

    Ok(Injected { config, addons })
}

/// Stage the payload and repack the archive in place.
///
/// The new archive is written next to the original and renamed over it, so
/// a failed pack leaves the tree's archive untouched.
pub fn inject_payload(
    tools: &dyn ImageTools,
    payload: &Payload,
    archive: &BootArchive,
    staging: &Path,
) -> Result<Injected> {
    let injected = stage_payload(payload, staging)?;

    let mut tmp_name = archive
        .path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".new");
    let repacked = archive.path.with_file_name(tmp_name);

    tracing::info!(archive = %archive.path.display(), compression = %archive.compression, "repacking boot archive");
    let output = tools
        .pack_archive(staging, archive.compression, &repacked)
        .with_context(|| format!("packing '{}'", staging.display()))?;
    if !output.success {
        let _ = fs::remove_file(&repacked);
        return Err(BuildError::ToolFailed {
            tool: "cpio",
            diagnostics: output.diagnostics,
        }
        .into());
    }

    fs::rename(&repacked, &archive.path)
        .with_context(|| format!("replacing '{}'", archive.path.display()))?;
    Ok(injected)
}
