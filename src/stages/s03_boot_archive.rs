//! Locate the boot archive in the unpacked tree and unpack it.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::artifact::cpio::{has_entries, Compression};
use crate::artifact::filesystem::recreate_dir;
use crate::error::BuildError;
use crate::layout::{locate_required, ArchiveLayout, ARCHIVE_LAYOUTS};
use crate::preflight::check_required_tools;
use crate::tools::ImageTools;

/// The boot archive selected for this build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootArchive {
    pub layout: ArchiveLayout,
    pub path: PathBuf,
    pub compression: Compression,
}

impl BootArchive {
    /// First layout whose archive exists under `tree`.
    pub fn locate(tree: &Path) -> Result<Self> {
        let (layout, path) = locate_required(tree, ARCHIVE_LAYOUTS, "boot archive")?;
        let compression = Compression::detect(&path)?;
        tracing::info!(
            layout = layout.name,
            archive = layout.archive,
            %compression,
            "found boot archive"
        );
        Ok(Self {
            layout: *layout,
            path,
            compression,
        })
    }

    /// Archive path as seen from the image root, with a leading slash.
    pub fn boot_path(&self) -> String {
        format!("/{}", self.layout.archive)
    }

    /// Kernel path as seen from the image root, with a leading slash.
    pub fn kernel_boot_path(&self) -> String {
        format!("/{}", self.layout.kernel)
    }
}

/// Unpack `archive` into a freshly emptied `staging` directory.
///
/// cpio exits non-zero for conditions that still leave a usable tree
/// (device nodes it may not create unprivileged, for one); a failure with a
/// populated staging directory is logged and tolerated.
pub fn unpack_boot_archive(tools: &dyn ImageTools, archive: &BootArchive, staging: &Path) -> Result<()> {
    check_required_tools(&tools.compression_tools(archive.compression))?;

    recreate_dir(staging)?;
    let output = tools
        .unpack_archive(&archive.path, archive.compression, staging)
        .with_context(|| format!("unpacking boot archive '{}'", archive.path.display()))?;

    if !output.success {
        if has_entries(staging) {
            tracing::warn!(
                diagnostics = %output.diagnostics,
                "boot archive unpack reported errors; continuing with partial tree"
            );
        } else {
            return Err(BuildError::ToolFailed {
                tool: "cpio",
                diagnostics: output.diagnostics,
            }
            .into());
        }
    }
    Ok(())
}
