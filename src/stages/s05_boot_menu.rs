//! Point both loader modes at the unattended entry.

use anyhow::Result;
use std::path::Path;

use crate::bootmenu::{patch_boot_menus, MenuOutcome, MenuReport};
use crate::stages::s03_boot_archive::BootArchive;

pub fn patch_menus(tree: &Path, archive: &BootArchive) -> Result<MenuReport> {
    let report = patch_boot_menus(tree, archive)?;
    for (mode, outcome) in [("legacy", &report.legacy), ("uefi", &report.uefi)] {
        if let MenuOutcome::Patched { changed } = outcome {
            if changed.is_empty() {
                tracing::info!(mode, "boot menu already unattended");
            }
        }
    }
    Ok(report)
}
