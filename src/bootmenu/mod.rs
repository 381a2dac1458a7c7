//! Boot menu patching.
//!
//! Each loader mode (legacy syslinux/isolinux, UEFI GRUB) is handled
//! independently. A mode whose config exists is patched in place; a mode
//! with loader material but no config gets a minimal authored config; a mode
//! with neither is skipped. Loader material with no config and no kernel to
//! author one for is an error, as is an image with no usable mode at all.

pub mod grub;
pub mod syslinux;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::layout::{
    locate_first, probed_paths, LEGACY_LOADER_CANDIDATES, LEGACY_MENU_CANDIDATES,
    UEFI_IMAGE_CANDIDATES, UEFI_MENU_CANDIDATES,
};
use crate::stages::s03_boot_archive::BootArchive;

/// Kernel parameters that make the installer run unattended from the
/// injected config.
pub const UNATTENDED_PARAMS: &[&str] = &[
    "auto=true",
    "priority=critical",
    "preseed/file=/preseed.cfg",
];

/// Marks the end of installer parameters; what follows is passed on to the
/// installed system.
const PARAM_SEPARATOR: &str = "---";

/// How one loader mode will be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Rewrite the existing config at this path.
    Patch(PathBuf),
    /// Write a minimal config into this path.
    Author(PathBuf),
    Absent,
}

/// What happened to one loader mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuOutcome {
    /// Files rewritten; empty when the config already carried everything.
    Patched { changed: Vec<PathBuf> },
    Authored(PathBuf),
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuReport {
    pub legacy: MenuOutcome,
    pub uefi: MenuOutcome,
}

/// Strategy for the legacy loader.
///
/// A loader binary with neither a config nor the layout's kernel is an
/// error: the image would still carry a BIOS boot entry, and it would come
/// up interactive.
pub fn legacy_strategy(tree: &Path, archive: &BootArchive) -> Result<Strategy> {
    if let Some((_, config)) = locate_first(tree, LEGACY_MENU_CANDIDATES) {
        return Ok(Strategy::Patch(config));
    }
    let Some((_, loader)) = locate_first(tree, LEGACY_LOADER_CANDIDATES) else {
        return Ok(Strategy::Absent);
    };
    let kernel = tree.join(archive.layout.kernel);
    if !kernel.is_file() {
        let mut probed = probed_paths(tree, LEGACY_MENU_CANDIDATES);
        probed.push(kernel);
        return Err(BuildError::NoMatchingLayout {
            what: "legacy boot menu or kernel to author one for",
            probed,
        }
        .into());
    }
    let dir = loader.parent().unwrap_or(tree);
    Ok(Strategy::Author(dir.join("isolinux.cfg")))
}

/// Strategy for the UEFI loader, with the same rule as [`legacy_strategy`].
pub fn uefi_strategy(tree: &Path, archive: &BootArchive) -> Result<Strategy> {
    if let Some((_, config)) = locate_first(tree, UEFI_MENU_CANDIDATES) {
        return Ok(Strategy::Patch(config));
    }
    if locate_first(tree, UEFI_IMAGE_CANDIDATES).is_none() {
        return Ok(Strategy::Absent);
    }
    let kernel = tree.join(archive.layout.kernel);
    if !kernel.is_file() {
        let mut probed = probed_paths(tree, UEFI_MENU_CANDIDATES);
        probed.push(kernel);
        return Err(BuildError::NoMatchingLayout {
            what: "UEFI boot menu or kernel to author one for",
            probed,
        }
        .into());
    }
    Ok(Strategy::Author(tree.join(UEFI_MENU_CANDIDATES[0])))
}

/// Patch or author the boot menus of both loader modes.
pub fn patch_boot_menus(tree: &Path, archive: &BootArchive) -> Result<MenuReport> {
    let legacy = legacy_strategy(tree, archive)?;
    let uefi = uefi_strategy(tree, archive)?;

    if legacy == Strategy::Absent && uefi == Strategy::Absent {
        let mut legacy_probed = probed_paths(tree, LEGACY_MENU_CANDIDATES);
        legacy_probed.extend(probed_paths(tree, LEGACY_LOADER_CANDIDATES));
        let mut uefi_probed = probed_paths(tree, UEFI_MENU_CANDIDATES);
        uefi_probed.extend(probed_paths(tree, UEFI_IMAGE_CANDIDATES));
        return Err(BuildError::NoBootMaterial {
            legacy: legacy_probed,
            uefi: uefi_probed,
        }
        .into());
    }

    let legacy = match legacy {
        Strategy::Patch(config) => {
            let mut menu = syslinux::LegacyMenu::load(tree, &config)?;
            let label = menu.patch(archive)?;
            tracing::info!(config = %config.display(), shape = %menu.shape(), entry = %label, "patched legacy boot menu");
            MenuOutcome::Patched {
                changed: menu.save()?,
            }
        }
        Strategy::Author(path) => {
            write_config(&path, &syslinux::author(archive))?;
            tracing::info!(config = %path.display(), "authored legacy boot menu");
            MenuOutcome::Authored(path)
        }
        Strategy::Absent => {
            tracing::info!("no legacy boot material; skipping legacy menu");
            MenuOutcome::Absent
        }
    };

    let uefi = match uefi {
        Strategy::Patch(config) => {
            let mut grub = grub::GrubConfig::load(&config)?;
            let index = grub.patch(archive)?;
            tracing::info!(config = %config.display(), entry = index, "patched UEFI boot menu");
            let changed = if grub.save()? { vec![config] } else { Vec::new() };
            MenuOutcome::Patched { changed }
        }
        Strategy::Author(path) => {
            write_config(&path, &grub::author(archive))?;
            tracing::info!(config = %path.display(), "authored UEFI boot menu");
            MenuOutcome::Authored(path)
        }
        Strategy::Absent => {
            tracing::info!("no UEFI boot material; skipping UEFI menu");
            MenuOutcome::Absent
        }
    };

    Ok(MenuReport { legacy, uefi })
}

fn write_config(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("writing '{}'", path.display()))
}

/// Merge [`UNATTENDED_PARAMS`] into a kernel argument string.
///
/// Parameters go before the `---` separator when there is one. A token with
/// the same key but another value is replaced in place; identical tokens are
/// left alone. Returns `None` when nothing changes.
pub(crate) fn merge_params(args: &str) -> Option<String> {
    let mut tokens: Vec<String> = args.split_whitespace().map(str::to_string).collect();
    let mut split = tokens
        .iter()
        .position(|t| t == PARAM_SEPARATOR)
        .unwrap_or(tokens.len());
    let mut changed = false;

    for param in UNATTENDED_PARAMS {
        let key = param_key(param);
        match tokens[..split].iter().position(|t| param_key(t) == key) {
            Some(i) if tokens[i] == *param => {}
            Some(i) => {
                tokens[i] = param.to_string();
                changed = true;
            }
            None => {
                tokens.insert(split, param.to_string());
                split += 1;
                changed = true;
            }
        }
    }

    changed.then(|| tokens.join(" "))
}

fn param_key(token: &str) -> &str {
    token.split_once('=').map(|(k, _)| k).unwrap_or(token)
}

/// True when `candidate` names the tree-relative `rel`, with or without a
/// leading slash.
pub(crate) fn names_path(candidate: &str, rel: &str) -> bool {
    candidate.trim_start_matches('/') == rel.trim_start_matches('/')
}

/// Leading whitespace of `line`.
pub(crate) fn indent_of(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::cpio::Compression;
    use crate::layout::ARCHIVE_LAYOUTS;
    use tempfile::TempDir;

    fn amd64_archive(tree: &Path) -> BootArchive {
        BootArchive {
            layout: ARCHIVE_LAYOUTS[0],
            path: tree.join(ARCHIVE_LAYOUTS[0].archive),
            compression: Compression::Gzip,
        }
    }

    fn touch(tree: &Path, rel: &str) {
        let path = tree.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn merge_inserts_before_separator() {
        let merged = merge_params("vga=788 initrd=/install.amd/initrd.gz --- quiet").unwrap();
        assert_eq!(
            merged,
            "vga=788 initrd=/install.amd/initrd.gz auto=true priority=critical preseed/file=/preseed.cfg --- quiet"
        );
    }

    #[test]
    fn merge_appends_without_separator() {
        let merged = merge_params("vga=788").unwrap();
        assert_eq!(
            merged,
            "vga=788 auto=true priority=critical preseed/file=/preseed.cfg"
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let once = merge_params("vga=788 --- quiet").unwrap();
        assert_eq!(merge_params(&once), None);
    }

    #[test]
    fn merge_replaces_conflicting_value() {
        let merged = merge_params("priority=low auto=true --- quiet").unwrap();
        assert_eq!(
            merged,
            "priority=critical auto=true preseed/file=/preseed.cfg --- quiet"
        );
    }

    #[test]
    fn params_after_separator_do_not_count() {
        let merged = merge_params("--- auto=true").unwrap();
        assert!(merged.starts_with("auto=true priority=critical"));
    }

    #[test]
    fn strategy_prefers_existing_config() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        touch(tree, "isolinux/isolinux.cfg");
        touch(tree, "isolinux/isolinux.bin");
        touch(tree, "install.amd/vmlinuz");
        let archive = amd64_archive(tree);

        assert_eq!(
            legacy_strategy(tree, &archive).unwrap(),
            Strategy::Patch(tree.join("isolinux/isolinux.cfg"))
        );
        assert_eq!(uefi_strategy(tree, &archive).unwrap(), Strategy::Absent);
    }

    #[test]
    fn strategy_authors_next_to_loader() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        touch(tree, "syslinux/isolinux.bin");
        touch(tree, "boot/grub/efi.img");
        touch(tree, "install.amd/vmlinuz");
        let archive = amd64_archive(tree);

        assert_eq!(
            legacy_strategy(tree, &archive).unwrap(),
            Strategy::Author(tree.join("syslinux/isolinux.cfg"))
        );
        assert_eq!(
            uefi_strategy(tree, &archive).unwrap(),
            Strategy::Author(tree.join("boot/grub/grub.cfg"))
        );
    }

    #[test]
    fn loader_without_menu_or_kernel_is_fatal() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        touch(tree, "isolinux/isolinux.bin");
        touch(tree, "boot/grub/grub.cfg");
        fs::write(
            tree.join("boot/grub/grub.cfg"),
            "menuentry 'Install' {\n    linux /install.amd/vmlinuz\n    initrd /install.amd/initrd.gz\n}\n",
        )
        .unwrap();
        let archive = amd64_archive(tree);

        let err = patch_boot_menus(tree, &archive).unwrap_err();

        match err.downcast_ref::<BuildError>() {
            Some(BuildError::NoMatchingLayout { what, probed }) => {
                assert!(what.starts_with("legacy boot menu"));
                assert!(probed.contains(&tree.join("install.amd/vmlinuz")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let grub = fs::read_to_string(tree.join("boot/grub/grub.cfg")).unwrap();
        assert!(!grub.contains("preseed/file"));
    }

    #[test]
    fn efi_image_without_menu_or_kernel_is_fatal() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        touch(tree, "boot/grub/efi.img");
        let archive = amd64_archive(tree);
        assert!(uefi_strategy(tree, &archive).is_err());
    }

    #[test]
    fn mode_without_loader_material_is_absent() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        touch(tree, "install.amd/vmlinuz");
        let archive = amd64_archive(tree);
        assert_eq!(legacy_strategy(tree, &archive).unwrap(), Strategy::Absent);
        assert_eq!(uefi_strategy(tree, &archive).unwrap(), Strategy::Absent);
    }

    #[test]
    fn no_boot_material_is_fatal() {
        let temp = TempDir::new().unwrap();
        let archive = amd64_archive(temp.path());
        let err = patch_boot_menus(temp.path(), &archive).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::NoBootMaterial { .. })
        ));
    }

    #[test]
    fn authors_both_modes() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        touch(tree, "isolinux/isolinux.bin");
        touch(tree, "boot/grub/efi.img");
        touch(tree, "install.amd/vmlinuz");
        let archive = amd64_archive(tree);

        let report = patch_boot_menus(tree, &archive).unwrap();

        assert_eq!(
            report.legacy,
            MenuOutcome::Authored(tree.join("isolinux/isolinux.cfg"))
        );
        assert_eq!(
            report.uefi,
            MenuOutcome::Authored(tree.join("boot/grub/grub.cfg"))
        );
        let grub = fs::read_to_string(tree.join("boot/grub/grub.cfg")).unwrap();
        assert!(grub.contains("preseed/file=/preseed.cfg"));
    }
}
