//! Known installer image layouts.
//!
//! Vendor releases move the boot archive, boot menus and loader binaries
//! around. Every place we look is listed here, in precedence order, and
//! every lookup goes through [`locate_first`]. Supporting a new layout means
//! adding a row, not a branch.

use std::path::{Path, PathBuf};

use crate::error::BuildError;

/// Something that can be probed for under the unpacked tree.
pub trait Candidate {
    /// Path relative to the tree root, `/`-separated, no leading slash.
    fn relative_path(&self) -> &str;
}

impl Candidate for &str {
    fn relative_path(&self) -> &str {
        self
    }
}

/// Boot archive location for one installer layout, plus the kernel that
/// boots it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub name: &'static str,
    pub archive: &'static str,
    pub kernel: &'static str,
}

impl Candidate for ArchiveLayout {
    fn relative_path(&self) -> &str {
        self.archive
    }
}

/// Boot archive layouts, first match wins.
///
/// Some images expose the archive at more than one of these paths; the order
/// here decides which one is patched.
pub const ARCHIVE_LAYOUTS: &[ArchiveLayout] = &[
    ArchiveLayout {
        name: "debian-amd64",
        archive: "install.amd/initrd.gz",
        kernel: "install.amd/vmlinuz",
    },
    ArchiveLayout {
        name: "debian-i386",
        archive: "install.386/initrd.gz",
        kernel: "install.386/vmlinuz",
    },
    ArchiveLayout {
        name: "debian-arm64",
        archive: "install.a64/initrd.gz",
        kernel: "install.a64/vmlinuz",
    },
    ArchiveLayout {
        name: "ubuntu-legacy",
        archive: "install/initrd.gz",
        kernel: "install/vmlinuz",
    },
    ArchiveLayout {
        name: "generic",
        archive: "boot/initrd.gz",
        kernel: "boot/vmlinuz",
    },
];

/// Primary legacy (syslinux/isolinux) menu configs.
pub const LEGACY_MENU_CANDIDATES: &[&str] = &[
    "isolinux/isolinux.cfg",
    "syslinux/syslinux.cfg",
    "isolinux.cfg",
];

/// UEFI (GRUB) menu configs.
pub const UEFI_MENU_CANDIDATES: &[&str] = &["boot/grub/grub.cfg", "EFI/boot/grub.cfg"];

/// Legacy El Torito boot binaries.
pub const LEGACY_LOADER_CANDIDATES: &[&str] = &["isolinux/isolinux.bin", "syslinux/isolinux.bin"];

/// UEFI El Torito boot images (FAT images holding the EFI loader).
pub const UEFI_IMAGE_CANDIDATES: &[&str] = &["boot/grub/efi.img", "images/efiboot.img", "efi.img"];

/// Host isohybrid MBR templates, used when the base image's boot code is blank.
pub const HOST_MBR_TEMPLATES: &[&str] = &[
    "/usr/lib/ISOLINUX/isohdpfx.bin",
    "/usr/share/syslinux/isohdpfx.bin",
    "/usr/lib/syslinux/bios/isohdpfx.bin",
];

/// Return the first candidate that exists under `root`, with its full path.
pub fn locate_first<'a, C: Candidate>(root: &Path, candidates: &'a [C]) -> Option<(&'a C, PathBuf)> {
    candidates.iter().find_map(|candidate| {
        let path = root.join(candidate.relative_path());
        path.exists().then_some((candidate, path))
    })
}

/// Like [`locate_first`], but a miss is a layout mismatch naming every
/// path that was probed.
pub fn locate_required<'a, C: Candidate>(
    root: &Path,
    candidates: &'a [C],
    what: &'static str,
) -> Result<(&'a C, PathBuf), BuildError> {
    locate_first(root, candidates).ok_or_else(|| BuildError::NoMatchingLayout {
        what,
        probed: probed_paths(root, candidates),
    })
}

/// Every path [`locate_first`] would check, in order.
pub fn probed_paths<C: Candidate>(root: &Path, candidates: &[C]) -> Vec<PathBuf> {
    candidates
        .iter()
        .map(|c| root.join(c.relative_path()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn first_candidate_in_list_order_wins() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "install.386/initrd.gz");
        sleep(Duration::from_millis(20));
        // Written last, but listed first.
        touch(temp.path(), "install.amd/initrd.gz");
        // And a later entry touched again afterwards must not win either.
        sleep(Duration::from_millis(20));
        touch(temp.path(), "install.386/initrd.gz");

        let (layout, path) = locate_first(temp.path(), ARCHIVE_LAYOUTS).unwrap();
        assert_eq!(layout.name, "debian-amd64");
        assert_eq!(path, temp.path().join("install.amd/initrd.gz"));
    }

    #[test]
    fn overlapping_layouts_resolve_to_earlier_entry() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "install/initrd.gz");
        touch(temp.path(), "boot/initrd.gz");

        let (layout, _) = locate_first(temp.path(), ARCHIVE_LAYOUTS).unwrap();
        assert_eq!(layout.name, "ubuntu-legacy");
        assert_eq!(layout.kernel, "install/vmlinuz");
    }

    #[test]
    fn miss_reports_every_probed_path() {
        let temp = TempDir::new().unwrap();
        let err = locate_required(temp.path(), LEGACY_MENU_CANDIDATES, "legacy boot menu")
            .unwrap_err();
        match err {
            BuildError::NoMatchingLayout { what, probed } => {
                assert_eq!(what, "legacy boot menu");
                assert_eq!(probed.len(), LEGACY_MENU_CANDIDATES.len());
                assert_eq!(probed[0], temp.path().join("isolinux/isolinux.cfg"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn str_candidates_work_with_locate_first() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "EFI/boot/grub.cfg");
        let (rel, _) = locate_first(temp.path(), UEFI_MENU_CANDIDATES).unwrap();
        assert_eq!(*rel, "EFI/boot/grub.cfg");
    }
}
