//! Hybrid ISO composition.
//!
//! Boot material is detected from the mutated tree; the plan is plain data
//! so the exact xorriso invocation can be inspected without running it.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::layout::{locate_first, HOST_MBR_TEMPLATES, LEGACY_LOADER_CANDIDATES, UEFI_IMAGE_CANDIDATES};

/// Bytes of MBR boot code before the partition table.
pub const MBR_BOOT_CODE_LEN: usize = 432;

/// Boot loader material found in the tree, as paths relative to its root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootMaterial {
    pub legacy_loader: Option<String>,
    pub uefi_image: Option<String>,
}

impl BootMaterial {
    pub fn detect(tree: &Path) -> Self {
        Self {
            legacy_loader: locate_first(tree, LEGACY_LOADER_CANDIDATES).map(|(c, _)| c.to_string()),
            uefi_image: locate_first(tree, UEFI_IMAGE_CANDIDATES).map(|(c, _)| c.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.legacy_loader.is_none() && self.uefi_image.is_none()
    }
}

/// Primary El Torito entry: BIOS boot through the legacy loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyBoot {
    pub loader: String,
    pub catalog: String,
    pub mbr_template: PathBuf,
}

/// Secondary El Torito entry: UEFI boot image, no emulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UefiBoot {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposePlan {
    pub tree: PathBuf,
    pub output: PathBuf,
    pub volume_label: String,
    pub legacy: Option<LegacyBoot>,
    pub uefi: Option<UefiBoot>,
}

impl ComposePlan {
    /// Arguments for `xorriso`.
    pub fn xorriso_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-as".into(),
            "mkisofs".into(),
            "-r".into(),
            "-J".into(),
            "-joliet-long".into(),
            "-V".into(),
            self.volume_label.clone(),
            "-o".into(),
            self.output.to_string_lossy().into_owned(),
        ];

        if let Some(legacy) = &self.legacy {
            args.extend([
                "-isohybrid-mbr".into(),
                legacy.mbr_template.to_string_lossy().into_owned(),
                "-b".into(),
                legacy.loader.clone(),
                "-c".into(),
                legacy.catalog.clone(),
                "-no-emul-boot".into(),
                "-boot-load-size".into(),
                "4".into(),
                "-boot-info-table".into(),
            ]);
        }

        if let Some(uefi) = &self.uefi {
            if self.legacy.is_some() {
                args.push("-eltorito-alt-boot".into());
            }
            args.extend(["-e".into(), uefi.image.clone(), "-no-emul-boot".into()]);
            // -isohybrid-gpt-basdat only takes effect alongside -isohybrid-mbr.
            if self.legacy.is_some() {
                args.push("-isohybrid-gpt-basdat".into());
            } else {
                args.extend(["-efi-boot-part".into(), "--efi-boot-image".into()]);
            }
        }

        args.push(self.tree.to_string_lossy().into_owned());
        args
    }
}

/// Boot catalog path written next to the legacy loader.
pub fn catalog_for(loader: &str) -> String {
    match loader.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/boot.cat"),
        None => "boot.cat".to_string(),
    }
}

/// Copy the base image's MBR boot code into `dest`.
///
/// Returns `false` (and writes nothing) when the boot code is blank, i.e.
/// the base image is not itself isohybrid.
pub fn extract_mbr_template(base_image: &Path, dest: &Path) -> Result<bool> {
    let mut boot_code = vec![0u8; MBR_BOOT_CODE_LEN];
    let mut file = File::open(base_image)
        .with_context(|| format!("opening base image '{}'", base_image.display()))?;
    let read = read_up_to(&mut file, &mut boot_code)?;
    if read < MBR_BOOT_CODE_LEN || boot_code.iter().all(|b| *b == 0) {
        return Ok(false);
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, &boot_code)
        .with_context(|| format!("writing MBR template '{}'", dest.display()))?;
    Ok(true)
}

/// First isohybrid MBR template installed on the host.
pub fn find_host_mbr_template() -> Option<PathBuf> {
    HOST_MBR_TEMPLATES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
