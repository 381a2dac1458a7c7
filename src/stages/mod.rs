//! Pipeline stages, in execution order.

pub mod s01_fetch;
pub mod s02_unpack_image;
pub mod s03_boot_archive;
pub mod s04_payload;
pub mod s05_boot_menu;
pub mod s06_checksum;
pub mod s07_compose;
pub mod s08_cleanup;

/// Stage names as they appear in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    VerifyTools,
    Fetch,
    UnpackImage,
    UnpackBootArchive,
    InjectPayload,
    PatchBootMenus,
    RegenerateChecksums,
    ComposeImage,
    Cleanup,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::VerifyTools => "verify-tools",
            Self::Fetch => "fetch",
            Self::UnpackImage => "unpack-image",
            Self::UnpackBootArchive => "unpack-boot-archive",
            Self::InjectPayload => "inject-payload",
            Self::PatchBootMenus => "patch-boot-menus",
            Self::RegenerateChecksums => "regenerate-checksums",
            Self::ComposeImage => "compose-image",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
