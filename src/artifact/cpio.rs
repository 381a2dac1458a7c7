//! Boot archive container format.
//!
//! The installer's boot archive is a `newc` cpio stream, optionally wrapped
//! in a compressor. The kernel's in-memory unpacker is picky about both
//! layers, so the compressor is detected from the original archive and
//! reused with parameters the kernel accepts.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use walkdir::WalkDir;

/// Outer compression of a boot archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
    /// Bare cpio.
    None,
}

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const NEWC_MAGIC: &[u8] = b"07070";

impl Compression {
    /// Detect compression from the archive's leading bytes.
    pub fn detect(archive: &Path) -> Result<Self> {
        let mut header = [0u8; 6];
        let mut file = File::open(archive)
            .with_context(|| format!("opening boot archive '{}'", archive.display()))?;
        let read = file.read(&mut header)?;
        Self::from_magic(&header[..read]).with_context(|| {
            format!(
                "boot archive '{}' is not a cpio stream or a known compressed container",
                archive.display()
            )
        })
    }

    pub fn from_magic(header: &[u8]) -> Result<Self> {
        if header.starts_with(GZIP_MAGIC) {
            Ok(Self::Gzip)
        } else if header.starts_with(XZ_MAGIC) {
            Ok(Self::Xz)
        } else if header.starts_with(ZSTD_MAGIC) {
            Ok(Self::Zstd)
        } else if header.starts_with(NEWC_MAGIC) {
            Ok(Self::None)
        } else {
            bail!("unrecognized archive magic {:02x?}", header)
        }
    }

    /// Host tool needed for this compression, as (command, package).
    pub fn required_tool(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Gzip => Some(("gzip", "gzip")),
            Self::Xz => Some(("xz", "xz-utils")),
            Self::Zstd => Some(("zstd", "zstd")),
            Self::None => None,
        }
    }

    /// Arguments to decompress stdin to stdout.
    pub fn decompress_args(&self) -> &'static [&'static str] {
        match self {
            Self::Gzip | Self::Xz | Self::Zstd => &["-d", "-c"],
            Self::None => &[],
        }
    }

    /// Arguments to compress stdin to stdout.
    ///
    /// xz must use CRC32 checks; the kernel's xz decoder rejects CRC64.
    pub fn compress_args(&self) -> &'static [&'static str] {
        match self {
            Self::Gzip => &["-9", "-n", "-c"],
            Self::Xz => &["--check=crc32", "-9", "-c"],
            Self::Zstd => &["-19", "-q", "-c"],
            Self::None => &[],
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
            Self::None => "none",
        })
    }
}

/// Write a NUL-separated list of every entry below `root`, relative to it.
///
/// The root itself is not listed: the archive must not start with a `.`
/// entry. Directories precede their contents, names are sorted for a
/// reproducible archive. Returns the number of entries.
pub fn write_file_list(root: &Path, list: &Path) -> Result<usize> {
    let mut out = File::create(list)
        .with_context(|| format!("creating cpio file list '{}'", list.display()))?;
    let mut count = 0;
    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        let rel = entry.path().strip_prefix(root)?;
        out.write_all(rel.as_os_str().as_encoded_bytes())?;
        out.write_all(b"\0")?;
        count += 1;
    }
    out.flush()?;
    Ok(count)
}

/// True when `dir` exists and holds at least one entry.
pub fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
