//! Regenerate the image's checksum manifests.
//!
//! `sha256sum.txt` is always written. Any other manifest the vendor shipped
//! (Debian's `md5sum.txt`, read by the installer's media check) is
//! recomputed in place. No manifest lists itself or another manifest.

use anyhow::{bail, Context, Result};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use walkdir::WalkDir;

use crate::artifact::iso::catalog_for;
use crate::layout::{locate_first, LEGACY_LOADER_CANDIDATES};

/// Manifest written at the tree root on every build.
pub const MANIFEST_NAME: &str = "sha256sum.txt";

/// Digest a manifest is written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Sha256,
}

impl Algorithm {
    pub const ALL: [Algorithm; 2] = [Algorithm::Md5, Algorithm::Sha256];

    /// File name of this algorithm's manifest at the tree root.
    pub fn manifest_name(self) -> &'static str {
        match self {
            Self::Md5 => "md5sum.txt",
            Self::Sha256 => MANIFEST_NAME,
        }
    }

    fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 => 64,
        }
    }

    pub fn hash_file(self, path: &Path) -> Result<String> {
        match self {
            Self::Md5 => digest_file::<Md5>(path),
            Self::Sha256 => digest_file::<Sha256>(path),
        }
    }
}

fn is_manifest(rel: &Path) -> bool {
    Algorithm::ALL
        .iter()
        .any(|a| rel == Path::new(a.manifest_name()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest: String,
    /// `./`-prefixed, `/`-separated path relative to the tree root.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub algorithm: Algorithm,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Hash every regular file below `tree` except the manifests.
    /// Symlinks are not followed.
    pub fn compute(tree: &Path, algorithm: Algorithm) -> Result<Self> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(tree)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("walking '{}'", tree.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(tree)?;
            if is_manifest(rel) {
                continue;
            }
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            entries.push(ManifestEntry {
                digest: algorithm.hash_file(entry.path())?,
                path: format!("./{rel}"),
            });
        }
        Ok(Self { algorithm, entries })
    }

    /// `md5sum`/`sha256sum`-compatible text.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}  {}\n", e.digest, e.path))
            .collect()
    }

    pub fn parse(text: &str, algorithm: Algorithm) -> Result<Self> {
        let mut entries = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((digest, path)) = line.split_once("  ") else {
                bail!("malformed manifest line {}: {:?}", n + 1, line);
            };
            if digest.len() != algorithm.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("malformed digest on manifest line {}", n + 1);
            }
            entries.push(ManifestEntry {
                digest: digest.to_string(),
                path: path.to_string(),
            });
        }
        Ok(Self { algorithm, entries })
    }

    /// Paths whose current contents no longer match their digest.
    pub fn mismatches(&self, tree: &Path) -> Result<Vec<String>> {
        let mut bad = Vec::new();
        for entry in &self.entries {
            let path = tree.join(entry.path.trim_start_matches("./"));
            if !path.is_file() || self.algorithm.hash_file(&path)? != entry.digest {
                bad.push(entry.path.clone());
            }
        }
        Ok(bad)
    }

    fn write(&self, tree: &Path) -> Result<()> {
        let path = tree.join(self.algorithm.manifest_name());
        fs::write(&path, self.render()).with_context(|| format!("writing '{}'", path.display()))
    }
}

/// Drop the boot catalog next to each legacy loader; the composer writes a
/// fresh one.
pub fn remove_stale_catalogs(tree: &Path) -> Result<()> {
    if let Some((loader, _)) = locate_first(tree, LEGACY_LOADER_CANDIDATES) {
        let catalog = tree.join(catalog_for(loader));
        if catalog.is_file() {
            fs::remove_file(&catalog)
                .with_context(|| format!("removing stale boot catalog '{}'", catalog.display()))?;
            tracing::debug!(path = %catalog.display(), "removed stale boot catalog");
        }
    }
    Ok(())
}

/// Drop the stale boot catalog, then rewrite every manifest: the SHA-256
/// one always, the others only where the vendor shipped them.
///
/// Returns the SHA-256 manifest.
pub fn regenerate_checksums(tree: &Path) -> Result<Manifest> {
    remove_stale_catalogs(tree)?;

    for algorithm in Algorithm::ALL {
        if algorithm == Algorithm::Sha256 || !tree.join(algorithm.manifest_name()).is_file() {
            continue;
        }
        let manifest = Manifest::compute(tree, algorithm)?;
        manifest.write(tree)?;
        tracing::info!(
            manifest = algorithm.manifest_name(),
            files = manifest.entries.len(),
            "vendor checksum manifest regenerated"
        );
    }

    let manifest = Manifest::compute(tree, Algorithm::Sha256)?;
    manifest.write(tree)?;
    tracing::info!(files = manifest.entries.len(), "checksum manifest regenerated");
    Ok(manifest)
}

fn digest_file<D: Digest>(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("isolinux")).unwrap();
        fs::create_dir_all(root.join("install.amd")).unwrap();
        fs::write(root.join("isolinux/isolinux.bin"), b"loader").unwrap();
        fs::write(root.join("isolinux/boot.cat"), b"old catalog").unwrap();
        fs::write(root.join("install.amd/initrd.gz"), b"archive").unwrap();
        fs::write(root.join("md5sum.txt"), "00000000000000000000000000000000  ./README\n").unwrap();
        fs::write(root.join("README"), b"").unwrap();
        std::os::unix::fs::symlink(".", root.join("debian")).unwrap();
        temp
    }

    #[test]
    fn manifest_covers_every_file_once() {
        let temp = tree();
        let manifest = regenerate_checksums(temp.path()).unwrap();

        let paths: Vec<_> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            ["./README", "./install.amd/initrd.gz", "./isolinux/isolinux.bin"]
        );
        assert_eq!(
            manifest.entries[0].digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(!temp.path().join("isolinux/boot.cat").exists());
    }

    #[test]
    fn vendor_md5_manifest_is_recomputed() {
        let temp = tree();
        regenerate_checksums(temp.path()).unwrap();

        let text = fs::read_to_string(temp.path().join("md5sum.txt")).unwrap();
        let md5 = Manifest::parse(&text, Algorithm::Md5).unwrap();
        let paths: Vec<_> = md5.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            ["./README", "./install.amd/initrd.gz", "./isolinux/isolinux.bin"]
        );
        assert_eq!(md5.entries[0].digest, "d41d8cd98f00b204e9800998ecf8427e");
        assert!(md5.mismatches(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn md5_manifest_is_not_invented() {
        let temp = tree();
        fs::remove_file(temp.path().join("md5sum.txt")).unwrap();
        regenerate_checksums(temp.path()).unwrap();
        assert!(!temp.path().join("md5sum.txt").exists());
        assert!(temp.path().join(MANIFEST_NAME).is_file());
    }

    #[test]
    fn written_manifest_matches_tree() {
        let temp = tree();
        regenerate_checksums(temp.path()).unwrap();

        let text = fs::read_to_string(temp.path().join(MANIFEST_NAME)).unwrap();
        let parsed = Manifest::parse(&text, Algorithm::Sha256).unwrap();
        assert_eq!(parsed.entries.len(), 3);
        assert!(parsed.mismatches(temp.path()).unwrap().is_empty());

        fs::write(temp.path().join("install.amd/initrd.gz"), b"repacked").unwrap();
        assert_eq!(
            parsed.mismatches(temp.path()).unwrap(),
            ["./install.amd/initrd.gz"]
        );
    }

    #[test]
    fn regenerating_ignores_previous_manifests() {
        let temp = tree();
        let first = regenerate_checksums(temp.path()).unwrap();
        let md5_first = fs::read_to_string(temp.path().join("md5sum.txt")).unwrap();
        let second = regenerate_checksums(temp.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(temp.path().join("md5sum.txt")).unwrap(), md5_first);
    }

    #[test]
    fn malformed_manifest_is_rejected() {
        assert!(Manifest::parse("nothex  ./a\n", Algorithm::Sha256).is_err());
        assert!(Manifest::parse("abc ./a\n", Algorithm::Sha256).is_err());
        assert!(
            Manifest::parse("d41d8cd98f00b204e9800998ecf8427e  ./a\n", Algorithm::Sha256).is_err()
        );
    }
}
