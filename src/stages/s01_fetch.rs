//! Download the base image into the cache, once.
//!
//! A cached file is trusted as-is. Downloads land beside the destination
//! and are renamed into place only when complete.

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::filesystem::partial_path;

const USER_AGENT: &str = concat!("autoiso/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// What the fetch stage did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The cache already held the image; nothing was transferred.
    Cached,
    Downloaded { bytes: u64 },
}

/// Source of base image bytes.
pub trait Transport {
    /// Stream `url` into `sink` and return the number of bytes written.
    ///
    /// Non-success responses and bodies shorter than advertised are errors.
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64>;
}

/// HTTP(S) downloads through a blocking reqwest client.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            // Installer images are large; only the connect phase is bounded.
            .timeout(None::<Duration>)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("HTTP request failed: {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!(
                "HTTP {} for {}: {}",
                status.as_u16(),
                url,
                status.canonical_reason().unwrap_or("Unknown error")
            );
        }

        let expected = response.content_length();
        let written = io::copy(&mut response, sink)
            .with_context(|| format!("reading response body from {}", url))?;
        check_length(url, written, expected)?;
        Ok(written)
    }
}

/// `file://` URLs and plain local paths.
pub struct FileTransport;

impl Transport for FileTransport {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
        let path = local_path(url);
        let mut file =
            File::open(&path).with_context(|| format!("opening source image '{}'", path.display()))?;
        let expected = file.metadata()?.len();
        let written = io::copy(&mut file, sink)
            .with_context(|| format!("copying source image '{}'", path.display()))?;
        check_length(url, written, Some(expected))?;
        Ok(written)
    }
}

/// Pick a transport for `url` by scheme.
pub fn transport_for(url: &str) -> Result<Box<dyn Transport>> {
    match url.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase()) {
        Some(scheme) if scheme == "http" || scheme == "https" => Ok(Box::new(HttpTransport::new()?)),
        Some(scheme) if scheme == "file" => Ok(Box::new(FileTransport)),
        Some(scheme) => bail!("unsupported URL scheme '{}' in {}", scheme, url),
        None => Ok(Box::new(FileTransport)),
    }
}

/// Fetch the base image into the cache unless it is already there.
///
/// The download lands in `<dest>.part` and is renamed into place only once
/// complete, so an interrupted run never leaves a truncated image that a
/// later run would trust.
pub fn fetch_base_image(url: &str, dest: &Path, transport: &dyn Transport) -> Result<FetchOutcome> {
    if dest.is_file() {
        tracing::info!(path = %dest.display(), "base image cached, skipping download");
        return Ok(FetchOutcome::Cached);
    }

    let parent = dest
        .parent()
        .with_context(|| format!("cache path '{}' has no parent", dest.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating cache directory '{}'", parent.display()))?;

    let partial = partial_path(dest);
    if partial.exists() {
        fs::remove_file(&partial)
            .with_context(|| format!("removing stale partial download '{}'", partial.display()))?;
    }

    tracing::info!(url, dest = %dest.display(), "downloading base image");
    let bytes = match download_to(url, &partial, transport) {
        Ok(bytes) => bytes,
        Err(err) => {
            if let Err(rm) = fs::remove_file(&partial) {
                if rm.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %partial.display(), error = %rm, "could not remove partial download");
                }
            }
            return Err(err);
        }
    };

    fs::rename(&partial, dest).with_context(|| {
        format!(
            "moving '{}' into place at '{}'",
            partial.display(),
            dest.display()
        )
    })?;
    tracing::info!(bytes, "base image downloaded");
    Ok(FetchOutcome::Downloaded { bytes })
}

fn download_to(url: &str, partial: &Path, transport: &dyn Transport) -> Result<u64> {
    let file = File::create(partial)
        .with_context(|| format!("creating '{}'", partial.display()))?;
    let mut writer = BufWriter::new(file);
    let bytes = transport.fetch(url, &mut writer)?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("flushing '{}'", partial.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing '{}'", partial.display()))?;
    Ok(bytes)
}

fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

fn check_length(url: &str, written: u64, expected: Option<u64>) -> Result<()> {
    if let Some(expected) = expected {
        if written != expected {
            bail!(
                "incomplete transfer from {}: got {} of {} bytes",
                url,
                written,
                expected
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct CountingTransport {
        calls: Cell<usize>,
        body: Vec<u8>,
    }

    impl Transport for CountingTransport {
        fn fetch(&self, _url: &str, sink: &mut dyn Write) -> Result<u64> {
            self.calls.set(self.calls.get() + 1);
            sink.write_all(&self.body)?;
            Ok(self.body.len() as u64)
        }
    }

    /// Writes some bytes, then fails like a dropped connection.
    struct BrokenTransport;

    impl Transport for BrokenTransport {
        fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
            sink.write_all(&[0u8; 1024])?;
            check_length(url, 1024, Some(4096))?;
            Ok(1024)
        }
    }

    #[test]
    fn second_fetch_makes_no_transport_call() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("cache/base.iso");
        let transport = CountingTransport {
            calls: Cell::new(0),
            body: b"iso bytes".to_vec(),
        };

        let first = fetch_base_image("https://x/base.iso", &dest, &transport).unwrap();
        assert_eq!(first, FetchOutcome::Downloaded { bytes: 9 });
        let before = fs::read(&dest).unwrap();

        let second = fetch_base_image("https://x/base.iso", &dest, &transport).unwrap();
        assert_eq!(second, FetchOutcome::Cached);
        assert_eq!(transport.calls.get(), 1);
        assert_eq!(fs::read(&dest).unwrap(), before);
    }

    #[test]
    fn failed_fetch_leaves_no_cache_file() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("base.iso");

        let err = fetch_base_image("https://x/base.iso", &dest, &BrokenTransport).unwrap_err();

        assert!(err.to_string().contains("incomplete transfer"));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn stale_partial_is_replaced() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("base.iso");
        fs::write(partial_path(&dest), b"truncated from a killed run").unwrap();
        let transport = CountingTransport {
            calls: Cell::new(0),
            body: b"complete".to_vec(),
        };

        fetch_base_image("https://x/base.iso", &dest, &transport).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"complete");
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn file_transport_copies_local_images() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("vendor.iso");
        fs::write(&source, b"vendor image").unwrap();
        let dest = temp.path().join("cache/vendor.iso");
        let url = format!("file://{}", source.display());

        let transport = transport_for(&url).unwrap();
        let outcome = fetch_base_image(&url, &dest, transport.as_ref()).unwrap();

        assert_eq!(outcome, FetchOutcome::Downloaded { bytes: 12 });
        assert_eq!(fs::read(&dest).unwrap(), b"vendor image");
    }

    #[test]
    fn missing_local_source_is_an_error() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("base.iso");
        let result = fetch_base_image(
            &temp.path().join("nope.iso").display().to_string(),
            &dest,
            &FileTransport,
        );
        assert!(result.is_err());
        assert!(!dest.exists());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(transport_for("ftp://mirror/base.iso").is_err());
    }
}
