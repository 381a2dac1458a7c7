//! Build context.
//!
//! Constructed once per invocation from the resolved [`Config`] and CLI
//! options, then passed by reference to every stage. Stages never consult
//! the environment or the config file themselves.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Directory (relative to the project) holding cache, scratch and output.
pub const ARTIFACTS_DIR: &str = ".artifacts";

/// Codename/arch pair identifying a base image in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTag {
    pub codename: String,
    pub arch: String,
}

impl std::fmt::Display for ImageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.codename, self.arch)
    }
}

/// The vendor installer image: where it comes from and where it is cached.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub url: String,
    pub cache_path: PathBuf,
    pub tag: ImageTag,
}

/// What gets injected into the boot archive.
#[derive(Debug, Clone)]
pub struct Payload {
    /// Automation configuration file.
    pub config: PathBuf,
    /// Optional directory of opaque add-on artifacts.
    pub addons_dir: PathBuf,
}

/// Options that come from the command line rather than the config file.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub url_override: Option<String>,
    pub keep_work: bool,
}

#[derive(Debug, Clone)]
pub struct BuildContext {
    pub project_dir: PathBuf,
    pub base: BaseImage,
    pub payload: Payload,
    /// Scratch root; everything below it except the lock is disposable.
    pub work_dir: PathBuf,
    /// Unpacked ISO 9660 tree.
    pub iso_tree: PathBuf,
    /// Unpacked boot archive.
    pub archive_staging: PathBuf,
    /// Final composed image.
    pub output: PathBuf,
    pub volume_label: String,
    pub keep_work: bool,
}

impl BuildContext {
    pub fn new(project_dir: &Path, config: &Config, options: &BuildOptions) -> Result<Self> {
        let artifacts = project_dir.join(ARTIFACTS_DIR);
        let url = options
            .url_override
            .clone()
            .unwrap_or_else(|| config.source_url.clone());
        let tag = ImageTag {
            codename: config.codename.clone(),
            arch: config.arch.clone(),
        };
        let cache_name = cache_file_name(&url, &tag)?;
        let work_dir = artifacts.join("work");

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            base: BaseImage {
                cache_path: artifacts.join("cache").join(tag.to_string()).join(cache_name),
                url,
                tag,
            },
            payload: Payload {
                config: config.payload_config.clone(),
                addons_dir: config.addons_dir.clone(),
            },
            iso_tree: work_dir.join("iso-tree"),
            archive_staging: work_dir.join("archive-root"),
            work_dir,
            output: artifacts.join("out").join(&config.output_name),
            volume_label: config.volume_label.clone(),
            keep_work: options.keep_work,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        self.base
            .cache_path
            .parent()
            .unwrap_or(self.project_dir.as_path())
    }

    pub fn output_dir(&self) -> &Path {
        self.output.parent().unwrap_or(self.project_dir.as_path())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.work_dir.join(".lock")
    }

    /// Boot code copied out of the base image for the isohybrid MBR.
    pub fn mbr_template(&self) -> PathBuf {
        self.work_dir.join("isohdpfx.bin")
    }

    /// Scratch directories and files removed by cleanup.
    pub fn scratch_paths(&self) -> Vec<PathBuf> {
        vec![
            self.iso_tree.clone(),
            self.archive_staging.clone(),
            self.archive_staging.with_extension("cpio"),
            self.archive_staging.with_extension("list"),
            self.mbr_template(),
        ]
    }
}

/// Last path segment of the URL, or a name derived from the tag.
fn cache_file_name(url: &str, tag: &ImageTag) -> Result<String> {
    if url.trim().is_empty() {
        bail!("base image URL is empty");
    }
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "." && *name != "..");
    Ok(match name {
        Some(name) => name.to_string(),
        None => format!("base-{tag}.iso"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from_toml(Path::new("/p"), "").unwrap()
    }

    #[test]
    fn paths_live_under_artifacts() {
        let ctx = BuildContext::new(Path::new("/p"), &config(), &BuildOptions::default()).unwrap();
        assert_eq!(
            ctx.base.cache_path,
            PathBuf::from("/p/.artifacts/cache/bookworm-amd64/debian-12.7.0-amd64-netinst.iso")
        );
        assert_eq!(ctx.iso_tree, PathBuf::from("/p/.artifacts/work/iso-tree"));
        assert_eq!(ctx.output, PathBuf::from("/p/.artifacts/out/autoiso.iso"));
        assert!(ctx.scratch_paths().iter().all(|p| p.starts_with(&ctx.work_dir)));
        assert!(!ctx.scratch_paths().contains(&ctx.base.cache_path));
    }

    #[test]
    fn url_override_drives_cache_name() {
        let options = BuildOptions {
            url_override: Some("file:///isos/custom.iso?x=1".to_string()),
            keep_work: true,
        };
        let ctx = BuildContext::new(Path::new("/p"), &config(), &options).unwrap();
        assert_eq!(ctx.base.url, "file:///isos/custom.iso?x=1");
        assert!(ctx.base.cache_path.ends_with("custom.iso"));
        assert!(ctx.keep_work);
    }

    #[test]
    fn url_without_file_name_falls_back_to_tag() {
        let tag = ImageTag {
            codename: "trixie".to_string(),
            arch: "arm64".to_string(),
        };
        assert_eq!(
            cache_file_name("https://mirror.example/", &tag).unwrap(),
            "base-trixie-arm64.iso"
        );
    }
}
