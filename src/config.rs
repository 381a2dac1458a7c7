//! Project configuration (`autoiso.toml`).
//!
//! Every key is optional. A project with no config file builds the default
//! Debian netinst image with `preseed.cfg` and `addons/` from the project
//! directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "autoiso.toml";

pub const DEFAULT_SOURCE_URL: &str =
    "https://cdimage.debian.org/cdimage/archive/12.7.0/amd64/iso-cd/debian-12.7.0-amd64-netinst.iso";
pub const DEFAULT_CODENAME: &str = "bookworm";
pub const DEFAULT_ARCH: &str = "amd64";
pub const DEFAULT_PAYLOAD_CONFIG: &str = "preseed.cfg";
pub const DEFAULT_ADDONS_DIR: &str = "addons";
pub const DEFAULT_OUTPUT_NAME: &str = "autoiso.iso";
pub const DEFAULT_VOLUME_LABEL: &str = "AUTOISO";

/// ISO 9660 volume identifiers are at most 32 characters.
const MAX_VOLUME_LABEL_LEN: usize = 32;

/// Resolved configuration. Paths are absolute (joined onto the project dir).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub source_url: String,
    pub codename: String,
    pub arch: String,
    pub payload_config: PathBuf,
    pub addons_dir: PathBuf,
    pub output_name: String,
    pub volume_label: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    source: Option<SourceToml>,
    payload: Option<PayloadToml>,
    output: Option<OutputToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceToml {
    url: Option<String>,
    codename: Option<String>,
    arch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadToml {
    config: Option<String>,
    addons: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputToml {
    name: Option<String>,
    volume_label: Option<String>,
}

impl Config {
    /// Load `explicit` if given (it must exist), else `<project>/autoiso.toml`
    /// if present, else defaults.
    pub fn load(project_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        let parsed = match explicit {
            Some(path) => read_config(path)?,
            None => {
                let path = project_dir.join(CONFIG_FILENAME);
                if path.is_file() {
                    read_config(&path)?
                } else {
                    ConfigToml::default()
                }
            }
        };
        Self::resolve(project_dir, parsed)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(project_dir: &Path, raw: &str) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(raw).context("parsing autoiso configuration")?;
        Self::resolve(project_dir, parsed)
    }

    fn resolve(project_dir: &Path, parsed: ConfigToml) -> Result<Self> {
        let source = parsed.source.unwrap_or_default();
        let payload = parsed.payload.unwrap_or_default();
        let output = parsed.output.unwrap_or_default();

        let source_url = non_empty(source.url, DEFAULT_SOURCE_URL);
        let codename = non_empty(source.codename, DEFAULT_CODENAME);
        let arch = non_empty(source.arch, DEFAULT_ARCH);

        let output_name = non_empty(output.name, DEFAULT_OUTPUT_NAME);
        if output_name.contains('/') {
            bail!(
                "invalid output.name '{}': must be a file name, not a path",
                output_name
            );
        }

        let volume_label = non_empty(output.volume_label, DEFAULT_VOLUME_LABEL);
        if volume_label.len() > MAX_VOLUME_LABEL_LEN {
            bail!(
                "invalid output.volume_label '{}': at most {} characters",
                volume_label,
                MAX_VOLUME_LABEL_LEN
            );
        }

        Ok(Self {
            source_url,
            codename,
            arch,
            payload_config: project_dir.join(non_empty(payload.config, DEFAULT_PAYLOAD_CONFIG)),
            addons_dir: project_dir.join(non_empty(payload.addons, DEFAULT_ADDONS_DIR)),
            output_name,
            volume_label,
        })
    }
}

fn read_config(path: &Path) -> Result<ConfigToml> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config '{}'", path.display()))
}

fn non_empty(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
