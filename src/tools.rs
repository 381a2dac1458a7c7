//! External tool invoker.
//!
//! The pipeline never spawns processes directly. The four operations it
//! needs from the host go through [`ImageTools`], which reports success or
//! failure with the captured diagnostics instead of raw exit codes.

use anyhow::Result;
use std::fs;
use std::path::Path;

use crate::artifact::cpio::{write_file_list, Compression};
use crate::artifact::iso::ComposePlan;
use crate::preflight::REQUIRED_TOOLS;
use crate::process::{Cmd, CommandResult};

/// Outcome of one tool operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    /// Captured stderr, or stdout when the tool wrote nothing to stderr.
    pub diagnostics: String,
}

impl ToolOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            diagnostics: String::new(),
        }
    }

    pub fn failed(diagnostics: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostics: diagnostics.into(),
        }
    }

    fn from_command(result: &CommandResult) -> Self {
        let mut diagnostics = match result.stderr_trimmed() {
            "" => result.stdout_trimmed().to_string(),
            stderr => stderr.to_string(),
        };
        if !result.success() {
            diagnostics = if diagnostics.is_empty() {
                format!("exit code {}", result.code())
            } else {
                format!("exit code {}: {}", result.code(), diagnostics)
            };
        }
        Self {
            success: result.success(),
            diagnostics,
        }
    }
}

/// Operations the pipeline delegates to external tooling.
///
/// `Err` means the tool could not be run at all; a tool that ran and failed
/// returns `Ok` with `success == false`.
pub trait ImageTools {
    /// Extract the ISO 9660 tree of `image` into the existing, empty `dest`.
    fn extract_filesystem(&self, image: &Path, dest: &Path) -> Result<ToolOutput>;

    /// Write the image described by `plan`.
    fn compose_filesystem(&self, plan: &ComposePlan) -> Result<ToolOutput>;

    /// Decompress `archive` and unpack its cpio stream into the existing `dest`.
    fn unpack_archive(&self, archive: &Path, compression: Compression, dest: &Path) -> Result<ToolOutput>;

    /// Pack everything below `source` into a `newc` cpio stream compressed
    /// with `compression`, written to `output`.
    fn pack_archive(&self, source: &Path, compression: Compression, output: &Path) -> Result<ToolOutput>;

    /// Host commands every build needs, as (command, package).
    fn required_tools(&self) -> Vec<(&'static str, &'static str)> {
        REQUIRED_TOOLS.to_vec()
    }

    /// Extra host commands needed once the archive's compression is known.
    fn compression_tools(&self, compression: Compression) -> Vec<(&'static str, &'static str)> {
        compression.required_tool().into_iter().collect()
    }
}

/// [`ImageTools`] backed by xorriso, cpio and the compressor binaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostTools;

impl HostTools {
    pub fn new() -> Self {
        Self
    }
}

impl ImageTools for HostTools {
    fn extract_filesystem(&self, image: &Path, dest: &Path) -> Result<ToolOutput> {
        let result = Cmd::new("xorriso")
            .args(["-osirrox", "on"])
            .arg("-indev")
            .arg_path(image)
            .args(["-extract", "/"])
            .arg_path(dest)
            .allow_fail()
            .run()?;
        Ok(ToolOutput::from_command(&result))
    }

    fn compose_filesystem(&self, plan: &ComposePlan) -> Result<ToolOutput> {
        let result = Cmd::new("xorriso")
            .args(plan.xorriso_args())
            .allow_fail()
            .run()?;
        Ok(ToolOutput::from_command(&result))
    }

    fn unpack_archive(&self, archive: &Path, compression: Compression, dest: &Path) -> Result<ToolOutput> {
        let stream = dest.with_extension("cpio");
        let cpio_input = match compression.required_tool() {
            Some((tool, _)) => {
                let result = Cmd::new(tool)
                    .args(compression.decompress_args())
                    .stdin_file(archive)
                    .stdout_file(&stream)
                    .allow_fail()
                    .run()?;
                if !result.success() {
                    return Ok(ToolOutput::from_command(&result));
                }
                stream.as_path()
            }
            None => archive,
        };

        let result = Cmd::new("cpio")
            .args(["--extract", "--make-directories", "--no-absolute-filenames", "--quiet"])
            .stdin_file(cpio_input)
            .dir(dest)
            .allow_fail()
            .run()?;
        if stream.exists() {
            fs::remove_file(&stream)?;
        }
        Ok(ToolOutput::from_command(&result))
    }

    fn pack_archive(&self, source: &Path, compression: Compression, output: &Path) -> Result<ToolOutput> {
        let list = source.with_extension("list");
        write_file_list(source, &list)?;

        let stream = source.with_extension("cpio");
        let cpio_output = if compression == Compression::None {
            output
        } else {
            stream.as_path()
        };

        let result = Cmd::new("cpio")
            .args(["--create", "--null", "--format=newc", "--owner=0:0", "--quiet"])
            .stdin_file(&list)
            .stdout_file(cpio_output)
            .dir(source)
            .allow_fail()
            .run()?;
        fs::remove_file(&list)?;
        if !result.success() {
            return Ok(ToolOutput::from_command(&result));
        }

        let Some((tool, _)) = compression.required_tool() else {
            return Ok(ToolOutput::ok());
        };
        let result = Cmd::new(tool)
            .args(compression.compress_args())
            .stdin_file(&stream)
            .stdout_file(output)
            .allow_fail()
            .run()?;
        fs::remove_file(&stream)?;
        Ok(ToolOutput::from_command(&result))
    }
}
