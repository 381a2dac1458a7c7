//! Pipeline driver.
//!
//! Runs the stages in order against one [`BuildContext`]. Every stage
//! failure is reported as `stage '<name>' failed` with the cause chain
//! underneath. Host tools and the payload are checked before anything on
//! disk changes; after that an advisory lock on the work directory keeps a
//! second invocation from trampling the scratch trees.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::bootmenu::MenuReport;
use crate::build::context::{BuildContext, ARTIFACTS_DIR};
use crate::error::BuildError;
use crate::preflight::check_required_tools;
use crate::stages::s01_fetch::{fetch_base_image, FetchOutcome, Transport};
use crate::stages::s02_unpack_image::unpack_image;
use crate::stages::s03_boot_archive::{unpack_boot_archive, BootArchive};
use crate::stages::s04_payload::{inject_payload, Injected};
use crate::stages::s05_boot_menu::patch_menus;
use crate::stages::s06_checksum::{regenerate_checksums, Manifest};
use crate::stages::s07_compose::{compose_image, plan_image};
use crate::stages::s08_cleanup::remove_scratch;
use crate::stages::Stage;
use crate::tools::ImageTools;

/// Exclusive hold on a project's work directory, released on drop.
///
/// The lock file itself is left in place: unlinking it while another
/// process waits on it would let a third process lock a fresh inode.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
    path: PathBuf,
}

impl BuildLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            return Err(BuildError::Locked(path.to_path_buf()).into());
        }
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub output: PathBuf,
    pub fetched: FetchOutcome,
    pub archive: BootArchive,
    pub injected: Injected,
    pub menus: MenuReport,
    pub manifest: Manifest,
}

fn in_stage<T>(stage: Stage, run: impl FnOnce() -> Result<T>) -> Result<T> {
    tracing::info!(%stage, "stage started");
    let value = run().with_context(|| format!("stage '{stage}' failed"))?;
    tracing::debug!(%stage, "stage finished");
    Ok(value)
}

/// Checks that must pass before anything is written.
fn verify(ctx: &BuildContext, tools: &dyn ImageTools) -> Result<()> {
    in_stage(Stage::VerifyTools, || {
        check_required_tools(&tools.required_tools())?;
        if !ctx.payload.config.is_file() {
            bail!(
                "automation config '{}' does not exist",
                ctx.payload.config.display()
            );
        }
        Ok(())
    })
}

/// Run the full pipeline and compose the output image.
///
/// Scratch state is removed afterwards whether or not the build succeeded,
/// unless the context asks to keep it.
pub fn run_build(
    ctx: &BuildContext,
    tools: &dyn ImageTools,
    transport: &dyn Transport,
) -> Result<BuildSummary> {
    verify(ctx, tools)?;

    let lock = BuildLock::acquire(&ctx.lock_path())?;
    tracing::debug!(lock = %lock.path().display(), "work directory locked");

    let result = run_stages(ctx, tools, transport);

    if ctx.keep_work {
        tracing::info!(work = %ctx.work_dir.display(), "keeping work directory");
    } else {
        tracing::info!(stage = %Stage::Cleanup, "stage started");
        let failed = remove_scratch(&ctx.scratch_paths());
        if !failed.is_empty() {
            tracing::warn!(count = failed.len(), "some scratch paths were left behind");
        }
    }

    result
}

fn run_stages(
    ctx: &BuildContext,
    tools: &dyn ImageTools,
    transport: &dyn Transport,
) -> Result<BuildSummary> {
    let fetched = in_stage(Stage::Fetch, || {
        fetch_base_image(&ctx.base.url, &ctx.base.cache_path, transport)
    })?;

    in_stage(Stage::UnpackImage, || {
        unpack_image(tools, &ctx.base.cache_path, &ctx.iso_tree)
    })?;

    let archive = in_stage(Stage::UnpackBootArchive, || {
        let archive = BootArchive::locate(&ctx.iso_tree)?;
        unpack_boot_archive(tools, &archive, &ctx.archive_staging)?;
        Ok(archive)
    })?;

    let injected = in_stage(Stage::InjectPayload, || {
        inject_payload(tools, &ctx.payload, &archive, &ctx.archive_staging)
    })?;

    let menus = in_stage(Stage::PatchBootMenus, || patch_menus(&ctx.iso_tree, &archive))?;

    let manifest = in_stage(Stage::RegenerateChecksums, || {
        regenerate_checksums(&ctx.iso_tree)
    })?;

    in_stage(Stage::ComposeImage, || {
        let plan = plan_image(ctx)?;
        compose_image(tools, &plan)
    })?;

    tracing::info!(output = %ctx.output.display(), "image composed");
    Ok(BuildSummary {
        output: ctx.output.clone(),
        fetched,
        archive,
        injected,
        menus,
        manifest,
    })
}

/// Populate the cache without building.
pub fn run_fetch(ctx: &BuildContext, transport: &dyn Transport) -> Result<FetchOutcome> {
    let _lock = BuildLock::acquire(&ctx.lock_path())?;
    in_stage(Stage::Fetch, || {
        fetch_base_image(&ctx.base.url, &ctx.base.cache_path, transport)
    })
}

/// Remove scratch state and the output, and the whole cache when
/// `include_cache` is set. Returns what was removed.
pub fn clean(ctx: &BuildContext, include_cache: bool) -> Result<Vec<PathBuf>> {
    let _lock = BuildLock::acquire(&ctx.lock_path())?;

    let mut targets = ctx.scratch_paths();
    targets.push(ctx.output_dir().to_path_buf());
    if include_cache {
        targets.push(ctx.project_dir.join(ARTIFACTS_DIR).join("cache"));
    }

    let present: Vec<PathBuf> = targets.into_iter().filter(|p| p.exists()).collect();
    let failed = remove_scratch(&present);
    if !failed.is_empty() {
        bail!(
            "could not remove: {}",
            failed
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(present)
}
