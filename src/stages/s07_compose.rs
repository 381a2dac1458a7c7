//! Compose the hybrid image from the mutated tree.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::artifact::iso::{
    catalog_for, extract_mbr_template, find_host_mbr_template, BootMaterial, ComposePlan,
    LegacyBoot, UefiBoot,
};
use crate::artifact::filesystem::partial_path;
use crate::build::context::BuildContext;
use crate::error::BuildError;
use crate::tools::ImageTools;

/// Build the compose plan for the tree in `ctx`.
///
/// Legacy boot needs an isohybrid MBR template; the base image's own boot
/// code is preferred, with a host template as fallback.
pub fn plan_image(ctx: &BuildContext) -> Result<ComposePlan> {
    let material = BootMaterial::detect(&ctx.iso_tree);
    if material.is_empty() {
        bail!(
            "no boot loader material in '{}'; cannot compose a bootable image",
            ctx.iso_tree.display()
        );
    }

    let legacy = match material.legacy_loader {
        Some(loader) => Some(LegacyBoot {
            catalog: catalog_for(&loader),
            mbr_template: mbr_template(&ctx.base.cache_path, &ctx.mbr_template())?,
            loader,
        }),
        None => None,
    };
    let uefi = material.uefi_image.map(|image| UefiBoot { image });

    Ok(ComposePlan {
        tree: ctx.iso_tree.clone(),
        output: ctx.output.clone(),
        volume_label: ctx.volume_label.clone(),
        legacy,
        uefi,
    })
}

fn mbr_template(base_image: &Path, scratch: &Path) -> Result<PathBuf> {
    if extract_mbr_template(base_image, scratch)? {
        return Ok(scratch.to_path_buf());
    }
    match find_host_mbr_template() {
        Some(host) => {
            tracing::info!(template = %host.display(), "base image has no MBR boot code; using host template");
            Ok(host)
        }
        None => bail!(
            "base image has no MBR boot code and no isohybrid template (isohdpfx.bin) is installed"
        ),
    }
}

/// Write the image described by `plan`, replacing any previous output.
///
/// The tool writes into `<output>.part`, which is renamed over the output
/// only on success. A failed compose leaves no image at the output path.
pub fn compose_image(tools: &dyn ImageTools, plan: &ComposePlan) -> Result<()> {
    if let Some(dir) = plan.output.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory '{}'", dir.display()))?;
    }
    for stale in [plan.output.clone(), partial_path(&plan.output)] {
        if stale.exists() {
            fs::remove_file(&stale)
                .with_context(|| format!("removing previous output '{}'", stale.display()))?;
        }
    }

    let staged = ComposePlan {
        output: partial_path(&plan.output),
        ..plan.clone()
    };
    tracing::info!(
        output = %plan.output.display(),
        legacy = plan.legacy.is_some(),
        uefi = plan.uefi.is_some(),
        "composing image"
    );
    if let Err(err) = run_compose(tools, &staged) {
        if let Err(rm) = fs::remove_file(&staged.output) {
            if rm.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %staged.output.display(), error = %rm, "could not remove partial image");
            }
        }
        return Err(err);
    }

    fs::rename(&staged.output, &plan.output).with_context(|| {
        format!(
            "moving '{}' into place at '{}'",
            staged.output.display(),
            plan.output.display()
        )
    })
}

fn run_compose(tools: &dyn ImageTools, plan: &ComposePlan) -> Result<()> {
    let output = tools
        .compose_filesystem(plan)
        .context("running image composition")?;
    if !output.success {
        return Err(BuildError::ToolFailed {
            tool: "xorriso",
            diagnostics: output.diagnostics,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::context::BuildOptions;
    use crate::config::Config;
    use crate::tools::stub::StubTools;
    use crate::tools::ToolOutput;
    use tempfile::TempDir;

    fn context(project: &Path) -> BuildContext {
        let config = Config::from_toml(project, "").unwrap();
        let ctx = BuildContext::new(project, &config, &BuildOptions::default()).unwrap();
        fs::create_dir_all(ctx.base.cache_path.parent().unwrap()).unwrap();
        let mut base = vec![0u8; 2048];
        base[0] = 0x33;
        fs::write(&ctx.base.cache_path, base).unwrap();
        ctx
    }

    fn touch(path: PathBuf) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn hybrid_tree_gets_both_entries() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        touch(ctx.iso_tree.join("isolinux/isolinux.bin"));
        touch(ctx.iso_tree.join("boot/grub/efi.img"));

        let plan = plan_image(&ctx).unwrap();

        let legacy = plan.legacy.as_ref().unwrap();
        assert_eq!(legacy.loader, "isolinux/isolinux.bin");
        assert_eq!(legacy.catalog, "isolinux/boot.cat");
        assert_eq!(legacy.mbr_template, ctx.mbr_template());
        assert_eq!(plan.uefi.as_ref().unwrap().image, "boot/grub/efi.img");
        assert_eq!(fs::read(ctx.mbr_template()).unwrap()[0], 0x33);
    }

    #[test]
    fn tree_without_efi_image_has_no_uefi_entry() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        touch(ctx.iso_tree.join("isolinux/isolinux.bin"));

        let plan = plan_image(&ctx).unwrap();
        assert!(plan.uefi.is_none());
        assert!(!plan.xorriso_args().contains(&"-e".to_string()));
    }

    #[test]
    fn uefi_only_tree_needs_no_mbr_template() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        fs::write(&ctx.base.cache_path, vec![0u8; 2048]).unwrap();
        touch(ctx.iso_tree.join("boot/grub/efi.img"));

        let plan = plan_image(&ctx).unwrap();
        assert!(plan.legacy.is_none());
        assert!(!ctx.mbr_template().exists());
    }

    #[test]
    fn compose_replaces_previous_output() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        touch(ctx.iso_tree.join("boot/grub/efi.img"));
        touch(ctx.output.clone());
        let plan = plan_image(&ctx).unwrap();
        let tools = StubTools::default();

        compose_image(&tools, &plan).unwrap();

        assert_eq!(fs::read(&ctx.output).unwrap(), b"composed image");
        assert_eq!(tools.composed.borrow().len(), 1);
    }

    #[test]
    fn failed_compose_leaves_no_output() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        touch(ctx.iso_tree.join("boot/grub/efi.img"));
        touch(ctx.output.clone());
        let plan = plan_image(&ctx).unwrap();
        let tools = StubTools {
            compose: ToolOutput::failed("libburn : SORRY : No space left on device"),
            ..Default::default()
        };

        let err = compose_image(&tools, &plan).unwrap_err();

        assert!(err.to_string().contains("xorriso failed"));
        let written = tools.composed.borrow()[0].output.clone();
        assert_eq!(written, partial_path(&ctx.output));
        assert!(!written.exists());
        assert!(!ctx.output.exists());
    }

    #[test]
    fn compose_writes_beside_output_then_renames() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        touch(ctx.iso_tree.join("boot/grub/efi.img"));
        let plan = plan_image(&ctx).unwrap();
        let tools = StubTools::default();

        compose_image(&tools, &plan).unwrap();

        assert_eq!(tools.composed.borrow()[0].output, partial_path(&ctx.output));
        assert!(!partial_path(&ctx.output).exists());
        assert!(ctx.output.is_file());
    }
}
