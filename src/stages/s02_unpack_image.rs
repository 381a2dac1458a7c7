//! Unpack the base image's ISO 9660 tree into scratch space.

use anyhow::{Context, Result};
use std::path::Path;

use crate::artifact::filesystem::{make_tree_writable, recreate_dir};
use crate::error::BuildError;
use crate::tools::ImageTools;

/// Extract `image` into a freshly emptied `tree` and make it writable.
pub fn unpack_image(tools: &dyn ImageTools, image: &Path, tree: &Path) -> Result<()> {
    recreate_dir(tree)?;

    tracing::info!(image = %image.display(), tree = %tree.display(), "extracting image filesystem");
    let output = tools
        .extract_filesystem(image, tree)
        .with_context(|| format!("running filesystem extraction on '{}'", image.display()))?;
    if !output.success {
        return Err(BuildError::ToolFailed {
            tool: "xorriso",
            diagnostics: output.diagnostics,
        }
        .into());
    }

    make_tree_writable(tree)?;
    Ok(())
}
