//! Artifact formats handled by the pipeline.
//!
//! - [`cpio`] - Boot archive compression and cpio file lists
//! - [`filesystem`] - Staging tree utilities
//! - [`iso`] - Boot material detection and the xorriso compose plan

pub mod cpio;
pub mod filesystem;
pub mod iso;
