//! Unattended-install ISO composition.
//!
//! Takes a vendor installer image and produces a hybrid (BIOS + UEFI)
//! bootable image that installs without interaction:
//!
//! ```text
//! verify tools -> fetch -> unpack image -> unpack boot archive
//!     -> inject payload -> patch boot menus -> checksums -> compose -> cleanup
//! ```
//!
//! - **Configuration** - [`config::Config`] from `autoiso.toml`, folded with
//!   CLI options into an immutable [`BuildContext`]
//! - **Layouts** - [`layout`] lists every place vendor images keep the boot
//!   archive, menus and loaders
//! - **Tools** - [`tools::ImageTools`] is the only way stages reach xorriso,
//!   cpio and the compressors
//! - **Stages** - one module per step under [`stages`], driven by
//!   [`pipeline::run_build`]
//!
//! # Example
//!
//! ```rust,ignore
//! use autoiso::{BuildContext, BuildOptions, Config, HostTools};
//! use autoiso::stages::s01_fetch::transport_for;
//!
//! let project = std::env::current_dir()?;
//! let config = Config::load(&project, None)?;
//! let ctx = BuildContext::new(&project, &config, &BuildOptions::default())?;
//! let transport = transport_for(&ctx.base.url)?;
//! let summary = autoiso::pipeline::run_build(&ctx, &HostTools::new(), transport.as_ref())?;
//! println!("{}", summary.output.display());
//! ```

pub mod artifact;
pub mod bootmenu;
pub mod build;
pub mod config;
pub mod error;
pub mod layout;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod stages;
pub mod tools;

pub use build::context::{BuildContext, BuildOptions};
pub use config::Config;
pub use error::BuildError;
pub use tools::{HostTools, ImageTools, ToolOutput};
