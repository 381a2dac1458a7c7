//! autoiso - unattended-install ISO composer.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use autoiso::bootmenu::MenuOutcome;
use autoiso::preflight::{tool_report, REQUIRED_TOOLS};
use autoiso::stages::s01_fetch::{transport_for, FetchOutcome};
use autoiso::{pipeline, BuildContext, BuildOptions, Config, HostTools};

#[derive(Parser)]
#[command(name = "autoiso", version)]
#[command(about = "Compose an unattended-install ISO from a vendor installer image")]
#[command(
    after_help = "QUICK START:\n  autoiso preflight  Check host tools\n  autoiso build      Fetch, patch and compose the image\n  autoiso clean      Remove scratch state and output"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory holding autoiso.toml and the payload
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Config file (default: <project>/autoiso.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Base image URL, overriding source.url
    #[arg(long, global = true)]
    url: Option<String>,

    /// Keep the work directory after the build
    #[arg(long, global = true)]
    keep_work: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the unattended image
    Build,

    /// Download the base image into the cache only
    Fetch,

    /// Check that required host tools are installed
    Preflight,

    /// Remove work and output directories (downloads are kept)
    Clean {
        /// Also remove the base image cache
        #[arg(long)]
        cache: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Preflight => preflight(),
        Commands::Build => build(&context(&cli)?),
        Commands::Fetch => {
            let ctx = context(&cli)?;
            let transport = transport_for(&ctx.base.url)?;
            match pipeline::run_fetch(&ctx, transport.as_ref())? {
                FetchOutcome::Cached => println!("Cached: {}", ctx.base.cache_path.display()),
                FetchOutcome::Downloaded { bytes } => println!(
                    "Downloaded {} bytes: {}",
                    bytes,
                    ctx.base.cache_path.display()
                ),
            }
            Ok(())
        }
        Commands::Clean { cache } => {
            let removed = pipeline::clean(&context(&cli)?, cache)?;
            if removed.is_empty() {
                println!("Nothing to clean.");
            }
            for path in removed {
                println!("Removed {}", path.display());
            }
            Ok(())
        }
    }
}

fn context(cli: &Cli) -> Result<BuildContext> {
    let project = match &cli.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::load(&project, cli.config.as_deref())?;
    let options = BuildOptions {
        url_override: cli.url.clone(),
        keep_work: cli.keep_work,
    };
    BuildContext::new(&project, &config, &options)
}

fn build(ctx: &BuildContext) -> Result<()> {
    let transport = transport_for(&ctx.base.url)?;
    let summary = pipeline::run_build(ctx, &HostTools::new(), transport.as_ref())?;

    println!();
    println!("=== Build complete ===");
    println!("  Image:     {}", summary.output.display());
    println!("  Layout:    {} ({})", summary.archive.layout.name, summary.archive.compression);
    println!("  Add-ons:   {}", summary.injected.addons.len());
    println!("  Legacy:    {}", describe(&summary.menus.legacy));
    println!("  UEFI:      {}", describe(&summary.menus.uefi));
    println!("  Checksums: {} files", summary.manifest.entries.len());
    Ok(())
}

fn describe(outcome: &MenuOutcome) -> String {
    match outcome {
        MenuOutcome::Patched { changed } if changed.is_empty() => "already unattended".to_string(),
        MenuOutcome::Patched { changed } => format!("patched {} file(s)", changed.len()),
        MenuOutcome::Authored(path) => format!("authored {}", path.display()),
        MenuOutcome::Absent => "not present".to_string(),
    }
}

fn preflight() -> Result<()> {
    println!("Host tools:");
    let mut missing = 0;
    for (tool, found) in tool_report(REQUIRED_TOOLS) {
        match found {
            Some(path) => println!("  [PASS] {tool:<8} {path}"),
            None => {
                missing += 1;
                println!("  [FAIL] {tool:<8} not found");
            }
        }
    }
    if missing > 0 {
        bail!("{} required tool(s) missing", missing);
    }
    println!("All required tools present.");
    Ok(())
}
