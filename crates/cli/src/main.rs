use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stratum_lib::config::{BackendKind, Config};

mod cmd;
mod output;

use cmd::{BuildArgs, parse_env};
use output::OutputFormat;

/// stratum - build layered OS images and extract them for boot
#[derive(Parser)]
#[command(name = "stratum")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose (debug) logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short = 'o', long, global = true, value_enum, default_value = "text")]
  output: OutputFormat,

  /// Execution backend: docker or native (overrides STRATUM_BACKEND)
  #[arg(long, global = true)]
  backend: Option<BackendKind>,

  /// Native backend store root (overrides STRATUM_STORE)
  #[arg(long, global = true, value_name = "DIR")]
  store: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Load and validate every image definition
  Validate {
    /// Directory holding the image definitions (overrides STRATUM_IMAGES)
    #[arg(long, value_name = "DIR")]
    images_dir: Option<PathBuf>,
  },

  /// List images in build order with their parents
  List {
    /// Directory holding the image definitions (overrides STRATUM_IMAGES)
    #[arg(long, value_name = "DIR")]
    images_dir: Option<PathBuf>,
  },

  /// Build one image (and any missing ancestors), or every image
  Build {
    /// Image to build; builds every image when omitted
    image: Option<String>,

    /// Directory holding the image definitions (overrides STRATUM_IMAGES)
    #[arg(long, value_name = "DIR")]
    images_dir: Option<PathBuf>,

    /// Namespace prepended to built image names (overrides STRATUM_PREFIX)
    #[arg(long)]
    prefix: Option<String>,

    /// Extra tag applied to each built image (repeatable)
    #[arg(short, long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// Environment variable for build scripts (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Host directory mounted at /packages during builds
    #[arg(long, value_name = "DIR")]
    package_cache: Option<PathBuf>,

    /// Rebuild ancestors even if they are already in the store
    #[arg(long)]
    rebuild_parents: bool,
  },

  /// Extract a built image's staged content into a directory
  Extract {
    /// Image reference to extract
    image: String,

    /// Destination directory (created if missing, emptied if not)
    destination: PathBuf,

    /// Fail unless the rootfs, kernel, and initramfs were extracted
    #[arg(long)]
    verify_boot: bool,
  },

  /// Import a root filesystem tarball as a base image
  Import {
    /// Reference to store the image under
    reference: String,

    /// Tarball (optionally gzip-compressed)
    tarball: PathBuf,
  },

  /// Remove unused layers and snapshots from the native store
  Gc {
    /// Show what would be removed without deleting anything
    #[arg(long)]
    dry_run: bool,

    /// Age after which an unreleased lease is considered abandoned
    #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
    lease_expiry: Duration,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let mut config = Config::from_env().context("Invalid configuration")?;
  if let Some(backend) = cli.backend {
    config.backend = backend;
  }
  if let Some(store) = cli.store {
    config.store = store;
  }

  match cli.command {
    Commands::Validate { images_dir } => cmd::cmd_validate(images_dir, &config, cli.output),
    Commands::List { images_dir } => cmd::cmd_list(images_dir, &config, cli.output),
    Commands::Build {
      image,
      images_dir,
      prefix,
      tags,
      env,
      package_cache,
      rebuild_parents,
    } => cmd::cmd_build(
      BuildArgs {
        image,
        images_dir,
        prefix,
        tags,
        env,
        package_cache,
        rebuild_parents,
      },
      &config,
      cli.output,
    ),
    Commands::Extract {
      image,
      destination,
      verify_boot,
    } => cmd::cmd_extract(&image, &destination, verify_boot, &config, cli.output),
    Commands::Import { reference, tarball } => cmd::cmd_import(&reference, &tarball, &config, cli.output),
    Commands::Gc { dry_run, lease_expiry } => cmd::cmd_gc(dry_run, lease_expiry, &config, cli.output),
  }
}
