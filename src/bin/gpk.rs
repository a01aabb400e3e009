//! gpk command-line tool
//!
//! Inspect packages, dump objects as JSON, and maintain the encrypted
//! composite mapper files of a client installation.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use gpk_rs::core::composite::{decrypt, encrypt};
use gpk_rs::{
    CancellationFlag, EngineBuilder, EngineConfig, IndexPatcher, LoadOptions, Package, PatchEntry,
    ProgressSink, Variant,
};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gpk")]
#[command(about = "Inspect and maintain game-asset packages and composite mappers")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a package summary as JSON
    Info { package: PathBuf },

    /// List the exports of a package
    Exports {
        package: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Dump one export as JSON
    Dump {
        package: PathBuf,
        /// Dotted path inside the package, e.g. `Group.Texture`
        object: String,
    },

    /// Decrypt a mapper file
    Decrypt { input: PathBuf, output: PathBuf },

    /// Encrypt a plaintext mapper file
    Encrypt { input: PathBuf, output: PathBuf },

    /// Point a composite entry at a new slice
    Patch {
        /// Encrypted composite mapper
        mapper: PathBuf,
        /// Composite name to patch
        name: String,
        /// Storage file holding the slice
        file: String,
        offset: u64,
        /// Slice size; 0 removes the entry
        size: u64,
        /// Object path of the package in the slice (defaults to the current one)
        #[arg(long)]
        object_path: Option<String>,
    },

    /// Bootstrap a content root and list its classes
    Classes {
        #[command(flatten)]
        root: RootArgs,
    },

    /// Write every composite slice as a standalone package
    Unpack {
        #[command(flatten)]
        root: RootArgs,
        out: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RootArgs {
    /// Content root (the directory holding CookedPC)
    #[arg(short = 'r', long)]
    root: PathBuf,

    /// Client variant (legacy, modern)
    #[arg(long, default_value = "modern")]
    variant: String,

    /// TOML configuration; `--root` and `--variant` override its values
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

impl RootArgs {
    fn builder(&self) -> anyhow::Result<EngineBuilder> {
        let config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => EngineConfig::default(),
        };
        Ok(EngineBuilder::new()
            .config(config)
            .root(&self.root)
            .variant(parse_variant(&self.variant)?))
    }
}

fn parse_variant(s: &str) -> anyhow::Result<Variant> {
    match s.to_lowercase().as_str() {
        "legacy" | "x86" | "32" => Ok(Variant::Legacy),
        "modern" | "x64" | "64" => Ok(Variant::Modern),
        _ => bail!("Invalid variant '{}'. Valid options: legacy, modern", s),
    }
}

/// Logs progress every few hundred items
struct LogProgress;

impl ProgressSink for LogProgress {
    fn started(&self, total: usize) {
        info!(total, "started");
    }

    fn advanced(&self, done: usize, total: usize, item: &str) {
        if done % 250 == 0 || done == total {
            info!(done, total, item, "progress");
        }
    }
}

fn open(path: &Path) -> anyhow::Result<std::sync::Arc<Package>> {
    Package::open(path, LoadOptions::default()).with_context(|| format!("opening {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Info { package } => {
            let package = open(&package)?;
            println!("{}", serde_json::to_string_pretty(package.summary())?);
        }
        Command::Exports { package, json } => {
            let package = open(&package)?;
            let exports = package.exports()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&exports)?);
            } else {
                for export in exports {
                    println!(
                        "{:>6}  {:<32} {:>10} {:>8}  {}",
                        export.index, export.class, export.serial_offset, export.serial_size, export.path
                    );
                }
            }
        }
        Command::Dump { package, object } => {
            let package = open(&package)?;
            let target = package.get_object(object.as_str())?;
            let value = package.object_json(target.index())?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Decrypt { input, output } => {
            let data = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            std::fs::write(&output, decrypt(&data))?;
            info!(bytes = data.len(), output = %output.display(), "decrypted");
        }
        Command::Encrypt { input, output } => {
            let data = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            std::fs::write(&output, encrypt(&data))?;
            info!(bytes = data.len(), output = %output.display(), "encrypted");
        }
        Command::Patch {
            mapper,
            name,
            file,
            offset,
            size,
            object_path,
        } => {
            let mut patcher = IndexPatcher::load(&mapper)?;
            let object_path = match object_path {
                Some(path) => path,
                None => match patcher.index()?.find(&name) {
                    Some(entry) => entry.object_path.clone(),
                    None => bail!("{} is not in {}; pass --object-path", name, mapper.display()),
                },
            };
            patcher.patch(
                &name,
                &PatchEntry {
                    filename: file,
                    object_path,
                    offset,
                    size,
                },
            )?;
            patcher.apply_to(&mapper)?;
            info!(composite = %name, mapper = %mapper.display(), "mapper patched");
        }
        Command::Classes { root } => {
            let engine = root.builder()?.with_bootstrap().build()?;
            for class in engine.classes()? {
                println!("{:<24} {}", class.package, class.chain);
            }
        }
        Command::Unpack { root, out } => {
            let engine = root.builder()?.build()?;
            engine.registry().load_mappers()?;
            let cancel = CancellationFlag::new();
            let report = engine.unpack_composites(&out, &cancel, &LogProgress)?;
            for failure in &report.errors {
                eprintln!("{}: {}", failure.item, failure.error);
            }
            info!(written = report.output.len(), failed = report.errors.len(), "unpack finished");
            if !report.errors.is_empty() {
                bail!("{} slices failed", report.errors.len());
            }
        }
    }
    Ok(())
}
