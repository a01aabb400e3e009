//! # gpk-rs - Package engine for composite game-asset containers
//!
//! `gpk-rs` reads and writes UE3-style `.gpk` packages: name tables, object
//! directories, lazily parsed property streams, and the encrypted mapper
//! files that locate packages inside composite bundles.
//!
//! - **Two format versions** (legacy 32-bit and modern 64-bit clients)
//! - **Lazy objects** parsed on first access, shared across threads
//! - **Cross-package resolution** through a process-wide package registry
//! - **Composite index tooling**: cipher, parser and an atomic patcher
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gpk_rs::{Engine, Result};
//!
//! # fn main() -> Result<()> {
//! let engine = Engine::builder()
//!     .root("D:/TERA/Client/S1Game")
//!     .build()?;
//! engine.bootstrap()?;
//!
//! let resolved = engine.load_object("S1UI_Chat.ChatWindow")?;
//! println!("{}", resolved.object.class_name()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Standalone packages
//!
//! ```rust,no_run
//! use gpk_rs::{LoadOptions, Package, Result};
//!
//! # fn main() -> Result<()> {
//! let package = Package::open("Core.u", LoadOptions::default())?;
//! for export in package.exports()? {
//!     println!("{} ({})", export.path, export.class);
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
pub(crate) use core::{
    builder, bulk, bulk_data, class, composite, compression, config, directory, error, header,
    mapper, name, object, package, property, registry, stream, version,
};

pub use crate::core::{
    bulk::{BatchOptions, BatchReport, CancellationFlag, ItemError, NullProgress, ProgressSink},
    composite::{CompositeEntry, CompositeIndex, IndexPatcher, PatchEntry},
    directory::PackageIndex,
    mapper::{PackageNameIndex, RedirectorIndex},
    property::{PropertyTag, PropertyType, PropertyValue},
    version::FormatVersion,
    ClassDescriptor, ClassKind, ClassTree, EngineConfig, ErrorKind, ExportInfo, GpkError,
    ImportResolver, LoadOptions, LoadState, Object, Package, PackageBuilder, PackageHandle,
    PackageRegistry, Resolved, Result, Variant,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Content directory of one client, with its package registry
///
/// Cheap to clone; clones share the registry.
#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<PackageRegistry>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        info!(root = %config.root_path.display(), variant = ?config.variant, "engine created");
        Ok(Engine {
            registry: Arc::new(PackageRegistry::new(config)?),
        })
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn registry(&self) -> &Arc<PackageRegistry> {
        &self.registry
    }

    pub fn config(&self) -> EngineConfig {
        self.registry.config()
    }

    /// Load the mapper files and class packages
    pub fn bootstrap(&self) -> Result<Arc<ClassTree>> {
        self.registry.bootstrap()
    }

    pub fn set_root_path(&self, root: impl Into<PathBuf>) {
        self.registry.set_root_path(root)
    }

    /// Open a package file; give the handle back with [`Engine::release`]
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<PackageHandle> {
        self.registry.open_by_path(path)
    }

    /// Open a package by name, searching the content root when needed
    pub fn open_package(&self, name: &str) -> Result<PackageHandle> {
        self.registry.open_by_name(name, true)
    }

    pub fn release(&self, handle: PackageHandle) {
        self.registry.release(handle)
    }

    /// Find the object at `Package.Outer.Name` without loading it
    pub fn resolve(&self, path: &str) -> Result<Resolved> {
        self.registry.resolve_object_path(path)
    }

    /// Find and load the object at `Package.Outer.Name`
    pub fn load_object(&self, path: &str) -> Result<Resolved> {
        let resolved = self.resolve(path)?;
        resolved.object.load_with(self.registry.as_ref())?;
        Ok(resolved)
    }

    pub fn classes(&self) -> Result<Vec<ClassDescriptor>> {
        self.registry.enumerate_classes()
    }

    pub fn composite_names(&self) -> Result<Vec<String>> {
        self.registry.enumerate_composite_names()
    }

    pub fn find_composites(&self, pattern: &str) -> Result<Vec<String>> {
        self.registry.find_composite_names(pattern)
    }

    fn batch_options(&self) -> BatchOptions {
        let config = self.config();
        BatchOptions {
            workers: config.dump_workers,
            poll_interval: config.cancel_poll_interval,
        }
    }

    /// Write every composite slice to `out_dir` as a standalone package
    pub fn unpack_composites(
        &self,
        out_dir: &Path,
        cancel: &CancellationFlag,
        progress: &dyn ProgressSink,
    ) -> Result<BatchReport<PathBuf>> {
        let indices = self.registry.indices()?;
        bulk::unpack_composites(
            &indices.composite,
            &self.config().cooked_path(),
            out_dir,
            self.batch_options(),
            cancel,
            progress,
        )
    }

    /// Rebuild the package-name mapper from the composite index and save it
    pub fn rebuild_package_names(
        &self,
        cancel: &CancellationFlag,
        progress: &dyn ProgressSink,
    ) -> Result<BatchReport<Vec<(String, String)>>> {
        let config = self.config();
        let indices = self.registry.indices()?;
        let (names, report) = PackageNameIndex::rebuild_from(
            &indices.composite,
            &config.cooked_path(),
            self.batch_options(),
            cancel,
            progress,
        )?;
        if !report.cancelled {
            names.map().save(config.cooked_path().join(&config.package_mapper))?;
        }
        Ok(report)
    }

    /// Point `composite_name` at a new slice in the on-disk composite mapper
    ///
    /// Reload the mappers (or bootstrap again) to see the change.
    pub fn patch_composite_index(&self, composite_name: &str, entry: &PatchEntry) -> Result<()> {
        let config = self.config();
        let path = config.cooked_path().join(&config.composite_mapper);
        let mut patcher = IndexPatcher::load(&path)?;
        patcher.patch(composite_name, entry)?;
        patcher.apply_to(&path)
    }
}

/// Builder for [`Engine`]
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    bootstrap: bool,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder::default()
    }

    /// Start from a TOML configuration file
    pub fn config_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(EngineBuilder {
            config: EngineConfig::load(path)?,
            bootstrap: false,
        })
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Content root (the directory holding `CookedPC`)
    pub fn root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.config.root_path = root.into();
        self
    }

    pub fn variant(mut self, variant: Variant) -> Self {
        self.config.variant = variant;
        self
    }

    /// Replace the essential class package list
    pub fn class_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.class_packages = Some(packages.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the optional class package list
    pub fn extra_class_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.extra_class_packages = Some(packages.into_iter().map(Into::into).collect());
        self
    }

    pub fn load_dependencies(mut self, enabled: bool) -> Self {
        self.config.load_dependencies = enabled;
        self
    }

    /// Bootstrap as part of [`EngineBuilder::build`]
    pub fn with_bootstrap(mut self) -> Self {
        self.bootstrap = true;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let engine = Engine::new(self.config)?;
        if self.bootstrap {
            engine.bootstrap()?;
        }
        Ok(engine)
    }
}
