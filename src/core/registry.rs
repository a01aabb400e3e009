//! Process-wide package cache and cross-package resolution
//!
//! The registry owns every package opened through it. Opens return a
//! [`PackageHandle`] retain token; callers give it back with
//! [`PackageRegistry::release`]. A package whose last token is released
//! moves to a small LRU of recently released packages and is reused from
//! there if opened again. A package pushed out of the LRU while something
//! outside the registry still holds it stays reachable through a weak
//! reference, so a later open returns that same instance instead of parsing
//! a second copy. [`PackageRegistry::collect_garbage`] drops released
//! packages that nothing outside the registry still holds.
//!
//! All cache access happens under one mutex, held while a missing package
//! is parsed, so two threads opening the same package get the same
//! instance.
//!
//! Name resolution order for [`PackageRegistry::open_by_name`]:
//!
//! 1. packages already open under that name
//! 2. package files directly in the cooked directory
//! 3. composite slices whose object path is the name
//! 4. the package-name mapper
//! 5. a recursive walk of the content root, when slow search is allowed

use crate::bulk::storage_path;
use crate::class::{ClassDescriptor, ClassTree};
use crate::composite::{CompositeEntry, CompositeIndex};
use crate::config::EngineConfig;
use crate::directory::{PackageIndex, Slot};
use crate::error::{ErrorKind, GpkError, Result};
use crate::mapper::{split_path, PackageNameIndex, RedirectorIndex};
use crate::object::{ClassKind, ImportResolver, Resolved};
use crate::package::Package;
use crate::stream::ByteSource;
use ahash::AHashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use regex::RegexBuilder;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

const PACKAGE_EXTENSIONS: &[&str] = &["gpk", "upk", "u", "umap"];

/// Retain token for an open package
///
/// Not `Clone`: take another token with [`PackageRegistry::retain`].
#[must_use = "release the handle through the registry"]
#[derive(Debug)]
pub struct PackageHandle {
    package: Arc<Package>,
    key: String,
}

impl PackageHandle {
    pub fn package(&self) -> &Arc<Package> {
        &self.package
    }

    /// Cache key the handle retains
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Deref for PackageHandle {
    type Target = Package;

    fn deref(&self) -> &Package {
        &self.package
    }
}

/// The three mapper files
#[derive(Debug, Default)]
pub struct MapperIndices {
    pub composite: CompositeIndex,
    pub packages: PackageNameIndex,
    pub redirectors: RedirectorIndex,
}

struct LiveEntry {
    package: Arc<Package>,
    retains: usize,
}

struct Cache {
    live: AHashMap<String, LiveEntry>,
    released: LruCache<String, Arc<Package>>,
    /// Evicted from `released` while still referenced elsewhere
    evicted: AHashMap<String, Weak<Package>>,
    /// Lowercase logical name -> cache key
    aliases: AHashMap<String, String>,
    /// Lowercase file stem -> package file in the cooked directory
    files: Option<AHashMap<String, PathBuf>>,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Cache {
            live: AHashMap::new(),
            released: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN)),
            evicted: AHashMap::new(),
            aliases: AHashMap::new(),
            files: None,
        }
    }

    fn acquire(&mut self, key: &str) -> Option<PackageHandle> {
        if let Some(entry) = self.live.get_mut(key) {
            entry.retains += 1;
            return Some(PackageHandle {
                package: entry.package.clone(),
                key: key.to_string(),
            });
        }
        let package = match self.released.pop(key) {
            Some(package) => package,
            None => self.evicted.remove(key)?.upgrade()?,
        };
        debug!(package = %package.name(), "reusing released package");
        self.live.insert(
            key.to_string(),
            LiveEntry {
                package: package.clone(),
                retains: 1,
            },
        );
        Some(PackageHandle {
            package,
            key: key.to_string(),
        })
    }

    fn acquire_alias(&mut self, name: &str) -> Option<PackageHandle> {
        let key = self.aliases.get(&name.to_ascii_lowercase())?.clone();
        self.acquire(&key)
    }

    fn insert(&mut self, key: String, package: Arc<Package>) -> PackageHandle {
        package.mark_ready();
        self.evicted.remove(&key);
        self.aliases
            .entry(package.name().to_ascii_lowercase())
            .or_insert_with(|| key.clone());
        self.live.insert(
            key.clone(),
            LiveEntry {
                package: package.clone(),
                retains: 1,
            },
        );
        PackageHandle { package, key }
    }

    fn alias(&mut self, name: &str, key: &str) {
        self.aliases
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| key.to_string());
    }
}

pub struct PackageRegistry {
    config: RwLock<EngineConfig>,
    cache: Mutex<Cache>,
    indices: RwLock<Option<Arc<MapperIndices>>>,
    classes: RwLock<Option<Arc<ClassTree>>>,
    class_handles: Mutex<Vec<PackageHandle>>,
}

impl PackageRegistry {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.released_cache_capacity;
        Ok(PackageRegistry {
            config: RwLock::new(config),
            cache: Mutex::new(Cache::new(capacity)),
            indices: RwLock::new(None),
            classes: RwLock::new(None),
            class_handles: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    pub fn root_path(&self) -> PathBuf {
        self.config.read().root_path.clone()
    }

    /// Point the registry at another content root
    ///
    /// Forgets every cached package, mapper and class; bootstrap again
    /// before resolving objects.
    pub fn set_root_path(&self, root: impl Into<PathBuf>) {
        let root = root.into();
        self.config.write().root_path = root.clone();
        self.class_handles.lock().clear();
        *self.classes.write() = None;
        *self.indices.write() = None;
        let capacity = self.config.read().released_cache_capacity;
        *self.cache.lock() = Cache::new(capacity);
        info!(root = %root.display(), "content root changed");
    }

    // --- opening -------------------------------------------------------------

    /// Open a package file
    pub fn open_by_path<P: AsRef<Path>>(&self, path: P) -> Result<PackageHandle> {
        let mut cache = self.cache.lock();
        self.open_path_locked(&mut cache, path.as_ref())
    }

    fn open_path_locked(&self, cache: &mut Cache, path: &Path) -> Result<PackageHandle> {
        let canonical = std::fs::canonicalize(path)
            .map_err(|_| GpkError::MissingPackage(path.display().to_string()))?;
        let key = format!("file:{}", canonical.to_string_lossy().to_ascii_lowercase());
        if let Some(handle) = cache.acquire(&key) {
            return Ok(handle);
        }
        let package = Package::open(&canonical, self.config.read().load_options())?;
        Ok(cache.insert(key, package))
    }

    /// Open a composite slice
    pub fn open_composite(&self, entry: &CompositeEntry) -> Result<PackageHandle> {
        let mut cache = self.cache.lock();
        self.open_composite_locked(&mut cache, entry)
    }

    fn open_composite_locked(&self, cache: &mut Cache, entry: &CompositeEntry) -> Result<PackageHandle> {
        let key = format!("composite:{}", entry.composite_name.to_ascii_lowercase());
        if let Some(handle) = cache.acquire(&key) {
            return Ok(handle);
        }
        let config = self.config.read().clone();
        let path = storage_path(&config.cooked_path(), &entry.filename);
        let source = ByteSource::map_file_range(&path, entry.offset, entry.size)
            .map_err(|e| e.context(format!("composite {}", entry.composite_name)))?;
        let package = Package::from_source(
            entry.object_path.clone(),
            source,
            Some(path),
            true,
            config.load_options(),
        )
        .map_err(|e| e.context(format!("composite {}", entry.composite_name)))?;
        let handle = cache.insert(key.clone(), package);
        cache.alias(&entry.composite_name, &key);
        Ok(handle)
    }

    /// Open a composite slice by its composite name
    pub fn open_composite_by_name(&self, composite_name: &str) -> Result<PackageHandle> {
        let indices = self.indices()?;
        let entry = indices
            .composite
            .find(composite_name)
            .ok_or_else(|| GpkError::MissingPackage(composite_name.to_string()))?;
        self.open_composite(entry)
    }

    /// Open a package by logical name
    pub fn open_by_name(&self, name: &str, allow_slow_search: bool) -> Result<PackageHandle> {
        let mut cache = self.cache.lock();
        if let Some(handle) = cache.acquire_alias(name) {
            return Ok(handle);
        }
        let config = self.config.read().clone();
        let lower = name.to_ascii_lowercase();

        let files = cache
            .files
            .get_or_insert_with(|| list_package_files(&config.cooked_path()));
        if let Some(path) = files.get(&lower).cloned() {
            let handle = self.open_path_locked(&mut cache, &path)?;
            cache.alias(name, &handle.key);
            return Ok(handle);
        }

        let indices = self.indices.read().clone();
        if let Some(indices) = indices {
            let entry = indices.composite.find_by_object_path(name).first().copied().or_else(|| {
                indices
                    .packages
                    .composite_for_package(name)
                    .and_then(|composite| indices.composite.find(composite))
            });
            if let Some(entry) = entry {
                let handle = self.open_composite_locked(&mut cache, entry)?;
                cache.alias(name, &handle.key);
                return Ok(handle);
            }
        }

        if allow_slow_search {
            if let Some(path) = find_package_file(&config.root_path, &lower) {
                debug!(name, path = %path.display(), "found package by slow search");
                let handle = self.open_path_locked(&mut cache, &path)?;
                cache.alias(name, &handle.key);
                return Ok(handle);
            }
        }
        Err(GpkError::MissingPackage(name.to_string()))
    }

    /// Take another retain token for the same package
    pub fn retain(&self, handle: &PackageHandle) -> PackageHandle {
        let mut cache = self.cache.lock();
        match cache.acquire(&handle.key) {
            Some(handle) => handle,
            None => {
                // Released elsewhere after a reset; re-register it
                cache.insert(handle.key.clone(), handle.package.clone())
            }
        }
    }

    /// Give back a retain token
    pub fn release(&self, handle: PackageHandle) {
        let mut cache = self.cache.lock();
        let Some(entry) = cache.live.get_mut(&handle.key) else {
            return;
        };
        entry.retains = entry.retains.saturating_sub(1);
        if entry.retains > 0 {
            return;
        }
        if let Some(entry) = cache.live.remove(&handle.key) {
            debug!(package = %entry.package.name(), "package released");
            if let Some((key, evicted)) = cache.released.push(handle.key.clone(), entry.package) {
                if key != handle.key {
                    debug!(package = %evicted.name(), "released package evicted");
                    // Still in use: a later open must find this instance
                    if Arc::strong_count(&evicted) > 1 {
                        cache.evicted.insert(key, Arc::downgrade(&evicted));
                    }
                }
            }
        }
    }

    /// Drop released packages that nothing else holds; returns how many
    pub fn collect_garbage(&self) -> usize {
        let mut cache = self.cache.lock();
        let unused: Vec<String> = cache
            .released
            .iter()
            .filter(|(_, package)| Arc::strong_count(package) == 1)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &unused {
            cache.released.pop(key);
        }
        cache.evicted.retain(|_, package| package.strong_count() > 0);
        if !unused.is_empty() {
            debug!(dropped = unused.len(), "released packages collected");
        }
        unused.len()
    }

    /// Packages with at least one outstanding retain token
    pub fn live_count(&self) -> usize {
        self.cache.lock().live.len()
    }

    pub fn released_count(&self) -> usize {
        self.cache.lock().released.len()
    }

    pub fn retain_count(&self, handle: &PackageHandle) -> usize {
        self.cache
            .lock()
            .live
            .get(&handle.key)
            .map_or(0, |entry| entry.retains)
    }

    // --- startup -----------------------------------------------------------

    /// Load the three mapper files concurrently
    ///
    /// Missing files are fatal for variants that ship composite bundles and
    /// read as empty otherwise. Any parse failure is fatal.
    pub fn load_mappers(&self) -> Result<Arc<MapperIndices>> {
        let config = self.config();
        let dir = config.cooked_path();
        let required = config.variant.requires_mappers();

        let (composite, packages, redirectors) = crossbeam::scope(|scope| {
            let composite = scope.spawn(|_| {
                load_mapper(&dir, &config.composite_mapper, required, |p| CompositeIndex::load(p))
            });
            let packages = scope.spawn(|_| {
                load_mapper(&dir, &config.package_mapper, required, |p| PackageNameIndex::load(p))
            });
            let redirectors = scope.spawn(|_| {
                load_mapper(&dir, &config.redirector_mapper, required, |p| RedirectorIndex::load(p))
            });
            (composite.join(), packages.join(), redirectors.join())
        })
        .map_err(|_| GpkError::WorkerPanicked("mapper load"))?;

        let indices = Arc::new(MapperIndices {
            composite: composite.map_err(|_| GpkError::WorkerPanicked("composite mapper load"))??,
            packages: packages.map_err(|_| GpkError::WorkerPanicked("package mapper load"))??,
            redirectors: redirectors.map_err(|_| GpkError::WorkerPanicked("redirector mapper load"))??,
        });
        info!(
            composites = indices.composite.len(),
            package_names = indices.packages.len(),
            redirectors = indices.redirectors.len(),
            "mapper indices loaded"
        );
        *self.indices.write() = Some(indices.clone());
        Ok(indices)
    }

    /// Load mappers, then the class packages in order, then the class tree
    ///
    /// A missing essential class package aborts with
    /// [`GpkError::MissingClassPackage`]; a missing extra one is skipped.
    pub fn bootstrap(&self) -> Result<Arc<ClassTree>> {
        let config = self.config();
        self.load_mappers()?;

        let mut handles = Vec::new();
        for name in config.essential_class_packages() {
            match self.open_by_name(&name, true) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in handles {
                        self.release(handle);
                    }
                    error!(package = %name, error = %err, "class package failed to load");
                    return Err(if err.kind() == ErrorKind::MissingDependency {
                        GpkError::MissingClassPackage(name)
                    } else {
                        err.context(name)
                    });
                }
            }
        }
        for name in config.extra_class_packages() {
            match self.open_by_name(&name, true) {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!(package = %name, error = %err, "optional class package skipped"),
            }
        }

        let tree = match ClassTree::build(handles.iter().map(|h| &**h.package())) {
            Ok(tree) => Arc::new(tree),
            Err(err) => {
                for handle in handles {
                    self.release(handle);
                }
                error!(error = %err, "class hierarchy is invalid");
                return Err(err);
            }
        };
        info!(packages = handles.len(), classes = tree.len(), "class packages loaded");
        let previous = std::mem::replace(&mut *self.class_handles.lock(), handles);
        for handle in previous {
            self.release(handle);
        }
        *self.classes.write() = Some(tree.clone());
        Ok(tree)
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.classes.read().is_some()
    }

    pub fn class_tree(&self) -> Result<Arc<ClassTree>> {
        self.classes.read().clone().ok_or(GpkError::NotBootstrapped)
    }

    pub fn indices(&self) -> Result<Arc<MapperIndices>> {
        self.indices.read().clone().ok_or(GpkError::NotBootstrapped)
    }

    // --- queries -----------------------------------------------------------

    pub fn enumerate_classes(&self) -> Result<Vec<ClassDescriptor>> {
        Ok(self.class_tree()?.classes().into_iter().cloned().collect())
    }

    pub fn enumerate_composite_names(&self) -> Result<Vec<String>> {
        Ok(self
            .indices()?
            .composite
            .composite_names()
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Composite names matching a case-insensitive regular expression
    pub fn find_composite_names(&self, pattern: &str) -> Result<Vec<String>> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| GpkError::Config(format!("invalid pattern {:?}: {}", pattern, e)))?;
        Ok(self
            .indices()?
            .composite
            .composite_names()
            .into_iter()
            .filter(|name| regex.is_match(name))
            .map(str::to_string)
            .collect())
    }

    // --- resolution --------------------------------------------------------

    /// Resolve `Package.Outer.Object`, following at most one redirect
    pub fn resolve_object_path(&self, path: &str) -> Result<Resolved> {
        if !self.is_bootstrapped() {
            return Err(GpkError::NotBootstrapped);
        }
        let indices = self.indices()?;
        let (target, followed) = match indices.redirectors.follow(path)? {
            Some(target) => {
                debug!(from = path, to = target, "following redirector mapping");
                (target, true)
            }
            None => (path, false),
        };
        let resolved = self.locate(&indices, target)?;
        if resolved.object.kind() != ClassKind::ObjectRedirector {
            return Ok(resolved);
        }
        if followed {
            return Err(GpkError::RedirectorChain {
                path: path.to_string(),
            });
        }

        let package = resolved.package;
        let redirect = package.redirector_target(resolved.object.index())?;
        let next = match redirect.slot() {
            Slot::Null => {
                return Err(GpkError::corrupt(
                    format!("redirector {}", path),
                    "redirector has no target",
                ))
            }
            Slot::Export(_) => Resolved {
                object: package.object(redirect)?,
                package: package.clone(),
            },
            Slot::Import(_) => self.locate(&indices, &package.object_path(redirect)?)?,
        };
        if next.object.kind() == ClassKind::ObjectRedirector {
            return Err(GpkError::RedirectorChain {
                path: path.to_string(),
            });
        }
        Ok(next)
    }

    /// Find the export a path names without following redirectors
    fn locate(&self, indices: &MapperIndices, path: &str) -> Result<Resolved> {
        let (package_name, inner) =
            split_path(path).ok_or_else(|| GpkError::MissingObject(path.to_string()))?;
        let top = inner.split('.').next().unwrap_or(inner);
        let mapped = indices
            .packages
            .resolve(&format!("{}.{}", package_name, top))
            .and_then(split_path)
            .and_then(|(composite, _)| indices.composite.find(composite));
        let handle = match mapped {
            Some(entry) => self.open_composite(entry)?,
            None => self.open_by_name(package_name, true)?,
        };
        let package = handle.package().clone();
        self.release(handle);
        let object = package
            .get_object(inner)
            .map_err(|_| GpkError::MissingObject(path.to_string()))?;
        Ok(Resolved { package, object })
    }
}

impl ImportResolver for PackageRegistry {
    fn resolve_import(&self, package: &Package, import: PackageIndex) -> Result<Resolved> {
        if !import.is_import() {
            return Err(GpkError::IndexOutOfRange {
                index: import.0 as i64,
                context: format!("imports of {}", package.name()),
            });
        }
        let path = package.object_path(import)?;
        self.resolve_object_path(&path)
            .map_err(|e| e.context(format!("{} import {}", package.name(), path)))
    }
}

impl std::fmt::Debug for PackageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageRegistry")
            .field("root", &self.root_path())
            .field("live", &self.live_count())
            .field("released", &self.released_count())
            .field("bootstrapped", &self.is_bootstrapped())
            .finish()
    }
}

fn load_mapper<T: Default>(
    dir: &Path,
    file: &str,
    required: bool,
    load: impl FnOnce(&Path) -> Result<T>,
) -> Result<T> {
    let path = dir.join(file);
    if path.exists() {
        return load(&path);
    }
    if required {
        Err(GpkError::MissingPackage(format!("mapper {}", path.display())))
    } else {
        debug!(path = %path.display(), "mapper file absent");
        Ok(T::default())
    }
}

fn is_package_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| PACKAGE_EXTENSIONS.iter().any(|p| p.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn stem_lower(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
}

/// Package files directly inside `dir`; first file wins on stem clashes
fn list_package_files(dir: &Path) -> AHashMap<String, PathBuf> {
    let mut files = AHashMap::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_package_file(p))
        .collect();
    paths.sort();
    for path in paths {
        if let Some(stem) = stem_lower(&path) {
            files.entry(stem).or_insert(path);
        }
    }
    files
}

/// Depth-first walk of `root` for a package file named `stem`
fn find_package_file(root: &Path, stem: &str) -> Option<PathBuf> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            if path.is_dir() {
                pending.push(path);
            } else if is_package_file(&path) && stem_lower(&path).as_deref() == Some(stem) {
                return Some(path);
            }
        }
    }
    None
}
