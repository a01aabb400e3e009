//! Objects and their load lifecycle
//!
//! Every export of an open package has one [`Object`] in the package's arena.
//! Objects start out `Constructed` and parse their serial data on first
//! [`Object::load`]:
//!
//! ```text
//! Constructed -> Loading -> Loaded -> PostLoaded
//! ```
//!
//! `Loaded` means the tags and payload are parsed; `PostLoaded` means the
//! direct dependencies were loaded as well. A load that needs an object which
//! is already being loaded on the same thread, or any dependency load that
//! finds its target mid-load, gets the partially constructed instance back
//! instead of recursing or blocking. Top-level loads from other threads wait.

mod kind;
mod payload;

pub use kind::ClassKind;
pub use payload::{Mip, ObjectBody, ObjectPayload};

use crate::directory::{PackageIndex, Slot};
use crate::error::{GpkError, Result};
use crate::package::Package;
use parking_lot::{Condvar, MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadState {
    Constructed,
    Loading,
    Loaded,
    PostLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    TopLevel,
    Dependency,
}

/// Resolves import references into objects of other packages
///
/// Implemented by the package registry; passed into loads that should follow
/// cross-package dependencies.
pub trait ImportResolver: Send + Sync {
    fn resolve_import(&self, package: &Package, import: PackageIndex) -> Result<Resolved>;
}

/// An object of another package together with the package keeping it alive
#[derive(Debug, Clone)]
pub struct Resolved {
    pub package: Arc<Package>,
    pub object: Arc<Object>,
}

struct LoadSlot {
    state: LoadState,
    loader: Option<ThreadId>,
}

pub struct Object {
    package: Weak<Package>,
    index: PackageIndex,
    kind: RwLock<ClassKind>,
    slot: Mutex<LoadSlot>,
    finished: Condvar,
    body: RwLock<Option<ObjectBody>>,
}

impl Object {
    pub(crate) fn new(package: Weak<Package>, index: PackageIndex, kind: ClassKind) -> Self {
        Object {
            package,
            index,
            kind: RwLock::new(kind),
            slot: Mutex::new(LoadSlot {
                state: LoadState::Constructed,
                loader: None,
            }),
            finished: Condvar::new(),
            body: RwLock::new(None),
        }
    }

    pub fn index(&self) -> PackageIndex {
        self.index
    }

    pub fn kind(&self) -> ClassKind {
        *self.kind.read()
    }

    /// Owning package, if it is still open
    pub fn package(&self) -> Result<Arc<Package>> {
        self.package
            .upgrade()
            .ok_or_else(|| GpkError::MissingPackage(format!("owner of export {}", self.index)))
    }

    /// Dotted path inside the owning package
    pub fn path(&self) -> Result<String> {
        self.package()?.object_path(self.index)
    }

    pub fn class_name(&self) -> Result<String> {
        self.package()?.class_name(self.index)
    }

    pub fn state(&self) -> LoadState {
        self.slot.lock().state
    }

    /// Fully loaded, dependencies included
    pub fn is_ready(&self) -> bool {
        self.state() == LoadState::PostLoaded
    }

    /// Load this object and the exports it references
    pub fn load(&self) -> Result<()> {
        self.load_inner(LoadMode::TopLevel, None)
    }

    /// Load this object, following imports through `resolver`
    pub fn load_with(&self, resolver: &dyn ImportResolver) -> Result<()> {
        self.load_inner(LoadMode::TopLevel, Some(resolver))
    }

    fn load_inner(&self, mode: LoadMode, resolver: Option<&dyn ImportResolver>) -> Result<()> {
        let me = thread::current().id();
        {
            let mut slot = self.slot.lock();
            loop {
                if let Some(owner) = slot.loader {
                    if owner == me || mode == LoadMode::Dependency {
                        return Ok(());
                    }
                    self.finished.wait(&mut slot);
                    continue;
                }
                match slot.state {
                    LoadState::Loaded | LoadState::PostLoaded => return Ok(()),
                    LoadState::Constructed | LoadState::Loading => break,
                }
            }
            slot.state = LoadState::Loading;
            slot.loader = Some(me);
        }

        let result = self.run_load(resolver);

        {
            let mut slot = self.slot.lock();
            slot.loader = None;
            if result.is_ok() {
                slot.state = LoadState::PostLoaded;
            } else {
                slot.state = LoadState::Constructed;
                *self.body.write() = None;
            }
        }
        self.finished.notify_all();
        result.map_err(|e| {
            let path = self.path().unwrap_or_else(|_| format!("export {}", self.index));
            e.context(path)
        })
    }

    fn run_load(&self, resolver: Option<&dyn ImportResolver>) -> Result<()> {
        let package = self.package()?;
        let body = package.parse_body(self.index, self.kind())?;
        let dependencies = body.dependencies.clone();
        *self.body.write() = Some(body);
        self.slot.lock().state = LoadState::Loaded;
        debug!(package = %package.name(), export = %self.index, "object parsed");

        if !package.options().load_dependencies {
            return Ok(());
        }
        for dependency in dependencies {
            match dependency.slot() {
                Slot::Null => {}
                Slot::Export(_) => package
                    .object(dependency)?
                    .load_inner(LoadMode::Dependency, resolver)?,
                Slot::Import(_) => {
                    if let Some(resolver) = resolver {
                        let resolved = resolver.resolve_import(&package, dependency)?;
                        resolved
                            .object
                            .load_inner(LoadMode::Dependency, Some(resolver))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Parsed state; `None` until loaded
    pub fn body(&self) -> Option<MappedRwLockReadGuard<'_, ObjectBody>> {
        RwLockReadGuard::try_map(self.body.read(), |b| b.as_ref()).ok()
    }

    /// Mutate the parsed state and mark the export dirty
    pub fn update<R>(&self, f: impl FnOnce(&mut ObjectBody) -> R) -> Result<R> {
        let out = {
            let mut guard = self.body.write();
            let body = guard.as_mut().ok_or_else(|| {
                GpkError::corrupt(format!("export {}", self.index), "object is not loaded")
            })?;
            f(body)
        };
        self.package()?.mark_dirty(self.index)?;
        Ok(out)
    }

    /// Drop the parsed state; refused while a load is in progress
    pub fn unload(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.loader.is_some() {
            return false;
        }
        slot.state = LoadState::Constructed;
        *self.body.write() = None;
        true
    }

    /// Install a body directly (redirector conversion, builders)
    pub(crate) fn replace(&self, kind: ClassKind, body: ObjectBody) {
        let mut slot = self.slot.lock();
        *self.kind.write() = kind;
        *self.body.write() = Some(body);
        slot.state = LoadState::PostLoaded;
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("index", &self.index)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}
