//! Package engine internals
//!
//! Layered bottom-up: byte streams and the name table, the object
//! directory, property streams and objects, packages, then the registry
//! and the composite index tooling on top.

pub mod builder;
pub mod bulk;
pub mod bulk_data;
pub mod class;
pub mod composite;
pub mod compression;
pub mod config;
pub mod directory;
pub mod error;
pub mod header;
pub mod mapper;
pub mod name;
pub mod object;
pub mod package;
pub mod property;
pub mod registry;
pub mod stream;
pub mod version;

pub use builder::PackageBuilder;
pub use class::{ClassDescriptor, ClassTree};
pub use config::{EngineConfig, Variant};
pub use error::{ErrorKind, GpkError, Result};
pub use object::{ClassKind, ImportResolver, LoadState, Object, Resolved};
pub use package::{ExportInfo, LoadOptions, ObjectKey, Package};
pub use registry::{MapperIndices, PackageHandle, PackageRegistry};
