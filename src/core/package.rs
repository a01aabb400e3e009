//! Open packages
//!
//! A [`Package`] holds the uncompressed package image, its summary, name
//! table and object directory, and one [`Object`] slot per export. Objects
//! are created when the package is opened and parse their data on demand.

use crate::compression::{read_chunk, CompressedChunk};
use crate::directory::{ImportRecord, ObjectDirectory, PackageIndex};
use crate::error::{GpkError, Result};
use crate::header::{PackageSummary, PACKAGE_STORE_COMPRESSED};
use crate::name::{Name, NameTable};
use crate::object::{ClassKind, Object, ObjectBody, ObjectPayload};
use crate::property::tags_to_json;
use crate::stream::{ByteSource, Stream};
use crate::version::FormatVersion;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const NAME_ENTRY_MIN_SIZE: usize = 12;
/// Upper bound on zlib expansion used to reject absurd chunk sizes
const MAX_EXPANSION: i64 = 1032;

/// Per-package load behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub max_property_depth: usize,
    pub load_dependencies: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            max_property_depth: 64,
            load_dependencies: true,
        }
    }
}

/// Lookup key for [`Package::get_object`]
#[derive(Debug, Clone, Copy)]
pub enum ObjectKey<'a> {
    Index(PackageIndex),
    Path(&'a str),
}

impl From<PackageIndex> for ObjectKey<'_> {
    fn from(index: PackageIndex) -> Self {
        ObjectKey::Index(index)
    }
}

impl<'a> From<&'a str> for ObjectKey<'a> {
    fn from(path: &'a str) -> Self {
        ObjectKey::Path(path)
    }
}

/// Directory listing row
#[derive(Debug, Clone, Serialize)]
pub struct ExportInfo {
    pub index: i32,
    pub path: String,
    pub class: String,
    pub serial_offset: i32,
    pub serial_size: i32,
    pub dirty: bool,
}

pub struct Package {
    name: String,
    path: Option<PathBuf>,
    composite: bool,
    image: ByteSource,
    summary: PackageSummary,
    /// Lock order: `names` before `directory`
    names: RwLock<NameTable>,
    directory: RwLock<ObjectDirectory>,
    /// Directory bytes after the export table (depends map, thumbnails)
    tail: Vec<u8>,
    tail_start: usize,
    objects: Vec<Arc<Object>>,
    options: LoadOptions,
    ready: AtomicBool,
}

impl Package {
    /// Open a standalone package file
    pub fn open<P: AsRef<Path>>(path: P, options: LoadOptions) -> Result<Arc<Package>> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source = ByteSource::map_file(path)?;
        Package::from_source(name, source, Some(path.to_path_buf()), false, options)
            .map_err(|e| e.context(path.display().to_string()))
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>, options: LoadOptions) -> Result<Arc<Package>> {
        Package::from_source(name.into(), ByteSource::from_vec(bytes), None, false, options)
    }

    /// Parse summary and directory from `source`
    pub fn from_source(
        name: String,
        source: ByteSource,
        path: Option<PathBuf>,
        composite: bool,
        options: LoadOptions,
    ) -> Result<Arc<Package>> {
        let mut stream = Stream::reader(source.clone(), FormatVersion::Legacy);
        let summary = PackageSummary::read(&mut stream)?;
        let image = if summary.is_compressed() {
            decompress(&source, &summary)?
        } else {
            source
        };

        let mut stream = Stream::reader(image.clone(), summary.version);
        stream.seek(summary.name_offset as usize)?;
        let name_count = summary.name_count as usize;
        if name_count.saturating_mul(NAME_ENTRY_MIN_SIZE) > stream.remaining() {
            return Err(GpkError::corrupt(
                "name table",
                format!("{} entries do not fit", name_count),
            ));
        }
        let names = NameTable::read(&mut stream, name_count)?;
        stream.seek(summary.import_offset as usize)?;
        let imports = ObjectDirectory::read_imports(&mut stream, summary.import_count as usize)?;
        stream.seek(summary.export_offset as usize)?;
        let exports = ObjectDirectory::read_exports(&mut stream, summary.export_count as usize)?;
        let directory = ObjectDirectory::new(imports, exports);
        directory.validate(&names)?;

        let tail_start = stream.position();
        let header_size = summary.header_size as usize;
        let tail = if header_size > tail_start {
            image.slice(tail_start, header_size - tail_start)?.to_vec()
        } else {
            Vec::new()
        };

        let mut slots = Vec::with_capacity(directory.export_count());
        for slot in 0..directory.export_count() {
            let index = PackageIndex::from_export(slot)?;
            let class = directory.class_name(index, &names)?;
            slots.push((index, ClassKind::from_class_name(&class)));
        }

        info!(
            package = %name,
            version = %summary.version,
            names = names.len(),
            imports = directory.import_count(),
            exports = directory.export_count(),
            composite,
            "package opened"
        );

        Ok(Arc::new_cyclic(|weak| Package {
            objects: slots
                .into_iter()
                .map(|(index, kind)| Arc::new(Object::new(weak.clone(), index, kind)))
                .collect(),
            name,
            path,
            composite,
            image,
            summary,
            names: RwLock::new(names),
            directory: RwLock::new(directory),
            tail,
            tail_start,
            options,
            ready: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_composite(&self) -> bool {
        self.composite
    }

    pub fn version(&self) -> FormatVersion {
        self.summary.version
    }

    pub fn summary(&self) -> &PackageSummary {
        &self.summary
    }

    pub fn options(&self) -> LoadOptions {
        self.options
    }

    pub fn names(&self) -> RwLockReadGuard<'_, NameTable> {
        self.names.read()
    }

    pub fn directory(&self) -> RwLockReadGuard<'_, ObjectDirectory> {
        self.directory.read()
    }

    pub fn export_count(&self) -> usize {
        self.objects.len()
    }

    pub fn import_count(&self) -> usize {
        self.directory.read().import_count()
    }

    /// Whether the registry finished setting this package up
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Object slot for an export index
    pub fn object(&self, index: PackageIndex) -> Result<Arc<Object>> {
        index
            .export_slot()
            .and_then(|slot| self.objects.get(slot))
            .cloned()
            .ok_or_else(|| GpkError::IndexOutOfRange {
                index: index.0 as i64,
                context: format!("exports of {}", self.name),
            })
    }

    pub fn objects(&self) -> &[Arc<Object>] {
        &self.objects
    }

    /// Look up an export by index or by dotted path
    pub fn get_object<'a>(&self, key: impl Into<ObjectKey<'a>>) -> Result<Arc<Object>> {
        match key.into() {
            ObjectKey::Index(index) => self.object(index),
            ObjectKey::Path(path) => {
                let found = {
                    let names = self.names.read();
                    self.directory.read().find_export(path, &names)
                };
                let index = found
                    .ok_or_else(|| GpkError::MissingObject(format!("{}.{}", self.name, path)))?;
                self.object(index)
            }
        }
    }

    pub fn object_path(&self, index: PackageIndex) -> Result<String> {
        let names = self.names.read();
        self.directory.read().object_path(index, &names)
    }

    pub fn class_name(&self, index: PackageIndex) -> Result<String> {
        let names = self.names.read();
        self.directory.read().class_name(index, &names)
    }

    pub fn exports(&self) -> Result<Vec<ExportInfo>> {
        let names = self.names.read();
        let dir = self.directory.read();
        dir.exports()
            .iter()
            .enumerate()
            .map(|(slot, export)| {
                let index = PackageIndex::from_export(slot)?;
                Ok(ExportInfo {
                    index: index.0,
                    path: dir.object_path(index, &names)?,
                    class: dir.class_name(index, &names)?,
                    serial_offset: export.serial_offset,
                    serial_size: export.serial_size,
                    dirty: export.dirty,
                })
            })
            .collect()
    }

    /// Parse the serial data of an export without touching its slot
    pub(crate) fn parse_body(&self, index: PackageIndex, kind: ClassKind) -> Result<ObjectBody> {
        let names = self.names.read();
        let dir = self.directory.read();
        self.parse_body_with(&names, &dir, index, kind)
    }

    fn parse_body_with(
        &self,
        names: &NameTable,
        dir: &ObjectDirectory,
        index: PackageIndex,
        kind: ClassKind,
    ) -> Result<ObjectBody> {
        let export = dir.get_export(index)?;
        let range = export.serial_range()?;
        let data = self.image.slice(range.start, range.len())?;
        let mut stream = Stream::reader(data, self.version());
        ObjectBody::read(
            &mut stream,
            kind,
            export.is_class_default(),
            names,
            self.options.max_property_depth,
        )
    }

    // --- mutation --------------------------------------------------------

    pub fn rename_export(&self, index: PackageIndex, new_name: &str) -> Result<()> {
        let name = self.names.write().intern_instanced(new_name);
        self.directory.write().rename_export(index, name)?;
        debug!(package = %self.name, export = %index, new_name, "export renamed");
        Ok(())
    }

    pub fn reparent_export(&self, index: PackageIndex, new_outer: PackageIndex) -> Result<()> {
        self.directory.write().reparent_export(index, new_outer)
    }

    pub fn mark_dirty(&self, index: PackageIndex) -> Result<()> {
        self.directory.write().mark_dirty(index)
    }

    pub fn is_dirty(&self, index: PackageIndex) -> Result<bool> {
        Ok(self.directory.read().get_export(index)?.dirty)
    }

    /// Turn `export` into a redirector pointing at `target`
    pub fn convert_to_redirector(&self, export: PackageIndex, target: PackageIndex) -> Result<()> {
        let object = self.object(export)?;
        if target.is_null() || target == export {
            return Err(GpkError::corrupt(
                format!("redirector {}", self.object_path(export)?),
                "redirector must point at another object",
            ));
        }
        if target.is_export() && self.object(target)?.kind() == ClassKind::ObjectRedirector {
            return Err(GpkError::RedirectorChain {
                path: self.object_path(export)?,
            });
        }
        let class = self.ensure_class_import("Core", "ObjectRedirector")?;
        let net_index = object.body().map(|b| b.net_index).unwrap_or(-1);
        {
            let mut dir = self.directory.write();
            dir.set_class(export, class)?;
            dir.mark_dirty(export)?;
        }
        let mut body = ObjectBody::new(Vec::new(), ObjectPayload::Redirector { target });
        body.net_index = net_index;
        body.dependencies = vec![target];
        object.replace(ClassKind::ObjectRedirector, body);
        info!(package = %self.name, export = %export, target = %target, "export converted to redirector");
        Ok(())
    }

    /// Find or add the import for `class_package.class_name`
    fn ensure_class_import(&self, class_package: &str, class_name: &str) -> Result<PackageIndex> {
        let mut names = self.names.write();
        let mut dir = self.directory.write();
        let package_name = names.intern_instanced(class_package);
        let class_token = names.intern_instanced(class_name);
        let core = names.intern_instanced("Core");
        let package_class = names.intern_instanced("Package");
        let class_class = names.intern_instanced("Class");

        let find = |dir: &ObjectDirectory, name: Name, outer: PackageIndex| {
            dir.imports()
                .iter()
                .position(|i| i.object_name == name && i.outer == outer)
                .map(PackageIndex::from_import)
        };
        let outer = match find(&*dir, package_name, PackageIndex::NULL) {
            Some(index) => index?,
            None => dir.push_import(ImportRecord {
                class_package: core,
                class_name: package_class,
                outer: PackageIndex::NULL,
                object_name: package_name,
            })?,
        };
        match find(&*dir, class_token, outer) {
            Some(index) => index,
            None => dir.push_import(ImportRecord {
                class_package: core,
                class_name: class_class,
                outer,
                object_name: class_token,
            }),
        }
    }

    /// Target of a redirector export; a redirector target is corruption
    pub fn redirector_target(&self, index: PackageIndex) -> Result<PackageIndex> {
        let object = self.object(index)?;
        if object.kind() != ClassKind::ObjectRedirector {
            return Err(GpkError::corrupt(
                format!("export {}", self.object_path(index)?),
                "not a redirector",
            ));
        }
        let body = match object.body() {
            Some(body) => ObjectBody::clone(&body),
            None => self.parse_body(index, ClassKind::ObjectRedirector)?,
        };
        let target = match body.payload {
            ObjectPayload::Redirector { target } => target,
            _ => PackageIndex::NULL,
        };
        if target.is_export() && self.object(target)?.kind() == ClassKind::ObjectRedirector {
            return Err(GpkError::RedirectorChain {
                path: self.object_path(index)?,
            });
        }
        Ok(target)
    }

    // --- serialization ---------------------------------------------------

    /// Summary plus directory, offsets recomputed
    pub fn directory_bytes(&self) -> Result<Vec<u8>> {
        let names = self.names.read();
        let dir = self.directory.read();
        let mut stream = Stream::writer(self.version());
        let mut summary = self.summary.clone();
        self.write_header(&mut stream, &names, &dir, &mut summary)?;
        stream.into_bytes()
    }

    fn write_header(
        &self,
        stream: &mut Stream,
        names: &NameTable,
        dir: &ObjectDirectory,
        summary: &mut PackageSummary,
    ) -> Result<()> {
        summary.compressed_chunks.clear();
        summary.compression_flags = 0;
        summary.package_flags &= !PACKAGE_STORE_COMPRESSED;
        let original = &self.summary;
        let old_start = self.tail_start;
        write_header(stream, summary, names, dir, &self.tail, |summary, tail_start| {
            let shift = |offset: u32| -> u32 {
                if offset as usize >= old_start && offset != 0 {
                    (offset as i64 - old_start as i64 + tail_start as i64) as u32
                } else {
                    offset
                }
            };
            summary.depends_offset = shift(original.depends_offset);
            summary.thumbnail_table_offset = shift(original.thumbnail_table_offset);
            if let (Some(tables), Some(before)) = (summary.guid_tables.as_mut(), original.guid_tables) {
                tables.offset = shift(before.offset);
            }
        })
    }

    /// Re-serialize the whole package, re-encoding dirty loaded objects
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let names = self.names.read();
        let mut dir = self.directory.read().clone();
        let mut stream = Stream::writer(self.version());
        let mut summary = self.summary.clone();
        self.write_header(&mut stream, &names, &dir, &mut summary)?;

        let mut placed = Vec::with_capacity(dir.export_count());
        for (slot, export) in dir.exports().iter().enumerate() {
            let index = PackageIndex::from_export(slot)?;
            let object = &self.objects[slot];
            let start = stream.position();
            let moved = start as i64 != export.serial_offset as i64;
            let body = if export.dirty { object.body() } else { None };
            match body {
                Some(body) => body.write(&mut stream, &names)?,
                None if object.kind().has_inline_bulk() && moved && export.serial_size > 0 => {
                    let body = self.parse_body_with(&names, &dir, index, object.kind())?;
                    body.write(&mut stream, &names)?;
                }
                None => {
                    let range = export.serial_range()?;
                    let data = self.image.slice(range.start, range.len())?;
                    stream.write_bytes(data.as_slice())?;
                }
            }
            placed.push((start, stream.position() - start));
        }
        let end = stream.position();
        for (slot, (offset, size)) in placed.into_iter().enumerate() {
            let export = dir.get_export_mut(PackageIndex::from_export(slot)?)?;
            export.serial_offset = offset as i32;
            export.serial_size = size as i32;
        }
        self.write_header(&mut stream, &names, &dir, &mut summary)?;
        stream.seek(end)?;
        stream.into_bytes()
    }

    /// Write the package to `path` and clear dirty flags
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.to_bytes()?;
        // The source may be a live mapping of `path`
        let temp = path.as_ref().with_extension("tmp");
        std::fs::write(&temp, &bytes)?;
        std::fs::rename(&temp, path.as_ref())?;
        self.directory.write().clear_dirty();
        info!(package = %self.name, path = %path.as_ref().display(), bytes = bytes.len(), "package saved");
        Ok(())
    }

    /// JSON view of one export (loads it first)
    pub fn object_json(&self, index: PackageIndex) -> Result<Value> {
        let object = self.object(index)?;
        object.load()?;
        let body = object
            .body()
            .ok_or_else(|| GpkError::MissingObject(self.object_path(index).unwrap_or_default()))?;
        let names = self.names.read();
        let dir = self.directory.read();
        let render = |i: PackageIndex| dir.object_path(i, &names).unwrap_or_else(|_| i.to_string());
        let payload = match &body.payload {
            ObjectPayload::None => Value::Null,
            ObjectPayload::Redirector { target } => json!({ "target": render(*target) }),
            ObjectPayload::References(refs) => json!(refs.iter().map(|r| render(*r)).collect::<Vec<_>>()),
            ObjectPayload::Level { actors } => {
                json!({ "actors": actors.iter().map(|r| render(*r)).collect::<Vec<_>>() })
            }
            ObjectPayload::Texture { mips, .. } => json!({
                "mips": mips.iter().map(|m| json!({
                    "size_x": m.size_x,
                    "size_y": m.size_y,
                    "bytes": m.data.element_count,
                    "external": m.data.is_external(),
                })).collect::<Vec<_>>()
            }),
            ObjectPayload::Sound { data } => json!({ "bytes": data.element_count }),
        };
        Ok(json!({
            "path": dir.object_path(index, &names)?,
            "class": dir.class_name(index, &names)?,
            "net_index": body.net_index,
            "properties": tags_to_json(&body.tags, &names, &render),
            "payload": payload,
            "trailing_bytes": body.trailing.len(),
        }))
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("name", &self.name)
            .field("version", &self.summary.version)
            .field("exports", &self.objects.len())
            .field("composite", &self.composite)
            .finish()
    }
}

/// Write summary, name table, imports, exports and the directory tail
///
/// `place_tail` receives the new tail start and fixes the summary offsets
/// that point into the tail. The summary is written twice, the second time
/// with final offsets; the stream is left at the end of the header.
pub(crate) fn write_header(
    stream: &mut Stream,
    summary: &mut PackageSummary,
    names: &NameTable,
    dir: &ObjectDirectory,
    tail: &[u8],
    place_tail: impl FnOnce(&mut PackageSummary, usize),
) -> Result<()> {
    summary.name_count = names.len() as u32;
    summary.import_count = dir.import_count() as u32;
    summary.export_count = dir.export_count() as u32;

    stream.seek(0)?;
    summary.write(stream)?;
    summary.name_offset = stream.position() as u32;
    names.write(stream)?;
    summary.import_offset = stream.position() as u32;
    dir.write_imports(stream)?;
    summary.export_offset = stream.position() as u32;
    dir.write_exports(stream)?;

    place_tail(summary, stream.position());
    stream.write_bytes(tail)?;
    summary.header_size = stream.position() as i32;

    let end = stream.position();
    stream.seek(0)?;
    summary.write(stream)?;
    stream.seek(end)
}

/// Expand compressed chunks into a flat package image
fn decompress(source: &ByteSource, summary: &PackageSummary) -> Result<ByteSource> {
    let mut total = 0usize;
    let mut first = usize::MAX;
    for chunk in &summary.compressed_chunks {
        check_chunk(chunk)?;
        total = total.max(chunk.uncompressed_offset as usize + chunk.uncompressed_size as usize);
        first = first.min(chunk.uncompressed_offset as usize);
    }
    if first > source.len() {
        return Err(GpkError::corrupt(
            "compressed chunks",
            format!("first chunk at {:#x} lies beyond the file", first),
        ));
    }
    let mut image = vec![0u8; total.max(first)];
    image[..first].copy_from_slice(&source.as_slice()[..first]);
    for chunk in &summary.compressed_chunks {
        let window = source.slice(chunk.compressed_offset as usize, chunk.compressed_size as usize)?;
        let mut stream = Stream::reader(window, summary.version);
        let data = read_chunk(&mut stream, summary.compression_flags)?;
        if data.len() != chunk.uncompressed_size as usize {
            return Err(GpkError::SizeMismatch {
                context: format!("compressed chunk at {:#x}", chunk.compressed_offset),
                expected: chunk.uncompressed_size as usize,
                actual: data.len(),
            });
        }
        let start = chunk.uncompressed_offset as usize;
        image[start..start + data.len()].copy_from_slice(&data);
    }
    debug!(chunks = summary.compressed_chunks.len(), bytes = total, "package decompressed");
    Ok(ByteSource::from_vec(image))
}

fn check_chunk(chunk: &CompressedChunk) -> Result<()> {
    let negative = chunk.uncompressed_offset < 0
        || chunk.uncompressed_size < 0
        || chunk.compressed_offset < 0
        || chunk.compressed_size < 0;
    if negative || chunk.uncompressed_size as i64 > chunk.compressed_size as i64 * MAX_EXPANSION + 64 {
        return Err(GpkError::corrupt(
            "compressed chunks",
            format!("implausible chunk {:?}", chunk),
        ));
    }
    Ok(())
}
