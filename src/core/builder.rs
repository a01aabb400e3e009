//! Package construction from scratch
//!
//! [`PackageBuilder`] assembles a name table, import and export tables and
//! per-export serial data, then lays them out as a package image in either
//! format revision. Tools use it to author small packages; the test suite
//! uses it to produce fixtures.

use crate::compression::{write_chunk, CompressedChunk, COMPRESS_ZLIB};
use crate::directory::{ExportRecord, ImportRecord, ObjectDirectory, PackageIndex, OBJECT_STANDALONE};
use crate::error::{GpkError, Result};
use crate::header::{PackageSummary, PACKAGE_STORE_COMPRESSED};
use crate::name::{NameTable, NONE};
use crate::object::{ObjectBody, ObjectPayload};
use crate::package::{write_header, LoadOptions, Package};
use crate::property::{PropertyTag, PropertyType, PropertyValue};
use crate::stream::Stream;
use crate::version::FormatVersion;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Serial {
    Body(ObjectBody),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct PackageBuilder {
    version: FormatVersion,
    folder: String,
    names: NameTable,
    directory: ObjectDirectory,
    serials: Vec<Serial>,
    compressed: bool,
}

impl PackageBuilder {
    pub fn new(version: FormatVersion) -> Self {
        let mut names = NameTable::new();
        names.intern(NONE);
        PackageBuilder {
            version,
            folder: NONE.to_string(),
            names,
            directory: ObjectDirectory::new(Vec::new(), Vec::new()),
            serials: Vec::new(),
            compressed: false,
        }
    }

    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    /// Store everything after the summary in one zlib chunk
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }

    pub fn names_mut(&mut self) -> &mut NameTable {
        &mut self.names
    }

    /// Build a tag, interning its name
    pub fn tag(&mut self, name: &str, property_type: PropertyType, value: PropertyValue) -> PropertyTag {
        PropertyTag::new(&mut self.names, name, property_type, value)
    }

    /// Find or add an import record
    pub fn import(
        &mut self,
        class_package: &str,
        class_name: &str,
        outer: PackageIndex,
        object_name: &str,
    ) -> Result<PackageIndex> {
        let record = ImportRecord {
            class_package: self.names.intern_instanced(class_package),
            class_name: self.names.intern_instanced(class_name),
            outer,
            object_name: self.names.intern_instanced(object_name),
        };
        match self.directory.imports().iter().position(|i| *i == record) {
            Some(slot) => PackageIndex::from_import(slot),
            None => self.directory.push_import(record),
        }
    }

    pub fn import_package(&mut self, package: &str) -> Result<PackageIndex> {
        self.import("Core", "Package", PackageIndex::NULL, package)
    }

    /// Import `package.class`, adding the package import as needed
    pub fn import_class(&mut self, package: &str, class: &str) -> Result<PackageIndex> {
        let outer = self.import_package(package)?;
        self.import("Core", "Class", outer, class)
    }

    /// Import an object by dotted path (`Package.Group.Object`)
    pub fn import_object(&mut self, path: &str, class_package: &str, class_name: &str) -> Result<PackageIndex> {
        let parts: Vec<&str> = path.split('.').collect();
        if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
            return Err(GpkError::MissingObject(path.to_string()));
        }
        let mut outer = self.import_package(parts[0])?;
        for group in &parts[1..parts.len() - 1] {
            outer = self.import("Core", "Package", outer, group)?;
        }
        self.import(class_package, class_name, outer, parts[parts.len() - 1])
    }

    /// Add an export with an empty tag list
    pub fn export(&mut self, class: PackageIndex, outer: PackageIndex, name: &str) -> Result<PackageIndex> {
        let mut record = ExportRecord::new(class, outer, self.names.intern_instanced(name));
        if outer.is_null() {
            record.object_flags |= OBJECT_STANDALONE;
        }
        let index = self.directory.push_export(record)?;
        self.serials
            .push(Serial::Body(ObjectBody::new(Vec::new(), ObjectPayload::None)));
        Ok(index)
    }

    /// Add an export of `class_package.class_name`
    pub fn object(&mut self, class_package: &str, class_name: &str, outer: PackageIndex, name: &str) -> Result<PackageIndex> {
        let class = self.import_class(class_package, class_name)?;
        self.export(class, outer, name)
    }

    /// Add a class export deriving from `super_class`
    pub fn class(&mut self, name: &str, super_class: PackageIndex) -> Result<PackageIndex> {
        let index = self.export(PackageIndex::NULL, PackageIndex::NULL, name)?;
        self.directory.get_export_mut(index)?.super_index = super_class;
        Ok(index)
    }

    /// Add a redirector export pointing at `target`
    pub fn redirector(&mut self, outer: PackageIndex, name: &str, target: PackageIndex) -> Result<PackageIndex> {
        let index = self.object("Core", "ObjectRedirector", outer, name)?;
        self.set_body(
            index,
            ObjectBody::new(Vec::new(), ObjectPayload::Redirector { target }),
        )?;
        Ok(index)
    }

    pub fn set_body(&mut self, index: PackageIndex, body: ObjectBody) -> Result<()> {
        *self.serial_mut(index)? = Serial::Body(body);
        Ok(())
    }

    pub fn set_tags(&mut self, index: PackageIndex, tags: Vec<PropertyTag>) -> Result<()> {
        match self.serial_mut(index)? {
            Serial::Body(body) => body.tags = tags,
            raw => *raw = Serial::Body(ObjectBody::new(tags, ObjectPayload::None)),
        }
        Ok(())
    }

    /// Store serial bytes verbatim, bypassing the object encoder
    pub fn set_raw(&mut self, index: PackageIndex, bytes: Vec<u8>) -> Result<()> {
        *self.serial_mut(index)? = Serial::Raw(bytes);
        Ok(())
    }

    pub fn export_mut(&mut self, index: PackageIndex) -> Result<&mut ExportRecord> {
        self.directory.get_export_mut(index)
    }

    fn serial_mut(&mut self, index: PackageIndex) -> Result<&mut Serial> {
        let slot = index.export_slot();
        slot.and_then(|slot| self.serials.get_mut(slot))
            .ok_or_else(|| GpkError::IndexOutOfRange {
                index: index.0 as i64,
                context: "builder exports".to_string(),
            })
    }

    /// Serialize the package image
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut summary = PackageSummary::new(self.version);
        summary.folder_name = self.folder.clone();
        if self.compressed {
            summary.compression_flags = COMPRESS_ZLIB;
            summary.package_flags |= PACKAGE_STORE_COMPRESSED;
            // Placeholder so the summary has its final size
            summary.compressed_chunks = vec![CompressedChunk::default()];
        }

        // Depends map: one empty array per export
        let tail = vec![0u8; self.directory.export_count() * 4];
        let mut dir = self.directory.clone();
        let mut stream = Stream::writer(self.version);
        let place_tail = |summary: &mut PackageSummary, start: usize| {
            summary.depends_offset = start as u32;
            if let Some(tables) = summary.guid_tables.as_mut() {
                tables.offset = (start + tail.len()) as u32;
            }
        };
        write_header(&mut stream, &mut summary, &self.names, &dir, &tail, place_tail)?;

        let mut placed = Vec::with_capacity(self.serials.len());
        for serial in &self.serials {
            let start = stream.position();
            match serial {
                Serial::Body(body) => body.write(&mut stream, &self.names)?,
                Serial::Raw(bytes) => stream.write_bytes(bytes)?,
            }
            placed.push((start, stream.position() - start));
        }
        let end = stream.position();
        for (slot, (offset, size)) in placed.into_iter().enumerate() {
            let export = dir.get_export_mut(PackageIndex::from_export(slot)?)?;
            export.serial_offset = offset as i32;
            export.serial_size = size as i32;
        }
        write_header(&mut stream, &mut summary, &self.names, &dir, &tail, place_tail)?;
        stream.seek(end)?;
        let image = stream.into_bytes()?;
        if !self.compressed {
            return Ok(image);
        }

        let body_start = summary.name_offset as usize;
        let mut chunk = Stream::writer(self.version);
        write_chunk(&mut chunk, &image[body_start..])?;
        let chunk = chunk.into_bytes()?;
        summary.compressed_chunks = vec![CompressedChunk {
            uncompressed_offset: body_start as i32,
            uncompressed_size: (image.len() - body_start) as i32,
            compressed_offset: body_start as i32,
            compressed_size: chunk.len() as i32,
        }];
        let mut out = Stream::writer(self.version);
        summary.write(&mut out)?;
        if out.position() != body_start {
            return Err(GpkError::SizeMismatch {
                context: "compressed package summary".to_string(),
                expected: body_start,
                actual: out.position(),
            });
        }
        out.write_bytes(&chunk)?;
        out.into_bytes()
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.build()?)?;
        Ok(())
    }

    /// Build and open in memory
    pub fn open(&self, name: &str, options: LoadOptions) -> Result<Arc<Package>> {
        Package::from_bytes(name, self.build()?, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imports_are_deduplicated() {
        let mut builder = PackageBuilder::new(FormatVersion::Modern);
        let a = builder.import_class("Engine", "Texture2D").unwrap();
        let b = builder.import_class("engine", "Texture2D").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, PackageIndex(-2));
    }

    #[test]
    fn test_import_object_builds_outer_chain() {
        let mut builder = PackageBuilder::new(FormatVersion::Legacy);
        let index = builder
            .import_object("Env.Grass.Blade", "Engine", "StaticMesh")
            .unwrap();
        let package = builder.open("Test", LoadOptions::default()).unwrap();
        assert_eq!(package.object_path(index).unwrap(), "Env.Grass.Blade");
        assert_eq!(package.class_name(index).unwrap(), "StaticMesh");
    }

    #[test]
    fn test_compressed_build_opens() {
        for version in [FormatVersion::Legacy, FormatVersion::Modern] {
            let mut builder = PackageBuilder::new(version).compressed(true);
            let outer = builder.object("Core", "Package", PackageIndex::NULL, "Group").unwrap();
            let mesh = builder.object("Engine", "StaticMesh", outer, "Grass").unwrap();
            let tag = builder.tag("SizeX", PropertyType::Int, PropertyValue::Int(256));
            builder.set_tags(mesh, vec![tag]).unwrap();

            let package = builder.open("Compressed", LoadOptions::default()).unwrap();
            assert!(package.summary().is_compressed());
            let object = package.get_object("Group.Grass").unwrap();
            object.load().unwrap();
            let body = object.body().unwrap();
            assert_eq!(body.tags[0].value.as_int(), Some(256));
        }
    }

    #[test]
    fn test_bad_export_index() {
        let mut builder = PackageBuilder::new(FormatVersion::Modern);
        assert!(matches!(
            builder.set_raw(PackageIndex(3), vec![]),
            Err(GpkError::IndexOutOfRange { .. })
        ));
    }
}
