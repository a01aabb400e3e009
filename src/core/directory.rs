//! Object directory: export and import records
//!
//! Object references inside a package are signed [`PackageIndex`] values:
//! `0` is "no object", `n > 0` addresses export `n - 1` and `n < 0` addresses
//! import `-n - 1`. The most negative `i32` is a valid import reference
//! (import `i32::MAX`), so all conversions widen to `i64` before negating.

use crate::error::{GpkError, Result};
use crate::name::{Name, NameTable};
use crate::stream::Stream;
use serde::{Deserialize, Serialize};

/// Object is visible outside its package
pub const OBJECT_PUBLIC: u64 = 0x0000_0000_0000_0004;
/// Object is the default instance of its class
pub const OBJECT_CLASS_DEFAULT: u64 = 0x0000_0200_0000_0000;
/// Object serial data starts with a script state frame
pub const OBJECT_HAS_STACK: u64 = 0x0200_0000_0000_0000;
/// Object survives garbage collection without references
pub const OBJECT_STANDALONE: u64 = 0x0008_0000_0000_0000;

/// Export must be loaded even when unreferenced
pub const EXPORT_FORCED: u32 = 0x0000_0001;

const IMPORT_RECORD_SIZE: usize = 28;
const EXPORT_RECORD_MIN_SIZE: usize = 68;

/// Signed object reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageIndex(pub i32);

/// What a [`PackageIndex`] addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Null,
    Export(usize),
    Import(usize),
}

impl PackageIndex {
    pub const NULL: PackageIndex = PackageIndex(0);

    /// Reference to export slot `slot`
    pub fn from_export(slot: usize) -> Result<Self> {
        i32::try_from(slot as i64 + 1)
            .map(PackageIndex)
            .map_err(|_| GpkError::IndexOutOfRange {
                index: slot as i64,
                context: "export slot".into(),
            })
    }

    /// Reference to import slot `slot`
    pub fn from_import(slot: usize) -> Result<Self> {
        i32::try_from(-(slot as i64) - 1)
            .map(PackageIndex)
            .map_err(|_| GpkError::IndexOutOfRange {
                index: slot as i64,
                context: "import slot".into(),
            })
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_export(self) -> bool {
        self.0 > 0
    }

    pub fn is_import(self) -> bool {
        self.0 < 0
    }

    pub fn slot(self) -> Slot {
        match self.0 {
            0 => Slot::Null,
            n if n > 0 => Slot::Export((n as i64 - 1) as usize),
            n => Slot::Import((-(n as i64) - 1) as usize),
        }
    }

    pub fn export_slot(self) -> Option<usize> {
        match self.slot() {
            Slot::Export(i) => Some(i),
            _ => None,
        }
    }

    pub fn import_slot(self) -> Option<usize> {
        match self.slot() {
            Slot::Import(i) => Some(i),
            _ => None,
        }
    }
}

impl std::fmt::Display for PackageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An object borrowed from another package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub class_package: Name,
    pub class_name: Name,
    pub outer: PackageIndex,
    pub object_name: Name,
}

impl ImportRecord {
    pub fn read(stream: &mut Stream) -> Result<Self> {
        Ok(ImportRecord {
            class_package: Name::read(stream)?,
            class_name: Name::read(stream)?,
            outer: stream.read_index()?,
            object_name: Name::read(stream)?,
        })
    }

    pub fn write(&self, stream: &mut Stream) -> Result<()> {
        self.class_package.write(stream)?;
        self.class_name.write(stream)?;
        stream.write_index(self.outer)?;
        self.object_name.write(stream)
    }
}

/// An object defined in this package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    /// Class of the object; null means the object is itself a class
    pub class: PackageIndex,
    pub super_index: PackageIndex,
    pub outer: PackageIndex,
    pub object_name: Name,
    pub archetype: PackageIndex,
    pub object_flags: u64,
    pub serial_size: i32,
    pub serial_offset: i32,
    pub export_flags: u32,
    pub net_object_counts: Vec<i32>,
    pub package_guid: [u8; 16],
    pub package_flags: u32,
    /// In-memory only; never written to disk
    #[serde(skip)]
    pub dirty: bool,
}

impl ExportRecord {
    pub fn new(class: PackageIndex, outer: PackageIndex, object_name: Name) -> Self {
        ExportRecord {
            class,
            super_index: PackageIndex::NULL,
            outer,
            object_name,
            archetype: PackageIndex::NULL,
            object_flags: OBJECT_PUBLIC,
            serial_size: 0,
            serial_offset: 0,
            export_flags: 0,
            net_object_counts: Vec::new(),
            package_guid: [0; 16],
            package_flags: 0,
            dirty: false,
        }
    }

    pub fn read(stream: &mut Stream) -> Result<Self> {
        Ok(ExportRecord {
            class: stream.read_index()?,
            super_index: stream.read_index()?,
            outer: stream.read_index()?,
            object_name: Name::read(stream)?,
            archetype: stream.read_index()?,
            object_flags: stream.read_u64()?,
            serial_size: stream.read_i32()?,
            serial_offset: stream.read_i32()?,
            export_flags: stream.read_u32()?,
            net_object_counts: stream.read_array(4, "export generation counts", |s| s.read_i32())?,
            package_guid: stream.read_guid()?,
            package_flags: stream.read_u32()?,
            dirty: false,
        })
    }

    pub fn write(&self, stream: &mut Stream) -> Result<()> {
        stream.write_index(self.class)?;
        stream.write_index(self.super_index)?;
        stream.write_index(self.outer)?;
        self.object_name.write(stream)?;
        stream.write_index(self.archetype)?;
        stream.write_u64(self.object_flags)?;
        stream.write_i32(self.serial_size)?;
        stream.write_i32(self.serial_offset)?;
        stream.write_u32(self.export_flags)?;
        stream.write_array(&self.net_object_counts, |s, v| s.write_i32(*v))?;
        stream.write_guid(&self.package_guid)?;
        stream.write_u32(self.package_flags)
    }

    pub fn is_class_default(&self) -> bool {
        self.object_flags & OBJECT_CLASS_DEFAULT != 0
    }

    /// Byte range of the serial data inside the package
    pub fn serial_range(&self) -> Result<std::ops::Range<usize>> {
        if self.serial_size < 0 || self.serial_offset < 0 {
            return Err(GpkError::corrupt(
                "export record",
                format!(
                    "negative serial range {}+{}",
                    self.serial_offset, self.serial_size
                ),
            ));
        }
        let start = self.serial_offset as usize;
        Ok(start..start + self.serial_size as usize)
    }
}

/// Borrowed view of whatever a [`PackageIndex`] addresses
#[derive(Debug, Clone, Copy)]
pub enum Entry<'a> {
    Export(&'a ExportRecord),
    Import(&'a ImportRecord),
}

impl<'a> Entry<'a> {
    pub fn object_name(&self) -> Name {
        match self {
            Entry::Export(e) => e.object_name,
            Entry::Import(i) => i.object_name,
        }
    }

    pub fn outer(&self) -> PackageIndex {
        match self {
            Entry::Export(e) => e.outer,
            Entry::Import(i) => i.outer,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObjectDirectory {
    imports: Vec<ImportRecord>,
    exports: Vec<ExportRecord>,
}

impl ObjectDirectory {
    pub fn new(imports: Vec<ImportRecord>, exports: Vec<ExportRecord>) -> Self {
        ObjectDirectory { imports, exports }
    }

    pub fn read_imports(stream: &mut Stream, count: usize) -> Result<Vec<ImportRecord>> {
        if count.saturating_mul(IMPORT_RECORD_SIZE) > stream.remaining() {
            return Err(GpkError::corrupt(
                "import table",
                format!("{} records do not fit", count),
            ));
        }
        (0..count).map(|_| ImportRecord::read(stream)).collect()
    }

    pub fn read_exports(stream: &mut Stream, count: usize) -> Result<Vec<ExportRecord>> {
        if count.saturating_mul(EXPORT_RECORD_MIN_SIZE) > stream.remaining() {
            return Err(GpkError::corrupt(
                "export table",
                format!("{} records do not fit", count),
            ));
        }
        (0..count).map(|_| ExportRecord::read(stream)).collect()
    }

    pub fn write_imports(&self, stream: &mut Stream) -> Result<()> {
        self.imports.iter().try_for_each(|i| i.write(stream))
    }

    pub fn write_exports(&self, stream: &mut Stream) -> Result<()> {
        self.exports.iter().try_for_each(|e| e.write(stream))
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    pub fn exports(&self) -> &[ExportRecord] {
        &self.exports
    }

    pub fn imports(&self) -> &[ImportRecord] {
        &self.imports
    }

    pub fn get_export(&self, index: PackageIndex) -> Result<&ExportRecord> {
        index
            .export_slot()
            .and_then(|slot| self.exports.get(slot))
            .ok_or_else(|| out_of_range(index, "export table"))
    }

    pub fn get_export_mut(&mut self, index: PackageIndex) -> Result<&mut ExportRecord> {
        index
            .export_slot()
            .and_then(|slot| self.exports.get_mut(slot))
            .ok_or_else(|| out_of_range(index, "export table"))
    }

    pub fn get_import(&self, index: PackageIndex) -> Result<&ImportRecord> {
        index
            .import_slot()
            .and_then(|slot| self.imports.get(slot))
            .ok_or_else(|| out_of_range(index, "import table"))
    }

    /// Resolve any non-null index; null yields `None`
    pub fn entry(&self, index: PackageIndex) -> Result<Option<Entry<'_>>> {
        match index.slot() {
            Slot::Null => Ok(None),
            Slot::Export(_) => self.get_export(index).map(|e| Some(Entry::Export(e))),
            Slot::Import(_) => self.get_import(index).map(|i| Some(Entry::Import(i))),
        }
    }

    pub fn push_export(&mut self, record: ExportRecord) -> Result<PackageIndex> {
        let index = PackageIndex::from_export(self.exports.len())?;
        self.exports.push(record);
        Ok(index)
    }

    pub fn push_import(&mut self, record: ImportRecord) -> Result<PackageIndex> {
        let index = PackageIndex::from_import(self.imports.len())?;
        self.imports.push(record);
        Ok(index)
    }

    /// Check every index and name in the directory and that outer chains terminate
    pub fn validate(&self, names: &NameTable) -> Result<()> {
        for import in &self.imports {
            names.check(import.class_package)?;
            names.check(import.class_name)?;
            names.check(import.object_name)?;
            self.check_index(import.outer, "import outer")?;
        }
        for export in &self.exports {
            names.check(export.object_name)?;
            self.check_index(export.class, "export class")?;
            self.check_index(export.super_index, "export super")?;
            self.check_index(export.outer, "export outer")?;
            self.check_index(export.archetype, "export archetype")?;
        }
        self.check_outer_chains()
    }

    fn check_index(&self, index: PackageIndex, context: &str) -> Result<()> {
        match index.slot() {
            Slot::Null => Ok(()),
            Slot::Export(i) if i < self.exports.len() => Ok(()),
            Slot::Import(i) if i < self.imports.len() => Ok(()),
            _ => Err(out_of_range(index, context)),
        }
    }

    fn check_outer_chains(&self) -> Result<()> {
        let total = self.exports.len() + self.imports.len();
        for slot in 0..self.exports.len() {
            let start = PackageIndex::from_export(slot)?;
            let mut current = self.get_export(start)?.outer;
            let mut steps = 0;
            while !current.is_null() {
                if steps > total {
                    return Err(GpkError::CyclicOuter { index: slot });
                }
                current = self
                    .entry(current)?
                    .map(|e| e.outer())
                    .unwrap_or(PackageIndex::NULL);
                steps += 1;
            }
        }
        for slot in 0..self.imports.len() {
            let mut current = self.imports[slot].outer;
            let mut steps = 0;
            while !current.is_null() {
                if steps > total {
                    return Err(GpkError::corrupt(
                        "import table",
                        format!("import {} has a cyclic outer chain", slot),
                    ));
                }
                current = self
                    .entry(current)?
                    .map(|e| e.outer())
                    .unwrap_or(PackageIndex::NULL);
                steps += 1;
            }
        }
        Ok(())
    }

    /// Class name of the object at `index` (`Class` for class exports)
    pub fn class_name(&self, index: PackageIndex, names: &NameTable) -> Result<String> {
        match self.entry(index)? {
            None => Ok("None".to_string()),
            Some(Entry::Import(import)) => names.display(import.class_name),
            Some(Entry::Export(export)) => {
                if export.class.is_null() {
                    Ok("Class".to_string())
                } else {
                    let class = self
                        .entry(export.class)?
                        .ok_or_else(|| out_of_range(export.class, "export class"))?;
                    names.display(class.object_name())
                }
            }
        }
    }

    pub fn object_name(&self, index: PackageIndex, names: &NameTable) -> Result<String> {
        match self.entry(index)? {
            None => Ok("None".to_string()),
            Some(entry) => names.display(entry.object_name()),
        }
    }

    /// Dotted path from the outermost object down to `index`
    ///
    /// For imports the first component is the source package name.
    pub fn object_path(&self, index: PackageIndex, names: &NameTable) -> Result<String> {
        let mut parts = Vec::new();
        let mut current = index;
        let limit = self.exports.len() + self.imports.len() + 1;
        while let Some(entry) = self.entry(current)? {
            if parts.len() > limit {
                return Err(GpkError::corrupt("object path", "cyclic outer chain"));
            }
            parts.push(names.display(entry.object_name())?);
            current = entry.outer();
        }
        parts.reverse();
        Ok(parts.join("."))
    }

    /// Direct inner objects (exports) of `outer`
    pub fn inners(&self, outer: PackageIndex) -> Vec<PackageIndex> {
        self.exports
            .iter()
            .enumerate()
            .filter(|(_, e)| e.outer == outer)
            .filter_map(|(slot, _)| PackageIndex::from_export(slot).ok())
            .collect()
    }

    /// Find an export by dotted path, case-insensitively
    pub fn find_export(&self, path: &str, names: &NameTable) -> Option<PackageIndex> {
        (0..self.exports.len())
            .filter_map(|slot| PackageIndex::from_export(slot).ok())
            .find(|&idx| {
                self.object_path(idx, names)
                    .map(|p| p.eq_ignore_ascii_case(path))
                    .unwrap_or(false)
            })
    }

    pub fn rename_export(&mut self, index: PackageIndex, name: Name) -> Result<()> {
        let export = self.get_export_mut(index)?;
        export.object_name = name;
        export.dirty = true;
        Ok(())
    }

    /// Move an export under a new outer, refusing moves that would create a cycle
    pub fn reparent_export(&mut self, index: PackageIndex, new_outer: PackageIndex) -> Result<()> {
        self.check_index(new_outer, "new outer")?;
        let mut current = new_outer;
        while current.is_export() {
            if current == index {
                let slot = index.export_slot().unwrap_or_default();
                return Err(GpkError::CyclicOuter { index: slot });
            }
            current = self.get_export(current)?.outer;
        }
        let export = self.get_export_mut(index)?;
        export.outer = new_outer;
        export.dirty = true;
        Ok(())
    }

    pub fn set_class(&mut self, index: PackageIndex, class: PackageIndex) -> Result<()> {
        self.check_index(class, "export class")?;
        let export = self.get_export_mut(index)?;
        export.class = class;
        export.dirty = true;
        Ok(())
    }

    pub fn mark_dirty(&mut self, index: PackageIndex) -> Result<()> {
        self.get_export_mut(index)?.dirty = true;
        Ok(())
    }

    pub fn clear_dirty(&mut self) {
        self.exports.iter_mut().for_each(|e| e.dirty = false);
    }

    pub fn dirty_exports(&self) -> Vec<PackageIndex> {
        self.exports
            .iter()
            .enumerate()
            .filter(|(_, e)| e.dirty)
            .filter_map(|(slot, _)| PackageIndex::from_export(slot).ok())
            .collect()
    }
}

fn out_of_range(index: PackageIndex, context: &str) -> GpkError {
    GpkError::IndexOutOfRange {
        index: index.0 as i64,
        context: context.to_string(),
    }
}
