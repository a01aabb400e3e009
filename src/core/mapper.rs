//! Key/value mapper files
//!
//! The package-name mapper and the redirector mapper share one plaintext
//! grammar, `(key ',' value '|')*`, under the composite cipher. The
//! package-name mapper maps `Package.Object` paths to `Composite.Object`
//! paths; the redirector mapper maps an object path to the path that
//! replaced it.

use crate::bulk::{for_each_slice, BatchOptions, BatchReport, CancellationFlag, ProgressSink};
use crate::composite::{self, latin1, to_latin1, CompositeIndex};
use crate::directory::PackageIndex;
use crate::error::{GpkError, Result};
use crate::package::{LoadOptions, Package};
use ahash::AHashMap;
use std::path::Path;
use tracing::info;

/// Ordered, case-insensitive `key -> value` map in mapper grammar
#[derive(Debug, Clone, Default)]
pub struct KeyValueIndex {
    pairs: Vec<(String, String)>,
    lookup: AHashMap<String, usize>,
}

impl KeyValueIndex {
    pub fn new() -> Self {
        KeyValueIndex::default()
    }

    pub fn parse(plaintext: &[u8]) -> Result<Self> {
        let end = plaintext
            .iter()
            .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
            .map_or(0, |p| p + 1);
        let data = &plaintext[..end];
        let mut index = KeyValueIndex::new();
        let mut pos = 0;
        while pos < data.len() {
            let comma = find(data, pos, b',')?;
            let bar = find(data, comma + 1, b'|')?;
            let key = &data[pos..comma];
            let value = &data[comma + 1..bar];
            if key.is_empty() || value.is_empty() {
                return Err(GpkError::IndexGrammar {
                    offset: pos,
                    message: "empty key or value".to_string(),
                });
            }
            index.insert(latin1(key), latin1(value));
            pos = bar + 1;
        }
        Ok(index)
    }

    pub fn from_encrypted(data: &[u8]) -> Result<Self> {
        KeyValueIndex::parse(&composite::decrypt(data))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        KeyValueIndex::from_encrypted(&data).map_err(|e| e.context(path.as_ref().display().to_string()))
    }

    /// Insert or replace; a replaced key keeps its position
    pub fn insert(&mut self, key: String, value: String) {
        match self.lookup.get(&key.to_ascii_lowercase()) {
            Some(&slot) => self.pairs[slot].1 = value,
            None => {
                self.lookup.insert(key.to_ascii_lowercase(), self.pairs.len());
                self.pairs.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lookup
            .get(&key.to_ascii_lowercase())
            .map(|&slot| self.pairs[slot].1.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn to_plaintext(&self) -> Result<Vec<u8>> {
        let mut out = String::new();
        for (key, value) in &self.pairs {
            for field in [key, value] {
                if field.bytes().any(|b| b == b',' || b == b'|') {
                    return Err(GpkError::IndexGrammar {
                        offset: out.len(),
                        message: format!("{:?} contains a delimiter", field),
                    });
                }
            }
            out.push_str(key);
            out.push(',');
            out.push_str(value);
            out.push('|');
        }
        to_latin1(&out)
    }

    pub fn to_encrypted(&self) -> Result<Vec<u8>> {
        Ok(composite::encrypt(&self.to_plaintext()?))
    }

    /// Encrypt and write through a temporary sibling file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let temp = path.with_extension("tmp");
        std::fs::write(&temp, self.to_encrypted()?)?;
        std::fs::rename(&temp, path)?;
        Ok(())
    }
}

fn find(data: &[u8], from: usize, delimiter: u8) -> Result<usize> {
    for (i, &b) in data.iter().enumerate().skip(from) {
        if b == delimiter {
            return Ok(i);
        }
        if b == b',' || b == b'|' {
            return Err(GpkError::IndexGrammar {
                offset: i,
                message: format!("expected {:?}, found {:?}", delimiter as char, b as char),
            });
        }
    }
    Err(GpkError::IndexGrammar {
        offset: data.len(),
        message: format!("missing {:?}", delimiter as char),
    })
}

/// Split `Outer.Rest` at the first dot
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    path.split_once('.').filter(|(a, b)| !a.is_empty() && !b.is_empty())
}

/// `Package.Object` -> `Composite.Object`
#[derive(Debug, Clone, Default)]
pub struct PackageNameIndex {
    map: KeyValueIndex,
    /// Lowercase package name -> first composite that holds it
    packages: AHashMap<String, String>,
}

impl PackageNameIndex {
    pub fn from_map(map: KeyValueIndex) -> Self {
        let mut packages = AHashMap::new();
        for (key, value) in map.iter() {
            if let (Some((package, _)), Some((composite, _))) = (split_path(key), split_path(value)) {
                packages
                    .entry(package.to_ascii_lowercase())
                    .or_insert_with(|| composite.to_string());
            }
        }
        PackageNameIndex { map, packages }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(PackageNameIndex::from_map(KeyValueIndex::load(path)?))
    }

    /// Composite path for a full object path
    pub fn resolve(&self, object_path: &str) -> Option<&str> {
        self.map.get(object_path)
    }

    /// Composite holding any object of `package`
    pub fn composite_for_package(&self, package: &str) -> Option<&str> {
        self.packages
            .get(&package.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn map(&self) -> &KeyValueIndex {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Rebuild from the composite index by opening every slice and listing
    /// its top-level exports
    ///
    /// Slices that fail to open are reported per item; the map holds every
    /// slice that succeeded, in index order.
    pub fn rebuild_from(
        index: &CompositeIndex,
        storage_dir: &Path,
        options: BatchOptions,
        cancel: &CancellationFlag,
        progress: &dyn ProgressSink,
    ) -> Result<(PackageNameIndex, BatchReport<Vec<(String, String)>>)> {
        let order: AHashMap<String, usize> = index
            .composite_names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name.to_ascii_lowercase(), i))
            .collect();
        let mut report = for_each_slice(index, storage_dir, options, cancel, progress, |entry, slice| {
            let package = Package::from_source(
                entry.object_path.clone(),
                slice,
                None,
                true,
                LoadOptions::default(),
            )?;
            let names = package.names();
            let dir = package.directory();
            let mut pairs = Vec::new();
            for (slot, export) in dir.exports().iter().enumerate() {
                if !export.outer.is_null() {
                    continue;
                }
                let object = dir.object_name(PackageIndex::from_export(slot)?, &names)?;
                pairs.push((
                    format!("{}.{}", entry.object_path, object),
                    format!("{}.{}", entry.composite_name, object),
                ));
            }
            Ok(pairs)
        })?;

        report.output.sort_by_key(|pairs| {
            pairs
                .first()
                .and_then(|(_, value)| split_path(value))
                .and_then(|(composite, _)| order.get(&composite.to_ascii_lowercase()).copied())
                .unwrap_or(usize::MAX)
        });
        let mut map = KeyValueIndex::new();
        for (key, value) in report.output.iter().flatten() {
            map.insert(key.clone(), value.clone());
        }
        info!(entries = map.len(), failed = report.errors.len(), "package-name index rebuilt");
        Ok((PackageNameIndex::from_map(map), report))
    }
}

/// Object path -> replacement object path
#[derive(Debug, Clone, Default)]
pub struct RedirectorIndex {
    map: KeyValueIndex,
}

impl RedirectorIndex {
    pub fn from_map(map: KeyValueIndex) -> Self {
        RedirectorIndex { map }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(RedirectorIndex::from_map(KeyValueIndex::load(path)?))
    }

    /// Follow one hop; a target that is itself redirected is corruption
    pub fn follow(&self, object_path: &str) -> Result<Option<&str>> {
        match self.map.get(object_path) {
            None => Ok(None),
            Some(target) if self.map.get(target).is_some() => Err(GpkError::RedirectorChain {
                path: object_path.to_string(),
            }),
            Some(target) => Ok(Some(target)),
        }
    }

    pub fn map(&self) -> &KeyValueIndex {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
