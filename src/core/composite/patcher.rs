//! In-memory edits of the composite mapper plaintext
//!
//! Every edit is computed against a copy of the buffer, re-scanned, and only
//! then swapped in, so a failed patch leaves the buffer untouched. Nothing
//! reaches disk before [`IndexPatcher::apply_to`].

use super::cipher;
use super::index::{scan, CompositeEntry, CompositeIndex, SectionSpan};
use crate::error::{GpkError, Result};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info};

/// Replacement location for a composite entry; `size == 0` deletes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    pub filename: String,
    pub object_path: String,
    pub offset: u64,
    pub size: u64,
}

impl PatchEntry {
    fn to_entry(&self, composite_name: &str) -> CompositeEntry {
        CompositeEntry {
            filename: self.filename.clone(),
            object_path: self.object_path.clone(),
            composite_name: composite_name.to_string(),
            offset: self.offset,
            size: self.size,
        }
    }
}

impl From<&CompositeEntry> for PatchEntry {
    fn from(entry: &CompositeEntry) -> Self {
        PatchEntry {
            filename: entry.filename.clone(),
            object_path: entry.object_path.clone(),
            offset: entry.offset,
            size: entry.size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexPatcher {
    plaintext: Vec<u8>,
}

impl IndexPatcher {
    pub fn new(plaintext: Vec<u8>) -> Result<Self> {
        scan(&plaintext)?;
        Ok(IndexPatcher { plaintext })
    }

    pub fn from_encrypted(data: &[u8]) -> Result<Self> {
        IndexPatcher::new(cipher::decrypt(data))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        IndexPatcher::from_encrypted(&data).map_err(|e| e.context(path.as_ref().display().to_string()))
    }

    pub fn plaintext(&self) -> &[u8] {
        &self.plaintext
    }

    /// Parsed view of the current buffer
    pub fn index(&self) -> Result<CompositeIndex> {
        CompositeIndex::parse(&self.plaintext)
    }

    /// Point `name` at a new location, moving it between sections if needed
    ///
    /// An entry in the target section is rewritten in place; copies of the
    /// name in other sections are removed, together with their section
    /// header if nothing else is left in it. A missing name is appended to
    /// the target section, which is created if absent.
    pub fn patch(&mut self, name: &str, entry: &PatchEntry) -> Result<()> {
        if entry.size == 0 {
            return self.delete_entry(name);
        }
        let new_entry = entry.to_entry(name);
        new_entry.check_fields()?;
        let encoded = new_entry.encode().into_bytes();

        let sections = scan(&self.plaintext)?;
        let found = locate(&sections, name);
        let keep = found
            .iter()
            .rev()
            .find(|&&(s, _)| sections[s].filename.eq_ignore_ascii_case(&entry.filename))
            .copied();

        let mut edits = removals(&sections, &found, keep);
        if let Some((s, e)) = keep {
            edits.push((sections[s].entries[e].range.clone(), encoded.clone()));
        }
        let mut buf = splice(&self.plaintext, edits);

        if keep.is_none() {
            let sections = scan(&buf)?;
            buf = insert(&buf, &sections, &entry.filename, &encoded);
        }
        scan(&buf)?;
        self.plaintext = buf;
        info!(
            composite = name,
            filename = %entry.filename,
            offset = entry.offset,
            size = entry.size,
            moved = !found.is_empty() && keep.is_none(),
            "composite index entry patched"
        );
        Ok(())
    }

    /// Remove every entry for `name`
    pub fn delete_entry(&mut self, name: &str) -> Result<()> {
        let sections = scan(&self.plaintext)?;
        let found = locate(&sections, name);
        if found.is_empty() {
            return Err(GpkError::PatchTargetNotFound(name.to_string()));
        }
        let buf = splice(&self.plaintext, removals(&sections, &found, None));
        scan(&buf)?;
        self.plaintext = buf;
        info!(composite = name, copies = found.len(), "composite index entry deleted");
        Ok(())
    }

    /// Encrypted bytes of the current buffer
    pub fn apply(&self) -> Vec<u8> {
        cipher::encrypt(&self.plaintext)
    }

    /// Encrypt and write to `path` through a temporary sibling file
    pub fn apply_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let temp = path.with_extension("tmp");
        std::fs::write(&temp, self.apply())?;
        std::fs::rename(&temp, path)?;
        debug!(path = %path.display(), bytes = self.plaintext.len(), "composite index written");
        Ok(())
    }
}

fn locate(sections: &[SectionSpan], name: &str) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    for (s, section) in sections.iter().enumerate() {
        for (e, span) in section.entries.iter().enumerate() {
            if span.entry.composite_name.eq_ignore_ascii_case(name) {
                found.push((s, e));
            }
        }
    }
    found
}

/// Ranges deleting every found entry except `keep`; a section that would be
/// left empty is removed whole
fn removals(
    sections: &[SectionSpan],
    found: &[(usize, usize)],
    keep: Option<(usize, usize)>,
) -> Vec<(Range<usize>, Vec<u8>)> {
    let mut edits = Vec::new();
    for (s, section) in sections.iter().enumerate() {
        let doomed: Vec<usize> = found
            .iter()
            .filter(|&&slot| slot.0 == s && Some(slot) != keep)
            .map(|&(_, e)| e)
            .collect();
        if doomed.is_empty() {
            continue;
        }
        if doomed.len() == section.entries.len() {
            edits.push((section.range.clone(), Vec::new()));
        } else {
            edits.extend(
                doomed
                    .into_iter()
                    .map(|e| (section.entries[e].range.clone(), Vec::new())),
            );
        }
    }
    edits
}

/// Apply non-overlapping replacements
fn splice(data: &[u8], mut edits: Vec<(Range<usize>, Vec<u8>)>) -> Vec<u8> {
    edits.sort_by_key(|(range, _)| std::cmp::Reverse(range.start));
    let mut out = data.to_vec();
    for (range, replacement) in edits {
        out.splice(range, replacement);
    }
    out
}

/// Append an encoded entry to `filename`'s section, or open a new section
/// after the last one
fn insert(data: &[u8], sections: &[SectionSpan], filename: &str, encoded: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    match sections
        .iter()
        .find(|s| s.filename.eq_ignore_ascii_case(filename))
    {
        Some(section) => {
            // Just before the closing '!'
            let at = section.range.end - 1;
            out.splice(at..at, encoded.iter().copied());
        }
        None => {
            let at = sections.last().map_or(0, |s| s.range.end);
            let mut block = filename.as_bytes().to_vec();
            block.push(b'?');
            block.extend_from_slice(encoded);
            block.push(b'!');
            out.splice(at..at, block);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"A?p1,c1,0,10,|p2,c2,10,20,|!B?p3,c3,0,5,|!";

    fn entry(filename: &str, object_path: &str, offset: u64, size: u64) -> PatchEntry {
        PatchEntry {
            filename: filename.to_string(),
            object_path: object_path.to_string(),
            offset,
            size,
        }
    }

    fn text(patcher: &IndexPatcher) -> &str {
        std::str::from_utf8(patcher.plaintext()).unwrap()
    }

    #[test]
    fn test_patch_in_place_grows_and_shrinks() {
        let mut patcher = IndexPatcher::new(SAMPLE.to_vec()).unwrap();
        patcher.patch("c2", &entry("A", "p2", 123456, 789)).unwrap();
        assert_eq!(text(&patcher), "A?p1,c1,0,10,|p2,c2,123456,789,|!B?p3,c3,0,5,|!");
        patcher.patch("C2", &entry("a", "p2", 1, 2)).unwrap();
        assert_eq!(text(&patcher), "A?p1,c1,0,10,|p2,C2,1,2,|!B?p3,c3,0,5,|!");
    }

    #[test]
    fn test_move_to_existing_section() {
        let mut patcher = IndexPatcher::new(SAMPLE.to_vec()).unwrap();
        patcher.patch("c1", &entry("B", "p1", 50, 60)).unwrap();
        assert_eq!(text(&patcher), "A?p2,c2,10,20,|!B?p3,c3,0,5,|p1,c1,50,60,|!");
    }

    #[test]
    fn test_move_removes_emptied_section() {
        let mut patcher = IndexPatcher::new(SAMPLE.to_vec()).unwrap();
        patcher.patch("c3", &entry("C", "p3", 7, 8)).unwrap();
        assert_eq!(text(&patcher), "A?p1,c1,0,10,|p2,c2,10,20,|!C?p3,c3,7,8,|!");
        let index = patcher.index().unwrap();
        assert_eq!(index.find("c3").unwrap().filename, "C");
        assert!(index.sections().iter().all(|s| s.filename != "B"));
    }

    #[test]
    fn test_insert_new_entry() {
        let mut patcher = IndexPatcher::new(SAMPLE.to_vec()).unwrap();
        patcher.patch("c9", &entry("B", "p9", 1, 1)).unwrap();
        assert_eq!(text(&patcher), "A?p1,c1,0,10,|p2,c2,10,20,|!B?p3,c3,0,5,|p9,c9,1,1,|!");
    }

    #[test]
    fn test_delete_and_zero_size() {
        let mut patcher = IndexPatcher::new(SAMPLE.to_vec()).unwrap();
        patcher.delete_entry("c1").unwrap();
        assert_eq!(text(&patcher), "A?p2,c2,10,20,|!B?p3,c3,0,5,|!");
        patcher.patch("c3", &entry("B", "p3", 0, 0)).unwrap();
        assert_eq!(text(&patcher), "A?p2,c2,10,20,|!");
        assert!(matches!(
            patcher.delete_entry("c3"),
            Err(GpkError::PatchTargetNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_patch_leaves_buffer() {
        let mut patcher = IndexPatcher::new(SAMPLE.to_vec()).unwrap();
        assert!(patcher.patch("c1", &entry("A", "bad,path", 0, 1)).is_err());
        assert_eq!(patcher.plaintext(), SAMPLE);
    }

    #[test]
    fn test_apply_to_writes_encrypted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("CompositePackageMapper.dat");
        let mut patcher = IndexPatcher::new(SAMPLE.to_vec()).unwrap();
        patcher.patch("c2", &entry("B", "p2", 3, 4)).unwrap();
        patcher.apply_to(&path).unwrap();
        let reloaded = IndexPatcher::load(&path).unwrap();
        assert_eq!(reloaded.plaintext(), patcher.plaintext());
        assert!(!path.with_extension("tmp").exists());
    }
}
