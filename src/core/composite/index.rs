//! Composite mapper grammar
//!
//! ```text
//! index   := section*
//! section := filename '?' entry+ '!'
//! entry   := object_path ',' composite_name ',' offset ',' size ',' '|'
//! ```
//!
//! The scanner keeps byte spans so the patcher can splice the plaintext in
//! place; [`CompositeIndex`] is the owned lookup view.

use super::cipher;
use crate::error::{GpkError, Result};
use ahash::AHashMap;
use serde::Serialize;
use std::ops::Range;
use std::path::Path;

pub(crate) const DELIMITERS: &[u8] = b"!?,|";

/// One logical package stored as a slice of a storage file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositeEntry {
    /// Storage file holding the slice
    pub filename: String,
    /// Logical package path the slice stands in for
    pub object_path: String,
    /// Unique key of the slice
    pub composite_name: String,
    pub offset: u64,
    pub size: u64,
}

impl CompositeEntry {
    /// Plaintext form, without the section framing
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{},|",
            self.object_path, self.composite_name, self.offset, self.size
        )
    }

    pub(crate) fn check_fields(&self) -> Result<()> {
        for (what, field) in [
            ("filename", &self.filename),
            ("object path", &self.object_path),
            ("composite name", &self.composite_name),
        ] {
            if field.is_empty() || field.bytes().any(|b| DELIMITERS.contains(&b)) {
                return Err(GpkError::IndexGrammar {
                    offset: 0,
                    message: format!("{} {:?} is empty or contains a delimiter", what, field),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntrySpan {
    pub range: Range<usize>,
    pub entry: CompositeEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SectionSpan {
    /// Filename through the closing `!`
    pub range: Range<usize>,
    pub filename: String,
    pub entries: Vec<EntrySpan>,
}

pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Inverse of [`latin1`]; characters above U+00FF are a grammar error
pub(crate) fn to_latin1(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .enumerate()
        .map(|(i, c)| {
            u8::try_from(c as u32).map_err(|_| GpkError::IndexGrammar {
                offset: i,
                message: format!("character {:?} is not Latin-1", c),
            })
        })
        .collect()
}

struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn error(&self, message: impl Into<String>) -> GpkError {
        GpkError::IndexGrammar {
            offset: self.pos,
            message: message.into(),
        }
    }

    /// Field up to (not including) `end`; other delimiters are errors
    fn field(&mut self, end: u8, what: &str) -> Result<&'a [u8]> {
        let start = self.pos;
        while let Some(&b) = self.data.get(self.pos) {
            if b == end {
                let field = &self.data[start..self.pos];
                self.pos += 1;
                if field.is_empty() {
                    return Err(GpkError::IndexGrammar {
                        offset: start,
                        message: format!("empty {}", what),
                    });
                }
                return Ok(field);
            }
            if DELIMITERS.contains(&b) {
                return Err(self.error(format!(
                    "unexpected {:?} in {}",
                    b as char, what
                )));
            }
            self.pos += 1;
        }
        Err(self.error(format!("unterminated {}", what)))
    }

    fn number(&mut self, what: &str) -> Result<u64> {
        let start = self.pos;
        let field = self.field(b',', what)?;
        std::str::from_utf8(field)
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| GpkError::IndexGrammar {
                offset: start,
                message: format!("{} {:?} is not a number", what, latin1(field)),
            })
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        match self.data.get(self.pos) {
            Some(&b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error(format!("expected {:?}", byte as char))),
        }
    }

    fn entry(&mut self, filename: &str) -> Result<EntrySpan> {
        let start = self.pos;
        let object_path = latin1(self.field(b',', "object path")?);
        let composite_name = latin1(self.field(b',', "composite name")?);
        let offset = self.number("offset")?;
        let size = self.number("size")?;
        self.expect(b'|')?;
        Ok(EntrySpan {
            range: start..self.pos,
            entry: CompositeEntry {
                filename: filename.to_string(),
                object_path,
                composite_name,
                offset,
                size,
            },
        })
    }

    fn section(&mut self) -> Result<SectionSpan> {
        let start = self.pos;
        let filename = latin1(self.field(b'?', "filename")?);
        let mut entries = Vec::new();
        loop {
            match self.data.get(self.pos) {
                Some(b'!') if !entries.is_empty() => {
                    self.pos += 1;
                    break;
                }
                Some(b'!') => return Err(self.error(format!("section {} has no entries", filename))),
                Some(_) => entries.push(self.entry(&filename)?),
                None => return Err(self.error(format!("section {} is not closed", filename))),
            }
        }
        Ok(SectionSpan {
            range: start..self.pos,
            filename,
            entries,
        })
    }
}

/// Split plaintext into sections with byte spans
///
/// Trailing NUL bytes and ASCII whitespace after the last section are
/// tolerated.
pub(crate) fn scan(data: &[u8]) -> Result<Vec<SectionSpan>> {
    let end = data
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    let mut scanner = Scanner {
        data: &data[..end],
        pos: 0,
    };
    let mut sections = Vec::new();
    while scanner.pos < end {
        sections.push(scanner.section()?);
    }
    Ok(sections)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositeSection {
    pub filename: String,
    pub entries: Vec<CompositeEntry>,
}

/// Parsed composite mapper
#[derive(Debug, Clone, Default)]
pub struct CompositeIndex {
    sections: Vec<CompositeSection>,
    /// Lowercase composite name -> (section, entry)
    by_name: AHashMap<String, (usize, usize)>,
    /// Lowercase object path -> every slot carrying it
    by_path: AHashMap<String, Vec<(usize, usize)>>,
}

impl CompositeIndex {
    pub fn parse(plaintext: &[u8]) -> Result<Self> {
        let sections = scan(plaintext)?
            .into_iter()
            .map(|s| CompositeSection {
                filename: s.filename,
                entries: s.entries.into_iter().map(|e| e.entry).collect(),
            })
            .collect();
        Ok(CompositeIndex::from_sections(sections))
    }

    pub fn from_encrypted(data: &[u8]) -> Result<Self> {
        CompositeIndex::parse(&cipher::decrypt(data))
    }

    /// Read and decrypt a mapper file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        CompositeIndex::from_encrypted(&data).map_err(|e| e.context(path.as_ref().display().to_string()))
    }

    pub fn from_sections(sections: Vec<CompositeSection>) -> Self {
        let mut by_name = AHashMap::new();
        let mut by_path: AHashMap<String, Vec<(usize, usize)>> = AHashMap::new();
        for (s, section) in sections.iter().enumerate() {
            for (e, entry) in section.entries.iter().enumerate() {
                // Later duplicates shadow earlier ones, matching a patched file
                by_name.insert(entry.composite_name.to_ascii_lowercase(), (s, e));
                by_path
                    .entry(entry.object_path.to_ascii_lowercase())
                    .or_default()
                    .push((s, e));
            }
        }
        CompositeIndex {
            sections,
            by_name,
            by_path,
        }
    }

    pub fn sections(&self) -> &[CompositeSection] {
        &self.sections
    }

    pub fn find(&self, composite_name: &str) -> Option<&CompositeEntry> {
        self.by_name
            .get(&composite_name.to_ascii_lowercase())
            .map(|&(s, e)| &self.sections[s].entries[e])
    }

    /// Entries standing in for a logical package path
    pub fn find_by_object_path(&self, object_path: &str) -> Vec<&CompositeEntry> {
        self.by_path
            .get(&object_path.to_ascii_lowercase())
            .map(|slots| {
                slots
                    .iter()
                    .map(|&(s, e)| &self.sections[s].entries[e])
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CompositeEntry> {
        self.sections.iter().flat_map(|s| s.entries.iter())
    }

    /// Composite names in file order
    pub fn composite_names(&self) -> Vec<&str> {
        self.entries().map(|e| e.composite_name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.sections.iter().map(|s| s.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Plaintext form
    pub fn to_plaintext(&self) -> Result<Vec<u8>> {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&section.filename);
            out.push('?');
            for entry in &section.entries {
                out.push_str(&entry.encode());
            }
            out.push('!');
        }
        to_latin1(&out)
    }

    pub fn to_encrypted(&self) -> Result<Vec<u8>> {
        Ok(cipher::encrypt(&self.to_plaintext()?))
    }
}
