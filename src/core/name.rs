//! Package name table
//!
//! Every identifier in a package (object names, class names, property names
//! and types) is stored once in the name table and referenced by index. A
//! [`Name`] pairs that index with an instance number so siblings sharing a
//! base name stay distinct: number `0` renders as `Wall`, number `n` renders
//! as `Wall_{n-1}`.
//!
//! Lookups and comparisons are case-insensitive; tokens are stable indices for
//! the lifetime of the owning package.

use crate::error::{GpkError, Result};
use crate::stream::Stream;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Reserved name terminating property lists and denoting "no name"
pub const NONE: &str = "None";

/// Index into a package's name table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameToken(pub u32);

/// A name reference as stored on disk: token plus instance number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Name {
    pub token: NameToken,
    pub number: i32,
}

impl Name {
    pub fn new(token: NameToken) -> Self {
        Name { token, number: 0 }
    }

    pub fn with_number(token: NameToken, number: i32) -> Self {
        Name { token, number }
    }

    /// Read the on-disk (index, number) pair without resolving it
    pub fn read(stream: &mut Stream) -> Result<Self> {
        let index = stream.read_i32()?;
        let number = stream.read_i32()?;
        if index < 0 {
            return Err(GpkError::InvalidName(index));
        }
        Ok(Name {
            token: NameToken(index as u32),
            number,
        })
    }

    pub fn write(&self, stream: &mut Stream) -> Result<()> {
        stream.write_i32(self.token.0 as i32)?;
        stream.write_i32(self.number)
    }
}

/// Name table row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameEntry {
    pub text: String,
    pub flags: u64,
}

/// Default flags given to names interned at runtime
pub const DEFAULT_NAME_FLAGS: u64 = 0x0007_0010_0000_0000;

#[derive(Debug, Clone, Default)]
pub struct NameTable {
    entries: Vec<NameEntry>,
    lookup: AHashMap<String, NameToken>,
}

impl NameTable {
    pub fn new() -> Self {
        NameTable::default()
    }

    /// Parse `count` entries starting at the stream's current position
    pub fn read(stream: &mut Stream, count: usize) -> Result<Self> {
        let mut table = NameTable::new();
        table.entries.reserve(count);
        for _ in 0..count {
            let text = stream.read_fstring()?;
            let flags = stream.read_u64()?;
            table.push(NameEntry { text, flags });
        }
        Ok(table)
    }

    pub fn write(&self, stream: &mut Stream) -> Result<()> {
        for entry in &self.entries {
            stream.write_fstring(&entry.text)?;
            stream.write_u64(entry.flags)?;
        }
        Ok(())
    }

    fn push(&mut self, entry: NameEntry) -> NameToken {
        let token = NameToken(self.entries.len() as u32);
        // First occurrence wins so duplicate rows keep their own token
        self.lookup
            .entry(entry.text.to_ascii_lowercase())
            .or_insert(token);
        self.entries.push(entry);
        token
    }

    /// Return the token for `text`, appending it if absent
    pub fn intern(&mut self, text: &str) -> NameToken {
        match self.find(text) {
            Some(token) => token,
            None => self.push(NameEntry {
                text: text.to_string(),
                flags: DEFAULT_NAME_FLAGS,
            }),
        }
    }

    /// Intern a display string, splitting a trailing `_N` into the instance number
    pub fn intern_instanced(&mut self, display: &str) -> Name {
        let (base, number) = split_instance(display);
        Name::with_number(self.intern(base), number)
    }

    pub fn find(&self, text: &str) -> Option<NameToken> {
        self.lookup.get(&text.to_ascii_lowercase()).copied()
    }

    /// Look up a display string (`Wall_1`) without interning
    pub fn find_instanced(&self, display: &str) -> Option<Name> {
        if let Some(token) = self.find(display) {
            return Some(Name::new(token));
        }
        let (base, number) = split_instance(display);
        self.find(base).map(|token| Name::with_number(token, number))
    }

    pub fn resolve(&self, token: NameToken) -> Result<&str> {
        self.entries
            .get(token.0 as usize)
            .map(|e| e.text.as_str())
            .ok_or(GpkError::InvalidName(token.0 as i32))
    }

    /// Validate that a name read from disk addresses this table
    pub fn check(&self, name: Name) -> Result<Name> {
        self.resolve(name.token).map(|_| name)
    }

    /// Render a name with its instance suffix
    pub fn display(&self, name: Name) -> Result<String> {
        let base = self.resolve(name.token)?;
        Ok(if name.number > 0 {
            format!("{}_{}", base, name.number - 1)
        } else {
            base.to_string()
        })
    }

    /// Case-insensitive comparison of a name (with suffix) against text
    pub fn matches(&self, name: Name, text: &str) -> bool {
        self.display(name)
            .map(|d| d.eq_ignore_ascii_case(text))
            .unwrap_or(false)
    }

    /// Whether `name` is the reserved `None` terminator
    pub fn is_none(&self, name: Name) -> bool {
        name.number == 0
            && self
                .resolve(name.token)
                .map(|t| t.eq_ignore_ascii_case(NONE))
                .unwrap_or(false)
    }

    pub fn get(&self, token: NameToken) -> Option<&NameEntry> {
        self.entries.get(token.0 as usize)
    }

    pub fn entries(&self) -> &[NameEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split `Wall_3` into (`Wall`, 4). Suffixes with leading zeros stay in the base.
pub fn split_instance(display: &str) -> (&str, i32) {
    if let Some(idx) = display.rfind('_') {
        let digits = &display[idx + 1..];
        let well_formed = !digits.is_empty()
            && digits.bytes().all(|b| b.is_ascii_digit())
            && (digits == "0" || !digits.starts_with('0'));
        if well_formed && idx > 0 {
            if let Ok(n) = digits.parse::<i32>() {
                if let Some(number) = n.checked_add(1) {
                    return (&display[..idx], number);
                }
            }
        }
    }
    (display, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::FormatVersion;

    #[test]
    fn test_intern_is_case_insensitive() {
        let mut names = NameTable::new();
        let a = names.intern("StaticMesh");
        let b = names.intern("staticmesh");
        assert_eq!(a, b);
        assert_eq!(names.len(), 1);
        assert_eq!(names.resolve(a).unwrap(), "StaticMesh");
    }

    #[test]
    fn test_tokens_are_indices() {
        let mut names = NameTable::new();
        assert_eq!(names.intern("None"), NameToken(0));
        assert_eq!(names.intern("Core"), NameToken(1));
        assert_eq!(names.intern("Engine"), NameToken(2));
    }

    #[test]
    fn test_instance_display() {
        let mut names = NameTable::new();
        let wall = names.intern("Wall");
        assert_eq!(names.display(Name::new(wall)).unwrap(), "Wall");
        assert_eq!(names.display(Name::with_number(wall, 1)).unwrap(), "Wall_0");
        assert_eq!(names.display(Name::with_number(wall, 2)).unwrap(), "Wall_1");
        assert!(names.matches(Name::with_number(wall, 2), "WALL_1"));
    }

    #[test]
    fn test_split_instance() {
        assert_eq!(split_instance("Wall_1"), ("Wall", 2));
        assert_eq!(split_instance("Wall_0"), ("Wall", 1));
        assert_eq!(split_instance("Wall_01"), ("Wall_01", 0));
        assert_eq!(split_instance("Wall_"), ("Wall_", 0));
        assert_eq!(split_instance("_3"), ("_3", 0));
        assert_eq!(split_instance("Wall"), ("Wall", 0));
    }

    #[test]
    fn test_find_instanced_prefers_exact_entry() {
        let mut names = NameTable::new();
        names.intern("Layer_2");
        let layer = names.intern("Layer");
        assert_eq!(names.find_instanced("Layer_2").unwrap().number, 0);
        assert_eq!(
            names.find_instanced("layer_5").unwrap(),
            Name::with_number(layer, 6)
        );
    }

    #[test]
    fn test_none_detection() {
        let mut names = NameTable::new();
        let none = names.intern("None");
        assert!(names.is_none(Name::new(none)));
        assert!(!names.is_none(Name::with_number(none, 1)));
    }

    #[test]
    fn test_read_write_round_trip() {
        let mut names = NameTable::new();
        names.intern("None");
        names.intern("Package");
        names.intern("Grass_Diffuse");

        let mut out = Stream::writer(FormatVersion::Modern);
        names.write(&mut out).unwrap();
        let bytes = out.into_bytes().unwrap();

        let mut input = Stream::from_vec(bytes, FormatVersion::Modern);
        let parsed = NameTable::read(&mut input, 3).unwrap();
        assert_eq!(parsed.entries(), names.entries());
        assert!(input.remaining() == 0);
    }

    #[test]
    fn test_invalid_token() {
        let names = NameTable::new();
        assert!(matches!(
            names.resolve(NameToken(4)),
            Err(GpkError::InvalidName(4))
        ));
    }
}
