//! Package format revisions
//!
//! Only two on-disk revisions exist: the legacy 32-bit client packages and the
//! modern 64-bit client packages (which are also the ones shipped inside
//! composite bundles). Every version-dependent branch in the crate goes
//! through [`FormatVersion`].

use crate::error::{GpkError, Result};
use serde::{Deserialize, Serialize};

/// File version written by the legacy (32-bit) client
pub const LEGACY_FILE_VERSION: u16 = 610;
/// Licensee version written by the legacy (32-bit) client
pub const LEGACY_LICENSEE_VERSION: u16 = 14;
/// File version written by the modern (64-bit) client
pub const MODERN_FILE_VERSION: u16 = 897;
/// Licensee version written by the modern (64-bit) client
pub const MODERN_LICENSEE_VERSION: u16 = 17;

/// First file version treated as modern
pub const MODERN_THRESHOLD: u16 = 868;
const OLDEST_SUPPORTED: u16 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatVersion {
    Legacy,
    Modern,
}

impl FormatVersion {
    /// Map a raw file version onto one of the two supported revisions
    pub fn from_file_version(file_version: u16, licensee_version: u16) -> Result<Self> {
        match file_version {
            v if (MODERN_THRESHOLD..=MODERN_FILE_VERSION).contains(&v) => Ok(Self::Modern),
            v if (OLDEST_SUPPORTED..MODERN_THRESHOLD).contains(&v) => Ok(Self::Legacy),
            _ => Err(GpkError::UnsupportedVersion {
                file_version,
                licensee_version,
            }),
        }
    }

    pub fn file_version(self) -> u16 {
        match self {
            Self::Legacy => LEGACY_FILE_VERSION,
            Self::Modern => MODERN_FILE_VERSION,
        }
    }

    pub fn licensee_version(self) -> u16 {
        match self {
            Self::Legacy => LEGACY_LICENSEE_VERSION,
            Self::Modern => MODERN_LICENSEE_VERSION,
        }
    }

    pub fn is_modern(self) -> bool {
        self == Self::Modern
    }

    /// Summary carries the import/export GUID table fields
    pub fn has_guid_tables(self) -> bool {
        self.is_modern()
    }

    /// `ByteProperty` tags carry an enum name
    pub fn has_byte_enum_name(self) -> bool {
        self.is_modern()
    }

    /// `BoolProperty` values live in bit 0 of the tag's size field instead
    /// of a value byte after the tag header
    pub fn bool_in_size_field(self) -> bool {
        !self.is_modern()
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy ({}/{})", LEGACY_FILE_VERSION, LEGACY_LICENSEE_VERSION),
            Self::Modern => write!(f, "modern ({}/{})", MODERN_FILE_VERSION, MODERN_LICENSEE_VERSION),
        }
    }
}
