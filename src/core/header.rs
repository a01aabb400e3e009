use crate::compression::CompressedChunk;
use crate::error::{GpkError, Result};
use crate::stream::Stream;
use crate::version::FormatVersion;
use serde::{Deserialize, Serialize};

/// Package tag found at offset 0 of every package and compressed chunk
pub const PACKAGE_TAG: u32 = 0x9E2A_83C1;

/// Package is a cooked, stripped build
pub const PACKAGE_COOKED: u32 = 0x0000_0008;
/// Package payload is stored in compressed chunks
pub const PACKAGE_STORE_COMPRESSED: u32 = 0x0200_0000;

/// Per-generation counts kept for incremental saves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub export_count: i32,
    pub name_count: i32,
    pub net_object_count: i32,
}

/// Texture pool reservation recorded by the cooker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureAllocation {
    pub size_x: i32,
    pub size_y: i32,
    pub num_mips: i32,
    pub format: u32,
    pub create_flags: u32,
    pub export_indices: Vec<i32>,
}

/// Package summary (the fixed header at offset 0)
///
/// Offsets are relative to the start of the uncompressed package. The
/// summary is the only part of a compressed package stored uncompressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSummary {
    pub version: FormatVersion,
    pub file_version: u16,
    pub licensee_version: u16,
    /// End of the directory region (names, imports, exports, depends)
    pub header_size: i32,
    pub folder_name: String,
    pub package_flags: u32,
    pub name_count: u32,
    pub name_offset: u32,
    pub export_count: u32,
    pub export_offset: u32,
    pub import_count: u32,
    pub import_offset: u32,
    pub depends_offset: u32,
    /// Present in modern packages only
    pub guid_tables: Option<GuidTables>,
    pub thumbnail_table_offset: u32,
    pub guid: [u8; 16],
    pub generations: Vec<Generation>,
    pub engine_version: u32,
    pub cooker_version: u32,
    pub compression_flags: u32,
    pub compressed_chunks: Vec<CompressedChunk>,
    pub package_source: u32,
    pub additional_packages: Vec<String>,
    pub texture_allocations: Vec<TextureAllocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidTables {
    pub offset: u32,
    pub import_guid_count: u32,
    pub export_guid_count: u32,
}

impl PackageSummary {
    /// Create an empty summary for the given revision
    pub fn new(version: FormatVersion) -> Self {
        PackageSummary {
            version,
            file_version: version.file_version(),
            licensee_version: version.licensee_version(),
            header_size: 0,
            folder_name: "None".to_string(),
            package_flags: PACKAGE_COOKED,
            name_count: 0,
            name_offset: 0,
            export_count: 0,
            export_offset: 0,
            import_count: 0,
            import_offset: 0,
            depends_offset: 0,
            guid_tables: version.has_guid_tables().then_some(GuidTables {
                offset: 0,
                import_guid_count: 0,
                export_guid_count: 0,
            }),
            thumbnail_table_offset: 0,
            guid: [0; 16],
            generations: Vec::new(),
            engine_version: match version {
                FormatVersion::Legacy => 4206,
                FormatVersion::Modern => 13249,
            },
            cooker_version: match version {
                FormatVersion::Legacy => 76,
                FormatVersion::Modern => 142,
            },
            compression_flags: 0,
            compressed_chunks: Vec::new(),
            package_source: 0,
            additional_packages: Vec::new(),
            texture_allocations: Vec::new(),
        }
    }

    /// Parse the summary; switches the stream to the detected revision
    pub fn read(stream: &mut Stream) -> Result<Self> {
        let tag = stream.read_u32()?;
        if tag != PACKAGE_TAG {
            return Err(GpkError::InvalidMagic { found: tag });
        }
        let file_version = stream.read_u16()?;
        let licensee_version = stream.read_u16()?;
        let version = FormatVersion::from_file_version(file_version, licensee_version)?;
        stream.set_version(version);

        let header_size = stream.read_i32()?;
        let folder_name = stream.read_fstring()?;
        let package_flags = stream.read_u32()?;
        let name_count = stream.read_u32()?;
        let name_offset = stream.read_u32()?;
        let export_count = stream.read_u32()?;
        let export_offset = stream.read_u32()?;
        let import_count = stream.read_u32()?;
        let import_offset = stream.read_u32()?;
        let depends_offset = stream.read_u32()?;
        let guid_tables = if version.has_guid_tables() {
            Some(GuidTables {
                offset: stream.read_u32()?,
                import_guid_count: stream.read_u32()?,
                export_guid_count: stream.read_u32()?,
            })
        } else {
            None
        };
        let thumbnail_table_offset = stream.read_u32()?;
        let guid = stream.read_guid()?;
        let generations = stream.read_array(12, "generations", |s| {
            Ok(Generation {
                export_count: s.read_i32()?,
                name_count: s.read_i32()?,
                net_object_count: s.read_i32()?,
            })
        })?;
        let engine_version = stream.read_u32()?;
        let cooker_version = stream.read_u32()?;
        let compression_flags = stream.read_u32()?;
        let compressed_chunks =
            stream.read_array(16, "compressed chunks", CompressedChunk::read)?;
        let package_source = stream.read_u32()?;
        let additional_packages = stream.read_array(4, "additional packages", |s| s.read_fstring())?;
        let texture_allocations = stream.read_array(24, "texture allocations", |s| {
            Ok(TextureAllocation {
                size_x: s.read_i32()?,
                size_y: s.read_i32()?,
                num_mips: s.read_i32()?,
                format: s.read_u32()?,
                create_flags: s.read_u32()?,
                export_indices: s.read_array(4, "texture allocation exports", |s| s.read_i32())?,
            })
        })?;

        let summary = PackageSummary {
            version,
            file_version,
            licensee_version,
            header_size,
            folder_name,
            package_flags,
            name_count,
            name_offset,
            export_count,
            export_offset,
            import_count,
            import_offset,
            depends_offset,
            guid_tables,
            thumbnail_table_offset,
            guid,
            generations,
            engine_version,
            cooker_version,
            compression_flags,
            compressed_chunks,
            package_source,
            additional_packages,
            texture_allocations,
        };
        summary.validate()?;
        Ok(summary)
    }

    pub fn write(&self, stream: &mut Stream) -> Result<()> {
        stream.write_u32(PACKAGE_TAG)?;
        stream.write_u16(self.file_version)?;
        stream.write_u16(self.licensee_version)?;
        stream.write_i32(self.header_size)?;
        stream.write_fstring(&self.folder_name)?;
        stream.write_u32(self.package_flags)?;
        stream.write_u32(self.name_count)?;
        stream.write_u32(self.name_offset)?;
        stream.write_u32(self.export_count)?;
        stream.write_u32(self.export_offset)?;
        stream.write_u32(self.import_count)?;
        stream.write_u32(self.import_offset)?;
        stream.write_u32(self.depends_offset)?;
        if self.version.has_guid_tables() {
            let tables = self.guid_tables.unwrap_or(GuidTables {
                offset: 0,
                import_guid_count: 0,
                export_guid_count: 0,
            });
            stream.write_u32(tables.offset)?;
            stream.write_u32(tables.import_guid_count)?;
            stream.write_u32(tables.export_guid_count)?;
        }
        stream.write_u32(self.thumbnail_table_offset)?;
        stream.write_guid(&self.guid)?;
        stream.write_array(&self.generations, |s, g| {
            s.write_i32(g.export_count)?;
            s.write_i32(g.name_count)?;
            s.write_i32(g.net_object_count)
        })?;
        stream.write_u32(self.engine_version)?;
        stream.write_u32(self.cooker_version)?;
        stream.write_u32(self.compression_flags)?;
        stream.write_array(&self.compressed_chunks, |s, c| c.write(s))?;
        stream.write_u32(self.package_source)?;
        stream.write_array(&self.additional_packages, |s, p| s.write_fstring(p))?;
        stream.write_array(&self.texture_allocations, |s, t| {
            s.write_i32(t.size_x)?;
            s.write_i32(t.size_y)?;
            s.write_i32(t.num_mips)?;
            s.write_u32(t.format)?;
            s.write_u32(t.create_flags)?;
            s.write_array(&t.export_indices, |s, i| s.write_i32(*i))
        })
    }

    /// Sanity checks that do not need the rest of the file
    pub fn validate(&self) -> Result<()> {
        if self.header_size < 0 {
            return Err(GpkError::corrupt(
                "package summary",
                format!("negative header size {}", self.header_size),
            ));
        }
        let header_size = self.header_size as u64;
        for (what, count, offset) in [
            ("name", self.name_count, self.name_offset),
            ("import", self.import_count, self.import_offset),
            ("export", self.export_count, self.export_offset),
        ] {
            if count > 0 && offset as u64 > header_size {
                return Err(GpkError::corrupt(
                    "package summary",
                    format!(
                        "{} table offset {:#x} lies beyond header size {:#x}",
                        what, offset, header_size
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn is_compressed(&self) -> bool {
        !self.compressed_chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(summary: &PackageSummary) -> PackageSummary {
        let mut out = Stream::writer(summary.version);
        summary.write(&mut out).unwrap();
        let bytes = out.into_bytes().unwrap();
        let mut input = Stream::from_vec(bytes, FormatVersion::Legacy);
        let parsed = PackageSummary::read(&mut input).unwrap();
        assert_eq!(input.version(), summary.version);
        assert_eq!(input.remaining(), 0);
        parsed
    }

    #[test]
    fn test_legacy_summary_round_trip() {
        let mut summary = PackageSummary::new(FormatVersion::Legacy);
        summary.header_size = 512;
        summary.folder_name = "S1Data".into();
        summary.generations.push(Generation {
            export_count: 3,
            name_count: 9,
            net_object_count: 0,
        });
        summary.additional_packages.push("S1Common".into());
        let parsed = round_trip(&summary);
        assert_eq!(parsed, summary);
        assert!(parsed.guid_tables.is_none());
    }

    #[test]
    fn test_modern_summary_has_guid_tables() {
        let mut summary = PackageSummary::new(FormatVersion::Modern);
        summary.header_size = 900;
        summary.texture_allocations.push(TextureAllocation {
            size_x: 256,
            size_y: 256,
            num_mips: 9,
            format: 3,
            create_flags: 0,
            export_indices: vec![4, 7],
        });
        let parsed = round_trip(&summary);
        assert_eq!(parsed, summary);
        assert!(parsed.guid_tables.is_some());
    }

    #[test]
    fn test_bad_tag_rejected() {
        let mut input = Stream::from_vec(vec![0u8; 128], FormatVersion::Legacy);
        assert!(matches!(
            PackageSummary::read(&mut input),
            Err(GpkError::InvalidMagic { found: 0 })
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut out = Stream::writer(FormatVersion::Legacy);
        out.write_u32(PACKAGE_TAG).unwrap();
        out.write_u16(491).unwrap();
        out.write_u16(0).unwrap();
        let mut input = Stream::from_vec(out.into_bytes().unwrap(), FormatVersion::Legacy);
        assert!(matches!(
            PackageSummary::read(&mut input),
            Err(GpkError::UnsupportedVersion { file_version: 491, .. })
        ));
    }

    #[test]
    fn test_offsets_beyond_header_rejected() {
        let mut summary = PackageSummary::new(FormatVersion::Legacy);
        summary.header_size = 100;
        summary.name_count = 2;
        summary.name_offset = 4000;
        assert!(summary.validate().is_err());
    }
}
