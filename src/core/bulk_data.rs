//! Bulk data regions
//!
//! Large payloads (texture mips, audio) are stored as bulk data: a small
//! record followed by the payload inline, or pointing at a side-cache file.

use crate::compression::{self, COMPRESS_ZLIB};
use crate::error::{GpkError, Result};
use crate::stream::{ByteSource, Stream};
use std::path::Path;

/// Payload lives in a separate cache file
pub const BULK_STORE_IN_SEPARATE_FILE: u32 = 0x01;
/// Payload is a zlib compressed chunk
pub const BULK_COMPRESSED_ZLIB: u32 = 0x02;
/// Region is unused and has no payload
pub const BULK_UNUSED: u32 = 0x20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkPayload {
    /// Bytes as stored (still compressed when the zlib flag is set)
    Inline(Vec<u8>),
    /// Stored elsewhere; `offset_in_file`/`size_on_disk` address it
    External,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkData {
    pub flags: u32,
    pub element_count: i32,
    pub size_on_disk: i32,
    pub offset_in_file: i32,
    pub payload: BulkPayload,
}

impl BulkData {
    /// Uncompressed inline bulk data
    pub fn inline(data: Vec<u8>) -> Self {
        BulkData {
            flags: 0,
            element_count: data.len() as i32,
            size_on_disk: data.len() as i32,
            offset_in_file: 0,
            payload: BulkPayload::Inline(data),
        }
    }

    /// Inline bulk data compressed as one zlib chunk
    pub fn compressed(data: &[u8]) -> Result<Self> {
        let mut chunk = Stream::writer(crate::version::FormatVersion::Modern);
        compression::write_chunk(&mut chunk, data)?;
        let stored = chunk.into_bytes()?;
        Ok(BulkData {
            flags: BULK_COMPRESSED_ZLIB,
            element_count: data.len() as i32,
            size_on_disk: stored.len() as i32,
            offset_in_file: 0,
            payload: BulkPayload::Inline(stored),
        })
    }

    pub fn read(stream: &mut Stream) -> Result<Self> {
        let flags = stream.read_u32()?;
        let element_count = stream.read_i32()?;
        let size_on_disk = stream.read_i32()?;
        let offset_in_file = stream.read_i32()?;
        if size_on_disk < 0 {
            return Err(GpkError::corrupt(
                "bulk data",
                format!("negative size on disk {}", size_on_disk),
            ));
        }
        let payload = if flags & BULK_UNUSED != 0 {
            BulkPayload::Empty
        } else if flags & BULK_STORE_IN_SEPARATE_FILE != 0 {
            BulkPayload::External
        } else {
            BulkPayload::Inline(stream.read_bytes(size_on_disk as usize)?.to_vec())
        };
        Ok(BulkData {
            flags,
            element_count,
            size_on_disk,
            offset_in_file,
            payload,
        })
    }

    /// Write the record; inline payloads get `offset_in_file` fixed to the payload position
    pub fn write(&self, stream: &mut Stream) -> Result<()> {
        stream.write_u32(self.flags)?;
        stream.write_i32(self.element_count)?;
        match &self.payload {
            BulkPayload::Inline(data) => {
                stream.write_count(data.len())?;
                let offset = stream.position() + 4;
                stream.write_i32(offset as i32)?;
                stream.write_bytes(data)
            }
            BulkPayload::External | BulkPayload::Empty => {
                stream.write_i32(self.size_on_disk)?;
                stream.write_i32(self.offset_in_file)
            }
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.payload, BulkPayload::External)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & BULK_COMPRESSED_ZLIB != 0
    }

    /// Decoded payload for inline data
    pub fn decode(&self) -> Result<Vec<u8>> {
        match &self.payload {
            BulkPayload::Inline(data) => self.decode_stored(data),
            BulkPayload::Empty => Ok(Vec::new()),
            BulkPayload::External => Err(GpkError::corrupt(
                "bulk data",
                "payload is stored in a separate file",
            )),
        }
    }

    /// Decoded payload read from a side-cache file
    pub fn decode_from_cache<P: AsRef<Path>>(&self, cache: P) -> Result<Vec<u8>> {
        if !self.is_external() {
            return self.decode();
        }
        if self.offset_in_file < 0 {
            return Err(GpkError::corrupt(
                "bulk data",
                format!("negative cache offset {}", self.offset_in_file),
            ));
        }
        let source = ByteSource::map_file_range(
            cache,
            self.offset_in_file as u64,
            self.size_on_disk as u64,
        )?;
        self.decode_stored(source.as_slice())
    }

    fn decode_stored(&self, stored: &[u8]) -> Result<Vec<u8>> {
        if !self.is_compressed() {
            return Ok(stored.to_vec());
        }
        let mut chunk = Stream::from_vec(stored.to_vec(), crate::version::FormatVersion::Modern);
        let data = compression::read_chunk(&mut chunk, COMPRESS_ZLIB)?;
        if self.element_count >= 0 && data.len() != self.element_count as usize {
            return Err(GpkError::SizeMismatch {
                context: "bulk data".into(),
                expected: self.element_count as usize,
                actual: data.len(),
            });
        }
        Ok(data)
    }
}
