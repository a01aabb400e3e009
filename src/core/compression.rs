//! Compressed chunk codec
//!
//! Packages and bulk data share one compressed layout:
//!
//! ```text
//! [tag: u32 = PACKAGE_TAG][block_size: i32]
//! [compressed_total: i32][uncompressed_total: i32]
//! [block headers: (compressed: i32, uncompressed: i32) x N]
//! [block payloads...]
//! ```
//!
//! Only zlib is implemented; the other engine codecs are reported as
//! unsupported.

use crate::error::{GpkError, Result};
use crate::header::PACKAGE_TAG;
use crate::stream::Stream;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Package-level compression flag for zlib chunks
pub const COMPRESS_ZLIB: u32 = 0x01;
/// Package-level compression flag for LZO chunks
pub const COMPRESS_LZO: u32 = 0x02;
/// Package-level compression flag for LZX chunks
pub const COMPRESS_LZX: u32 = 0x04;

/// Uncompressed bytes per block when writing
pub const BLOCK_SIZE: usize = 0x20000;

const MAX_PREALLOC: usize = 64 * 1024 * 1024;

/// Compressed chunk descriptor from the package summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompressedChunk {
    pub uncompressed_offset: i32,
    pub uncompressed_size: i32,
    pub compressed_offset: i32,
    pub compressed_size: i32,
}

impl CompressedChunk {
    pub fn read(stream: &mut Stream) -> Result<Self> {
        Ok(CompressedChunk {
            uncompressed_offset: stream.read_i32()?,
            uncompressed_size: stream.read_i32()?,
            compressed_offset: stream.read_i32()?,
            compressed_size: stream.read_i32()?,
        })
    }

    pub fn write(&self, stream: &mut Stream) -> Result<()> {
        stream.write_i32(self.uncompressed_offset)?;
        stream.write_i32(self.uncompressed_size)?;
        stream.write_i32(self.compressed_offset)?;
        stream.write_i32(self.compressed_size)
    }
}

fn inflate(data: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected.min(MAX_PREALLOC));
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| GpkError::Decompression(e.to_string()))?;
    if out.len() != expected {
        return Err(GpkError::SizeMismatch {
            context: "compressed block".into(),
            expected,
            actual: out.len(),
        });
    }
    Ok(out)
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn check_method(flags: u32) -> Result<()> {
    if flags & COMPRESS_ZLIB != 0 {
        Ok(())
    } else {
        Err(GpkError::UnsupportedCompression(flags))
    }
}

/// Decode one compressed chunk at the stream's position
pub fn read_chunk(stream: &mut Stream, flags: u32) -> Result<Vec<u8>> {
    check_method(flags)?;
    let start = stream.position();
    let tag = stream.read_u32()?;
    if tag != PACKAGE_TAG {
        return Err(GpkError::InvalidMagic { found: tag });
    }
    let block_size = stream.read_i32()?;
    let compressed_total = stream.read_i32()?;
    let uncompressed_total = stream.read_i32()?;
    if block_size <= 0 || compressed_total < 0 || uncompressed_total < 0 {
        return Err(GpkError::corrupt(
            format!("compressed chunk at {:#x}", start),
            "negative size in chunk summary",
        ));
    }
    let block_size = block_size as usize;
    let block_count = (uncompressed_total as usize).div_ceil(block_size);
    if block_count.saturating_mul(8) > stream.remaining() {
        return Err(GpkError::corrupt(
            format!("compressed chunk at {:#x}", start),
            format!("{} block headers do not fit", block_count),
        ));
    }
    let mut blocks = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        let compressed = stream.read_i32()?;
        let uncompressed = stream.read_i32()?;
        if compressed < 0 || uncompressed < 0 {
            return Err(GpkError::corrupt(
                format!("compressed chunk at {:#x}", start),
                "negative block size",
            ));
        }
        blocks.push((compressed as usize, uncompressed as usize));
    }
    let declared: usize = blocks.iter().map(|b| b.0).sum();
    if declared != compressed_total as usize {
        return Err(GpkError::SizeMismatch {
            context: format!("compressed chunk at {:#x}", start),
            expected: compressed_total as usize,
            actual: declared,
        });
    }
    let mut out = Vec::with_capacity((uncompressed_total as usize).min(MAX_PREALLOC));
    for (compressed, uncompressed) in blocks {
        let data = stream.read_bytes(compressed)?;
        out.extend_from_slice(&inflate(data, uncompressed)?);
    }
    if out.len() != uncompressed_total as usize {
        return Err(GpkError::SizeMismatch {
            context: format!("compressed chunk at {:#x}", start),
            expected: uncompressed_total as usize,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Encode `data` as one zlib chunk
pub fn write_chunk(stream: &mut Stream, data: &[u8]) -> Result<()> {
    let blocks = data
        .chunks(BLOCK_SIZE)
        .map(|block| deflate(block).map(|c| (c, block.len())))
        .collect::<Result<Vec<_>>>()?;
    let compressed_total: usize = blocks.iter().map(|(c, _)| c.len()).sum();
    stream.write_u32(PACKAGE_TAG)?;
    stream.write_i32(BLOCK_SIZE as i32)?;
    stream.write_count(compressed_total)?;
    stream.write_count(data.len())?;
    for (compressed, uncompressed) in &blocks {
        stream.write_count(compressed.len())?;
        stream.write_count(*uncompressed)?;
    }
    for (compressed, _) in &blocks {
        stream.write_bytes(compressed)?;
    }
    Ok(())
}
