//! Versioned byte stream
//!
//! [`Stream`] reads or writes little-endian primitives, strings, arrays and
//! object references over an in-memory buffer or a mapped file slice. It knows
//! the package [`FormatVersion`] so callers can branch on optional fields, and
//! it records every object reference read through [`Stream::read_object_ref`]
//! in a pending-reference list that the object loader later resolves.
//!
//! Streams are cheap to create and are never shared between threads; the
//! underlying [`ByteSource`] is.

use crate::directory::PackageIndex;
use crate::error::{GpkError, Result};
use crate::version::FormatVersion;
use memmap2::Mmap;
use std::fs::File;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

enum Backing {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Owned(v) => v,
            Backing::Mapped(m) => m,
        }
    }
}

/// Shared, immutable byte range (owned buffer or memory-mapped file window)
#[derive(Clone)]
pub struct ByteSource {
    backing: Arc<Backing>,
    range: Range<usize>,
}

impl ByteSource {
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        ByteSource {
            backing: Arc::new(Backing::Owned(data)),
            range: 0..len,
        }
    }

    /// Map an entire file read-only
    pub fn map_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(ByteSource::from_vec(Vec::new()));
        }
        // SAFETY: the mapping is read-only; storage files are not modified while open
        let map = unsafe { Mmap::map(&file)? };
        Ok(ByteSource {
            backing: Arc::new(Backing::Mapped(map)),
            range: 0..len,
        })
    }

    /// Map `size` bytes of a file starting at `offset`
    pub fn map_file_range<P: AsRef<Path>>(path: P, offset: u64, size: u64) -> Result<Self> {
        let whole = ByteSource::map_file(path)?;
        whole.slice(offset as usize, size as usize)
    }

    /// Narrow this source to `len` bytes at `offset` (relative to this source)
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self> {
        let end = offset.checked_add(len).filter(|&end| end <= self.len());
        match end {
            Some(end) => Ok(ByteSource {
                backing: self.backing.clone(),
                range: self.range.start + offset..self.range.start + end,
            }),
            None => Err(GpkError::UnexpectedEof {
                offset,
                need: len,
                have: self.len().saturating_sub(offset),
            }),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.backing.as_slice()[self.range.clone()]
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource")
            .field("range", &self.range)
            .finish()
    }
}

/// Reading vs writing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Reading,
    Writing,
}

/// Object reference encountered while reading, awaiting resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRef {
    /// Stream offset the index was read from
    pub offset: usize,
    pub index: PackageIndex,
}

enum Buffer {
    Read(ByteSource),
    Write(Vec<u8>),
}

pub struct Stream {
    buffer: Buffer,
    pos: usize,
    version: FormatVersion,
    pending: Vec<PendingRef>,
}

impl Stream {
    pub fn reader(source: ByteSource, version: FormatVersion) -> Self {
        Stream {
            buffer: Buffer::Read(source),
            pos: 0,
            version,
            pending: Vec::new(),
        }
    }

    pub fn from_vec(data: Vec<u8>, version: FormatVersion) -> Self {
        Stream::reader(ByteSource::from_vec(data), version)
    }

    pub fn open_file<P: AsRef<Path>>(path: P, version: FormatVersion) -> Result<Self> {
        Ok(Stream::reader(ByteSource::map_file(path)?, version))
    }

    pub fn writer(version: FormatVersion) -> Self {
        Stream {
            buffer: Buffer::Write(Vec::new()),
            pos: 0,
            version,
            pending: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        match self.buffer {
            Buffer::Read(_) => Mode::Reading,
            Buffer::Write(_) => Mode::Writing,
        }
    }

    pub fn is_reading(&self) -> bool {
        self.mode() == Mode::Reading
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }

    /// Switch revision once the summary has been parsed
    pub fn set_version(&mut self, version: FormatVersion) {
        self.version = version;
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.pos)
    }

    fn data(&self) -> &[u8] {
        match &self.buffer {
            Buffer::Read(source) => source.as_slice(),
            Buffer::Write(buf) => buf,
        }
    }

    /// Underlying source when reading
    pub fn source(&self) -> Option<&ByteSource> {
        match &self.buffer {
            Buffer::Read(source) => Some(source),
            Buffer::Write(_) => None,
        }
    }

    /// Seek to an absolute position; seeking past the end is an error
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.len() {
            return Err(GpkError::UnexpectedEof {
                offset: pos,
                need: 0,
                have: self.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.pos += n;
        Ok(())
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.pos.checked_add(n).map_or(true, |end| end > self.len()) {
            return Err(GpkError::UnexpectedEof {
                offset: self.pos,
                need: n,
                have: self.remaining(),
            });
        }
        Ok(())
    }

    fn expect_reading(&self) -> Result<()> {
        match self.buffer {
            Buffer::Read(_) => Ok(()),
            Buffer::Write(_) => Err(GpkError::InvalidMode { expected: "reading" }),
        }
    }

    /// Fail unless exactly `declared` bytes were consumed since `start`
    pub fn expect_consumed(&self, start: usize, declared: usize, context: &str) -> Result<()> {
        let actual = self.pos.saturating_sub(start);
        if actual != declared {
            return Err(GpkError::SizeMismatch {
                context: context.to_string(),
                expected: declared,
                actual,
            });
        }
        Ok(())
    }

    // --- reading ---------------------------------------------------------

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
        self.expect_reading()?;
        self.ensure(n)?;
        let start = self.pos;
        self.pos += n;
        Ok(&self.data()[start..start + n])
    }

    fn read_array_of<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array_of::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array_of()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array_of()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array_of()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array_of()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array_of()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array_of()?))
    }

    pub fn read_guid(&mut self) -> Result<[u8; 16]> {
        self.read_array_of()
    }

    /// Read a length-prefixed string (positive = Latin-1, negative = UTF-16LE)
    pub fn read_fstring(&mut self) -> Result<String> {
        let offset = self.pos;
        let len = self.read_i32()?;
        if len == 0 {
            return Ok(String::new());
        }
        if len > 0 {
            let bytes = self.read_bytes(len as usize)?;
            let (text, nul) = bytes.split_at(bytes.len() - 1);
            if nul[0] != 0 {
                return Err(GpkError::corrupt(
                    format!("string at {:#x}", offset),
                    "missing terminator",
                ));
            }
            Ok(text.iter().map(|&b| b as char).collect())
        } else {
            let units = (len as i64).unsigned_abs() as usize;
            let bytes = self.read_bytes(units.checked_mul(2).ok_or_else(|| {
                GpkError::corrupt(format!("string at {:#x}", offset), "length overflow")
            })?)?;
            let wide: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            let (text, nul) = wide.split_at(wide.len() - 1);
            if nul[0] != 0 {
                return Err(GpkError::corrupt(
                    format!("string at {:#x}", offset),
                    "missing terminator",
                ));
            }
            String::from_utf16(text).map_err(|_| {
                GpkError::corrupt(format!("string at {:#x}", offset), "invalid UTF-16")
            })
        }
    }

    /// Read an element count and check it against the bytes left
    ///
    /// `min_element_size` is the smallest encoded size of one element; a count
    /// that cannot possibly fit is corruption, not an allocation request.
    pub fn read_count(&mut self, min_element_size: usize, context: &str) -> Result<usize> {
        let offset = self.pos;
        let count = self.read_i32()?;
        if count < 0 {
            return Err(GpkError::corrupt(
                context,
                format!("negative element count {} at {:#x}", count, offset),
            ));
        }
        let count = count as usize;
        if count.saturating_mul(min_element_size) > self.remaining() {
            return Err(GpkError::corrupt(
                context,
                format!(
                    "element count {} at {:#x} exceeds remaining {} bytes",
                    count,
                    offset,
                    self.remaining()
                ),
            ));
        }
        Ok(count)
    }

    /// Read a length-prefixed array
    pub fn read_array<T, F>(&mut self, min_element_size: usize, context: &str, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Stream) -> Result<T>,
    {
        let count = self.read_count(min_element_size, context)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(f(self)?);
        }
        Ok(items)
    }

    pub fn read_index(&mut self) -> Result<PackageIndex> {
        Ok(PackageIndex(self.read_i32()?))
    }

    /// Read an object reference and remember it for later resolution
    pub fn read_object_ref(&mut self) -> Result<PackageIndex> {
        let offset = self.pos;
        let index = self.read_index()?;
        if !index.is_null() {
            self.pending.push(PendingRef { offset, index });
        }
        Ok(index)
    }

    pub fn pending_refs(&self) -> &[PendingRef] {
        &self.pending
    }

    pub fn take_pending_refs(&mut self) -> Vec<PendingRef> {
        std::mem::take(&mut self.pending)
    }

    // --- writing ---------------------------------------------------------

    fn out(&mut self) -> Result<&mut Vec<u8>> {
        match &mut self.buffer {
            Buffer::Write(buf) => Ok(buf),
            Buffer::Read(_) => Err(GpkError::InvalidMode { expected: "writing" }),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let pos = self.pos;
        let buf = self.out()?;
        let end = pos + bytes.len();
        if end > buf.len() {
            buf.resize(end, 0);
        }
        buf[pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_bytes(&[v])
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_guid(&mut self, guid: &[u8; 16]) -> Result<()> {
        self.write_bytes(guid)
    }

    /// Write a string as Latin-1 when possible, UTF-16LE otherwise
    pub fn write_fstring(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return self.write_i32(0);
        }
        if text.chars().all(|c| (c as u32) <= 0xFF) {
            let count = text.chars().count() + 1;
            self.write_i32(count as i32)?;
            let bytes: Vec<u8> = text.chars().map(|c| c as u8).chain(Some(0)).collect();
            self.write_bytes(&bytes)
        } else {
            let wide: Vec<u16> = text.encode_utf16().chain(Some(0)).collect();
            self.write_i32(-(wide.len() as i32))?;
            let bytes: Vec<u8> = wide.iter().flat_map(|u| u.to_le_bytes()).collect();
            self.write_bytes(&bytes)
        }
    }

    pub fn write_count(&mut self, count: usize) -> Result<()> {
        let count = i32::try_from(count)
            .map_err(|_| GpkError::corrupt("array", format!("count {} does not fit", count)))?;
        self.write_i32(count)
    }

    pub fn write_array<T, F>(&mut self, items: &[T], mut f: F) -> Result<()>
    where
        F: FnMut(&mut Stream, &T) -> Result<()>,
    {
        self.write_count(items.len())?;
        for item in items {
            f(self, item)?;
        }
        Ok(())
    }

    /// Object references are always written back as plain indices
    pub fn write_index(&mut self, index: PackageIndex) -> Result<()> {
        self.write_i32(index.0)
    }

    /// Overwrite an i32 at an earlier position (size back-patching)
    pub fn patch_i32(&mut self, pos: usize, v: i32) -> Result<()> {
        let buf = self.out()?;
        if pos + 4 > buf.len() {
            return Err(GpkError::UnexpectedEof {
                offset: pos,
                need: 4,
                have: buf.len().saturating_sub(pos),
            });
        }
        buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// Finish writing and take the buffer
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.buffer {
            Buffer::Write(buf) => Ok(buf),
            Buffer::Read(_) => Err(GpkError::InvalidMode { expected: "writing" }),
        }
    }
}
