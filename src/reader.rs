//! Device access and bounds-checked field reads.
//!
//! `DiskReader` is the only place that touches the underlying device; every
//! parser receives plain byte buffers and decodes them through `ByteView`,
//! which reports out-of-range reads as `ScanError::OutOfBounds` instead of
//! panicking. A single corrupted record must never take the scan down.

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use std::io::{Read, Seek, SeekFrom};

use crate::error::{Result, ScanError};

/// Anything we can scan: raw files, block devices, EWF bodies, in-memory images.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Seek + read over a device handle.
#[derive(Debug)]
pub struct DiskReader<T: Read + Seek> {
    inner: T,
}

impl<T: Read + Seek> DiskReader<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Fill `buf` with the bytes found at absolute `offset`.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        trace!("Reading {} bytes at 0x{:X}", buf.len(), offset);
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read_exact(buf)?;
        Ok(())
    }

    /// Read `len` bytes at absolute `offset` into a fresh buffer.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

/// Read-only view over an untrusted buffer with typed little-endian accessors.
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    buf: &'a [u8],
}

impl<'a> ByteView<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.buf
    }

    /// `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .map(|end| &self.buf[offset..end])
            .ok_or(ScanError::OutOfBounds {
                offset,
                len,
                size: self.buf.len(),
            })
    }

    /// Sub-view of `len` bytes starting at `offset`.
    pub fn view(&self, offset: usize, len: usize) -> Result<ByteView<'a>> {
        self.slice(offset, len).map(ByteView::new)
    }

    pub fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(offset, N)?);
        Ok(out)
    }

    pub fn u8_at(&self, offset: usize) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn i8_at(&self, offset: usize) -> Result<i8> {
        Ok(self.u8_at(offset)? as i8)
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.slice(offset, 2)?))
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.slice(offset, 4)?))
    }

    pub fn u64_at(&self, offset: usize) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.slice(offset, 8)?))
    }

    pub fn i64_at(&self, offset: usize) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.slice(offset, 8)?))
    }

    /// Unsigned little-endian integer of 1..=8 bytes (used for 6-byte file references).
    pub fn uint_at(&self, offset: usize, nbytes: usize) -> Result<u64> {
        if nbytes == 0 || nbytes > 8 {
            return Err(ScanError::OutOfBounds {
                offset,
                len: nbytes,
                size: self.buf.len(),
            });
        }
        Ok(LittleEndian::read_uint(self.slice(offset, nbytes)?, nbytes))
    }

    /// True when every byte of the view is zero.
    pub fn is_zeroed(&self) -> bool {
        self.buf.iter().all(|b| *b == 0)
    }
}
