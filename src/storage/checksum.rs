//! CRC32 integrity checks
//!
//! Used in two places:
//! - every frame the file-backed block manager writes (`[crc: u32][payload]`)
//! - the trailer of the serialized graph stream, via [`ChecksumWriter`] and
//!   [`ChecksumReader`] which hash bytes as they pass through
//!
//! ```ignore
//! let mut writer = ChecksumWriter::new(inner);
//! writer.write_all(payload)?;
//! let (inner, crc) = writer.finish();
//! ```

use crate::{Result, StorageError};
use crc32fast::Hasher;
use std::io::{self, Read, Write};

/// Size of an encoded checksum
pub const CHECKSUM_SIZE: usize = 4;

/// CRC32 helpers
pub struct Checksum;

impl Checksum {
    pub fn compute(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn verify(data: &[u8], expected: u32) -> Result<()> {
        let actual = Self::compute(data);
        if actual != expected {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch: expected {:#010x}, got {:#010x} (data_len={})",
                expected,
                actual,
                data.len()
            )));
        }
        Ok(())
    }

    /// Encode a fixed-size frame: `[crc: u32][payload]`
    pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(CHECKSUM_SIZE + payload.len());
        frame.extend_from_slice(&Self::compute(payload).to_le_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Verify and strip a frame produced by [`Checksum::encode_frame`]
    pub fn decode_frame(frame: &[u8]) -> Result<&[u8]> {
        if frame.len() < CHECKSUM_SIZE {
            return Err(StorageError::Corruption(format!(
                "frame of {} bytes is too short for a checksum",
                frame.len()
            )));
        }
        let (head, payload) = frame.split_at(CHECKSUM_SIZE);
        let expected = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        Self::verify(payload, expected)?;
        Ok(payload)
    }
}

/// Write adapter hashing everything written through it
pub struct ChecksumWriter<W> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, hasher: Hasher::new(), written: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Returns the wrapped writer and the checksum of all bytes written
    pub fn finish(self) -> (W, u32) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Read adapter hashing everything read through it
pub struct ChecksumReader<R> {
    inner: R,
    hasher: Hasher,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, hasher: Hasher::new() }
    }

    /// Read the trailing checksum from the wrapped reader and compare
    pub fn verify_trailer(self) -> Result<R> {
        let mut inner = self.inner;
        let mut trailer = [0u8; CHECKSUM_SIZE];
        inner.read_exact(&mut trailer)?;
        let expected = u32::from_le_bytes(trailer);
        let actual = self.hasher.finalize();
        if expected != actual {
            return Err(StorageError::Corruption(format!(
                "stream checksum mismatch: expected {:#010x}, got {:#010x}",
                expected, actual
            )));
        }
        Ok(inner)
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
