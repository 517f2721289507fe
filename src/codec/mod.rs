//! Payload codec: zlib-wrapped deflate.
//!
//! Regular-file content is compressed once, whole, into a single zlib
//! stream and stored as the entry payload.  The decoder inflates it
//! straight into the destination file in fixed-size chunks, so a payload
//! never needs a second full-size buffer on the way out.
//!
//! Compression failures are reported as [`CodecError`], a category kept
//! apart from plain I/O on the container or destination files.

use std::io::{self, Read, Write};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;

/// Maximum deflate level; the default for new cells.
pub const MAX_LEVEL:     u32   = 9;
/// Chunk size used when streaming inflated bytes to a destination.
pub const INFLATE_CHUNK: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
}

// ── Deflate ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct DeflateCodec {
    level: u32,
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self { level: MAX_LEVEL }
    }
}

impl DeflateCodec {
    pub fn new(level: u32) -> Self {
        Self { level: level.min(MAX_LEVEL) }
    }

    pub fn level(&self) -> u32 { self.level }

    /// Compress everything `source` yields into one zlib stream.
    ///
    /// Returns the compressed bytes and the number of source bytes consumed.
    /// Read errors on `source` are propagated as I/O errors, not codec errors.
    pub fn compress_reader<R: Read>(&self, mut source: R) -> Result<(Vec<u8>, u64), CompressError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        let mut buf = vec![0u8; INFLATE_CHUNK];
        let mut consumed = 0u64;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CompressError::Source(e)),
            };
            encoder
                .write_all(&buf[..n])
                .map_err(|e| CompressError::Codec(CodecError::Compression(e.to_string())))?;
            consumed += n as u64;
        }
        let compressed = encoder
            .finish()
            .map_err(|e| CompressError::Codec(CodecError::Compression(e.to_string())))?;
        Ok((compressed, consumed))
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self.compress_reader(data) {
            Ok((out, _)) => Ok(out),
            Err(CompressError::Codec(e)) => Err(e),
            Err(CompressError::Source(e)) => Err(CodecError::Compression(e.to_string())),
        }
    }

    /// Start inflating `payload`.
    pub fn inflater<'a>(&self, payload: &'a [u8]) -> Inflater<'a> {
        Inflater { decoder: ZlibDecoder::new(payload) }
    }

    /// Inflate a whole payload into memory.  Test and listing helper; the
    /// extraction path streams through [`Inflater`] instead.
    pub fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        ZlibDecoder::new(payload)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

/// Failure while compressing a source stream.
#[derive(Debug)]
pub enum CompressError {
    /// Reading the source failed.
    Source(io::Error),
    Codec(CodecError),
}

/// Chunked reader over an inflating payload.
pub struct Inflater<'a> {
    decoder: ZlibDecoder<&'a [u8]>,
}

impl Inflater<'_> {
    /// Fill `buf` with the next inflated bytes; `Ok(0)` at end of stream.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, CodecError> {
        loop {
            match self.decoder.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CodecError::Decompression(e.to_string())),
            }
        }
    }
}
