//! Error taxonomy shared by the encoder and the extraction pipeline.
//!
//! Every fatal condition maps onto one of four categories: plain I/O,
//! malformed container data ([`FormatError`]), compression failures
//! ([`CodecError`]) and filesystem-object creation failures (`Os`).
//! Decode errors that belong to a specific entry are wrapped in
//! [`CellError::Entry`] so the caller learns which entry broke the run.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::codec::CodecError;

pub type CellResult<T> = Result<T, CellError>;

/// Malformed or inconsistent container data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Bad begin marker 0x{found:04x} (expected 0x{expected:04x})")]
    BadMarker { found: u16, expected: u16 },
    #[error("Unknown property tag 0x{0:04x}")]
    UnknownTag(u16),
    #[error("Unknown entry type 0x{0:04x}")]
    UnknownKind(u16),
    #[error("Property 0x{tag:04x} has invalid length {len}")]
    BadPropertyLength { tag: u16, len: u32 },
    #[error("Property 0x{tag:04x} value {value} does not fit its field")]
    ValueOutOfRange { tag: u16, value: u64 },
    #[error("Property record of {len} bytes overruns block ({remaining} bytes left)")]
    PropertyOverrun { len: u64, remaining: u64 },
    #[error("Missing required property: {0}")]
    MissingProperty(&'static str),
    #[error("Entry of kind {kind} carries {data_len} payload bytes")]
    UnexpectedPayload { kind: &'static str, data_len: u64 },
    #[error("SizeInCell {size_in_cell} disagrees with data length {data_len}")]
    DataLengthMismatch { size_in_cell: u64, data_len: u64 },
    #[error("Decompressed {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Unsafe entry path '{0}'")]
    UnsafePath(String),
}

#[derive(Error, Debug)]
pub enum CellError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("{0}")]
    Codec(#[from] CodecError),
    #[error("Resource error: {0}")]
    Resource(String),
    #[error("Cannot create '{}': {source}", path.display())]
    Os { path: PathBuf, source: io::Error },
    #[error("Walk root '{}' must be a regular file or a directory", .0.display())]
    UnsupportedRoot(PathBuf),
    #[error("Entry #{index} ('{path}'): {source}")]
    Entry {
        index:  u32,
        path:   String,
        #[source]
        source: Box<CellError>,
    },
    #[error("Extraction cancelled")]
    Cancelled,
}

impl CellError {
    pub(crate) fn os(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CellError::Os { path: path.into(), source }
    }

    pub(crate) fn at_entry(self, index: u32, path: impl Into<String>) -> Self {
        match self {
            // Never wrap twice; the innermost entry is the one that failed.
            e @ CellError::Entry { .. } => e,
            e => CellError::Entry { index, path: path.into(), source: Box::new(e) },
        }
    }

    /// The entry index this error is attributed to, if any.
    pub fn entry_index(&self) -> Option<u32> {
        match self {
            CellError::Entry { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Strip any [`CellError::Entry`] wrapping and return the root cause.
    pub fn root_cause(&self) -> &CellError {
        match self {
            CellError::Entry { source, .. } => source.root_cause(),
            e => e,
        }
    }

    pub fn format_error(&self) -> Option<&FormatError> {
        match self.root_cause() {
            CellError::Format(f) => Some(f),
            _ => None,
        }
    }
}
