//! High-level [`Cell`] API: the primary embedding surface.
//!
//! ```no_run
//! use hexcell::archive::{Cell, EncodeOptions};
//!
//! // Write
//! let info = Cell::pack("assets/", "assets.cell", EncodeOptions::default())?;
//! println!("{} entries", info.entry_count);
//!
//! // Read
//! let cell = Cell::open("assets.cell")?;
//! for entry in cell.list()? {
//!     println!("{:>10} {}", entry.original_size, entry.path);
//! }
//! cell.extract_all("out/")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::Serialize;

pub use crate::decoder::{DecodeOptions, DecodeReport};
pub use crate::encoder::EncodeOptions;

use crate::block::EntryKind;
use crate::decoder::{DecodedEntry, Decoder, EntryReader};
use crate::encoder::Encoder;
use crate::error::{CellError, CellResult};
use crate::info_block::InfoBlock;
use crate::message::{default_sink, MessageSink};

// ── EntrySummary ──────────────────────────────────────────────────────────────

/// Lightweight descriptor returned by [`Cell::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub index:         u32,
    pub kind:          EntryKind,
    pub path:          String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target:   Option<String>,
    pub mode:          u32,
    pub uid:           u32,
    pub gid:           u32,
    pub original_size: u64,
    pub encoded_size:  u64,
    /// `(major, minor)` for device nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device:        Option<(u32, u32)>,
}

impl From<&DecodedEntry> for EntrySummary {
    fn from(d: &DecodedEntry) -> Self {
        let e = &d.entry;
        EntrySummary {
            index:         d.index,
            kind:          e.kind,
            path:          e.path.to_string_lossy().into_owned(),
            link_target:   e.link_target.as_ref().map(|t| t.to_string_lossy().into_owned()),
            mode:          e.mode,
            uid:           e.uid,
            gid:           e.gid,
            original_size: e.original_size,
            encoded_size:  d.header.data_len,
            device:        e.kind.is_device().then_some((e.dev_major, e.dev_minor)),
        }
    }
}

// ── Cell ──────────────────────────────────────────────────────────────────────

/// A cell stored in a file, possibly after `offset` bytes of other data.
pub struct Cell {
    path:   PathBuf,
    offset: u64,
    info:   InfoBlock,
    sink:   Arc<dyn MessageSink>,
}

impl Cell {
    // ── Write ─────────────────────────────────────────────────────────────────

    /// Encode `root` into a new file at `out`.
    pub fn pack<P: AsRef<Path>, Q: AsRef<Path>>(root: P, out: Q, opts: EncodeOptions) -> CellResult<InfoBlock> {
        Self::pack_with_sink(root, out, opts, default_sink())
    }

    pub fn pack_with_sink<P: AsRef<Path>, Q: AsRef<Path>>(
        root: P,
        out:  Q,
        opts: EncodeOptions,
        sink: Arc<dyn MessageSink>,
    ) -> CellResult<InfoBlock> {
        let out = out.as_ref();
        let file = File::create(out).map_err(|e| CellError::os(out, e))?;
        let mut writer = BufWriter::new(file);
        let info = Encoder::with_sink(opts, sink).encode(root.as_ref(), &mut writer, 0)?;
        writer.flush()?;
        Ok(info)
    }

    /// Append a cell for `root` to the end of `out`.  Returns the offset of
    /// the new info block together with the block itself.
    pub fn append<P: AsRef<Path>>(root: P, out: &mut File, opts: EncodeOptions) -> CellResult<(u64, InfoBlock)> {
        Self::append_with_sink(root, out, opts, default_sink())
    }

    pub fn append_with_sink<P: AsRef<Path>>(
        root: P,
        out:  &mut File,
        opts: EncodeOptions,
        sink: Arc<dyn MessageSink>,
    ) -> CellResult<(u64, InfoBlock)> {
        let offset = out.seek(SeekFrom::End(0))?;
        let mut writer = BufWriter::new(out);
        let info = Encoder::with_sink(opts, sink).encode(root.as_ref(), &mut writer, offset)?;
        writer.flush()?;
        Ok((offset, info))
    }

    // ── Open ──────────────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P) -> CellResult<Self> {
        Self::open_at(path, 0)
    }

    /// Open a cell whose info block starts `offset` bytes into the file.
    pub fn open_at<P: AsRef<Path>>(path: P, offset: u64) -> CellResult<Self> {
        let path = path.as_ref().to_owned();
        let reader = EntryReader::open(BufReader::new(File::open(&path)?), offset)?;
        let info = *reader.info();
        Ok(Self { path, offset, info, sink: default_sink() })
    }

    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = sink;
        self
    }

    // ── Read ──────────────────────────────────────────────────────────────────

    pub fn info(&self) -> &InfoBlock { &self.info }

    /// Every entry's metadata, in stream order.  Payloads are read and
    /// dropped, nothing is inflated.
    pub fn list(&self) -> CellResult<Vec<EntrySummary>> {
        self.entries()?
            .map(|d| d.map(|d| EntrySummary::from(&d)))
            .collect()
    }

    /// Iterate over the decoded entries, payloads included.
    pub fn entries(&self) -> CellResult<EntryReader<BufReader<File>>> {
        EntryReader::open(BufReader::new(File::open(&self.path)?), self.offset)
    }

    /// Extract every entry into `dest`, creating it if necessary.
    pub fn extract_all<P: AsRef<Path>>(&self, dest: P) -> CellResult<DecodeReport> {
        self.extract_with(dest, DecodeOptions::default())
    }

    pub fn extract_with<P: AsRef<Path>>(&self, dest: P, opts: DecodeOptions) -> CellResult<DecodeReport> {
        let file = BufReader::new(File::open(&self.path)?);
        Decoder::with_sink(opts, Arc::clone(&self.sink)).decode(file, self.offset, dest.as_ref())
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path { &self.path }

    pub fn offset(&self) -> u64 { self.offset }
}
