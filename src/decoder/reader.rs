//! Sequential entry parsing and the decode thread body.

use std::io::{Read, Seek, SeekFrom};

use crate::block::{Entry, EntryHeader, EntryKind};
use crate::error::{CellError, CellResult};
use crate::info_block::InfoBlock;
use crate::message::MessageSink;
use crate::property::read_properties;
use crate::queue::BoundedQueue;

/// What a queue slot carries besides the entry metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Regular file with a compressed payload.
    HasPayload,
    /// Regular file of length zero; nothing to inflate.
    EmptyFile,
    /// Any other kind.
    Metadata,
}

/// One decoded entry, owned by the queue until a materializer takes it.
#[derive(Debug, Clone)]
pub struct DecodedEntry {
    /// Position in the stream, starting at 0.
    pub index:  u32,
    pub header: EntryHeader,
    pub entry:  Entry,
    pub status: SlotStatus,
}

/// Reads the info block, then hands out entries one at a time.
///
/// Stops for good after the first error: the stream is never resynchronised.
pub struct EntryReader<R> {
    reader: R,
    info:   InfoBlock,
    next:   u32,
    failed: bool,
}

impl<R: Read + Seek> EntryReader<R> {
    /// Position `reader` at `offset` and read the info block there.
    pub fn open(mut reader: R, offset: u64) -> CellResult<Self> {
        reader.seek(SeekFrom::Start(offset))?;
        let info = InfoBlock::read(&mut reader)?;
        Ok(Self { reader, info, next: 0, failed: false })
    }
}

impl<R: Read> EntryReader<R> {
    pub fn info(&self) -> &InfoBlock { &self.info }

    /// Entries parsed successfully so far.
    pub fn decoded(&self) -> u32 { self.next }

    /// Entries still to be read.
    pub fn remaining(&self) -> u32 {
        if self.failed { 0 } else { self.info.entry_count - self.next }
    }

    /// Next entry, or `Ok(None)` once `entry_count` entries have been read.
    pub fn next_entry(&mut self) -> CellResult<Option<DecodedEntry>> {
        if self.failed || self.next >= self.info.entry_count {
            return Ok(None);
        }
        let index = self.next;
        match self.read_entry(index) {
            Ok(decoded) => {
                self.next += 1;
                Ok(Some(decoded))
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn read_entry(&mut self, index: u32) -> CellResult<DecodedEntry> {
        let header = EntryHeader::read(&mut self.reader).map_err(|e| e.at_entry(index, "?"))?;
        let props = read_properties(&mut self.reader, header.block_len)
            .map_err(|e| e.at_entry(index, "?"))?;
        let path_hint = props
            .path_name
            .as_deref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_else(|| "?".into());
        let mut entry = Entry::from_properties(props, &header)
            .map_err(|e| CellError::from(e).at_entry(index, path_hint.as_str()))?;

        let status = if header.data_len > 0 {
            let payload = self
                .read_payload(header.data_len)
                .map_err(|e| e.at_entry(index, path_hint.as_str()))?;
            entry.payload = Some(payload);
            SlotStatus::HasPayload
        } else if entry.kind == EntryKind::Regular {
            SlotStatus::EmptyFile
        } else {
            SlotStatus::Metadata
        };
        Ok(DecodedEntry { index, header, entry, status })
    }

    fn read_payload(&mut self, data_len: u64) -> CellResult<Vec<u8>> {
        let len = usize::try_from(data_len)
            .map_err(|_| CellError::Resource(format!("payload of {data_len} bytes")))?;
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(len)
            .map_err(|e| CellError::Resource(format!("payload of {data_len} bytes: {e}")))?;
        payload.resize(len, 0);
        self.reader.read_exact(&mut payload)?;
        Ok(payload)
    }
}

impl<R: Read> Iterator for EntryReader<R> {
    type Item = CellResult<DecodedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// Decode thread body: parse entries and push them into `queue` until the
/// stream ends, an error occurs or the pipeline is cancelled.
///
/// Returns the number of entries pushed.  The caller closes the queue.
pub(crate) fn run_reader<R: Read>(
    entries: &mut EntryReader<R>,
    queue:   &BoundedQueue<DecodedEntry>,
    sink:    &dyn MessageSink,
) -> CellResult<u32> {
    let mut pushed = 0u32;
    loop {
        if queue.is_cancelled() {
            return Err(CellError::Cancelled);
        }
        match entries.next_entry() {
            Ok(Some(decoded)) => {
                queue.push(decoded).map_err(|_| CellError::Cancelled)?;
                pushed += 1;
            }
            Ok(None) => return Ok(pushed),
            Err(e) => {
                sink.error(&format!("reader: {e}"));
                return Err(e);
            }
        }
    }
}
