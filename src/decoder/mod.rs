//! Extraction pipeline.
//!
//! One decode thread parses entries in stream order and pushes them into a
//! [`BoundedQueue`]; one or more materializer threads pop entries and
//! recreate them under the destination directory.
//!
//! Failure handling:
//! - a parse error closes the queue, so every entry already queued is still
//!   materialized before the error is reported;
//! - a materializer error cancels the queue and stops everyone promptly;
//! - the first error recorded is the one returned.
//!
//! Directory modes and hard links are applied after all threads have
//! joined, since both depend on entries other threads may still be writing.

mod materialize;
mod reader;

pub use reader::{DecodedEntry, EntryReader, SlotStatus};

use std::fs;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use serde::Serialize;

use crate::error::{CellError, CellResult};
use crate::info_block::InfoBlock;
use crate::message::{default_sink, MessageSink};
use crate::queue::{BoundedQueue, CancellationToken};

use materialize::{Deferred, Materializer};

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Configuration for [`Decoder`].
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Entries buffered between the decode thread and the materializers.
    pub queue_capacity:     usize,
    /// Number of materializer threads; at least one is always started.
    pub materializers:      usize,
    /// Restore recorded uid/gid.  Defaults to on when running as root.
    pub preserve_ownership: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            queue_capacity:     DEFAULT_QUEUE_CAPACITY,
            materializers:      1,
            // SAFETY: geteuid has no preconditions and cannot fail.
            preserve_ownership: unsafe { libc::geteuid() } == 0,
        }
    }
}

/// Summary of a finished extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeReport {
    pub info:                 InfoBlock,
    pub entries_decoded:      u32,
    pub entries_materialized: u32,
    /// Decompressed bytes written to regular files.
    pub bytes_written:        u64,
    /// Most entries ever waiting in the queue at once.
    pub queue_peak:           usize,
}

pub struct Decoder {
    options: DecodeOptions,
    sink:    Arc<dyn MessageSink>,
    token:   CancellationToken,
}

impl Decoder {
    pub fn new(options: DecodeOptions) -> Self {
        Self::with_sink(options, default_sink())
    }

    pub fn with_sink(options: DecodeOptions, sink: Arc<dyn MessageSink>) -> Self {
        Self { options, sink, token: CancellationToken::new() }
    }

    /// Use `token` to stop a running [`Decoder::decode`] from another thread.
    ///
    /// Each run cancels only its own child of `token` on failure, so the
    /// decoder stays usable afterwards.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn options(&self) -> &DecodeOptions { &self.options }

    /// Extract the cell whose info block sits at `offset` into `dest`.
    pub fn decode<R: Read + Seek + Send>(&self, reader: R, offset: u64, dest: &Path) -> CellResult<DecodeReport> {
        let mut entries = EntryReader::open(reader, offset)?;
        let info = *entries.info();
        fs::create_dir_all(dest).map_err(|e| CellError::os(dest, e))?;
        self.sink.info(&format!("unpacking {} entries into {}", info.entry_count, dest.display()));

        let queue = BoundedQueue::new(self.options.queue_capacity, self.token.child());
        let state = Shared::default();
        let sink = self.sink.as_ref();
        let workers = self.options.materializers.max(1);

        let decoded = thread::scope(|s| {
            let decode_thread = s.spawn(|| {
                let _close = CloseOnDrop(&queue);
                match reader::run_reader(&mut entries, &queue, sink) {
                    Ok(n) => n,
                    Err(e) => {
                        state.fail(e);
                        entries.decoded()
                    }
                }
            });

            let handles: Vec<_> = (0..workers)
                .map(|_| s.spawn(|| self.run_materializer(dest, &queue, &state)))
                .collect();

            for handle in handles {
                if handle.join().is_err() {
                    queue.cancel();
                    state.fail(CellError::Resource("materializer thread panicked".into()));
                }
            }
            match decode_thread.join() {
                Ok(n) => n,
                Err(_) => {
                    state.fail(CellError::Resource("decode thread panicked".into()));
                    0
                }
            }
        });

        let queue_peak = queue.peak();
        let mut state = state.into_inner();
        if !matches!(state.error, Some(CellError::Cancelled)) {
            self.finish(dest, &mut state);
        }

        if let Some(e) = state.error {
            self.sink.error(&e.to_string());
            return Err(e);
        }
        let report = DecodeReport {
            info,
            entries_decoded:      decoded,
            entries_materialized: state.materialized,
            bytes_written:        state.bytes_written,
            queue_peak,
        };
        self.sink.info(&format!(
            "unpacked {} entries ({} bytes written)",
            report.entries_materialized, report.bytes_written,
        ));
        Ok(report)
    }

    fn run_materializer(&self, dest: &Path, queue: &BoundedQueue<DecodedEntry>, state: &Shared) {
        let materializer = Materializer::new(dest, &self.options, self.sink.as_ref());
        loop {
            let item = match queue.pop() {
                Ok(Some(item)) => item,
                Ok(None) => return,
                Err(_) => {
                    state.fail(CellError::Cancelled);
                    return;
                }
            };
            match materializer.materialize(&item) {
                Ok(done) => {
                    state.materialized.fetch_add(1, Ordering::SeqCst);
                    state.bytes_written.fetch_add(done.bytes_written, Ordering::SeqCst);
                    if let Some(deferred) = done.deferred {
                        state.defer(item.index, deferred);
                    }
                }
                Err(e) => {
                    let e = e.at_entry(item.index, item.entry.path.to_string_lossy());
                    self.sink.error(&format!("writer: {e}"));
                    state.fail(e);
                    queue.cancel();
                    return;
                }
            }
        }
    }

    /// Links in stream order, then directory modes deepest first.
    fn finish(&self, dest: &Path, state: &mut Finished) {
        state.deferred.sort_by_key(|(index, _)| *index);
        for (index, deferred) in &state.deferred {
            let (link, made) = match deferred {
                Deferred::Symlink { link, target, uid, gid } => {
                    let made = materialize::make_symlink(dest, link, target).and_then(|path| {
                        if self.options.preserve_ownership {
                            materialize::set_owner(&path, *uid, *gid)?;
                        }
                        Ok(())
                    });
                    (link, made)
                }
                Deferred::HardLink { link, original } => {
                    (link, materialize::make_hard_link(dest, link, original))
                }
                Deferred::DirMode { .. } => continue,
            };
            if let Err(e) = made {
                let e = e.at_entry(*index, link.to_string_lossy());
                self.sink.error(&format!("writer: {e}"));
                state.error.get_or_insert(e);
                break;
            }
        }

        let mut dirs: Vec<(&PathBuf, u32)> = state
            .deferred
            .iter()
            .filter_map(|(_, d)| match d {
                Deferred::DirMode { path, mode } => Some((path, *mode)),
                Deferred::Symlink { .. } | Deferred::HardLink { .. } => None,
            })
            .collect();
        dirs.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, mode) in dirs {
            if let Err(e) = materialize::apply_dir_mode(dest, path, mode) {
                self.sink.warning(&format!("{e}"));
                state.error.get_or_insert(e);
            }
        }
    }
}

/// Extract with default options and a `tracing` sink.
pub fn decode<R: Read + Seek + Send>(reader: R, offset: u64, dest: &Path) -> CellResult<DecodeReport> {
    Decoder::new(DecodeOptions::default()).decode(reader, offset, dest)
}

// ── Shared pipeline state ────────────────────────────────────────────────────

#[derive(Default)]
struct Shared {
    error:         Mutex<Option<CellError>>,
    deferred:      Mutex<Vec<(u32, Deferred)>>,
    materialized:  AtomicU32,
    bytes_written: AtomicU64,
}

struct Finished {
    error:         Option<CellError>,
    deferred:      Vec<(u32, Deferred)>,
    materialized:  u32,
    bytes_written: u64,
}

impl Shared {
    /// Record `e` unless an earlier error is already stored.
    fn fail(&self, e: CellError) {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(e);
    }

    fn defer(&self, index: u32, deferred: Deferred) {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((index, deferred));
    }

    fn into_inner(self) -> Finished {
        Finished {
            error:         self.error.into_inner().unwrap_or_else(PoisonError::into_inner),
            deferred:      self.deferred.into_inner().unwrap_or_else(PoisonError::into_inner),
            materialized:  self.materialized.into_inner(),
            bytes_written: self.bytes_written.into_inner(),
        }
    }
}

/// Closes the queue when the decode thread exits, including by panic.
struct CloseOnDrop<'a, T>(&'a BoundedQueue<T>);

impl<T> Drop for CloseOnDrop<'_, T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Entry, EntryKind};
    use crate::encoder::{EncodeOptions, Encoder};
    use crate::error::FormatError;
    use crate::message::NullSink;
    use std::io::Cursor;

    fn quiet_decoder(materializers: usize) -> Decoder {
        let options = DecodeOptions { materializers, preserve_ownership: false, ..DecodeOptions::default() };
        Decoder::with_sink(options, Arc::new(NullSink))
    }

    fn pack(root: &Path) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        Encoder::with_sink(EncodeOptions::default(), Arc::new(NullSink))
            .encode(root, &mut out, 0)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn empty_cell_extracts_nothing() {
        let mut bytes = Vec::new();
        InfoBlock::default().write(&mut bytes).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let report = quiet_decoder(1).decode(Cursor::new(bytes), 0, dest.path()).unwrap();
        assert_eq!(report.entries_decoded, 0);
        assert_eq!(report.entries_materialized, 0);
    }

    #[test]
    fn directory_modes_are_applied_last() {
        use std::os::unix::fs::PermissionsExt;
        let src = tempfile::tempdir().unwrap();
        let locked = src.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("inside"), b"data data data").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
        let bytes = pack(src.path());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let report = quiet_decoder(1).decode(Cursor::new(bytes), 0, dest.path()).unwrap();
        assert_eq!(report.entries_materialized, 2);
        let out = dest.path().join("locked");
        assert_eq!(fs::read(out.join("inside")).unwrap(), b"data data data");
        assert_eq!(fs::metadata(&out).unwrap().permissions().mode() & 0o7777, 0o555);
        fs::set_permissions(&out, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn pre_cancelled_token_stops_extraction() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), b"x").unwrap();
        let bytes = pack(src.path());

        let token = CancellationToken::new();
        token.cancel();
        let dest = tempfile::tempdir().unwrap();
        let err = quiet_decoder(2)
            .with_cancellation(token)
            .decode(Cursor::new(bytes), 0, dest.path())
            .unwrap_err();
        assert!(matches!(err, CellError::Cancelled));
    }

    fn cell_of(entries: &[Entry]) -> Vec<u8> {
        let mut body = Vec::new();
        let mut info = InfoBlock::default();
        for entry in entries {
            let header = entry.write(&mut body).unwrap();
            info.entry_count += 1;
            info.total_encoded_size += header.encoded_len();
        }
        let mut bytes = Vec::new();
        info.write(&mut bytes).unwrap();
        bytes.extend(body);
        bytes
    }

    #[test]
    fn decoder_is_reusable_after_a_failed_run() {
        let mut bad = Entry::new(EntryKind::Regular, "f");
        bad.mode = 0o644;
        bad.original_size = 99;
        let payload = crate::codec::DeflateCodec::default().compress(b"four").unwrap();
        bad.encoded_size = payload.len() as u64;
        bad.payload = Some(payload);
        let bad = cell_of(&[bad]);

        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("good"), b"fine").unwrap();
        let good = pack(src.path());

        let decoder = quiet_decoder(2);
        let dest = tempfile::tempdir().unwrap();
        let err = decoder.decode(Cursor::new(bad), 0, dest.path()).unwrap_err();
        assert!(matches!(err.format_error(), Some(FormatError::SizeMismatch { expected: 99, actual: 4 })));

        let report = decoder.decode(Cursor::new(good), 0, dest.path()).unwrap();
        assert_eq!(report.entries_materialized, 1);
        assert_eq!(fs::read(dest.path().join("good")).unwrap(), b"fine");
    }

    #[test]
    fn external_token_still_reaches_later_runs() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), b"x").unwrap();
        let bytes = pack(src.path());

        let token = CancellationToken::new();
        let decoder = quiet_decoder(1).with_cancellation(token.clone());
        decoder.decode(Cursor::new(bytes.clone()), 0, tempfile::tempdir().unwrap().path()).unwrap();
        token.cancel();
        let err = decoder.decode(Cursor::new(bytes), 0, tempfile::tempdir().unwrap().path()).unwrap_err();
        assert!(matches!(err, CellError::Cancelled));
    }

    #[test]
    fn link_under_a_symlinked_directory_is_refused() {
        let outside = tempfile::tempdir().unwrap();
        let mut escape = Entry::new(EntryKind::Symlink, "a");
        escape.mode = 0o777;
        escape.link_target = Some(outside.path().to_path_buf());
        let mut nested = Entry::new(EntryKind::Symlink, "a/inner");
        nested.mode = 0o777;
        nested.link_target = Some(PathBuf::from("anything"));
        let bytes = cell_of(&[escape, nested]);

        let dest = tempfile::tempdir().unwrap();
        let err = quiet_decoder(1).decode(Cursor::new(bytes), 0, dest.path()).unwrap_err();
        assert_eq!(err.entry_index(), Some(1));
        assert!(matches!(err.format_error(), Some(FormatError::UnsafePath(_))));
        assert_eq!(fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[test]
    fn truncated_info_block_is_an_io_error() {
        let dest = tempfile::tempdir().unwrap();
        let err = quiet_decoder(1).decode(Cursor::new(vec![1u8, 0, 0]), 0, dest.path()).unwrap_err();
        assert!(matches!(err, CellError::Io(_)));
    }
}
