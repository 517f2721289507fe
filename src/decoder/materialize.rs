//! Recreate filesystem objects from decoded entries.

use std::ffi::CString;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{lchown, symlink, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::block::{Entry, EntryKind};
use crate::codec::{DeflateCodec, INFLATE_CHUNK};
use crate::error::{CellError, CellResult, FormatError};
use crate::message::MessageSink;

use super::reader::{DecodedEntry, SlotStatus};
use super::DecodeOptions;

/// Owner bits a directory keeps until its recorded mode is applied.
const DIR_WORKING_BITS: u32 = 0o700;

/// Work that has to wait until every materializer has finished.
///
/// Links are never created while materializers run, so no thread can be
/// redirected through a link another thread has just made.  Link paths are
/// relative to the destination root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Deferred {
    /// Final mode of a directory created with owner access.
    DirMode { path: PathBuf, mode: u32 },
    Symlink { link: PathBuf, target: PathBuf, uid: u32, gid: u32 },
    /// Hard link whose original may still be in flight on another thread.
    HardLink { link: PathBuf, original: PathBuf },
}

/// Outcome of materializing one entry.
#[derive(Debug, Default)]
pub(crate) struct Materialized {
    pub bytes_written: u64,
    pub deferred:      Option<Deferred>,
}

pub(crate) struct Materializer<'a> {
    dest:    &'a Path,
    options: &'a DecodeOptions,
    sink:    &'a dyn MessageSink,
    codec:   DeflateCodec,
}

impl<'a> Materializer<'a> {
    pub fn new(dest: &'a Path, options: &'a DecodeOptions, sink: &'a dyn MessageSink) -> Self {
        Self { dest, options, sink, codec: DeflateCodec::default() }
    }

    pub fn materialize(&self, item: &DecodedEntry) -> CellResult<Materialized> {
        let entry = &item.entry;
        self.sink.debug(&format!("writer: #{} {} {}", item.index, entry.kind.name(), entry.path.display()));

        let mut done = Materialized::default();
        match entry.kind {
            EntryKind::Symlink => {
                let target = entry.link_target.clone().unwrap_or_else(|| PathBuf::from("."));
                done.deferred = Some(Deferred::Symlink {
                    link: entry.path.clone(),
                    target,
                    uid: entry.uid,
                    gid: entry.gid,
                });
                return Ok(done);
            }
            EntryKind::HardLink => {
                let original = entry
                    .link_target
                    .clone()
                    .ok_or(FormatError::MissingProperty("LinkName"))?;
                // Shares the original's inode: mode and owner come with it.
                done.deferred = Some(Deferred::HardLink { link: entry.path.clone(), original });
                return Ok(done);
            }
            _ => {}
        }

        let target = prepare_parent(self.dest, &entry.path)?;
        // Mode is applied after chown, which clears setuid/setgid bits.
        let final_mode = match entry.kind {
            EntryKind::Directory => {
                create_directory(&target, entry.mode)?;
                done.deferred = Some(Deferred::DirMode { path: entry.path.clone(), mode: entry.mode });
                None
            }
            EntryKind::Regular => {
                remove_existing(&target)?;
                done.bytes_written = self.write_regular(&target, entry, item.status)?;
                Some(entry.mode)
            }
            EntryKind::CharDevice | EntryKind::BlockDevice => {
                remove_existing(&target)?;
                make_device(&target, entry)?;
                Some(entry.mode)
            }
            EntryKind::Fifo => {
                remove_existing(&target)?;
                make_fifo(&target, entry.mode)?;
                Some(entry.mode)
            }
            EntryKind::Symlink | EntryKind::HardLink => None,
        };

        if self.options.preserve_ownership {
            set_owner(&target, entry.uid, entry.gid)?;
        }
        if let Some(mode) = final_mode {
            set_mode(&target, mode)?;
        }
        Ok(done)
    }

    fn write_regular(&self, target: &Path, entry: &Entry, status: SlotStatus) -> CellResult<u64> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(entry.mode & 0o777)
            .open(target)
            .map_err(|e| CellError::os(target, e))?;

        let written = match (status, entry.payload.as_deref()) {
            (SlotStatus::HasPayload, Some(payload)) => {
                file.set_len(entry.original_size)?;
                let written = self.inflate_into(payload, &mut file, entry.original_size)?;
                if written != entry.original_size {
                    return Err(FormatError::SizeMismatch {
                        expected: entry.original_size,
                        actual:   written,
                    }.into());
                }
                written
            }
            _ => 0,
        };
        file.flush()?;
        Ok(written)
    }

    /// Inflate `payload` into `out`, refusing to write past `expected` bytes.
    fn inflate_into<W: Write>(&self, payload: &[u8], out: &mut W, expected: u64) -> CellResult<u64> {
        let mut inflater = self.codec.inflater(payload);
        let mut buf = vec![0u8; INFLATE_CHUNK];
        let mut written = 0u64;
        loop {
            let n = inflater.read_chunk(&mut buf)?;
            if n == 0 {
                return Ok(written);
            }
            if written + n as u64 > expected {
                return Err(FormatError::SizeMismatch { expected, actual: written + n as u64 }.into());
            }
            out.write_all(&buf[..n])?;
            written += n as u64;
        }
    }
}

/// Make sure every existing ancestor of `rel` below `dest` is a real
/// directory, then create the missing ones.  Returns `dest.join(rel)`.
///
/// A symlinked ancestor would let the entry land outside `dest`.
pub(crate) fn prepare_parent(dest: &Path, rel: &Path) -> CellResult<PathBuf> {
    check_ancestors(dest, rel)?;
    let target = dest.join(rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| CellError::os(parent, e))?;
    }
    Ok(target)
}

fn check_ancestors(dest: &Path, rel: &Path) -> CellResult<()> {
    let Some(parent) = rel.parent() else { return Ok(()) };
    let mut current = dest.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(FormatError::UnsafePath(rel.to_string_lossy().into_owned()).into());
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(CellError::os(&current, e)),
        }
    }
    Ok(())
}

/// Replace whatever sits at `dest/link` with a symlink to `target`.
pub(crate) fn make_symlink(dest: &Path, link: &Path, target: &Path) -> CellResult<PathBuf> {
    let path = prepare_parent(dest, link)?;
    remove_existing(&path)?;
    symlink(target, &path).map_err(|e| CellError::os(&path, e))?;
    Ok(path)
}

pub(crate) fn set_owner(path: &Path, uid: u32, gid: u32) -> CellResult<()> {
    lchown(path, Some(uid), Some(gid)).map_err(|e| CellError::os(path, e))
}

/// Create `path` and any missing parents.  An existing directory is fine;
/// any other object in the way is replaced.
pub(crate) fn create_directory(path: &Path, mode: u32) -> CellResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => remove_existing(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(CellError::os(path, e)),
    }
    fs::create_dir_all(path).map_err(|e| CellError::os(path, e))?;
    set_mode(path, mode | DIR_WORKING_BITS)
}

/// Overwrite semantics: whatever sits at `path` goes first.
fn remove_existing(path: &Path) -> CellResult<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CellError::os(path, e)),
    };
    let removed = if meta.is_dir() { fs::remove_dir_all(path) } else { fs::remove_file(path) };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CellError::os(path, e)),
    }
}

/// Replace whatever sits at `dest/link` with a hard link to `dest/original`.
pub(crate) fn make_hard_link(dest: &Path, link: &Path, original: &Path) -> CellResult<()> {
    check_ancestors(dest, original)?;
    let link = prepare_parent(dest, link)?;
    remove_existing(&link)?;
    fs::hard_link(dest.join(original), &link).map_err(|e| CellError::os(&link, e))
}

/// Apply a directory's recorded mode, unless a later entry has put
/// something else at `dest/rel` or above it.
pub(crate) fn apply_dir_mode(dest: &Path, rel: &Path, mode: u32) -> CellResult<()> {
    if check_ancestors(dest, rel).is_err() {
        return Ok(());
    }
    let path = dest.join(rel);
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => set_mode(&path, mode),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CellError::os(&path, e)),
    }
}

pub(crate) fn set_mode(path: &Path, mode: u32) -> CellResult<()> {
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| CellError::os(path, e))
}

fn c_path(path: &Path) -> CellResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        CellError::os(path, io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
    })
}

#[allow(unused_unsafe)]
fn make_device(path: &Path, entry: &Entry) -> CellResult<()> {
    let c = c_path(path)?;
    let file_type = if entry.kind == EntryKind::CharDevice { libc::S_IFCHR } else { libc::S_IFBLK };
    let mode = file_type | (entry.mode as libc::mode_t);
    // SAFETY: `c` is a valid NUL-terminated path for the duration of the call.
    let rc = unsafe { libc::mknod(c.as_ptr(), mode, libc::makedev(entry.dev_major, entry.dev_minor)) };
    if rc != 0 {
        return Err(CellError::os(path, io::Error::last_os_error()));
    }
    Ok(())
}

fn make_fifo(path: &Path, mode: u32) -> CellResult<()> {
    let c = c_path(path)?;
    // SAFETY: `c` is a valid NUL-terminated path for the duration of the call.
    let rc = unsafe { libc::mkfifo(c.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(CellError::os(path, io::Error::last_os_error()));
    }
    Ok(())
}
