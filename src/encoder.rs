//! Tree-walk encoder.
//!
//! Walks a source path and writes one entry per filesystem object after a
//! placeholder [`InfoBlock`]; once the walk is done the info block is
//! patched with the final count and totals.
//!
//! All walk state lives in the [`Encoder`] call, so independent encodes can
//! run concurrently.  Any I/O failure aborts the encode; the partially
//! written container is left as is.

use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::block::{Entry, EntryKind};
use crate::codec::{CompressError, DeflateCodec, MAX_LEVEL};
use crate::error::{CellError, CellResult};
use crate::info_block::InfoBlock;
use crate::message::{default_sink, MessageSink};

/// Permission bits carried in the Mode property.
pub const MODE_MASK: u32 = 0o7777;

/// Configuration for [`Encoder`].
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// Deflate level, 0–9.
    pub level: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self { level: MAX_LEVEL }
    }
}

pub struct Encoder {
    options: EncodeOptions,
    sink:    Arc<dyn MessageSink>,
}

impl Encoder {
    pub fn new(options: EncodeOptions) -> Self {
        Self::with_sink(options, default_sink())
    }

    pub fn with_sink(options: EncodeOptions, sink: Arc<dyn MessageSink>) -> Self {
        Self { options, sink }
    }

    /// Encode `root` into `out`, with the info block at `offset`.
    ///
    /// On success the stream is left positioned just past the last entry and
    /// the final info block is returned.
    pub fn encode<W: Write + Seek>(&self, root: &Path, out: &mut W, offset: u64) -> CellResult<InfoBlock> {
        let meta = fs::symlink_metadata(root)?;
        let file_type = meta.file_type();
        if !(file_type.is_dir() || file_type.is_file()) {
            self.sink.error(&format!("{}: walk root must be a regular file or directory", root.display()));
            return Err(CellError::UnsupportedRoot(root.to_path_buf()));
        }

        out.seek(SeekFrom::Start(offset))?;
        InfoBlock::default().write(&mut *out)?;

        let mut walk = Walk {
            root,
            canonical_root: fs::canonicalize(root)?,
            codec: DeflateCodec::new(self.options.level),
            sink: self.sink.as_ref(),
            info: InfoBlock::default(),
            hard_links: HashMap::new(),
        };

        if file_type.is_file() {
            let name = root
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| CellError::UnsupportedRoot(root.to_path_buf()))?;
            walk.visit(root, &name, &meta, out)?;
        } else {
            for dirent in WalkDir::new(root).follow_links(false).min_depth(1).sort_by_file_name() {
                let dirent = dirent.map_err(walk_error)?;
                let rel = dirent
                    .path()
                    .strip_prefix(root)
                    .map_err(|_| io::Error::new(io::ErrorKind::Other,
                        format!("{} is outside the walk root", dirent.path().display())))?
                    .to_path_buf();
                let meta = dirent.metadata().map_err(walk_error)?;
                walk.visit(dirent.path(), &rel, &meta, out)?;
            }
        }

        let info = walk.info;
        info.patch(out, offset)?;
        out.flush()?;
        self.sink.info(&format!(
            "packed {} entries ({} bytes in cell, {} bytes original)",
            info.entry_count, info.total_encoded_size, info.total_original_size,
        ));
        Ok(info)
    }
}

/// Encode with default options and a `tracing` sink.
pub fn encode<W: Write + Seek>(root: &Path, out: &mut W, offset: u64) -> CellResult<InfoBlock> {
    Encoder::new(EncodeOptions::default()).encode(root, out, offset)
}

fn walk_error(e: walkdir::Error) -> CellError {
    let msg = e.to_string();
    let io = e
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, msg));
    CellError::Io(io)
}

// ── Walk state ───────────────────────────────────────────────────────────────

struct Walk<'a> {
    root:           &'a Path,
    canonical_root: PathBuf,
    codec:          DeflateCodec,
    sink:           &'a dyn MessageSink,
    info:           InfoBlock,
    /// (device, inode) of multiply-linked files → first relative path seen.
    hard_links:     HashMap<(u64, u64), PathBuf>,
}

impl Walk<'_> {
    fn visit<W: Write>(&mut self, path: &Path, rel: &Path, meta: &Metadata, out: &mut W) -> CellResult<()> {
        let index = self.info.entry_count;
        let entry = match self.build(path, rel, meta) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e.at_entry(index, rel.to_string_lossy())),
        };

        let header = entry.write(&mut *out).map_err(|e| e.at_entry(index, rel.to_string_lossy()))?;
        self.info.entry_count = index.checked_add(1).ok_or_else(|| {
            CellError::Resource("cell cannot hold more than u32::MAX entries".into())
        })?;
        self.info.total_encoded_size += header.encoded_len();
        if entry.kind == EntryKind::Regular {
            self.info.total_original_size += entry.original_size;
        }
        self.sink.debug(&format!(
            "entry #{index}: {} {} ({} -> {} bytes)",
            entry.kind.name(), rel.display(), entry.original_size, entry.encoded_size,
        ));
        Ok(())
    }

    fn build(&mut self, path: &Path, rel: &Path, meta: &Metadata) -> CellResult<Option<Entry>> {
        let ft = meta.file_type();
        let kind = if ft.is_file() {
            EntryKind::Regular
        } else if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_char_device() {
            EntryKind::CharDevice
        } else if ft.is_block_device() {
            EntryKind::BlockDevice
        } else if ft.is_fifo() {
            EntryKind::Fifo
        } else {
            self.sink.warning(&format!("{}: unsupported file type, skipped", path.display()));
            return Ok(None);
        };

        let mut entry = Entry::new(kind, rel);
        entry.mode = meta.mode() & MODE_MASK;
        entry.uid = meta.uid();
        entry.gid = meta.gid();

        match kind {
            EntryKind::Regular => {
                if meta.nlink() > 1 {
                    if let Some(first) = self.hard_links.get(&(meta.dev(), meta.ino())) {
                        entry.kind = EntryKind::HardLink;
                        entry.link_target = Some(first.clone());
                        return Ok(Some(entry));
                    }
                    self.hard_links.insert((meta.dev(), meta.ino()), rel.to_path_buf());
                }
                self.load_payload(path, &mut entry)?;
            }
            EntryKind::Symlink => {
                let target = fs::read_link(path)?;
                entry.link_target = Some(self.rebase_link(target));
            }
            EntryKind::CharDevice | EntryKind::BlockDevice => {
                let (major, minor) = split_device(meta.rdev());
                entry.dev_major = major;
                entry.dev_minor = minor;
            }
            EntryKind::Directory | EntryKind::Fifo | EntryKind::HardLink => {}
        }
        Ok(Some(entry))
    }

    fn load_payload(&self, path: &Path, entry: &mut Entry) -> CellResult<()> {
        let file = File::open(path)?;
        let (compressed, consumed) = self
            .codec
            .compress_reader(BufReader::new(file))
            .map_err(|e| match e {
                CompressError::Source(io) => CellError::Io(io),
                CompressError::Codec(c) => CellError::Codec(c),
            })?;
        entry.original_size = consumed;
        if consumed > 0 {
            entry.encoded_size = compressed.len() as u64;
            entry.payload = Some(compressed);
        }
        Ok(())
    }

    /// Targets under the walked root are stored relative to it; anything
    /// else is kept verbatim.
    fn rebase_link(&self, target: PathBuf) -> PathBuf {
        if !target.is_absolute() {
            return target;
        }
        let rest = target
            .strip_prefix(self.root)
            .or_else(|_| target.strip_prefix(&self.canonical_root));
        match rest {
            Ok(rest) if rest.as_os_str().is_empty() => PathBuf::from("."),
            Ok(rest) => rest.to_path_buf(),
            Err(_) => target,
        }
    }
}

#[allow(unused_unsafe)]
fn split_device(rdev: u64) -> (u32, u32) {
    let dev = rdev as libc::dev_t;
    // SAFETY: pure bit manipulation on the device number.
    unsafe { (libc::major(dev) as u32, libc::minor(dev) as u32) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NullSink;
    use std::io::Cursor;
    use std::os::unix::fs::symlink;

    fn quiet() -> Encoder {
        Encoder::with_sink(EncodeOptions::default(), Arc::new(NullSink))
    }

    #[test]
    fn symlink_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        symlink(dir.path(), &link).unwrap();
        let err = quiet().encode(&link, &mut Cursor::new(Vec::new()), 0).unwrap_err();
        assert!(matches!(err, CellError::UnsupportedRoot(_)));
    }

    #[test]
    fn single_file_root_is_named_after_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("solo.txt");
        fs::write(&file, b"hello hello hello").unwrap();
        let mut out = Cursor::new(Vec::new());
        let info = quiet().encode(&file, &mut out, 0).unwrap();
        assert_eq!(info.entry_count, 1);
        assert_eq!(info.total_original_size, 17);
        assert_eq!(out.position(), out.get_ref().len() as u64);
        assert_eq!(info.total_encoded_size + 20, out.get_ref().len() as u64);
    }

    #[test]
    fn absolute_links_into_the_root_are_rebased() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let walk = Walk {
            root,
            canonical_root: fs::canonicalize(root).unwrap(),
            codec: DeflateCodec::default(),
            sink: &NullSink,
            info: InfoBlock::default(),
            hard_links: HashMap::new(),
        };
        assert_eq!(walk.rebase_link(root.join("a/b")), PathBuf::from("a/b"));
        assert_eq!(walk.rebase_link(root.to_path_buf()), PathBuf::from("."));
        assert_eq!(walk.rebase_link(PathBuf::from("../x")), PathBuf::from("../x"));
        assert_eq!(walk.rebase_link(PathBuf::from("/etc/hosts")), PathBuf::from("/etc/hosts"));

        // Component-wise: a sibling sharing the root's name prefix stays verbatim.
        let mut sibling = root.as_os_str().to_owned();
        sibling.push("x/file");
        assert_eq!(walk.rebase_link(PathBuf::from(&sibling)), PathBuf::from(sibling));
    }

    #[test]
    fn device_numbers_split() {
        #[allow(unused_unsafe)]
        let dev = unsafe { libc::makedev(8, 17) };
        assert_eq!(split_device(dev as u64), (8, 17));
    }
}
