//! Entries ("blocks") and their on-disk framing.
//!
//! ```text
//! +-------------+------------+-----------+------------------+-----------+
//! | marker u16  | blklen u32 | datlen u64| property records | payload   |
//! |   0x1DF0    |            |           |  (blklen bytes)  | (datlen)  |
//! +-------------+------------+-----------+------------------+-----------+
//! ```
//!
//! Integers are little-endian.  The payload exists only for non-empty
//! regular files and holds the zlib stream of the file content.

use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::error::{CellError, CellResult, FormatError};
use crate::property::{Properties, PropertyWriter, Tag};

pub const BEGIN_MARKER:     u16 = 0x1DF0;
/// Marker + block length + data length.
pub const ENTRY_HEADER_LEN: u64 = 2 + 4 + 8;

// ── Kinds ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u16)]
pub enum EntryKind {
    Regular     = 0x200B,
    HardLink    = 0x200C,
    Symlink     = 0x200D,
    CharDevice  = 0x200E,
    BlockDevice = 0x201A,
    Directory   = 0x201F,
    Fifo        = 0x202C,
}

impl EntryKind {
    pub fn from_u16(raw: u16) -> Result<Self, FormatError> {
        match raw {
            0x200B => Ok(EntryKind::Regular),
            0x200C => Ok(EntryKind::HardLink),
            0x200D => Ok(EntryKind::Symlink),
            0x200E => Ok(EntryKind::CharDevice),
            0x201A => Ok(EntryKind::BlockDevice),
            0x201F => Ok(EntryKind::Directory),
            0x202C => Ok(EntryKind::Fifo),
            other  => Err(FormatError::UnknownKind(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntryKind::Regular     => "regular",
            EntryKind::HardLink    => "hardlink",
            EntryKind::Symlink     => "symlink",
            EntryKind::CharDevice  => "chardev",
            EntryKind::BlockDevice => "blockdev",
            EntryKind::Directory   => "directory",
            EntryKind::Fifo        => "fifo",
        }
    }

    pub fn is_link(self) -> bool {
        matches!(self, EntryKind::Symlink | EntryKind::HardLink)
    }

    pub fn is_device(self) -> bool {
        matches!(self, EntryKind::CharDevice | EntryKind::BlockDevice)
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub block_len: u32,
    pub data_len:  u64,
}

impl EntryHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(BEGIN_MARKER)?;
        writer.write_u32::<LittleEndian>(self.block_len)?;
        writer.write_u64::<LittleEndian>(self.data_len)?;
        Ok(())
    }

    /// Read and validate the begin marker, then the two lengths.
    pub fn read<R: Read>(mut reader: R) -> CellResult<Self> {
        let marker = reader.read_u16::<LittleEndian>()?;
        if marker != BEGIN_MARKER {
            return Err(FormatError::BadMarker { found: marker, expected: BEGIN_MARKER }.into());
        }
        Ok(Self {
            block_len: reader.read_u32::<LittleEndian>()?,
            data_len:  reader.read_u64::<LittleEndian>()?,
        })
    }

    /// Bytes this entry occupies on disk.
    pub fn encoded_len(&self) -> u64 {
        ENTRY_HEADER_LEN + u64::from(self.block_len) + self.data_len
    }
}

// ── Entry ────────────────────────────────────────────────────────────────────

/// One filesystem object as stored in a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind:          EntryKind,
    /// Always relative to the walked root.
    pub path:          PathBuf,
    pub link_target:   Option<PathBuf>,
    pub mode:          u32,
    pub uid:           u32,
    pub gid:           u32,
    pub dev_major:     u32,
    pub dev_minor:     u32,
    /// Compressed payload length.
    pub encoded_size:  u64,
    pub original_size: u64,
    pub payload:       Option<Vec<u8>>,
}

impl Entry {
    pub fn new(kind: EntryKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path:          path.into(),
            link_target:   None,
            mode:          0,
            uid:           0,
            gid:           0,
            dev_major:     0,
            dev_minor:     0,
            encoded_size:  0,
            original_size: 0,
            payload:       None,
        }
    }

    /// Property records for this entry, in the per-kind set the format defines.
    pub fn properties(&self) -> CellResult<PropertyWriter> {
        let mut w = PropertyWriter::new();
        w.put_u16(Tag::Type, self.kind as u16);
        match self.kind {
            EntryKind::Regular => {
                w.put_u64(Tag::SizeInCell, self.encoded_size)
                    .put_u64(Tag::SizeOriginal, self.original_size);
                w.put_name(Tag::PathName, self.path.as_os_str().as_bytes())?;
            }
            EntryKind::Directory => {
                w.put_u64(Tag::SizeOriginal, 0);
                w.put_name(Tag::PathName, self.path.as_os_str().as_bytes())?;
            }
            EntryKind::Symlink | EntryKind::HardLink => {
                let target = self.link_target.as_deref().unwrap_or_else(|| Path::new(""));
                w.put_name(Tag::PathName, self.path.as_os_str().as_bytes())?;
                w.put_name(Tag::LinkName, target.as_os_str().as_bytes())?;
            }
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo => {
                w.put_name(Tag::PathName, self.path.as_os_str().as_bytes())?;
            }
        }
        w.put_u32(Tag::Mode, self.mode)
            .put_u32(Tag::Uid, self.uid)
            .put_u32(Tag::Gid, self.gid);
        if self.kind.is_device() {
            w.put_u32(Tag::DeviceMajor, self.dev_major)
                .put_u32(Tag::DeviceMinor, self.dev_minor);
        }
        Ok(w)
    }

    /// Write header, properties and payload.  Returns the header written.
    pub fn write<W: Write>(&self, mut writer: W) -> CellResult<EntryHeader> {
        let props = self.properties()?;
        let block_len = u32::try_from(props.len())
            .map_err(|_| CellError::Resource(format!("property block of {} bytes", props.len())))?;
        let payload = self.payload.as_deref().unwrap_or(&[]);
        let header = EntryHeader { block_len, data_len: payload.len() as u64 };
        header.write(&mut writer)?;
        writer.write_all(props.as_bytes())?;
        writer.write_all(payload)?;
        Ok(header)
    }

    /// Build an entry from decoded properties, validating what the materializer
    /// relies on.  The payload is attached separately by the caller.
    pub fn from_properties(props: Properties, header: &EntryHeader) -> Result<Self, FormatError> {
        let kind = EntryKind::from_u16(props.kind.ok_or(FormatError::MissingProperty("Type"))?)?;
        let path = props.path_name.ok_or(FormatError::MissingProperty("PathName"))?;
        let path = safe_relative(&path)?;

        if kind != EntryKind::Regular && header.data_len > 0 {
            return Err(FormatError::UnexpectedPayload { kind: kind.name(), data_len: header.data_len });
        }

        let mut entry = Entry::new(kind, path);
        entry.mode = props.mode.ok_or(FormatError::MissingProperty("Mode"))?;
        entry.uid  = props.uid.ok_or(FormatError::MissingProperty("Uid"))?;
        entry.gid  = props.gid.ok_or(FormatError::MissingProperty("Gid"))?;

        match kind {
            EntryKind::Regular => {
                if let Some(size_in_cell) = props.size_in_cell {
                    if size_in_cell != header.data_len {
                        return Err(FormatError::DataLengthMismatch {
                            size_in_cell,
                            data_len: header.data_len,
                        });
                    }
                }
                entry.encoded_size  = header.data_len;
                entry.original_size = props.size_original
                    .ok_or(FormatError::MissingProperty("SizeOriginal"))?;
                if header.data_len == 0 && entry.original_size != 0 {
                    return Err(FormatError::SizeMismatch { expected: entry.original_size, actual: 0 });
                }
            }
            EntryKind::Symlink => {
                let target = props.link_name.ok_or(FormatError::MissingProperty("LinkName"))?;
                if target.is_empty() {
                    return Err(FormatError::UnsafePath(String::new()));
                }
                entry.link_target = Some(PathBuf::from(OsStr::from_bytes(&target)));
            }
            EntryKind::HardLink => {
                let target = props.link_name.ok_or(FormatError::MissingProperty("LinkName"))?;
                entry.link_target = Some(safe_relative(&target)?);
            }
            EntryKind::CharDevice | EntryKind::BlockDevice => {
                entry.dev_major = props.dev_major.ok_or(FormatError::MissingProperty("DeviceMajor"))?;
                entry.dev_minor = props.dev_minor.ok_or(FormatError::MissingProperty("DeviceMinor"))?;
            }
            EntryKind::Directory | EntryKind::Fifo => {}
        }
        Ok(entry)
    }
}

/// Accept only non-empty paths that stay below the destination root.
fn safe_relative(raw: &[u8]) -> Result<PathBuf, FormatError> {
    let path = Path::new(OsStr::from_bytes(raw));
    let unsafe_path = || FormatError::UnsafePath(path.to_string_lossy().into_owned());
    let mut normal = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path());
            }
        }
    }
    if normal == 0 {
        return Err(unsafe_path());
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::read_properties;
    use std::io::{Cursor, Read};

    fn roundtrip(entry: &Entry) -> Entry {
        let mut buf = Vec::new();
        entry.write(&mut buf).unwrap();
        let mut cur = Cursor::new(&buf);
        let header = EntryHeader::read(&mut cur).unwrap();
        let props = read_properties(&mut cur, header.block_len).unwrap();
        let mut decoded = Entry::from_properties(props, &header).unwrap();
        if header.data_len > 0 {
            let mut payload = vec![0u8; header.data_len as usize];
            cur.read_exact(&mut payload).unwrap();
            decoded.payload = Some(payload);
        }
        assert_eq!(cur.position() as usize, buf.len());
        decoded
    }

    #[test]
    fn header_is_fourteen_bytes() {
        let mut buf = Vec::new();
        EntryHeader { block_len: 1, data_len: 2 }.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, ENTRY_HEADER_LEN);
        assert_eq!(&buf[..2], &[0xF0, 0x1D]);
    }

    #[test]
    fn bad_marker_is_reported() {
        let buf = [0xEF, 0xBE, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let err = EntryHeader::read(&buf[..]).unwrap_err();
        assert_eq!(
            err.format_error(),
            Some(&FormatError::BadMarker { found: 0xBEEF, expected: BEGIN_MARKER })
        );
    }

    #[test]
    fn device_entry_keeps_its_numbers() {
        let mut dev = Entry::new(EntryKind::CharDevice, "dev/null");
        dev.mode = 0o666;
        dev.dev_major = 1;
        dev.dev_minor = 3;
        assert_eq!(roundtrip(&dev), dev);
    }

    #[test]
    fn regular_entry_with_payload() {
        let mut file = Entry::new(EntryKind::Regular, "bin/tool");
        file.mode = 0o755;
        file.uid = 1000;
        file.gid = 1000;
        file.payload = Some(vec![1, 2, 3, 4]);
        file.encoded_size = 4;
        file.original_size = 10;
        assert_eq!(roundtrip(&file), file);
    }

    #[test]
    fn symlink_target_is_kept_verbatim() {
        let mut link = Entry::new(EntryKind::Symlink, "d/link");
        link.mode = 0o777;
        link.link_target = Some(PathBuf::from("../a"));
        assert_eq!(roundtrip(&link).link_target, Some(PathBuf::from("../a")));
    }

    #[test]
    fn escaping_paths_are_rejected() {
        for bad in ["", "/etc/passwd", "../up", "a/../../b", "."] {
            assert!(safe_relative(bad.as_bytes()).is_err(), "{bad:?} accepted");
        }
        assert_eq!(safe_relative(b"./a/b").unwrap(), PathBuf::from("./a/b"));
    }

    #[test]
    fn payload_on_directory_is_rejected() {
        let dir = Entry::new(EntryKind::Directory, "d");
        let props = dir.properties().unwrap();
        let header = EntryHeader { block_len: props.len() as u32, data_len: 3 };
        let decoded = read_properties(&mut Cursor::new(props.as_bytes()), header.block_len).unwrap();
        let err = Entry::from_properties(decoded, &header).unwrap_err();
        assert!(matches!(err, FormatError::UnexpectedPayload { .. }));
    }

    #[test]
    fn size_in_cell_must_match_data_length() {
        let mut file = Entry::new(EntryKind::Regular, "f");
        file.encoded_size = 9;
        file.original_size = 20;
        let props = file.properties().unwrap();
        let header = EntryHeader { block_len: props.len() as u32, data_len: 8 };
        let decoded = read_properties(&mut Cursor::new(props.as_bytes()), header.block_len).unwrap();
        let err = Entry::from_properties(decoded, &header).unwrap_err();
        assert_eq!(err, FormatError::DataLengthMismatch { size_in_cell: 9, data_len: 8 });
    }
}
