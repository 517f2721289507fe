//! TLV property codec.
//!
//! An entry's metadata is a run of property records:
//!
//! ```text
//! +---------+------------+-----------------+
//! | tag u16 | length u32 | value (length)  |
//! +---------+------------+-----------------+
//! ```
//!
//! All integers are little-endian on disk.  Tags form a closed set; a tag
//! outside [`Tag`] is a fatal [`FormatError::UnknownTag`], the decoder never
//! skips a record it does not understand.
//!
//! Path and link names are stored under a reversible byte transform
//! ([`encode_name`] / [`decode_name`]).  It is a format quirk, not a
//! protection mechanism.

use std::io::Read;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CellError, CellResult, FormatError};

/// Bytes taken by a record's tag and length fields.
pub const RECORD_HEADER_LEN: u64 = 6;

/// Byte mask applied to every name byte after bit reversal.
pub const NAME_MASK: u8 = (0x0A5E_921F_u32 & 0xFF) as u8;

// ── Tags ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Tag {
    Type         = 0x1D0A,
    SizeInCell   = 0x1D1C,
    SizeOriginal = 0x1D1D,
    PathName     = 0x1D2A,
    LinkName     = 0x1D2B,
    Mode         = 0x1D30,
    Uid          = 0x1D41,
    Gid          = 0x1D52,
    DeviceMajor  = 0x1D6A,
    DeviceMinor  = 0x1D6B,
}

impl Tag {
    pub const ALL: [Tag; 10] = [
        Tag::Type, Tag::SizeInCell, Tag::SizeOriginal, Tag::PathName, Tag::LinkName,
        Tag::Mode, Tag::Uid, Tag::Gid, Tag::DeviceMajor, Tag::DeviceMinor,
    ];

    /// Decode table.  Anything not listed is a format error.
    pub fn from_u16(raw: u16) -> Result<Self, FormatError> {
        match raw {
            0x1D0A => Ok(Tag::Type),
            0x1D1C => Ok(Tag::SizeInCell),
            0x1D1D => Ok(Tag::SizeOriginal),
            0x1D2A => Ok(Tag::PathName),
            0x1D2B => Ok(Tag::LinkName),
            0x1D30 => Ok(Tag::Mode),
            0x1D41 => Ok(Tag::Uid),
            0x1D52 => Ok(Tag::Gid),
            0x1D6A => Ok(Tag::DeviceMajor),
            0x1D6B => Ok(Tag::DeviceMinor),
            other  => Err(FormatError::UnknownTag(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::Type         => "Type",
            Tag::SizeInCell   => "SizeInCell",
            Tag::SizeOriginal => "SizeOriginal",
            Tag::PathName     => "PathName",
            Tag::LinkName     => "LinkName",
            Tag::Mode         => "Mode",
            Tag::Uid          => "Uid",
            Tag::Gid          => "Gid",
            Tag::DeviceMajor  => "DeviceMajor",
            Tag::DeviceMinor  => "DeviceMinor",
        }
    }

    fn is_name(self) -> bool {
        matches!(self, Tag::PathName | Tag::LinkName)
    }
}

// ── Name transform ───────────────────────────────────────────────────────────

/// Bit-reverse each byte, then XOR with [`NAME_MASK`].
pub fn encode_name(plain: &[u8]) -> Vec<u8> {
    plain.iter().map(|b| b.reverse_bits() ^ NAME_MASK).collect()
}

/// Inverse of [`encode_name`]: XOR first, then bit-reverse.
pub fn decode_name(stored: &[u8]) -> Vec<u8> {
    stored.iter().map(|b| (b ^ NAME_MASK).reverse_bits()).collect()
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Accumulates the property records of one entry.
#[derive(Debug, Default, Clone)]
pub struct PropertyWriter {
    buf: Vec<u8>,
}

impl PropertyWriter {
    pub fn new() -> Self { Self::default() }

    fn header(&mut self, tag: Tag, len: u32) {
        // Writes into a Vec cannot fail.
        let _ = self.buf.write_u16::<LittleEndian>(tag as u16);
        let _ = self.buf.write_u32::<LittleEndian>(len);
    }

    pub fn put_u16(&mut self, tag: Tag, value: u16) -> &mut Self {
        self.header(tag, 2);
        let _ = self.buf.write_u16::<LittleEndian>(value);
        self
    }

    pub fn put_u32(&mut self, tag: Tag, value: u32) -> &mut Self {
        self.header(tag, 4);
        let _ = self.buf.write_u32::<LittleEndian>(value);
        self
    }

    pub fn put_u64(&mut self, tag: Tag, value: u64) -> &mut Self {
        self.header(tag, 8);
        let _ = self.buf.write_u64::<LittleEndian>(value);
        self
    }

    /// Store a path or link name; the name transform is applied here.
    pub fn put_name(&mut self, tag: Tag, plain: &[u8]) -> CellResult<&mut Self> {
        let len = u32::try_from(plain.len()).map_err(|_| {
            CellError::Resource(format!("{} of {} bytes is too long", tag.name(), plain.len()))
        })?;
        self.header(tag, len);
        self.buf.extend(encode_name(plain));
        Ok(self)
    }

    /// Total encoded size, i.e. the entry's block length.
    pub fn len(&self) -> usize { self.buf.len() }

    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    pub fn as_bytes(&self) -> &[u8] { &self.buf }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// The decoded property set of one entry.  Name fields hold plain bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Properties {
    pub kind:          Option<u16>,
    pub size_in_cell:  Option<u64>,
    pub size_original: Option<u64>,
    pub path_name:     Option<Vec<u8>>,
    pub link_name:     Option<Vec<u8>>,
    pub mode:          Option<u32>,
    pub uid:           Option<u32>,
    pub gid:           Option<u32>,
    pub dev_major:     Option<u32>,
    pub dev_minor:     Option<u32>,
}

/// Read exactly `block_len` bytes of property records from `reader`.
pub fn read_properties<R: Read>(reader: &mut R, block_len: u32) -> CellResult<Properties> {
    let block_len = u64::from(block_len);
    let mut props = Properties::default();
    let mut consumed = 0u64;

    while consumed < block_len {
        let remaining = block_len - consumed;
        if remaining < RECORD_HEADER_LEN {
            return Err(FormatError::PropertyOverrun { len: RECORD_HEADER_LEN, remaining }.into());
        }
        let raw_tag = reader.read_u16::<LittleEndian>()?;
        let len = reader.read_u32::<LittleEndian>()?;
        consumed += RECORD_HEADER_LEN;

        let tag = Tag::from_u16(raw_tag)?;
        if u64::from(len) > block_len - consumed {
            return Err(FormatError::PropertyOverrun {
                len:       u64::from(len),
                remaining: block_len - consumed,
            }.into());
        }
        if !tag.is_name() && !matches!(len, 1 | 2 | 4 | 8) {
            return Err(FormatError::BadPropertyLength { tag: raw_tag, len }.into());
        }

        let value = read_value(reader, len)?;
        consumed += u64::from(len);
        dispatch(&mut props, tag, &value)?;
    }
    Ok(props)
}

fn read_value<R: Read>(reader: &mut R, len: u32) -> CellResult<Vec<u8>> {
    let len = len as usize;
    let mut value = Vec::new();
    value
        .try_reserve_exact(len)
        .map_err(|e| CellError::Resource(format!("property value of {len} bytes: {e}")))?;
    value.resize(len, 0);
    reader.read_exact(&mut value)?;
    Ok(value)
}

fn dispatch(props: &mut Properties, tag: Tag, value: &[u8]) -> Result<(), FormatError> {
    match tag {
        Tag::Type         => props.kind          = Some(narrow(tag, value)?),
        Tag::SizeInCell   => props.size_in_cell  = Some(read_uint(value)),
        Tag::SizeOriginal => props.size_original = Some(read_uint(value)),
        Tag::PathName     => props.path_name     = Some(decode_name(value)),
        Tag::LinkName     => props.link_name     = Some(decode_name(value)),
        Tag::Mode         => props.mode          = Some(narrow(tag, value)?),
        Tag::Uid          => props.uid           = Some(narrow(tag, value)?),
        Tag::Gid          => props.gid           = Some(narrow(tag, value)?),
        Tag::DeviceMajor  => props.dev_major     = Some(narrow(tag, value)?),
        Tag::DeviceMinor  => props.dev_minor     = Some(narrow(tag, value)?),
    }
    Ok(())
}

/// Little-endian unsigned integer of 1, 2, 4 or 8 bytes.
fn read_uint(value: &[u8]) -> u64 {
    value
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn narrow<T: TryFrom<u64>>(tag: Tag, value: &[u8]) -> Result<T, FormatError> {
    let wide = read_uint(value);
    T::try_from(wide).map_err(|_| FormatError::ValueOutOfRange { tag: tag as u16, value: wide })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn every_tag_is_in_the_decode_table() {
        for tag in Tag::ALL {
            assert_eq!(Tag::from_u16(tag as u16).unwrap(), tag);
        }
        assert_eq!(Tag::from_u16(0x30FF), Err(FormatError::UnknownTag(0x30FF)));
    }

    #[test]
    fn record_layout_is_little_endian() {
        let mut w = PropertyWriter::new();
        w.put_u16(Tag::Type, 0x200B);
        assert_eq!(w.as_bytes(), &[0x0A, 0x1D, 2, 0, 0, 0, 0x0B, 0x20]);
    }

    #[test]
    fn names_are_transformed_on_disk() {
        let mut w = PropertyWriter::new();
        w.put_name(Tag::PathName, b"a").unwrap();
        // 'a' = 0x61 -> reversed 0x86 -> ^0x1F = 0x99
        assert_eq!(&w.as_bytes()[6..], &[0x99]);
    }

    #[test]
    fn reads_back_a_full_property_set() {
        let mut w = PropertyWriter::new();
        w.put_u16(Tag::Type, 0x200D)
            .put_u32(Tag::Mode, 0o755)
            .put_u32(Tag::Uid, 1000)
            .put_u32(Tag::Gid, 100)
            .put_u64(Tag::SizeOriginal, 0);
        w.put_name(Tag::PathName, b"d/link").unwrap();
        w.put_name(Tag::LinkName, b"../a").unwrap();

        let props = read_properties(&mut Cursor::new(w.as_bytes()), w.len() as u32).unwrap();
        assert_eq!(props.kind, Some(0x200D));
        assert_eq!(props.mode, Some(0o755));
        assert_eq!(props.uid, Some(1000));
        assert_eq!(props.gid, Some(100));
        assert_eq!(props.size_original, Some(0));
        assert_eq!(props.path_name.as_deref(), Some(&b"d/link"[..]));
        assert_eq!(props.link_name.as_deref(), Some(&b"../a"[..]));
    }

    #[test]
    fn narrower_integer_widths_are_accepted() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(Tag::Mode as u16).to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&0o644u16.to_le_bytes());
        let props = read_properties(&mut Cursor::new(&bytes), bytes.len() as u32).unwrap();
        assert_eq!(props.mode, Some(0o644));
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x1D99u16.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 4]);
        let err = read_properties(&mut Cursor::new(&bytes), bytes.len() as u32).unwrap_err();
        assert_eq!(err.format_error(), Some(&FormatError::UnknownTag(0x1D99)));
    }

    #[test]
    fn record_overrunning_the_block_is_rejected() {
        let mut w = PropertyWriter::new();
        w.put_u64(Tag::SizeOriginal, 7);
        // Claim one byte less than the records actually take.
        let err = read_properties(&mut Cursor::new(w.as_bytes()), w.len() as u32 - 1).unwrap_err();
        assert!(matches!(err.format_error(), Some(FormatError::PropertyOverrun { .. })));
    }

    #[test]
    fn oversized_value_for_field_is_rejected() {
        let mut w = PropertyWriter::new();
        w.put_u64(Tag::Uid, u64::from(u32::MAX) + 1);
        let err = read_properties(&mut Cursor::new(w.as_bytes()), w.len() as u32).unwrap_err();
        assert!(matches!(err.format_error(), Some(FormatError::ValueOutOfRange { .. })));
    }

    #[test]
    fn truncated_stream_is_an_io_error() {
        let mut w = PropertyWriter::new();
        w.put_u32(Tag::Gid, 5);
        let short = &w.as_bytes()[..w.len() - 2];
        let err = read_properties(&mut Cursor::new(short), w.len() as u32).unwrap_err();
        assert!(matches!(err, CellError::Io(_)));
    }

    proptest! {
        #[test]
        fn name_transform_is_reversible(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert_eq!(decode_name(&encode_name(&bytes)), bytes);
        }

        #[test]
        fn names_survive_a_record(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut w = PropertyWriter::new();
            w.put_name(Tag::LinkName, &bytes).unwrap();
            let props = read_properties(&mut Cursor::new(w.as_bytes()), w.len() as u32).unwrap();
            prop_assert_eq!(props.link_name, Some(bytes));
        }
    }
}
