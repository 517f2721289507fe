//! Cell info block: entry count and size totals at the start of a cell.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// On-disk size of the info block.
pub const INFO_BLOCK_SIZE: u64 = 4 + 8 + 8;

/// Cell header: entry count and aggregate sizes.
///
/// Written as a zeroed placeholder before the tree walk and patched in place
/// once the walk has finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InfoBlock {
    pub entry_count:         u32,
    /// Sum of every entry's on-disk size (header + properties + payload).
    pub total_encoded_size:  u64,
    /// Sum of the original sizes of regular files.
    pub total_original_size: u64,
}

impl InfoBlock {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.entry_count)?;
        writer.write_u64::<LittleEndian>(self.total_encoded_size)?;
        writer.write_u64::<LittleEndian>(self.total_original_size)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(Self {
            entry_count:         reader.read_u32::<LittleEndian>()?,
            total_encoded_size:  reader.read_u64::<LittleEndian>()?,
            total_original_size: reader.read_u64::<LittleEndian>()?,
        })
    }

    /// Overwrite the block at `offset`, then restore the stream position.
    pub fn patch<W: Write + Seek>(&self, writer: &mut W, offset: u64) -> io::Result<()> {
        let resume = writer.stream_position()?;
        writer.seek(SeekFrom::Start(offset))?;
        self.write(&mut *writer)?;
        writer.seek(SeekFrom::Start(resume))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn placeholder_then_patch_at_offset() {
        let mut cur = Cursor::new(vec![0xAAu8; 7]);
        cur.seek(SeekFrom::End(0)).unwrap();
        InfoBlock::default().write(&mut cur).unwrap();
        cur.write_all(b"body").unwrap();

        let info = InfoBlock { entry_count: 3, total_encoded_size: 99, total_original_size: 5 };
        info.patch(&mut cur, 7).unwrap();
        assert_eq!(cur.position(), 7 + INFO_BLOCK_SIZE + 4);

        let bytes = cur.into_inner();
        assert_eq!(&bytes[..7], &[0xAA; 7]);
        assert_eq!(&bytes[7..11], &3u32.to_le_bytes());
        assert_eq!(InfoBlock::read(&bytes[7..]).unwrap(), info);
        assert_eq!(&bytes[bytes.len() - 4..], b"body");
    }
}
