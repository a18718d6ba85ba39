//! Serialization of `CopyEngine` state for crash-resume.
//!
//! ```text
//! header: (magic, total_size, pass_size, blocks_read, read_errors,
//!          blocks_written, blocks_skipped, checksum_equal, write_errors,
//!          block_size, pass)
//! to_copy, to_retry, copied      (BlockRangeSet binary form, each)
//! trailer: identical header
//! ```
//! All integers big-endian. Loading rejects with `Invalid` unless header and
//! trailer match exactly and the counters are non-negative and consistent.

use crate::block_range_set::BlockRangeSet;
use crate::error::{DdbError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const MAGIC: &[u8; 8] = b"DDB CKPT";

#[derive(Debug, Clone)]
pub struct CheckpointHeader {
    pub total_size: u64,
    pub pass_size: u64,
    pub blocks_read: u64,
    pub read_errors: u64,
    pub blocks_written: u64,
    pub blocks_skipped: u64,
    pub checksum_equal: u64,
    pub write_errors: u64,
    pub block_size: u64,
    pub pass: u64,
}

impl CheckpointHeader {
    fn write<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_u64::<BigEndian>(self.total_size)?;
        w.write_u64::<BigEndian>(self.pass_size)?;
        w.write_u64::<BigEndian>(self.blocks_read)?;
        w.write_u64::<BigEndian>(self.read_errors)?;
        w.write_u64::<BigEndian>(self.blocks_written)?;
        w.write_u64::<BigEndian>(self.blocks_skipped)?;
        w.write_u64::<BigEndian>(self.checksum_equal)?;
        w.write_u64::<BigEndian>(self.write_errors)?;
        w.write_u64::<BigEndian>(self.block_size)?;
        w.write_u64::<BigEndian>(self.pass)?;
        Ok(())
    }

    fn read<R: Read>(mut r: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DdbError::invalid("checkpoint: bad magic"));
        }
        Ok(CheckpointHeader {
            total_size: r.read_u64::<BigEndian>()?,
            pass_size: r.read_u64::<BigEndian>()?,
            blocks_read: r.read_u64::<BigEndian>()?,
            read_errors: r.read_u64::<BigEndian>()?,
            blocks_written: r.read_u64::<BigEndian>()?,
            blocks_skipped: r.read_u64::<BigEndian>()?,
            checksum_equal: r.read_u64::<BigEndian>()?,
            write_errors: r.read_u64::<BigEndian>()?,
            block_size: r.read_u64::<BigEndian>()?,
            pass: r.read_u64::<BigEndian>()?,
        })
    }

    fn matches(&self, other: &CheckpointHeader) -> bool {
        self.total_size == other.total_size
            && self.pass_size == other.pass_size
            && self.blocks_read == other.blocks_read
            && self.read_errors == other.read_errors
            && self.blocks_written == other.blocks_written
            && self.blocks_skipped == other.blocks_skipped
            && self.checksum_equal == other.checksum_equal
            && self.write_errors == other.write_errors
            && self.block_size == other.block_size
            && self.pass == other.pass
    }
}

pub struct Checkpoint {
    pub header: CheckpointHeader,
    pub to_copy: BlockRangeSet,
    pub to_retry: BlockRangeSet,
    pub copied: BlockRangeSet,
}

impl Checkpoint {
    pub fn save<W: Write>(&self, mut w: W) -> Result<()> {
        self.header.write(&mut w)?;
        self.to_copy.save(&mut w)?;
        self.to_retry.save(&mut w)?;
        self.copied.save(&mut w)?;
        self.header.write(&mut w)?;
        Ok(())
    }

    pub fn load<R: Read>(mut r: R) -> Result<Self> {
        let header = CheckpointHeader::read(&mut r)?;
        let total_blocks = header.total_size.div_ceil(header.block_size.max(1));

        if header.blocks_read + header.read_errors > total_blocks {
            return Err(DdbError::invalid("checkpoint: blocks_read + read_errors exceeds total"));
        }
        if header.blocks_written + header.write_errors > total_blocks {
            return Err(DdbError::invalid("checkpoint: blocks_written + write_errors exceeds total"));
        }

        let to_copy = BlockRangeSet::load(&mut r)?;
        let to_retry = BlockRangeSet::load(&mut r)?;
        let copied = BlockRangeSet::load(&mut r)?;
        let trailer = CheckpointHeader::read(&mut r)?;

        if !header.matches(&trailer) {
            return Err(DdbError::invalid("checkpoint: header/trailer mismatch"));
        }

        Ok(Checkpoint { header, to_copy, to_retry, copied })
    }

    /// Write to `<name>.tmp` then rename over `name`, as the copy engine
    /// does for every periodic checkpoint.
    pub fn save_atomic(&self, path: &std::path::Path) -> Result<()> {
        let tmp_path = {
            let file_name = path.file_name().unwrap_or_default().to_string_lossy();
            path.with_file_name(format!(".{file_name}.tmp"))
        };
        let mut file = std::fs::File::create(&tmp_path)?;
        self.save(&mut file)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_bit_exact() {
        let mut to_copy = BlockRangeSet::new();
        to_copy.add(0, 99);
        let mut to_retry = BlockRangeSet::new();
        to_retry.add(50, 60);
        let mut copied = BlockRangeSet::new();
        copied.add(0, 49);

        let cp = Checkpoint {
            header: CheckpointHeader {
                total_size: 512 * 100,
                pass_size: 100,
                blocks_read: 100,
                read_errors: 0,
                blocks_written: 89,
                blocks_skipped: 0,
                checksum_equal: 0,
                write_errors: 0,
                block_size: 512,
                pass: 1,
            },
            to_copy,
            to_retry,
            copied,
        };

        let mut buf = Vec::new();
        cp.save(&mut buf).unwrap();
        let loaded = Checkpoint::load(&buf[..]).unwrap();
        assert_eq!(loaded.to_copy, cp.to_copy);
        assert_eq!(loaded.to_retry, cp.to_retry);
        assert_eq!(loaded.copied, cp.copied);
        assert_eq!(loaded.header.pass, 1);
    }

    #[test]
    fn load_rejects_header_trailer_mismatch() {
        let mut buf = Vec::new();
        let header = CheckpointHeader {
            total_size: 100,
            pass_size: 10,
            blocks_read: 0,
            read_errors: 0,
            blocks_written: 0,
            blocks_skipped: 0,
            checksum_equal: 0,
            write_errors: 0,
            block_size: 10,
            pass: 1,
        };
        header.write(&mut buf).unwrap();
        BlockRangeSet::new().save(&mut buf).unwrap();
        BlockRangeSet::new().save(&mut buf).unwrap();
        BlockRangeSet::new().save(&mut buf).unwrap();
        let mut bad_trailer = header.clone();
        bad_trailer.pass = 2;
        bad_trailer.write(&mut buf).unwrap();

        assert!(Checkpoint::load(&buf[..]).is_err());
    }
}
