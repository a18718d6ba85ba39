//! Sparse and dense image containers, random-access block stores.
//!
//! # Sparse on-disk layout
//!
//! ```text
//! Offset  Size  Field
//!    0      8   magic            = "DDB META" (8 ASCII bytes)
//!    8      8   total_size       (BE i64)
//!   16      8   blocks_present   (BE i64)
//!   24      8   data_end         (BE i64)
//!   32      4   block_size       (BE i32)
//!   36      4   version          (BE i32, currently 0)
//!   40      8   mtime            (BE i64, seconds since epoch)
//!   48      8   metadata_head    (BE i64, 0 if none)
//!   56      8   reserved, zero
//!  ...    ...  zero padding to block_size
//! ```
//!
//! Metadata blocks form a singly linked list starting at `metadata_head`:
//!
//! ```text
//! int64 next_block_offset  (0 if last)
//! int32 entry_count
//! entry[entry_count]: { int64 first_block, int64 last_block, int64 data_offset }
//! padding to block_size
//! ```
//!
//! Capacity per metadata block is `(block_size - 12) / 24` entries.

use crate::block_range_set::BlockRangeSet;
use crate::checksum::Checksum;
use crate::device::{BlockOp, BlockStatus, Device, DeviceInfo, ReadFlags};
use crate::error::{DdbError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const HEADER_MAGIC: &[u8; 8] = b"DDB META";
pub const HEADER_SIZE_MIN: usize = 64;
const META_ENTRY_SIZE: u64 = 24;
const META_HEADER_SIZE: u64 = 12;
pub const FORMAT_VERSION: i32 = 0;

#[derive(Debug, Clone, Copy)]
struct MetaEntry {
    first_block: u64,
    last_block: u64,
    data_offset: u64,
}

#[derive(Debug, Clone)]
struct MetaBlock {
    offset: u64,
    next: u64,
    entries: Vec<MetaEntry>,
}

impl MetaBlock {
    fn capacity(block_size: u64) -> usize {
        ((block_size - META_HEADER_SIZE) / META_ENTRY_SIZE) as usize
    }

    fn read<R: Read>(mut r: R, offset: u64) -> Result<Self> {
        let next = r.read_i64::<BigEndian>()? as u64;
        let count = r.read_i32::<BigEndian>()?;
        if count < 0 {
            return Err(DdbError::invalid("metadata block: negative entry_count"));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let first_block = r.read_i64::<BigEndian>()? as u64;
            let last_block = r.read_i64::<BigEndian>()? as u64;
            let data_offset = r.read_i64::<BigEndian>()? as u64;
            if first_block > last_block {
                return Err(DdbError::invalid("metadata entry: first_block > last_block"));
            }
            entries.push(MetaEntry { first_block, last_block, data_offset });
        }
        for w in entries.windows(2) {
            if w[0].last_block >= w[1].first_block {
                return Err(DdbError::invalid("metadata entries not disjoint/sorted"));
            }
        }
        Ok(MetaBlock { offset, next, entries })
    }

    fn write<W: Write>(&self, mut w: W, block_size: u64) -> Result<()> {
        let mut body = Vec::with_capacity(block_size as usize);
        body.write_i64::<BigEndian>(self.next as i64)?;
        body.write_i32::<BigEndian>(self.entries.len() as i32)?;
        for e in &self.entries {
            body.write_i64::<BigEndian>(e.first_block as i64)?;
            body.write_i64::<BigEndian>(e.last_block as i64)?;
            body.write_i64::<BigEndian>(e.data_offset as i64)?;
        }
        if body.len() as u64 > block_size {
            return Err(DdbError::invalid("metadata block overflows block_size"));
        }
        body.resize(block_size as usize, 0u8);
        w.write_all(&body)?;
        Ok(())
    }

    fn span(&self) -> Option<(u64, u64)> {
        match (self.entries.first(), self.entries.last()) {
            (Some(f), Some(l)) => Some((f.first_block, l.last_block)),
            _ => None,
        }
    }
}

/// `(metadata_block_offset, first_covered_block, last_covered_block)`, one
/// per metadata block, kept in ascending span order.
#[derive(Debug, Clone, Copy)]
struct SummaryEntry {
    offset: u64,
    first: u64,
    last: u64,
}

enum Backing {
    Dense,
    Sparse {
        header_offset: u64,
        metadata_head: u64,
        data_end: u64,
        blocks_present: u64,
        summary: Vec<SummaryEntry>,
        cached: Option<MetaBlock>,
        dirty_header: bool,
    },
}

pub struct ImageContainer {
    file: File,
    block_size: u64,
    total_size: u64,
    num_blocks: u64,
    backing: Backing,
}

impl ImageContainer {
    pub fn create<P: AsRef<Path>>(
        path: P,
        block_size: u64,
        total_size: u64,
        sparse: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(DdbError::Exists(path.display().to_string()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let num_blocks = total_size.div_ceil(block_size).max(1);

        if sparse {
            let header = SparseHeader {
                total_size,
                blocks_present: 0,
                data_end: block_size,
                block_size,
                version: FORMAT_VERSION,
                mtime: now_unix(),
                metadata_head: 0,
            };
            header.write(&mut file, block_size)?;
            file.set_len(block_size)?;
            log::debug!(target: "image", "created sparse image {} ({} blocks)", path.display(), num_blocks);
            Ok(ImageContainer {
                file,
                block_size,
                total_size,
                num_blocks,
                backing: Backing::Sparse {
                    header_offset: 0,
                    metadata_head: 0,
                    data_end: block_size,
                    blocks_present: 0,
                    summary: Vec::new(),
                    cached: None,
                    dirty_header: false,
                },
            })
        } else {
            file.set_len(total_size)?;
            log::debug!(target: "image", "created dense image {} ({} blocks)", path.display(), num_blocks);
            Ok(ImageContainer {
                file,
                block_size,
                total_size,
                num_blocks,
                backing: Backing::Dense,
            })
        }
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        writable: bool,
        expected_block_size: Option<u64>,
        expected_total_size: Option<u64>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        file.seek(SeekFrom::Start(0))?;

        if &magic == HEADER_MAGIC {
            let header = SparseHeader::read(&mut file)?;
            if let Some(bs) = expected_block_size {
                if bs != header.block_size {
                    return Err(DdbError::invalid("block_size mismatch on open"));
                }
            }
            if let Some(ts) = expected_total_size {
                if ts != header.total_size {
                    return Err(DdbError::invalid("total_size mismatch on open"));
                }
            }
            let num_blocks = header.total_size.div_ceil(header.block_size).max(1);
            let mut container = ImageContainer {
                file,
                block_size: header.block_size,
                total_size: header.total_size,
                num_blocks,
                backing: Backing::Sparse {
                    header_offset: 0,
                    metadata_head: header.metadata_head,
                    data_end: header.data_end,
                    blocks_present: header.blocks_present,
                    summary: Vec::new(),
                    cached: None,
                    dirty_header: false,
                },
            };
            container.rebuild_summary()?;
            Ok(container)
        } else {
            let len = file.metadata()?.len();
            let block_size = expected_block_size.unwrap_or(512);
            let total_size = expected_total_size.unwrap_or(len);
            let num_blocks = total_size.div_ceil(block_size).max(1);
            Ok(ImageContainer {
                file,
                block_size,
                total_size,
                num_blocks,
                backing: Backing::Dense,
            })
        }
    }

    fn rebuild_summary(&mut self) -> Result<()> {
        let block_size = self.block_size;
        if let Backing::Sparse { metadata_head, summary, .. } = &mut self.backing {
            summary.clear();
            let mut offset = *metadata_head;
            let mut seen = std::collections::HashSet::new();
            while offset != 0 {
                if !seen.insert(offset) {
                    return Err(DdbError::invalid("metadata chain contains a cycle"));
                }
                self.file.seek(SeekFrom::Start(offset))?;
                let block = MetaBlock::read(&mut self.file, offset)?;
                if let Some((first, last)) = block.span() {
                    if let Backing::Sparse { summary, .. } = &mut self.backing {
                        if let Some(prev) = summary.last() {
                            if prev.last >= first {
                                return Err(DdbError::invalid("metadata block spans out of order"));
                            }
                        }
                        summary.push(SummaryEntry { offset, first, last });
                    }
                }
                offset = block.next;
            }
            let _ = block_size;
        }
        Ok(())
    }

    fn load_meta_block(&mut self, offset: u64) -> Result<MetaBlock> {
        self.file.seek(SeekFrom::Start(offset))?;
        MetaBlock::read(&mut self.file, offset)
    }

    /// Same as `load_meta_block` but through a shared reference: `File`
    /// implements `Read`/`Seek` for `&File`, so this works from methods
    /// that only see `&self` (`blocks`, `has_block`).
    fn load_meta_block_shared(&self, offset: u64) -> Result<MetaBlock> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(offset))?;
        MetaBlock::read(f, offset)
    }

    fn save_meta_block(&mut self, block: &MetaBlock) -> Result<()> {
        self.file.seek(SeekFrom::Start(block.offset))?;
        block.write(&mut self.file, self.block_size)
    }

    fn find_entry(&mut self, b: u64) -> Result<Option<(MetaBlock, MetaEntry)>> {
        let (summary, cached) = match &self.backing {
            Backing::Sparse { summary, cached, .. } => (summary.clone(), cached.clone()),
            Backing::Dense => return Ok(None),
        };

        if let Some(block) = &cached {
            if let Some((first, last)) = block.span() {
                if first <= b && b <= last {
                    for e in &block.entries {
                        if e.first_block <= b && b <= e.last_block {
                            return Ok(Some((block.clone(), *e)));
                        }
                    }
                }
            }
        }

        for s in &summary {
            if s.first <= b && b <= s.last {
                let block = self.load_meta_block(s.offset)?;
                for e in &block.entries {
                    if e.first_block <= b && b <= e.last_block {
                        let found = (block.clone(), *e);
                        if let Backing::Sparse { cached, .. } = &mut self.backing {
                            *cached = Some(block);
                        }
                        return Ok(Some(found));
                    }
                }
            }
        }
        Ok(None)
    }

    fn sparse_read_block(&mut self, b: u64, buf: &mut [u8]) -> Result<bool> {
        match self.find_entry(b)? {
            Some((_, entry)) => {
                let offset = entry.data_offset + (b - entry.first_block) * self.block_size;
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.read_exact(buf)?;
                Ok(true)
            }
            None => {
                buf.fill(0);
                Ok(false)
            }
        }
    }

    /// Allocate a data region for `b` and record it in metadata, per the
    /// sparse allocation algorithm.
    fn sparse_write_block(&mut self, b: u64, data: &[u8]) -> Result<()> {
        let (data_end, metadata_head) = match &self.backing {
            Backing::Sparse { data_end, metadata_head, .. } => (*data_end, *metadata_head),
            Backing::Dense => unreachable!(),
        };

        // Can we extend the cached block's last entry contiguously?
        if let Backing::Sparse { cached: Some(block), .. } = &self.backing {
            if let Some(last) = block.entries.last() {
                if last.last_block == b.wrapping_sub(1)
                    && last.data_offset + (last.last_block - last.first_block + 1) * self.block_size
                        == data_end
                {
                    let mut block = block.clone();
                    block.entries.last_mut().unwrap().last_block = b;
                    self.file.seek(SeekFrom::Start(data_end))?;
                    self.file.write_all(data)?;
                    self.save_meta_block(&block)?;
                    if let Backing::Sparse { cached, data_end: de, blocks_present, dirty_header, .. } =
                        &mut self.backing
                    {
                        *cached = Some(block);
                        *de += self.block_size;
                        *blocks_present += 1;
                        *dirty_header = true;
                    }
                    let new_len = data_end + self.block_size;
                    self.file.set_len(self.file.metadata()?.len().max(new_len))?;
                    return Ok(());
                }
            }
        }

        // Find the metadata block whose span covers `b` or is nearest to
        // its right; fall back to extending/creating the tail block.
        let target_offset = {
            let summary = match &self.backing {
                Backing::Sparse { summary, .. } => summary.clone(),
                Backing::Dense => unreachable!(),
            };
            summary
                .iter()
                .find(|s| s.last + 1 >= b)
                .map(|s| s.offset)
                .or_else(|| summary.last().map(|s| s.offset))
        };

        let mut block = match target_offset {
            Some(off) => self.load_meta_block(off)?,
            None => {
                // No metadata blocks at all yet: create the first one right
                // after the header.
                let offset = self.block_size;
                let block = MetaBlock { offset, next: 0, entries: Vec::new() };
                self.link_head(offset)?;
                self.extend_data_end_to(offset + self.block_size)?;
                block
            }
        };

        let capacity = MetaBlock::capacity(self.block_size);
        if block.entries.len() < capacity {
            self.write_payload_and_insert(&mut block, b, data)?;
        } else {
            // Split: move the upper half into a fresh metadata block.
            let mid = block.entries.len() / 2;
            let upper: Vec<MetaEntry> = block.entries.split_off(mid);
            let new_block_offset = self.current_data_end()?;
            self.extend_data_end_to(new_block_offset + self.block_size)?;
            let new_block = MetaBlock { offset: new_block_offset, next: block.next, entries: upper };
            block.next = new_block_offset;
            self.save_meta_block(&new_block)?;
            self.refresh_summary_entry(&new_block)?;

            if new_block.entries.first().map(|e| e.first_block <= b).unwrap_or(false)
                || block.span().map(|(_, last)| b > last).unwrap_or(true)
            {
                let mut new_block = new_block;
                self.write_payload_and_insert(&mut new_block, b, data)?;
            } else {
                self.write_payload_and_insert(&mut block, b, data)?;
            }
        }
        let _ = metadata_head;
        Ok(())
    }

    fn current_data_end(&self) -> Result<u64> {
        match &self.backing {
            Backing::Sparse { data_end, .. } => Ok(*data_end),
            Backing::Dense => unreachable!(),
        }
    }

    fn extend_data_end_to(&mut self, new_end: u64) -> Result<()> {
        if let Backing::Sparse { data_end, dirty_header, .. } = &mut self.backing {
            *data_end = new_end;
            *dirty_header = true;
        }
        let len = self.file.metadata()?.len();
        if len < new_end {
            self.file.set_len(new_end)?;
        }
        Ok(())
    }

    fn link_head(&mut self, offset: u64) -> Result<()> {
        if let Backing::Sparse { metadata_head, dirty_header, .. } = &mut self.backing {
            *metadata_head = offset;
            *dirty_header = true;
        }
        Ok(())
    }

    fn refresh_summary_entry(&mut self, block: &MetaBlock) -> Result<()> {
        if let (Backing::Sparse { summary, .. }, Some((first, last))) =
            (&mut self.backing, block.span())
        {
            summary.retain(|s| s.offset != block.offset);
            summary.push(SummaryEntry { offset: block.offset, first, last });
            summary.sort_by_key(|s| s.first);
        }
        Ok(())
    }

    fn write_payload_and_insert(&mut self, block: &mut MetaBlock, b: u64, data: &[u8]) -> Result<()> {
        let data_end = self.current_data_end()?;
        self.file.seek(SeekFrom::Start(data_end))?;
        self.file.write_all(data)?;
        self.extend_data_end_to(data_end + self.block_size)?;

        let new_entry = MetaEntry { first_block: b, last_block: b, data_offset: data_end };
        let pos = block.entries.partition_point(|e| e.first_block < b);
        block.entries.insert(pos, new_entry);
        self.save_meta_block(block)?;
        self.refresh_summary_entry(block)?;

        if let Backing::Sparse { cached, blocks_present, dirty_header, .. } = &mut self.backing {
            *cached = Some(block.clone());
            *blocks_present += 1;
            *dirty_header = true;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Backing::Sparse { dirty_header, header_offset, total_size, blocks_present,
                data_end, block_size, metadata_head, .. } = &self.backing
        {
            if *dirty_header {
                let header = SparseHeader {
                    total_size: *total_size,
                    blocks_present: *blocks_present,
                    data_end: *data_end,
                    block_size: *block_size,
                    version: FORMAT_VERSION,
                    mtime: now_unix(),
                    metadata_head: *metadata_head,
                };
                self.file.seek(SeekFrom::Start(*header_offset))?;
                header.write(&mut self.file, *block_size)?;
                if let Backing::Sparse { dirty_header, .. } = &mut self.backing {
                    *dirty_header = false;
                }
            }
        }
        self.file.flush()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        if let Backing::Sparse { data_end, .. } = &self.backing {
            self.file.set_len(*data_end)?;
        }
        Ok(())
    }

    /// Union of every metadata entry's own `[first_block, last_block]` span,
    /// not the coarser per-metadata-block summary span: a metadata block can
    /// hold several disjoint entries, and the summary only tracks the outer
    /// min/max of those for the allocator's "which block to load" lookup.
    pub fn blocks(&self) -> BlockRangeSet {
        let mut set = BlockRangeSet::new();
        match &self.backing {
            Backing::Dense => {
                if self.num_blocks > 0 {
                    set.add(0, self.num_blocks - 1);
                }
            }
            Backing::Sparse { summary, .. } => {
                for s in summary {
                    match self.load_meta_block_shared(s.offset) {
                        Ok(block) => {
                            for e in &block.entries {
                                set.add(e.first_block, e.last_block);
                            }
                        }
                        Err(e) => log::warn!(
                            target: "image",
                            "failed to load metadata block at {}: {e}",
                            s.offset
                        ),
                    }
                }
            }
        }
        set
    }

    pub fn copy_range(&self) -> BlockRangeSet {
        match &self.backing {
            Backing::Dense => self.blocks(),
            Backing::Sparse { .. } => self.blocks(),
        }
    }

    pub fn has_block(&self, b: u64) -> bool {
        match &self.backing {
            Backing::Dense => b < self.num_blocks,
            Backing::Sparse { summary, .. } => {
                for s in summary {
                    if s.first <= b && b <= s.last {
                        return match self.load_meta_block_shared(s.offset) {
                            Ok(block) => block.entries.iter().any(|e| e.first_block <= b && b <= e.last_block),
                            Err(e) => {
                                log::warn!(
                                    target: "image",
                                    "failed to load metadata block at {}: {e}",
                                    s.offset
                                );
                                false
                            }
                        };
                    }
                }
                false
            }
        }
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo { block_size: self.block_size, total_size: self.total_size, num_blocks: self.num_blocks }
    }

    fn tail_len(&self, b: u64) -> usize {
        if b != self.num_blocks - 1 {
            return self.block_size as usize;
        }
        let rem = self.total_size % self.block_size;
        if rem == 0 { self.block_size as usize } else { rem as usize }
    }

    pub fn read_multi(&mut self, batch: &mut [BlockOp], flags: ReadFlags) -> Result<()> {
        for op in batch.iter_mut() {
            if op.block_idx >= self.num_blocks {
                op.result = BlockStatus::Error;
                continue;
            }
            let tail = self.tail_len(op.block_idx);

            if flags.maybe {
                if let Some(want) = op.maybe_digest {
                    let mut buf = vec![0u8; self.block_size as usize];
                    let present = match &self.backing {
                        Backing::Dense => {
                            self.file.seek(SeekFrom::Start(op.block_idx * self.block_size))?;
                            self.file.read_exact(&mut buf[..tail])?;
                            true
                        }
                        Backing::Sparse { .. } => self.sparse_read_block(op.block_idx, &mut buf[..tail])?,
                    };
                    if !present {
                        buf[..tail].fill(0);
                    }
                    buf[tail..].fill(0);
                    let digest = Checksum::of_bytes(&buf);
                    if digest.check(&want) {
                        op.result = BlockStatus::Equal;
                        continue;
                    }
                    if flags.checksum {
                        op.buffer.clear();
                        op.buffer.extend_from_slice(digest.as_bytes());
                    } else {
                        op.buffer = buf;
                    }
                    op.result = BlockStatus::Ok;
                    continue;
                }
            }

            match &self.backing {
                Backing::Dense => {
                    op.buffer.resize(self.block_size as usize, 0);
                    self.file.seek(SeekFrom::Start(op.block_idx * self.block_size))?;
                    self.file.read_exact(&mut op.buffer[..tail])?;
                    op.buffer[tail..].fill(0);
                    op.result = BlockStatus::Ok;
                }
                Backing::Sparse { .. } => {
                    op.buffer.resize(self.block_size as usize, 0);
                    let present = self.sparse_read_block(op.block_idx, &mut op.buffer[..tail])?;
                    op.buffer[tail..].fill(0);
                    if !present && !flags.zero_fill {
                        op.result = BlockStatus::Absent;
                    } else {
                        op.result = BlockStatus::Ok;
                    }
                }
            }

            if flags.checksum {
                let digest = Checksum::of_bytes(&op.buffer);
                op.buffer.clear();
                op.buffer.extend_from_slice(digest.as_bytes());
            }
        }
        Ok(())
    }

    pub fn write_multi(&mut self, batch: &mut [BlockOp]) -> Result<()> {
        for op in batch.iter_mut() {
            if op.block_idx >= self.num_blocks {
                op.result = BlockStatus::Error;
                continue;
            }
            let tail = self.tail_len(op.block_idx);
            let mut full = vec![0u8; self.block_size as usize];
            full[..tail].copy_from_slice(&op.buffer[..tail]);

            let res = match &self.backing {
                Backing::Dense => {
                    self.file.seek(SeekFrom::Start(op.block_idx * self.block_size))?;
                    self.file.write_all(&full[..tail])
                }
                Backing::Sparse { .. } => self.sparse_write_block(op.block_idx, &full).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                }),
            };
            op.result = if res.is_ok() { BlockStatus::Ok } else { BlockStatus::Error };
        }
        Ok(())
    }
}

impl Clone for MetaBlock {
    fn clone(&self) -> Self {
        MetaBlock { offset: self.offset, next: self.next, entries: self.entries.clone() }
    }
}

struct SparseHeader {
    total_size: u64,
    blocks_present: u64,
    data_end: u64,
    block_size: u64,
    version: i32,
    mtime: i64,
    metadata_head: u64,
}

impl SparseHeader {
    fn write<W: Write>(&self, mut w: W, block_size: u64) -> Result<()> {
        let mut body = Vec::with_capacity(block_size as usize);
        body.extend_from_slice(HEADER_MAGIC);
        body.write_i64::<BigEndian>(self.total_size as i64)?;
        body.write_i64::<BigEndian>(self.blocks_present as i64)?;
        body.write_i64::<BigEndian>(self.data_end as i64)?;
        body.write_i32::<BigEndian>(self.block_size as i32)?;
        body.write_i32::<BigEndian>(self.version)?;
        body.write_i64::<BigEndian>(self.mtime)?;
        body.write_i64::<BigEndian>(self.metadata_head as i64)?;
        body.write_i64::<BigEndian>(0)?; // reserved
        body.resize(block_size as usize, 0u8);
        w.write_all(&body)?;
        Ok(())
    }

    fn read<R: Read>(mut r: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != HEADER_MAGIC {
            return Err(DdbError::invalid("image: bad magic"));
        }
        let total_size = r.read_i64::<BigEndian>()? as u64;
        let blocks_present = r.read_i64::<BigEndian>()? as u64;
        let data_end = r.read_i64::<BigEndian>()? as u64;
        let block_size = r.read_i32::<BigEndian>()? as u64;
        let version = r.read_i32::<BigEndian>()?;
        let mtime = r.read_i64::<BigEndian>()?;
        let metadata_head = r.read_i64::<BigEndian>()? as u64;
        if block_size < 512 {
            return Err(DdbError::invalid("image: block_size below minimum"));
        }
        Ok(SparseHeader { total_size, blocks_present, data_end, block_size, version, mtime, metadata_head })
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Device for ImageContainer {
    fn info(&self) -> DeviceInfo {
        ImageContainer::info(self)
    }

    fn read_multi(&mut self, batch: &mut [BlockOp], flags: ReadFlags) -> Result<()> {
        ImageContainer::read_multi(self, batch, flags)
    }

    fn write_multi(&mut self, batch: &mut [BlockOp]) -> Result<()> {
        ImageContainer::write_multi(self, batch)
    }

    fn has_block(&self, block_idx: u64) -> bool {
        ImageContainer::has_block(self, block_idx)
    }

    fn blocks(&self) -> BlockRangeSet {
        ImageContainer::blocks(self)
    }

    fn copy_range(&self) -> BlockRangeSet {
        ImageContainer::copy_range(self)
    }

    fn flush(&mut self) -> Result<()> {
        ImageContainer::flush(self)
    }

    fn close(self) -> Result<()> {
        ImageContainer::close(self)
    }
}
