//! Layered backup sequence: one full image plus an ordered list of
//! incremental overlays.
//!
//! ```text
//! dir/
//!   meta                        text: "DDB SEQUENCE META" then "block_size total_size full_mtime"
//!   full                        sparse image
//!   incr-YYYY-MM-DD:HH:MM:SS    zero or more incrementals, newest last
//!   checksum                    optional: num_blocks * checksum_length bytes
//! ```
//!
//! Reads consult layers newest-first; the first layer reporting a block
//! present supplies its data. Writes go to exactly one target layer.

use crate::checksum::{Checksum, CHECKSUM_SIZE};
use crate::copy::{CopyConfig, CopyEngine};
use crate::device::{AnyDevice, BlockOp, BlockStatus, DeviceInfo, ReadFlags};
use crate::error::{DdbError, Result};
use crate::image::ImageContainer;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const META_MAGIC: &str = "DDB SEQUENCE META";
const TIMESTAMP_FMT: &str = "%Y-%m-%d:%H:%M:%S";

struct MetaFile {
    block_size: u64,
    total_size: u64,
    full_mtime: DateTime<Utc>,
}

impl MetaFile {
    fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut lines = contents.lines();
        let magic = lines.next().ok_or_else(|| DdbError::invalid("meta: empty file"))?;
        if magic != META_MAGIC {
            return Err(DdbError::invalid("meta: bad magic line"));
        }
        let fields = lines.next().ok_or_else(|| DdbError::invalid("meta: missing field line"))?;
        let mut parts = fields.split_whitespace();
        let block_size: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DdbError::invalid("meta: bad block_size"))?;
        let total_size: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DdbError::invalid("meta: bad total_size"))?;
        let mtime_secs: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DdbError::invalid("meta: bad full_mtime"))?;
        let full_mtime = DateTime::from_timestamp(mtime_secs, 0)
            .ok_or_else(|| DdbError::invalid("meta: bad full_mtime"))?;
        Ok(MetaFile { block_size, total_size, full_mtime })
    }

    fn write(&self, path: &Path) -> Result<()> {
        let contents = format!(
            "{META_MAGIC}\n{} {} {}\n",
            self.block_size,
            self.total_size,
            self.full_mtime.timestamp()
        );
        fs::write(path, contents)?;
        Ok(())
    }
}

struct Layer {
    name: String,
    timestamp: Option<DateTime<Utc>>,
    image: ImageContainer,
}

enum Target {
    /// Index into `layers` that writes go to.
    Existing(usize),
}

pub struct Sequence {
    dir: PathBuf,
    block_size: u64,
    total_size: u64,
    num_blocks: u64,
    full_mtime: DateTime<Utc>,
    /// Oldest first: `layers[0]` is always the full.
    layers: Vec<Layer>,
    target: Option<Target>,
    checksum_path: PathBuf,
    checksum_cache: Option<Vec<u8>>,
}

impl Sequence {
    pub fn create<P: AsRef<Path>>(dir: P, block_size: u64, total_size: u64) -> Result<Self> {
        let dir = dir.as_ref();
        if dir.exists() {
            return Err(DdbError::Exists(dir.display().to_string()));
        }
        fs::create_dir_all(dir)?;

        let full_path = dir.join("full");
        ImageContainer::create(&full_path, block_size, total_size, true)?.close()?;

        let meta = MetaFile { block_size, total_size, full_mtime: Utc::now() };
        meta.write(&dir.join("meta"))?;

        log::info!(target: "sequence", "created sequence at {}", dir.display());
        Sequence::open(dir, false, None)
    }

    pub fn open<P: AsRef<Path>>(dir: P, writable: bool, select_last: Option<bool>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let meta_path = dir.join("meta");
        let meta = MetaFile::read(&meta_path)?;
        let num_blocks = meta.total_size.div_ceil(meta.block_size).max(1);

        let full_path = dir.join("full");
        let full_image = ImageContainer::open(&full_path, writable, Some(meta.block_size), Some(meta.total_size))?;
        let mut layers = vec![Layer { name: "full".into(), timestamp: None, image: full_image }];

        let mut incr_entries: Vec<(DateTime<Utc>, PathBuf, String)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(rest) = name.strip_prefix("incr-") {
                let ts = DateTime::parse_from_str(rest, TIMESTAMP_FMT)
                    .map_err(|_| DdbError::invalid(format!("bad incremental name: {name}")))?
                    .with_timezone(&Utc);
                incr_entries.push((ts, entry.path(), name));
            }
        }
        incr_entries.sort_by_key(|(ts, _, _)| *ts);
        for w in incr_entries.windows(2) {
            if w[0].0 >= w[1].0 {
                return Err(DdbError::invalid("incremental timestamps not strictly increasing"));
            }
        }

        for (ts, path, name) in &incr_entries {
            let image = ImageContainer::open(path, false, Some(meta.block_size), Some(meta.total_size))?;
            layers.push(Layer { name: name.clone(), timestamp: Some(*ts), image });
        }

        let checksum_path = dir.join("checksum");
        let checksum_cache = if checksum_path.exists() {
            Some(fs::read(&checksum_path)?)
        } else {
            None
        };

        let target = if writable {
            Some(Sequence::open_write_target(&dir, &mut layers, select_last.unwrap_or(false), meta.block_size, meta.total_size)?)
        } else {
            None
        };

        Ok(Sequence {
            dir,
            block_size: meta.block_size,
            total_size: meta.total_size,
            num_blocks,
            full_mtime: meta.full_mtime,
            layers,
            target,
            checksum_path,
            checksum_cache,
        })
    }

    fn open_write_target(
        dir: &Path,
        layers: &mut Vec<Layer>,
        last: bool,
        block_size: u64,
        total_size: u64,
    ) -> Result<Target> {
        if last {
            let idx = layers.len() - 1;
            let name = layers[idx].name.clone();
            let path = dir.join(&name);
            let image = ImageContainer::open(&path, true, Some(block_size), Some(total_size))?;
            layers[idx].image = image;
            return Ok(Target::Existing(idx));
        }

        let ts = Utc::now();
        if let Some(last_ts) = layers.last().and_then(|l| l.timestamp) {
            if ts <= last_ts {
                return Err(DdbError::invalid("new incremental timestamp did not advance"));
            }
        }
        let name = format!("incr-{}", ts.format(TIMESTAMP_FMT));
        let path = dir.join(&name);
        let image = ImageContainer::create(&path, block_size, total_size, true)?;
        layers.push(Layer { name, timestamp: Some(ts), image });
        Ok(Target::Existing(layers.len() - 1))
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo { block_size: self.block_size, total_size: self.total_size, num_blocks: self.num_blocks }
    }

    pub fn has_block(&self, b: u64) -> bool {
        self.layers.iter().any(|l| l.image.has_block(b))
    }

    pub fn blocks(&self) -> crate::block_range_set::BlockRangeSet {
        let sets: Vec<_> = self.layers.iter().map(|l| l.image.blocks()).collect();
        let refs: Vec<&_> = sets.iter().collect();
        crate::block_range_set::BlockRangeSet::union(&refs)
    }

    pub fn copy_range(&self) -> crate::block_range_set::BlockRangeSet {
        self.blocks()
    }

    pub fn read_multi(&mut self, batch: &mut [BlockOp], flags: ReadFlags) -> Result<()> {
        for op in batch.iter_mut() {
            if flags.checksum {
                if let Some(cache) = &self.checksum_cache {
                    let start = (op.block_idx as usize) * CHECKSUM_SIZE;
                    if start + CHECKSUM_SIZE <= cache.len() {
                        op.buffer.clear();
                        op.buffer.extend_from_slice(&cache[start..start + CHECKSUM_SIZE]);
                        op.result = BlockStatus::Ok;
                        continue;
                    }
                }
            }

            let mut found = false;
            for layer in self.layers.iter_mut().rev() {
                if layer.image.has_block(op.block_idx) {
                    let mut single = vec![BlockOp::new(op.block_idx, self.block_size as usize)];
                    single[0].maybe_digest = op.maybe_digest;
                    layer.image.read_multi(&mut single, flags)?;
                    op.buffer = std::mem::take(&mut single[0].buffer);
                    op.result = single[0].result;
                    found = true;
                    break;
                }
            }
            if !found {
                op.buffer = vec![0u8; if flags.checksum { CHECKSUM_SIZE } else { self.block_size as usize }];
                if flags.checksum {
                    let digest = Checksum::of_bytes(&vec![0u8; self.block_size as usize]);
                    op.buffer.copy_from_slice(digest.as_bytes());
                }
                op.result = BlockStatus::Ok;
            }
        }
        Ok(())
    }

    pub fn write_multi(&mut self, batch: &mut [BlockOp]) -> Result<()> {
        let Some(Target::Existing(idx)) = self.target else {
            return Err(DdbError::Unsupported("sequence opened read-only".into()));
        };
        self.layers[idx].image.write_multi(batch)?;

        if self.checksum_cache.is_some() {
            for op in batch.iter() {
                if op.result != BlockStatus::Ok {
                    continue;
                }
                let digest = Checksum::of_bytes(&op.buffer);
                if let Err(e) = self.update_checksum_cache(op.block_idx, &digest) {
                    log::warn!(target: "sequence", "checksum side-file update failed for block {}: {e}", op.block_idx);
                }
            }
        }
        Ok(())
    }

    fn update_checksum_cache(&mut self, block_idx: u64, digest: &Checksum) -> Result<()> {
        let mut file = fs::OpenOptions::new().write(true).open(&self.checksum_path)?;
        file.seek(SeekFrom::Start(block_idx * CHECKSUM_SIZE as u64))?;
        file.write_all(digest.as_bytes())?;
        if let Some(cache) = &mut self.checksum_cache {
            let start = (block_idx as usize) * CHECKSUM_SIZE;
            if start + CHECKSUM_SIZE <= cache.len() {
                cache[start..start + CHECKSUM_SIZE].copy_from_slice(digest.as_bytes());
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.image.flush()?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Fold the oldest incremental into the full, then delete it.
    pub fn join(&mut self) -> Result<()> {
        if self.layers.len() < 2 {
            return Err(DdbError::invalid("sequence has no incremental to join"));
        }
        log::info!(target: "sequence", "joining {} into full", self.layers[1].name);

        let incr_path = self.dir.join(&self.layers[1].name);
        let incr_ts = self.layers[1].timestamp.expect("incremental has a timestamp");

        let full_path = self.dir.join(&self.layers[0].name);
        let mut full = ImageContainer::open(&full_path, true, Some(self.block_size), Some(self.total_size))?;
        let mut incr = ImageContainer::open(&incr_path, false, Some(self.block_size), Some(self.total_size))?;
        let present = incr.blocks();

        let mut src_dev = AnyDevice::Image(incr);
        let mut dst_dev = AnyDevice::Image(full);

        let config = CopyConfig {
            write_dst: true,
            use_checksums: false,
            skip_identical: false,
            output_each_pass: false,
            extra_report: false,
            block_size: self.block_size,
            max_passes: 2,
            progress_interval: 0,
            progress_sleep: 0,
            flush_interval: 0,
            checkpoint_interval: 0,
            machine_progress_interval: 0,
            input_list: Some(present),
            output_list: None,
            copied_list: None,
            checkpoint_file: None,
            machine_progress_file: None,
        };
        let mut engine = CopyEngine::new(config);
        let outcome = engine.run(&mut src_dev, &mut dst_dev, &mut |_| {})?;
        if outcome != 1 {
            return Err(DdbError::invalid("join: incremental did not fully copy into full"));
        }

        let (src_image, dst_image) = match (src_dev, dst_dev) {
            (AnyDevice::Image(s), AnyDevice::Image(d)) => (s, d),
            _ => unreachable!(),
        };
        incr = src_image;
        full = dst_image;
        full.close()?;
        incr.close()?;

        fs::remove_file(&incr_path)?;
        self.full_mtime = incr_ts;
        let meta = MetaFile { block_size: self.block_size, total_size: self.total_size, full_mtime: incr_ts };
        meta.write(&self.dir.join("meta"))?;

        log::info!(target: "sequence", "join complete, full.mtime = {}", incr_ts);
        self.layers.remove(1);
        self.layers[0].image = ImageContainer::open(&full_path, false, Some(self.block_size), Some(self.total_size))?;
        Ok(())
    }

    /// Rebuild the checksum side-file by reading every block through the
    /// layered path in checksum mode.
    pub fn build_checksum_cache(&mut self) -> Result<()> {
        let tmp_path = self.dir.join("checksum.tmp");
        let mut tmp = fs::File::create(&tmp_path)?;

        for b in 0..self.num_blocks {
            let mut batch = vec![BlockOp::new(b, self.block_size as usize)];
            let flags = ReadFlags { checksum: true, ..Default::default() };
            if let Err(e) = self.read_multi(&mut batch, flags) {
                drop(tmp);
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
            tmp.write_all(&batch[0].buffer)?;
        }
        tmp.flush()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.checksum_path)?;
        self.checksum_cache = Some(fs::read(&self.checksum_path)?);
        log::info!(target: "sequence", "rebuilt checksum cache ({} blocks)", self.num_blocks);
        Ok(())
    }
}

/// Packed single-file sequence variant. Resolved as read-only: the original
/// write path (`save_meta_packed`) was never completed, so this crate only
/// supports reading a packed file into an ordered layer list.
pub struct PackedSequence {
    subfiles: Vec<PackedSubfile>,
}

struct PackedSubfile {
    #[allow(dead_code)]
    file_no: i32,
    block_size: u32,
    #[allow(dead_code)]
    timestamp: i64,
    total_size: i64,
    offset: u64,
    file_size: i64,
}

pub const PACKED_MAGIC: &[u8; 8] = b"DDB PACK";

impl PackedSequence {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = fs::File::open(path)?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != PACKED_MAGIC {
            return Err(DdbError::invalid("packed sequence: bad magic"));
        }

        let mut subfiles = Vec::new();
        let mut file_no_expected = 0i32;
        loop {
            let mut header = [0u8; 4 + 4 + 8 + 8 + 8];
            file.read_exact(&mut header)?;
            let file_no = i32::from_be_bytes(header[0..4].try_into().unwrap());
            let block_size = u32::from_be_bytes(header[4..8].try_into().unwrap());
            let file_size = i64::from_be_bytes(header[8..16].try_into().unwrap());
            let timestamp = i64::from_be_bytes(header[16..24].try_into().unwrap());
            let total_size = i64::from_be_bytes(header[24..32].try_into().unwrap());

            if file_size == -1 {
                break;
            }
            if file_no != file_no_expected {
                return Err(DdbError::invalid("packed sequence: file_no out of order"));
            }
            let offset = file.stream_position()?;
            subfiles.push(PackedSubfile { file_no, block_size, timestamp, total_size, offset, file_size });

            let padded = (file_size as u64).div_ceil(block_size as u64) * block_size as u64;
            file.seek(SeekFrom::Current(padded as i64))?;
            file_no_expected += 1;
        }
        Ok(PackedSequence { subfiles })
    }

    pub fn subfile_count(&self) -> usize {
        self.subfiles.len()
    }

    pub fn subfile_info(&self, i: usize) -> Option<(u64, u32, i64, i64)> {
        self.subfiles.get(i).map(|s| (s.offset, s.block_size, s.file_size, s.total_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BlockOp;
    use tempfile::tempdir;

    fn write_block(seq: &mut Sequence, idx: u64, fill: u8) {
        let mut batch = vec![BlockOp::new(idx, seq.block_size as usize)];
        batch[0].buffer = vec![fill; seq.block_size as usize];
        seq.write_multi(&mut batch).unwrap();
    }

    #[test]
    fn layered_read_prefers_newest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq");

        let mut seq = Sequence::create(&path, 512, 512 * 16).unwrap();
        for b in 0..16 {
            write_block(&mut seq, b, 1);
        }
        seq.close().unwrap();

        let mut seq = Sequence::open(&path, true, Some(false)).unwrap();
        write_block(&mut seq, 5, 2);
        write_block(&mut seq, 10, 2);
        seq.close().unwrap();

        let mut seq = Sequence::open(&path, true, Some(false)).unwrap();
        write_block(&mut seq, 3, 3);
        write_block(&mut seq, 7, 3);
        write_block(&mut seq, 10, 3);
        seq.close().unwrap();

        let mut seq = Sequence::open(&path, false, None).unwrap();
        let mut batch = vec![BlockOp::new(3, 512)];
        seq.read_multi(&mut batch, ReadFlags::default()).unwrap();
        assert!(batch[0].buffer.iter().all(|&b| b == 3));

        let mut batch = vec![BlockOp::new(5, 512)];
        seq.read_multi(&mut batch, ReadFlags::default()).unwrap();
        assert!(batch[0].buffer.iter().all(|&b| b == 2));

        let mut batch = vec![BlockOp::new(10, 512)];
        seq.read_multi(&mut batch, ReadFlags::default()).unwrap();
        assert!(batch[0].buffer.iter().all(|&b| b == 3));

        let mut batch = vec![BlockOp::new(0, 512)];
        seq.read_multi(&mut batch, ReadFlags::default()).unwrap();
        assert!(batch[0].buffer.iter().all(|&b| b == 1));
    }

    #[test]
    fn join_merges_and_removes_incremental() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq");

        let mut seq = Sequence::create(&path, 512, 512 * 16).unwrap();
        for b in 0..16 {
            write_block(&mut seq, b, 9);
        }
        seq.close().unwrap();

        let mut seq = Sequence::open(&path, true, Some(false)).unwrap();
        write_block(&mut seq, 5, 55);
        write_block(&mut seq, 10, 77);
        seq.close().unwrap();

        let mut seq = Sequence::open(&path, true, None).unwrap();
        assert_eq!(seq.layers.len(), 2);
        seq.join().unwrap();
        assert_eq!(seq.layers.len(), 1);

        let mut batch = vec![BlockOp::new(5, 512)];
        seq.read_multi(&mut batch, ReadFlags::default()).unwrap();
        assert!(batch[0].buffer.iter().all(|&b| b == 55));

        assert!(!dir.path().join("seq").join("incr-nonexistent").exists());
    }
}
