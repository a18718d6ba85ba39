//! Multi-pass, checkpointable block copier.
//!
//! Drives two [`Device`](crate::device::AnyDevice) handles, batching reads
//! and writes, optionally skipping identical content via checksums, and
//! retrying failed blocks on the next pass. Never retries inside a single
//! pass; the pass structure itself is the retry mechanism.

use crate::block_range_set::BlockRangeSet;
use crate::checkpoint::{Checkpoint, CheckpointHeader};
use crate::device::{AnyDevice, BlockOp, BlockStatus, ReadFlags};
use crate::error::Result;
use std::path::PathBuf;

const DEFAULT_RW_MAX: usize = 128;

#[derive(Debug, Clone)]
pub struct CopyConfig {
    pub write_dst: bool,
    pub use_checksums: bool,
    pub skip_identical: bool,
    pub output_each_pass: bool,
    pub extra_report: bool,
    pub block_size: u64,
    pub max_passes: u32,
    pub progress_interval: u64,
    pub progress_sleep: u64,
    pub flush_interval: u64,
    pub checkpoint_interval: u64,
    pub machine_progress_interval: u64,
    pub input_list: Option<BlockRangeSet>,
    pub output_list: Option<PathBuf>,
    pub copied_list: Option<PathBuf>,
    pub checkpoint_file: Option<PathBuf>,
    pub machine_progress_file: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    blocks_read: u64,
    read_errors: u64,
    blocks_written: u64,
    blocks_skipped: u64,
    checksum_equal: u64,
    write_errors: u64,
}

pub struct CopyEngine {
    config: CopyConfig,
    to_copy: BlockRangeSet,
    to_retry: BlockRangeSet,
    copied: BlockRangeSet,
    pass: u32,
    counters: Counters,
    next_report_batch: u64,
    next_flush_batch: u64,
    next_checkpoint_batch: u64,
    next_machine_report_batch: u64,
    batch_seq: u64,
    /// Source device's total size, captured once in `run()`; carried into
    /// every checkpoint so `Checkpoint::load` can bound-check the counters.
    total_size: u64,
}

pub type ProgressSink<'a> = dyn FnMut(&str) + 'a;

impl CopyEngine {
    pub fn new(config: CopyConfig) -> Self {
        CopyEngine {
            config,
            to_copy: BlockRangeSet::new(),
            to_retry: BlockRangeSet::new(),
            copied: BlockRangeSet::new(),
            pass: 0,
            counters: Counters::default(),
            next_report_batch: 0,
            next_flush_batch: 0,
            next_checkpoint_batch: 0,
            next_machine_report_batch: 0,
            batch_seq: 0,
            total_size: 0,
        }
    }

    /// Returns `1` if `to_copy` drained entirely, `0` if some blocks still
    /// need copying (non-fatal), or propagates the first fatal error.
    pub fn run(&mut self, src: &mut AnyDevice, dst: &mut AnyDevice, progress: &mut ProgressSink) -> Result<i32> {
        let rw_max = DEFAULT_RW_MAX;
        let mut resuming = false;
        self.total_size = src.info().total_size.max(dst.info().total_size);

        if let Some(path) = &self.config.checkpoint_file {
            if path.exists() {
                let bytes = std::fs::read(path)?;
                if let Ok(cp) = Checkpoint::load(&bytes[..]) {
                    self.to_copy = cp.to_copy;
                    self.to_retry = cp.to_retry;
                    self.copied = cp.copied;
                    self.pass = cp.header.pass as u32;
                    self.counters = Counters {
                        blocks_read: cp.header.blocks_read,
                        read_errors: cp.header.read_errors,
                        blocks_written: cp.header.blocks_written,
                        blocks_skipped: cp.header.blocks_skipped,
                        checksum_equal: cp.header.checksum_equal,
                        write_errors: cp.header.write_errors,
                    };
                    resuming = true;
                    progress(&format!("resumed at pass {} from checkpoint", self.pass));
                }
            }
        }

        if !resuming {
            self.to_copy = self.config.input_list.clone().unwrap_or_else(|| src.copy_range());
        }

        while self.pass < self.config.max_passes && !self.to_copy.is_empty() {
            if !resuming {
                self.pass += 1;
                progress(&format!("start pass {}", self.pass));
                self.counters = Counters::default();
            }
            resuming = false;

            self.to_retry = BlockRangeSet::new();

            let ranges: Vec<(u64, u64)> = self.to_copy.ranges().to_vec();
            for (start, end) in ranges {
                let mut b = start;
                while b <= end {
                    let batch_end = (b + rw_max as u64 - 1).min(end);
                    self.inner_step(src, dst, b, batch_end, progress)?;
                    b = batch_end + 1;
                }
            }

            progress(&format!(
                "end pass {}: read={} read_errors={} written={} skipped={} equal={} write_errors={}",
                self.pass,
                self.counters.blocks_read,
                self.counters.read_errors,
                self.counters.blocks_written,
                self.counters.blocks_skipped,
                self.counters.checksum_equal,
                self.counters.write_errors
            ));

            self.to_copy = self.to_retry.clone();
            if let Some(path) = &self.config.output_list {
                if self.config.output_each_pass {
                    let mut buf = Vec::new();
                    self.to_copy.save(&mut buf)?;
                    std::fs::write(path, buf)?;
                }
            }
        }

        Ok(if self.to_copy.is_empty() { 1 } else { 0 })
    }

    fn inner_step(
        &mut self,
        src: &mut AnyDevice,
        dst: &mut AnyDevice,
        start: u64,
        end: u64,
        progress: &mut ProgressSink,
    ) -> Result<()> {
        let block_size = self.config.block_size as usize;
        let blocks: Vec<u64> = (start..=end).collect();
        let dst_has: Vec<bool> = blocks.iter().map(|&b| dst.has_block(b)).collect();
        let dst_exists = dst_has.iter().any(|&h| h);

        if dst_exists && self.config.skip_identical && self.config.use_checksums {
            self.checksum_skip_path(src, dst, &blocks, progress)?;
        } else if dst_exists && !self.config.use_checksums && (self.config.skip_identical || !self.config.write_dst) {
            self.read_all_compare_path(src, dst, &blocks, block_size)?;
        } else if dst_exists && self.config.write_dst {
            self.read_and_write_path(src, dst, &blocks, block_size)?;
        } else if !dst_exists {
            self.read_only_path(src, &blocks, block_size)?;
        } else {
            self.read_all_compare_path(src, dst, &blocks, block_size)?;
        }

        self.batch_seq += 1;
        if self.config.progress_interval > 0 && self.batch_seq >= self.next_report_batch {
            progress(&format!(
                "progress: read={} written={} skipped={}",
                self.counters.blocks_read, self.counters.blocks_written, self.counters.blocks_skipped
            ));
            self.next_report_batch = self.batch_seq + self.config.progress_interval;
        }
        if self.config.flush_interval > 0 && self.batch_seq >= self.next_flush_batch {
            dst.flush()?;
            self.next_flush_batch = self.batch_seq + self.config.flush_interval;
        }
        if self.config.checkpoint_interval > 0 && self.batch_seq >= self.next_checkpoint_batch {
            self.write_checkpoint()?;
            self.next_checkpoint_batch = self.batch_seq + self.config.checkpoint_interval;
        }
        if self.config.machine_progress_interval > 0 && self.batch_seq >= self.next_machine_report_batch {
            self.write_machine_progress()?;
            self.next_machine_report_batch = self.batch_seq + self.config.machine_progress_interval;
        }
        Ok(())
    }

    fn checksum_skip_path(
        &mut self,
        src: &mut AnyDevice,
        dst: &mut AnyDevice,
        blocks: &[u64],
        progress: &mut ProgressSink,
    ) -> Result<()> {
        let flags = ReadFlags { checksum: true, ..Default::default() };
        let mut dst_batch: Vec<BlockOp> = blocks.iter().map(|&b| BlockOp::new(b, self.config.block_size as usize)).collect();
        if dst.read_multi(&mut dst_batch, flags).is_err() {
            // Checksum read unsupported or failed outright: fall back to a
            // full read-and-compare, which already respects write_dst.
            return self.read_all_compare_path(src, dst, blocks, self.config.block_size as usize);
        }

        let mut src_batch: Vec<BlockOp> = blocks.iter().map(|&b| BlockOp::new(b, self.config.block_size as usize)).collect();
        for (s, d) in src_batch.iter_mut().zip(dst_batch.iter()) {
            if d.result == BlockStatus::Ok {
                s.maybe_digest = Some(crate::checksum::Checksum::from_bytes(
                    d.buffer.as_slice().try_into().unwrap_or([0u8; 32]),
                ));
            }
        }
        let maybe_flags = ReadFlags { maybe: true, ..Default::default() };
        src.read_multi(&mut src_batch, maybe_flags)?;

        let write_dst = self.config.write_dst;
        let mut write_batch = Vec::new();
        for s in src_batch.into_iter() {
            match s.result {
                BlockStatus::Equal => {
                    self.counters.blocks_skipped += 1;
                    self.counters.checksum_equal += 1;
                    self.counters.blocks_read += 1;
                    self.copied.add(s.block_idx, s.block_idx);
                }
                BlockStatus::Error => {
                    self.to_retry.add(s.block_idx, s.block_idx);
                    self.counters.read_errors += 1;
                }
                _ if write_dst => {
                    self.counters.blocks_read += 1;
                    write_batch.push(s);
                }
                _ => {
                    // Dry-run: count what would have been written, never touch dst.
                    self.counters.blocks_read += 1;
                    self.counters.blocks_written += 1;
                }
            }
        }
        if write_dst && !write_batch.is_empty() {
            self.do_write(dst, &mut write_batch, progress)?;
        }
        Ok(())
    }

    fn read_all_compare_path(
        &mut self,
        src: &mut AnyDevice,
        dst: &mut AnyDevice,
        blocks: &[u64],
        block_size: usize,
    ) -> Result<()> {
        let mut src_batch: Vec<BlockOp> = blocks.iter().map(|&b| BlockOp::new(b, block_size)).collect();
        let mut dst_batch: Vec<BlockOp> = blocks.iter().map(|&b| BlockOp::new(b, block_size)).collect();

        // Rayon is an optional dependency; fall back to sequential reads if
        // the feature is disabled.
        #[cfg(feature = "parallel")]
        {
            let (r1, r2) = rayon::join(
                || src.read_multi(&mut src_batch, ReadFlags::default()),
                || dst.read_multi(&mut dst_batch, ReadFlags::default()),
            );
            r1?;
            r2?;
        }
        #[cfg(not(feature = "parallel"))]
        {
            src.read_multi(&mut src_batch, ReadFlags::default())?;
            dst.read_multi(&mut dst_batch, ReadFlags::default())?;
        }

        let write_dst = self.config.write_dst;
        let mut write_batch = Vec::new();
        for (s, d) in src_batch.into_iter().zip(dst_batch.into_iter()) {
            match s.result {
                BlockStatus::Error => {
                    self.to_retry.add(s.block_idx, s.block_idx);
                    self.counters.read_errors += 1;
                    continue;
                }
                _ => self.counters.blocks_read += 1,
            }
            if d.result == BlockStatus::Ok && d.buffer == s.buffer {
                self.counters.blocks_skipped += 1;
                self.copied.add(s.block_idx, s.block_idx);
            } else if write_dst {
                write_batch.push(s);
            } else {
                // Dry-run: count what would have been written.
                self.counters.blocks_written += 1;
            }
        }
        if write_dst && !write_batch.is_empty() {
            self.do_write(dst, &mut write_batch, &mut |_| {})?;
        }
        Ok(())
    }

    fn read_and_write_path(
        &mut self,
        src: &mut AnyDevice,
        dst: &mut AnyDevice,
        blocks: &[u64],
        block_size: usize,
    ) -> Result<()> {
        let mut src_batch: Vec<BlockOp> = blocks.iter().map(|&b| BlockOp::new(b, block_size)).collect();
        src.read_multi(&mut src_batch, ReadFlags::default())?;

        let mut write_batch = Vec::new();
        for s in src_batch.into_iter() {
            if s.result == BlockStatus::Error {
                self.to_retry.add(s.block_idx, s.block_idx);
                self.counters.read_errors += 1;
            } else {
                self.counters.blocks_read += 1;
                write_batch.push(s);
            }
        }
        self.do_write(dst, &mut write_batch, &mut |_| {})
    }

    fn read_only_path(&mut self, src: &mut AnyDevice, blocks: &[u64], block_size: usize) -> Result<()> {
        let mut src_batch: Vec<BlockOp> = blocks.iter().map(|&b| BlockOp::new(b, block_size)).collect();
        src.read_multi(&mut src_batch, ReadFlags::default())?;
        for s in src_batch {
            if s.result == BlockStatus::Error {
                self.to_retry.add(s.block_idx, s.block_idx);
                self.counters.read_errors += 1;
            } else {
                self.counters.blocks_read += 1;
                self.copied.add(s.block_idx, s.block_idx);
            }
        }
        Ok(())
    }

    fn do_write(&mut self, dst: &mut AnyDevice, batch: &mut [BlockOp], _progress: &mut ProgressSink) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        dst.write_multi(batch)?;
        for op in batch {
            if op.result == BlockStatus::Error {
                self.to_retry.add(op.block_idx, op.block_idx);
                self.counters.write_errors += 1;
                log::debug!(target: "copy", "write failed for block {}, queued for retry", op.block_idx);
            } else {
                self.counters.blocks_written += 1;
                self.copied.add(op.block_idx, op.block_idx);
            }
        }
        Ok(())
    }

    fn write_checkpoint(&self) -> Result<()> {
        let Some(path) = &self.config.checkpoint_file else { return Ok(()) };
        let header = CheckpointHeader {
            total_size: self.total_size,
            pass_size: self.to_copy.count(),
            blocks_read: self.counters.blocks_read,
            read_errors: self.counters.read_errors,
            blocks_written: self.counters.blocks_written,
            blocks_skipped: self.counters.blocks_skipped,
            checksum_equal: self.counters.checksum_equal,
            write_errors: self.counters.write_errors,
            block_size: self.config.block_size,
            pass: self.pass as u64,
        };
        let cp = Checkpoint {
            header,
            to_copy: self.to_copy.clone(),
            to_retry: self.to_retry.clone(),
            copied: self.copied.clone(),
        };
        cp.save_atomic(path)?;
        log::info!(target: "copy", "checkpoint written at pass {}", self.pass);
        Ok(())
    }

    fn write_machine_progress(&self) -> Result<()> {
        let Some(path) = &self.config.machine_progress_file else { return Ok(()) };
        let now = chrono::Utc::now().timestamp();
        let line = format!(
            "{} {} {} {} {} {} {} {} {}\n",
            now,
            self.to_copy.count(),
            self.counters.blocks_read,
            self.counters.read_errors,
            self.counters.blocks_written,
            self.counters.blocks_skipped,
            self.counters.write_errors,
            self.config.block_size,
            self.pass
        );
        let tmp = path.with_file_name(format!(
            ".{}.tmp",
            path.file_name().unwrap_or_default().to_string_lossy()
        ));
        std::fs::write(&tmp, line)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageContainer;
    use tempfile::tempdir;

    fn make_filled(dir: &std::path::Path, name: &str, blocks: u64, fill: u8) -> ImageContainer {
        let path = dir.join(name);
        let mut img = ImageContainer::create(&path, 512, 512 * blocks, true).unwrap();
        for b in 0..blocks {
            let mut batch = vec![BlockOp::new(b, 512)];
            batch[0].buffer = vec![fill; 512];
            img.write_multi(&mut batch).unwrap();
        }
        img
    }

    #[test]
    fn full_copy_src_to_empty_dst() {
        let dir = tempdir().unwrap();
        let src = make_filled(dir.path(), "src.img", 32, 0x55);
        let dst = ImageContainer::create(&dir.path().join("dst.img"), 512, 512 * 32, true).unwrap();

        let mut src_dev = AnyDevice::Image(src);
        let mut dst_dev = AnyDevice::Image(dst);

        let config = CopyConfig {
            write_dst: true,
            use_checksums: false,
            skip_identical: false,
            output_each_pass: false,
            extra_report: false,
            block_size: 512,
            max_passes: 3,
            progress_interval: 0,
            progress_sleep: 0,
            flush_interval: 0,
            checkpoint_interval: 0,
            machine_progress_interval: 0,
            input_list: None,
            output_list: None,
            copied_list: None,
            checkpoint_file: None,
            machine_progress_file: None,
        };
        let mut engine = CopyEngine::new(config);
        let result = engine.run(&mut src_dev, &mut dst_dev, &mut |_| {}).unwrap();
        assert_eq!(result, 1);
        assert_eq!(engine.to_retry.count(), 0);

        for b in 0..32 {
            let mut s = vec![BlockOp::new(b, 512)];
            src_dev.read_multi(&mut s, ReadFlags::default()).unwrap();
            let mut d = vec![BlockOp::new(b, 512)];
            dst_dev.read_multi(&mut d, ReadFlags::default()).unwrap();
            assert_eq!(s[0].buffer, d[0].buffer);
        }
    }

    #[test]
    fn checkpoint_round_trips_engine_state() {
        let dir = tempdir().unwrap();
        let mut to_copy = BlockRangeSet::new();
        to_copy.add(10, 20);
        let mut engine = CopyEngine::new(CopyConfig {
            write_dst: true,
            use_checksums: false,
            skip_identical: false,
            output_each_pass: false,
            extra_report: false,
            block_size: 512,
            max_passes: 1,
            progress_interval: 0,
            progress_sleep: 0,
            flush_interval: 0,
            checkpoint_interval: 0,
            machine_progress_interval: 0,
            input_list: None,
            output_list: None,
            copied_list: None,
            checkpoint_file: Some(dir.path().join("ckpt")),
            machine_progress_file: None,
        });
        engine.to_copy = to_copy.clone();
        engine.pass = 1;
        engine.counters.blocks_read = 5;
        engine.total_size = 512 * 100;
        engine.write_checkpoint().unwrap();

        let bytes = std::fs::read(dir.path().join("ckpt")).unwrap();
        let cp = Checkpoint::load(&bytes[..]).unwrap();
        assert_eq!(cp.to_copy, to_copy);
        assert_eq!(cp.header.pass, 1);
        assert_eq!(cp.header.blocks_read, 5);
    }
}
