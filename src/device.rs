//! Device abstraction: the uniform interface `CopyEngine` and `Sequence`
//! drive everything else through.
//!
//! A small closed set of concrete devices (`Image`) is dispatched through
//! the `AnyDevice` enum rather than `Box<dyn Device>`, static dispatch
//! where the set of implementors is known at compile time, the same shape
//! the codec registry uses for its built-in codecs.

use crate::block_range_set::BlockRangeSet;
use crate::error::Result;

/// Outcome of a single block operation inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Ok,
    /// Block absent in the source (sparse container never wrote it).
    Absent,
    /// Caller supplied a digest via `MAYBE` and the device confirms a match
    /// without transferring data.
    Equal,
    Error,
}

/// One block's worth of request/response state within a batch.
pub struct BlockOp {
    pub block_idx: u64,
    pub buffer: Vec<u8>,
    /// Populated by `read_multi`/`write_multi` on return.
    pub result: BlockStatus,
    pub error_code: Option<i32>,
    /// Digest to compare against when `flags.maybe` is set on a read.
    pub maybe_digest: Option<crate::checksum::Checksum>,
}

impl BlockOp {
    pub fn new(block_idx: u64, block_size: usize) -> Self {
        BlockOp {
            block_idx,
            buffer: vec![0u8; block_size],
            result: BlockStatus::Error,
            error_code: None,
            maybe_digest: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFlags {
    /// Return only the digest of the block's content, not the data.
    pub checksum: bool,
    /// Caller has filled `maybe_digest`; device may answer `Equal` instead
    /// of transferring data.
    pub maybe: bool,
    /// Missing backing region reads as zeros instead of `BadFile`.
    pub zero_fill: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub block_size: u64,
    pub total_size: u64,
    pub num_blocks: u64,
}

/// Uniform contract every device (image container, sequence, or a future
/// remote/LVM wrapper) implements. Every method except `close` has a
/// default body that emulates the missing operation in the documented way,
/// so a minimal device only needs to implement `info`, `read_multi`, and
/// `close`.
pub trait Device {
    fn info(&self) -> DeviceInfo;

    fn read_multi(&mut self, batch: &mut [BlockOp], flags: ReadFlags) -> Result<()>;

    fn write_multi(&mut self, _batch: &mut [BlockOp]) -> Result<()> {
        Err(crate::error::DdbError::Unsupported("write_multi".into()))
    }

    /// Default: dense semantics, every block in range is present.
    fn has_block(&self, block_idx: u64) -> bool {
        block_idx < self.info().num_blocks
    }

    fn has_blocks(&self, set: &BlockRangeSet) -> BlockRangeSet {
        let num_blocks = self.info().num_blocks;
        let mut out = BlockRangeSet::new();
        set.iterate(|s, e| {
            for b in s..=e {
                if b < num_blocks && self.has_block(b) {
                    out.add(b, b);
                }
            }
            true
        });
        out
    }

    /// Default: every block in `0..num_blocks` is present.
    fn blocks(&self) -> BlockRangeSet {
        let mut set = BlockRangeSet::new();
        let n = self.info().num_blocks;
        if n > 0 {
            set.add(0, n - 1);
        }
        set
    }

    /// Default: identical to `blocks()`.
    fn copy_range(&self) -> BlockRangeSet {
        self.blocks()
    }

    fn iterate<F: FnMut(u64, u64) -> bool>(&self, f: F) {
        self.blocks().iterate(f)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn report(&self, _sink: &mut dyn FnMut(&str)) {}

    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Closed set of concrete device implementations, dispatched statically.
pub enum AnyDevice {
    Image(crate::image::ImageContainer),
    Sequence(crate::sequence::Sequence),
}

impl AnyDevice {
    pub fn info(&self) -> DeviceInfo {
        match self {
            AnyDevice::Image(d) => d.info(),
            AnyDevice::Sequence(d) => d.info(),
        }
    }

    pub fn read_multi(&mut self, batch: &mut [BlockOp], flags: ReadFlags) -> Result<()> {
        match self {
            AnyDevice::Image(d) => d.read_multi(batch, flags),
            AnyDevice::Sequence(d) => d.read_multi(batch, flags),
        }
    }

    pub fn write_multi(&mut self, batch: &mut [BlockOp]) -> Result<()> {
        match self {
            AnyDevice::Image(d) => d.write_multi(batch),
            AnyDevice::Sequence(d) => d.write_multi(batch),
        }
    }

    pub fn has_block(&self, block_idx: u64) -> bool {
        match self {
            AnyDevice::Image(d) => d.has_block(block_idx),
            AnyDevice::Sequence(d) => d.has_block(block_idx),
        }
    }

    pub fn blocks(&self) -> BlockRangeSet {
        match self {
            AnyDevice::Image(d) => d.blocks(),
            AnyDevice::Sequence(d) => d.blocks(),
        }
    }

    pub fn copy_range(&self) -> BlockRangeSet {
        match self {
            AnyDevice::Image(d) => d.copy_range(),
            AnyDevice::Sequence(d) => d.copy_range(),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            AnyDevice::Image(d) => d.flush(),
            AnyDevice::Sequence(d) => d.flush(),
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            AnyDevice::Image(d) => d.close(),
            AnyDevice::Sequence(d) => d.close(),
        }
    }
}
