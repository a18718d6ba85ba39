//! # ddb: block-level backup and replication engine
//!
//! Format guarantees:
//! - All numeric fields on disk are big-endian.
//! - A sparse image container records only the blocks actually present; an
//!   absent block reads as zeros.
//! - A backup sequence is one full image plus an ordered list of
//!   incremental overlays; reads consult layers newest-first.
//! - The copy engine is resumable: a checkpoint captures `to_copy`,
//!   `to_retry`, `copied`, and every counter needed to continue a pass.
//! - Per-block failures never abort a pass; they accumulate into
//!   `to_retry` and are retried on the next pass.

pub mod block_range_set;
pub mod checksum;
pub mod checkpoint;
pub mod copy;
pub mod device;
pub mod error;
pub mod image;
pub mod sequence;

pub use block_range_set::BlockRangeSet;
pub use checksum::Checksum;
pub use checkpoint::Checkpoint;
pub use copy::{CopyConfig, CopyEngine};
pub use device::{AnyDevice, BlockOp, BlockStatus, Device, DeviceInfo, ReadFlags};
pub use error::{DdbError, Result};
pub use image::ImageContainer;
pub use sequence::{PackedSequence, Sequence};
