#![forbid(unsafe_code)]
//! Data model for recorded block-I/O workloads.
//!
//! Defines the flag set and record type produced by the kernel tracer
//! (`WriteFlags`, `BlockWrite`), the shared immutable payload buffer they
//! carry (`PayloadBuf`), and the replayable output record consumed by the
//! disk-replay engine (`DiskWriteData`). The `DiskWriteData` field layout is
//! a stable contract; see the field docs before changing anything.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Kernel sector size in bytes. Block-layer sector numbers are always in
/// these units regardless of the logical sector size of the device.
pub const KERNEL_SECTOR_SIZE: u64 = 512;

/// Errors raised while ingesting raw trace records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("unknown flag bits 0x{bits:08x}")]
    UnknownFlags { bits: u32 },

    #[error("payload length {actual} does not match declared size {declared}")]
    SizeMismatch { declared: u32, actual: usize },

    #[error("checkpoint record must not carry a payload or barrier flags")]
    BadCheckpoint,
}

/// Flag set of a recorded block-I/O operation.
///
/// Mirrors the bits the tracer records from the submitted bio. `BARRIER` is
/// not a stored bit: an operation is a barrier iff any of `FLUSH`,
/// `FLUSH_SEQ`, or `FUA` is set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct WriteFlags(u32);

impl WriteFlags {
    pub const NONE: Self = Self(0);
    pub const WRITE: Self = Self(1 << 0);
    pub const FLUSH: Self = Self(1 << 1);
    pub const FLUSH_SEQ: Self = Self(1 << 2);
    pub const FUA: Self = Self(1 << 3);
    pub const META: Self = Self(1 << 4);
    pub const CHECKPOINT: Self = Self(1 << 5);

    const ALL: u32 = Self::WRITE.0
        | Self::FLUSH.0
        | Self::FLUSH_SEQ.0
        | Self::FUA.0
        | Self::META.0
        | Self::CHECKPOINT.0;

    /// Validate a raw bit pattern from a profile dump.
    pub fn from_bits(bits: u32) -> Result<Self, TraceError> {
        if bits & !Self::ALL != 0 {
            return Err(TraceError::UnknownFlags {
                bits: bits & !Self::ALL,
            });
        }
        Ok(Self(bits))
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// True iff the operation ends an epoch (any flush or FUA bit).
    #[must_use]
    pub fn is_barrier(self) -> bool {
        self.0 & (Self::FLUSH.0 | Self::FLUSH_SEQ.0 | Self::FUA.0) != 0
    }

    #[must_use]
    pub fn is_meta(self) -> bool {
        self.contains(Self::META)
    }

    #[must_use]
    pub fn is_checkpoint(self) -> bool {
        self.contains(Self::CHECKPOINT)
    }

    #[must_use]
    pub fn has_write_flag(self) -> bool {
        self.contains(Self::WRITE)
    }

    #[must_use]
    pub fn has_flush_flag(self) -> bool {
        self.contains(Self::FLUSH)
    }

    #[must_use]
    pub fn has_flush_seq_flag(self) -> bool {
        self.contains(Self::FLUSH_SEQ)
    }

    #[must_use]
    pub fn has_fua_flag(self) -> bool {
        self.contains(Self::FUA)
    }
}

impl std::ops::BitOr for WriteFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Shared immutable payload buffer.
///
/// Many views (sector slices, replay records) alias one recorded payload;
/// cloning is O(1) and the bytes are never mutated after ingestion.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "Vec<u8>", into = "Vec<u8>")]
pub struct PayloadBuf {
    bytes: Arc<[u8]>,
}

impl PayloadBuf {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            bytes: Arc::from([] as [u8; 0]),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::from(bytes),
        }
    }

    /// New reference to the same underlying bytes.
    #[must_use]
    pub fn clone_ref(&self) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Sub-view of the buffer without copying.
    ///
    /// # Panics
    ///
    /// Panics if `[offset, offset + len)` is out of bounds.
    #[must_use]
    pub fn slice(&self, offset: u32, len: u32) -> &[u8] {
        let start = offset as usize;
        let end = start + len as usize;
        &self.bytes[start..end]
    }
}

impl From<Vec<u8>> for PayloadBuf {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_vec(bytes)
    }
}

impl From<PayloadBuf> for Vec<u8> {
    fn from(buf: PayloadBuf) -> Self {
        buf.bytes.to_vec()
    }
}

impl PartialEq for PayloadBuf {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for PayloadBuf {}

impl fmt::Debug for PayloadBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadBuf({} bytes)", self.bytes.len())
    }
}

/// A single recorded block-I/O write operation.
///
/// `write_sector` is the starting LBA in kernel sectors; `size` is the
/// payload length in bytes. Checkpoint records are markers only: zero size,
/// empty payload, no barrier bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWrite {
    pub write_sector: u64,
    pub size: u32,
    pub time_ns: u64,
    pub flags: WriteFlags,
    pub data: PayloadBuf,
}

impl BlockWrite {
    /// Validating constructor for records crossing the tracer boundary.
    ///
    /// `size` is the length the profile dump declares for the record; it must
    /// match the captured payload exactly (zero when there is no payload).
    pub fn new(
        write_sector: u64,
        size: u32,
        time_ns: u64,
        flags: WriteFlags,
        data: PayloadBuf,
    ) -> Result<Self, TraceError> {
        if data.len() != size as usize {
            return Err(TraceError::SizeMismatch {
                declared: size,
                actual: data.len(),
            });
        }
        if flags.is_checkpoint() && (!data.is_empty() || flags.is_barrier()) {
            return Err(TraceError::BadCheckpoint);
        }
        Ok(Self {
            write_sector,
            size,
            time_ns,
            flags,
            data,
        })
    }

    /// A checkpoint marker dividing logical test phases.
    #[must_use]
    pub fn checkpoint(time_ns: u64) -> Self {
        Self {
            write_sector: 0,
            size: 0,
            time_ns,
            flags: WriteFlags::CHECKPOINT,
            data: PayloadBuf::empty(),
        }
    }

    #[must_use]
    pub fn is_barrier(&self) -> bool {
        self.flags.is_barrier()
    }

    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.flags.is_meta()
    }

    #[must_use]
    pub fn is_checkpoint(&self) -> bool {
        self.flags.is_checkpoint()
    }
}

/// One replayable write: either a whole recorded operation or a single
/// sector-sized slice of one.
///
/// Stable contract with the replay engine:
/// - `bio_index` is the 0-based position of the originating record in the
///   profile dump (both halves of a split barrier share it).
/// - Whole ops: `is_whole_op == true`, `bio_sector_index == 0`,
///   `disk_offset == 512 * write_sector`, `data_offset == 0`.
/// - Sectors: `is_whole_op == false`, `data_offset ==
///   max_sector_size * bio_sector_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskWriteData {
    pub is_whole_op: bool,
    pub bio_index: u32,
    pub bio_sector_index: u32,
    pub disk_offset: u64,
    pub size: u32,
    pub data: PayloadBuf,
    pub data_offset: u32,
}

impl DiskWriteData {
    /// The bytes this record writes at `disk_offset`.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.data.slice(self.data_offset, self.size)
    }
}

/// Per-test log record filled in while generating a crash state.
///
/// `crash_state` is set as a side effect of generation; `last_checkpoint` is
/// the checkpoint id the proposed state ran up to (-1 when none), set by the
/// reorder strategy when it picks a crash point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLog {
    pub crash_state: Vec<DiskWriteData>,
    pub last_checkpoint: i32,
}

impl Default for TestLog {
    fn default() -> Self {
        Self {
            crash_state: Vec::new(),
            last_checkpoint: -1,
        }
    }
}
