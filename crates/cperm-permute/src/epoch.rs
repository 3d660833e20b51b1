//! Epochs, their operations, and sector-granularity decomposition.
//!
//! An `Epoch` is a maximal run of recorded writes between durability
//! barriers; reordering within an epoch is legal, across epochs is not.
//! `EpochOp::to_sectors` slices one operation into sector-sized pieces for
//! sub-record reordering, and `coalesce_sectors` reduces a sector sequence
//! to its last-writer-wins subset.

use cperm_types::{BlockWrite, DiskWriteData, KERNEL_SECTOR_SIZE, PayloadBuf};
use std::collections::HashSet;

/// A recorded write together with its absolute position in the profile dump.
///
/// Both halves of a split barrier share one `abs_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochOp {
    pub abs_index: u32,
    pub write: BlockWrite,
}

impl EpochOp {
    /// Replay record covering the whole operation.
    #[must_use]
    pub fn to_write_data(&self) -> DiskWriteData {
        DiskWriteData {
            is_whole_op: true,
            bio_index: self.abs_index,
            bio_sector_index: 0,
            disk_offset: KERNEL_SECTOR_SIZE * self.write.write_sector,
            size: self.write.size,
            data: self.write.data.clone_ref(),
            data_offset: 0,
        }
    }

    /// Decompose the operation into `ceil(size / sector_size)` sector slices.
    ///
    /// The last slice is short when the payload is not a multiple of
    /// `sector_size`.
    ///
    /// # Panics
    ///
    /// Panics if `sector_size == 0`.
    #[must_use]
    pub fn to_sectors(&self, sector_size: u32) -> Vec<EpochOpSector> {
        assert!(sector_size > 0, "sector decomposition requires sector_size > 0");

        let num_sectors = self.write.size.div_ceil(sector_size);
        let mut sectors = Vec::with_capacity(num_sectors as usize);
        for i in 0..num_sectors {
            let size = if i == num_sectors - 1 {
                self.write.size - i * sector_size
            } else {
                sector_size
            };
            sectors.push(EpochOpSector {
                bio_index: self.abs_index,
                parent_sector_index: i,
                disk_offset: KERNEL_SECTOR_SIZE * self.write.write_sector
                    + u64::from(i) * u64::from(sector_size),
                size,
                max_sector_size: sector_size,
                data: self.write.data.clone_ref(),
            });
        }
        sectors
    }
}

/// One sector-sized slice of an `EpochOp`.
///
/// The back-reference to the parent is carried as its `abs_index`
/// (`bio_index` here) plus a shared view of the parent payload, so slices
/// stay valid without an arena of parent pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochOpSector {
    pub bio_index: u32,
    pub parent_sector_index: u32,
    pub disk_offset: u64,
    pub size: u32,
    pub max_sector_size: u32,
    pub data: PayloadBuf,
}

impl EpochOpSector {
    /// The slice of the parent payload this sector covers.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.data
            .slice(self.max_sector_size * self.parent_sector_index, self.size)
    }

    /// Replay record covering this sector only.
    #[must_use]
    pub fn to_write_data(&self) -> DiskWriteData {
        DiskWriteData {
            is_whole_op: false,
            bio_index: self.bio_index,
            bio_sector_index: self.parent_sector_index,
            disk_offset: self.disk_offset,
            size: self.size,
            data: self.data.clone_ref(),
            data_offset: self.max_sector_size * self.parent_sector_index,
        }
    }
}

/// A maximal run of operations bounded by a barrier or a soft time gap.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Epoch {
    /// Operations in trace order. Once assigned here an op never moves.
    pub ops: Vec<EpochOp>,
    /// Count of ops carrying the META flag.
    pub num_meta: u32,
    /// True iff at least two ops in this epoch touch intersecting sector
    /// ranges.
    pub overlaps: bool,
    /// True iff the epoch was closed by a barrier rather than a soft gap or
    /// the end of the trace.
    pub has_barrier: bool,
    /// Checkpoint id in effect when the epoch opened, -1 before the first
    /// checkpoint.
    pub checkpoint_epoch: i32,
}

impl Epoch {
    pub(crate) fn open(checkpoint_epoch: i32) -> Self {
        Self {
            checkpoint_epoch,
            ..Self::default()
        }
    }

    pub(crate) fn push(&mut self, abs_index: u32, write: BlockWrite) {
        if write.is_meta() {
            self.num_meta += 1;
        }
        self.ops.push(EpochOp { abs_index, write });
    }
}

/// Reduce a sector sequence to its last-writer-wins subset.
///
/// For each `disk_offset` only the latest occurrence in input order is kept;
/// the kept slices preserve their relative order. A later sector write fully
/// supersedes any earlier one at the same offset for crash-state replay.
#[must_use]
pub fn coalesce_sectors(sectors: &[EpochOpSector]) -> Vec<EpochOpSector> {
    let mut seen_offsets: HashSet<u64> = HashSet::with_capacity(sectors.len());
    let mut kept = Vec::with_capacity(sectors.len());

    for sector in sectors.iter().rev() {
        if seen_offsets.insert(sector.disk_offset) {
            kept.push(sector.clone());
        }
    }

    kept.reverse();
    kept
}
