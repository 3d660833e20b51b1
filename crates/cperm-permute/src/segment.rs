//! Trace segmentation: turning a flat bio stream into ordered epochs.
//!
//! Two walks over the recorded trace are provided. `segment_flags` splits on
//! durability barriers alone, which is the pessimistic model: nothing is
//! persisted until a flush/FUA is seen. `segment_soft` additionally splits
//! when enough wall-clock time passed between two submissions, modeling a
//! disk that destages cached data on its own.

use crate::epoch::Epoch;
use cperm_types::{BlockWrite, PayloadBuf, WriteFlags};
use tracing::{debug, trace};

/// Minimum submission gap that ends a soft epoch: 2.5 seconds.
pub const SOFT_EPOCH_GAP_NS: u64 = 2_500_000_000;

/// Sorted list of sector ranges written within the current epoch.
///
/// Answers "does this write overlap anything already in the epoch" while
/// registering the write. After an extension the tracker does not re-merge a
/// range with its neighbours; ranges may become adjacent or overlapping.
/// The only contract is the returned overlap boolean.
#[derive(Debug, Default)]
pub struct OverlapTracker {
    ranges: Vec<(u64, u64)>,
}

impl OverlapTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Register `write` and report whether it intersects a previously
    /// registered range.
    ///
    /// The range is `[write_sector, write_sector + size - 1]` with `size`
    /// taken as recorded; the end saturates so zero-sized writes produce a
    /// degenerate range instead of wrapping.
    pub fn record(&mut self, write: &BlockWrite) -> bool {
        let start = write.write_sector;
        let end = (start + u64::from(write.size)).saturating_sub(1);

        for i in 0..self.ranges.len() {
            let (range_start, range_end) = self.ranges[i];
            if (range_start <= start && start <= range_end)
                || (range_start <= end && end <= range_end)
                || (start <= range_start && range_end <= end)
            {
                self.ranges[i] = (range_start.min(start), range_end.max(end));
                return true;
            }
            if range_start > end {
                // Sorted list: nothing further can intersect, so this is the
                // insertion point.
                self.ranges.insert(i, (start, end));
                return false;
            }
        }

        self.ranges.push((start, end));
        false
    }
}

/// Can `write` be divided into a flush half and a data half?
///
/// A pure flush promises durability of previously submitted data and says
/// nothing about this operation's payload, so the payload is legal only from
/// the next epoch onward. FUA co-persists the payload with the flush and must
/// not be split.
#[must_use]
pub fn can_split_barrier(write: &BlockWrite) -> bool {
    (write.flags.has_flush_flag() || write.flags.has_flush_seq_flag())
        && write.flags.has_write_flag()
        && !write.flags.has_fua_flag()
        && write.size > 0
}

/// Split a barrier-with-data operation into (flush half, data half).
///
/// The flush half keeps the original flags with zero size and empty payload;
/// the data half keeps the payload with FLUSH/FLUSH_SEQ cleared.
///
/// # Panics
///
/// Panics if `write` fails the `can_split_barrier` predicate; guarding is the
/// caller's responsibility.
#[must_use]
pub fn split_barrier(write: &BlockWrite) -> (BlockWrite, BlockWrite) {
    assert!(
        can_split_barrier(write),
        "split requested for a non-splittable barrier"
    );

    let flush_half = BlockWrite {
        write_sector: write.write_sector,
        size: 0,
        time_ns: write.time_ns,
        flags: write.flags,
        data: PayloadBuf::empty(),
    };
    let data_half = BlockWrite {
        flags: write.flags.without(WriteFlags::FLUSH | WriteFlags::FLUSH_SEQ),
        ..write.clone()
    };
    (flush_half, data_half)
}

fn open_epoch<'a>(
    epochs: &'a mut Vec<Epoch>,
    tracker: &mut OverlapTracker,
    checkpoint_epoch: i32,
) -> &'a mut Epoch {
    tracker.clear();
    epochs.push(Epoch::open(checkpoint_epoch));
    trace!(
        target: "cperm::segment",
        event = "epoch_open",
        index = epochs.len() - 1,
        checkpoint_epoch
    );
    let last = epochs.len() - 1;
    &mut epochs[last]
}

/// Segment the trace on barrier flags alone.
///
/// Epochs open lazily: the first non-checkpoint record after a closing
/// barrier opens the next one. A splittable barrier closes the current epoch
/// with its flush half and leaves the data half's epoch current, so a
/// following write joins that same epoch.
#[must_use]
pub fn segment_flags(trace: &[BlockWrite]) -> Vec<Epoch> {
    let mut epochs: Vec<Epoch> = Vec::new();
    let mut tracker = OverlapTracker::new();
    let mut checkpoint_epoch = -1_i32;
    let mut abs_index = 0_u32;
    let mut open = false;

    for write in trace {
        if !open {
            open_epoch(&mut epochs, &mut tracker, checkpoint_epoch);
            open = true;
        }
        let last = epochs.len() - 1;

        if write.is_checkpoint() {
            // Checkpoints are markers: bump the counter, restamp the current
            // epoch, and keep them out of the op stream.
            checkpoint_epoch += 1;
            epochs[last].checkpoint_epoch = checkpoint_epoch;
        } else if !write.is_barrier() {
            if tracker.record(write) {
                epochs[last].overlaps = true;
            }
            epochs[last].push(abs_index, write.clone());
        } else if can_split_barrier(write) {
            let (flush_half, data_half) = split_barrier(write);
            debug!(
                target: "cperm::segment",
                event = "barrier_split",
                abs_index,
                size = data_half.size
            );
            epochs[last].push(abs_index, flush_half);
            epochs[last].has_barrier = true;

            let next = open_epoch(&mut epochs, &mut tracker, checkpoint_epoch);
            tracker.record(&data_half);
            next.push(abs_index, data_half);
            // The new epoch stays current: a following write joins it.
        } else {
            epochs[last].push(abs_index, write.clone());
            epochs[last].has_barrier = true;
            open = false;
        }

        abs_index += 1;
    }

    epochs
}

/// Segment the trace on barrier flags plus submission-time gaps.
///
/// A gap of at least [`SOFT_EPOCH_GAP_NS`] between two non-barrier writes
/// ends the current epoch. Times are never compared across a barrier. A
/// checkpoint restamps the current epoch only while it is still empty, so the
/// checkpoint attaches to the upcoming epoch rather than retroactively to one
/// that already received writes.
#[must_use]
pub fn segment_soft(trace: &[BlockWrite]) -> Vec<Epoch> {
    let mut epochs: Vec<Epoch> = Vec::new();
    let mut tracker = OverlapTracker::new();
    let mut checkpoint_epoch = -1_i32;
    let mut abs_index = 0_u32;
    // 0 means "no comparable submission yet"; reset after every barrier.
    let mut last_time_ns = 0_u64;

    open_epoch(&mut epochs, &mut tracker, checkpoint_epoch);

    for write in trace {
        let last = epochs.len() - 1;

        if write.is_checkpoint() {
            checkpoint_epoch += 1;
            if epochs[last].ops.is_empty() {
                epochs[last].checkpoint_epoch = checkpoint_epoch;
            }
        } else if !write.is_barrier() {
            if last_time_ns > 0 && write.time_ns.saturating_sub(last_time_ns) >= SOFT_EPOCH_GAP_NS {
                debug!(
                    target: "cperm::segment",
                    event = "soft_gap",
                    abs_index,
                    gap_ns = write.time_ns.saturating_sub(last_time_ns)
                );
                open_epoch(&mut epochs, &mut tracker, checkpoint_epoch);
            }
            let last = epochs.len() - 1;
            epochs[last].push(abs_index, write.clone());
            last_time_ns = write.time_ns;
            if tracker.record(write) {
                epochs[last].overlaps = true;
            }
        } else {
            if can_split_barrier(write) {
                let (flush_half, data_half) = split_barrier(write);
                debug!(
                    target: "cperm::segment",
                    event = "barrier_split",
                    abs_index,
                    size = data_half.size
                );
                epochs[last].push(abs_index, flush_half);
                epochs[last].has_barrier = true;

                let next = open_epoch(&mut epochs, &mut tracker, checkpoint_epoch);
                tracker.record(&data_half);
                next.push(abs_index, data_half);
            } else {
                epochs[last].push(abs_index, write.clone());
                epochs[last].has_barrier = true;
                open_epoch(&mut epochs, &mut tracker, checkpoint_epoch);
            }
            last_time_ns = 0;
        }

        abs_index += 1;
    }

    // Eager epoch switching can leave an empty trailing epoch that marks
    // nothing new; drop it unless a checkpoint advanced in between.
    if epochs.len() > 1 {
        let n = epochs.len();
        if epochs[n - 1].ops.is_empty()
            && epochs[n - 1].checkpoint_epoch == epochs[n - 2].checkpoint_epoch
        {
            epochs.pop();
        }
    }

    epochs
}
