#![forbid(unsafe_code)]
//! Reference reorder strategies.
//!
//! A strategy only *proposes* candidate crash states; deduplication, retry
//! bounding, and conversion guarantees live in `cperm_permute::Permuter`.
//! `RandomPermuter` is the default workhorse: cheap proposals, relying on the
//! memo layer to discard repeats.

use cperm_permute::{Epoch, EpochOp, EpochOpSector, ReorderStrategy, coalesce_sectors};
use cperm_types::{DiskWriteData, TestLog};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Random reorder strategy.
///
/// Each proposal picks a crash epoch uniformly, replays every earlier epoch
/// completely and in order (cross-epoch reordering is never legal), and
/// finishes with a shuffled random subset of the crash epoch. Sector
/// proposals additionally coalesce the fully replayed prefix so superseded
/// sector writes drop out.
#[derive(Debug)]
pub struct RandomPermuter {
    rng: StdRng,
}

impl RandomPermuter {
    /// Seeded construction; the same seed reproduces the proposal sequence.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    #[must_use]
    pub fn from_os_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    fn shuffled_subset<T: Clone>(&mut self, pool: &[T]) -> Vec<T> {
        let keep = self.rng.gen_range(0..=pool.len());
        let mut subset: Vec<T> = pool
            .choose_multiple(&mut self.rng, keep)
            .cloned()
            .collect();
        subset.shuffle(&mut self.rng);
        subset
    }
}

impl ReorderStrategy for RandomPermuter {
    fn propose_state(
        &mut self,
        epochs: &[Epoch],
        out: &mut Vec<EpochOp>,
        log: &mut TestLog,
    ) -> bool {
        if epochs.is_empty() {
            return false;
        }

        let crash_epoch = self.rng.gen_range(0..epochs.len());
        for epoch in &epochs[..crash_epoch] {
            out.extend(epoch.ops.iter().cloned());
        }
        out.extend(self.shuffled_subset(&epochs[crash_epoch].ops));

        log.last_checkpoint = epochs[crash_epoch].checkpoint_epoch;
        trace!(
            target: "cperm::strategy",
            event = "proposal",
            granularity = "whole_op",
            crash_epoch,
            ops = out.len()
        );
        true
    }

    fn propose_sector_state(
        &mut self,
        epochs: &[Epoch],
        sector_size: u32,
        out: &mut Vec<DiskWriteData>,
        log: &mut TestLog,
    ) -> bool {
        if epochs.is_empty() {
            return false;
        }

        let crash_epoch = self.rng.gen_range(0..epochs.len());

        let prefix: Vec<EpochOpSector> = epochs[..crash_epoch]
            .iter()
            .flat_map(|e| e.ops.iter())
            .flat_map(|op| op.to_sectors(sector_size))
            .collect();
        out.extend(coalesce_sectors(&prefix).iter().map(EpochOpSector::to_write_data));

        let pool: Vec<EpochOpSector> = epochs[crash_epoch]
            .ops
            .iter()
            .flat_map(|op| op.to_sectors(sector_size))
            .collect();
        out.extend(
            self.shuffled_subset(&pool)
                .iter()
                .map(EpochOpSector::to_write_data),
        );

        log.last_checkpoint = epochs[crash_epoch].checkpoint_epoch;
        trace!(
            target: "cperm::strategy",
            event = "proposal",
            granularity = "sector",
            crash_epoch,
            writes = out.len()
        );
        true
    }
}
