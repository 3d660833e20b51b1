#![forbid(unsafe_code)]
//! Crash-state permutation core.
//!
//! Ingests a recorded block-I/O trace, reconstructs the partial order of
//! writes implied by barrier semantics (`segment`), and enumerates distinct
//! crash states for replay against a virtual disk. The reorder decision
//! itself is delegated to a [`ReorderStrategy`]; the [`Permuter`] owns the
//! epoch vector and the memo of already-emitted states, so the uniqueness
//! guarantee lives in exactly one place no matter which strategy runs.
//!
//! The core performs no I/O and never mutates the input trace. One instance
//! is single-threaded; embed one per worker.

pub mod epoch;
pub mod segment;

pub use epoch::{Epoch, EpochOp, EpochOpSector, coalesce_sectors};
pub use segment::{
    OverlapTracker, SOFT_EPOCH_GAP_NS, can_split_barrier, segment_flags, segment_soft,
    split_barrier,
};

use cperm_types::{BlockWrite, DiskWriteData, KERNEL_SECTOR_SIZE, TestLog};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Retry floor for the bounded-retry exit.
pub const MIN_RETRIES: usize = 1000;

/// Scale factor applied to the memo size when it exceeds the retry floor.
pub const RETRY_MULTIPLIER: usize = 2;

/// A reorder strategy proposes candidate crash states; the [`Permuter`]
/// deduplicates and converts them.
///
/// Implementors carry their own RNG or enumeration state. Both hooks receive
/// `out` empty and must fill it with the complete proposal; the return value
/// is `false` when the strategy believes no further states exist.
pub trait ReorderStrategy {
    /// Propose a crash state at whole-operation granularity.
    fn propose_state(
        &mut self,
        epochs: &[Epoch],
        out: &mut Vec<EpochOp>,
        log: &mut TestLog,
    ) -> bool;

    /// Propose a crash state at sector granularity, already converted to
    /// replay records.
    fn propose_sector_state(
        &mut self,
        epochs: &[Epoch],
        sector_size: u32,
        out: &mut Vec<DiskWriteData>,
        log: &mut TestLog,
    ) -> bool;
}

/// Drives a [`ReorderStrategy`] over a segmented trace, memoising every
/// emitted crash state so no state is returned twice from one instance.
#[derive(Debug)]
pub struct Permuter<S> {
    strategy: S,
    epochs: Vec<Epoch>,
    sector_size: u32,
    completed_permutations: HashSet<Vec<u32>>,
}

impl<S: ReorderStrategy> Permuter<S> {
    #[must_use]
    pub fn new(strategy: S) -> Self {
        Self {
            strategy,
            epochs: Vec::new(),
            sector_size: KERNEL_SECTOR_SIZE as u32,
            completed_permutations: HashSet::new(),
        }
    }

    /// Ingest a trace, segmenting on barrier flags alone.
    ///
    /// Replaces any previously ingested epochs. The memo of emitted states is
    /// instance state and survives re-ingestion.
    pub fn init_flag(&mut self, sector_size: u32, trace: &[BlockWrite]) {
        self.sector_size = sector_size;
        self.epochs = segment_flags(trace);
        debug!(
            target: "cperm::segment",
            event = "ingest",
            mode = "flag",
            records = trace.len(),
            epochs = self.epochs.len()
        );
    }

    /// Ingest a trace, segmenting on barrier flags plus soft time gaps.
    pub fn init_soft(&mut self, sector_size: u32, trace: &[BlockWrite]) {
        self.sector_size = sector_size;
        self.epochs = segment_soft(trace);
        debug!(
            target: "cperm::segment",
            event = "ingest",
            mode = "soft",
            records = trace.len(),
            epochs = self.epochs.len()
        );
    }

    /// Read-only view of the segmented trace, consumed by strategies.
    #[must_use]
    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    #[must_use]
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Produce the next distinct crash state at whole-operation granularity.
    ///
    /// Returns `(new_state, crash_state)` and sets `log.crash_state` as a
    /// side effect. `false` means the state space is likely exhausted: the
    /// strategy gave up, or no unseen state surfaced within the retry bound.
    pub fn generate_crash_state(&mut self, log: &mut TestLog) -> (bool, Vec<DiskWriteData>) {
        let mut proposal: Vec<EpochOp> = Vec::new();
        let mut key: Vec<u32> = Vec::new();
        let max_retries = self.max_retries();
        let mut retries = 0_usize;
        let new_state;
        let exists;

        loop {
            proposal.clear();
            let fresh = self.strategy.propose_state(&self.epochs, &mut proposal, log);

            key.clear();
            key.extend(proposal.iter().map(|op| op.abs_index));

            retries += 1;
            let dup = self.completed_permutations.contains(&key);
            if !fresh || retries >= max_retries {
                new_state = fresh;
                exists = dup;
                break;
            }
            if !dup {
                new_state = fresh;
                exists = false;
                break;
            }
            trace!(target: "cperm::generate", event = "duplicate_state", retries);
        }

        let crash_state: Vec<DiskWriteData> = proposal.iter().map(EpochOp::to_write_data).collect();
        log.crash_state.clone_from(&crash_state);

        if exists {
            debug!(
                target: "cperm::generate",
                event = "retries_exhausted",
                retries,
                memo = self.completed_permutations.len()
            );
            return (false, crash_state);
        }

        self.completed_permutations.insert(std::mem::take(&mut key));
        (new_state, crash_state)
    }

    /// Produce the next distinct crash state at sector granularity.
    ///
    /// The memo key interleaves `(bio_index, bio_sector_index)` pairs so two
    /// states differing only in which sector of an op they include are
    /// distinct.
    pub fn generate_sector_crash_state(&mut self, log: &mut TestLog) -> (bool, Vec<DiskWriteData>) {
        let mut proposal: Vec<DiskWriteData> = Vec::new();
        let mut key: Vec<u32> = Vec::new();
        let max_retries = self.max_retries();
        let mut retries = 0_usize;
        let new_state;
        let exists;

        loop {
            proposal.clear();
            let fresh = self.strategy.propose_sector_state(
                &self.epochs,
                self.sector_size,
                &mut proposal,
                log,
            );

            key.clear();
            for wd in &proposal {
                key.push(wd.bio_index);
                key.push(wd.bio_sector_index);
            }

            retries += 1;
            let dup = self.completed_permutations.contains(&key);
            if !fresh || retries >= max_retries {
                new_state = fresh;
                exists = dup;
                break;
            }
            if !dup {
                new_state = fresh;
                exists = false;
                break;
            }
            trace!(target: "cperm::generate", event = "duplicate_state", retries);
        }

        log.crash_state.clone_from(&proposal);

        if exists {
            debug!(
                target: "cperm::generate",
                event = "retries_exhausted",
                retries,
                memo = self.completed_permutations.len()
            );
            return (false, proposal);
        }

        self.completed_permutations.insert(std::mem::take(&mut key));
        (new_state, proposal)
    }

    fn max_retries(&self) -> usize {
        (RETRY_MULTIPLIER * self.completed_permutations.len()).max(MIN_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cperm_types::{PayloadBuf, WriteFlags};

    fn trace_of(n: u32) -> Vec<BlockWrite> {
        (0..n)
            .map(|i| {
                BlockWrite::new(
                    u64::from(i) * 8,
                    512,
                    0,
                    WriteFlags::WRITE,
                    PayloadBuf::from_vec(vec![i as u8; 512]),
                )
                .expect("valid test record")
            })
            .collect()
    }

    /// Strategy scripted from a list of abs-index prefixes over a single
    /// epoch; repeats its last answer with `false` once exhausted.
    struct Scripted {
        states: Vec<Vec<u32>>,
        next: usize,
        calls: usize,
    }

    impl Scripted {
        fn new(states: Vec<Vec<u32>>) -> Self {
            Self {
                states,
                next: 0,
                calls: 0,
            }
        }

        fn emit(&mut self) -> (Vec<u32>, bool) {
            self.calls += 1;
            if self.next < self.states.len() {
                let state = self.states[self.next].clone();
                self.next += 1;
                (state, true)
            } else {
                (self.states.last().cloned().unwrap_or_default(), false)
            }
        }
    }

    impl ReorderStrategy for Scripted {
        fn propose_state(
            &mut self,
            epochs: &[Epoch],
            out: &mut Vec<EpochOp>,
            _log: &mut TestLog,
        ) -> bool {
            let (indices, fresh) = self.emit();
            for abs in indices {
                for e in epochs {
                    if let Some(op) = e.ops.iter().find(|op| op.abs_index == abs) {
                        out.push(op.clone());
                    }
                }
            }
            fresh
        }

        fn propose_sector_state(
            &mut self,
            epochs: &[Epoch],
            sector_size: u32,
            out: &mut Vec<DiskWriteData>,
            _log: &mut TestLog,
        ) -> bool {
            let (indices, fresh) = self.emit();
            for abs in indices {
                for e in epochs {
                    if let Some(op) = e.ops.iter().find(|op| op.abs_index == abs) {
                        out.extend(op.to_sectors(sector_size).iter().map(|s| s.to_write_data()));
                    }
                }
            }
            fresh
        }
    }

    /// Strategy that keeps proposing states from a closure.
    struct FnStrategy<F>(F);

    impl<F> ReorderStrategy for FnStrategy<F>
    where
        F: FnMut(&[Epoch], &mut Vec<EpochOp>) -> bool,
    {
        fn propose_state(
            &mut self,
            epochs: &[Epoch],
            out: &mut Vec<EpochOp>,
            _log: &mut TestLog,
        ) -> bool {
            (self.0)(epochs, out)
        }

        fn propose_sector_state(
            &mut self,
            _epochs: &[Epoch],
            _sector_size: u32,
            _out: &mut Vec<DiskWriteData>,
            _log: &mut TestLog,
        ) -> bool {
            false
        }
    }

    #[test]
    fn empty_trace_with_empty_strategy_returns_false() {
        let mut permuter = Permuter::new(Scripted::new(Vec::new()));
        permuter.init_flag(512, &[]);
        assert!(permuter.epochs().is_empty());

        let mut log = TestLog::default();
        let (new_state, crash_state) = permuter.generate_crash_state(&mut log);
        assert!(!new_state);
        assert!(crash_state.is_empty());
        assert!(log.crash_state.is_empty());
    }

    #[test]
    fn crash_state_is_converted_and_logged() {
        let mut permuter = Permuter::new(Scripted::new(vec![vec![0, 2]]));
        permuter.init_flag(512, &trace_of(3));

        let mut log = TestLog::default();
        let (new_state, crash_state) = permuter.generate_crash_state(&mut log);
        assert!(new_state);
        assert_eq!(crash_state.len(), 2);
        assert!(crash_state[0].is_whole_op);
        assert_eq!(crash_state[0].bio_index, 0);
        assert_eq!(crash_state[1].bio_index, 2);
        assert_eq!(crash_state[1].disk_offset, 16 * 512);
        assert_eq!(log.crash_state, crash_state);
    }

    #[test]
    fn duplicate_proposals_are_retried_until_fresh() {
        let mut permuter = Permuter::new(Scripted::new(vec![
            vec![0, 1],
            vec![0, 1],
            vec![0, 1],
            vec![0, 2],
        ]));
        permuter.init_flag(512, &trace_of(3));

        let mut log = TestLog::default();
        let (first, state) = permuter.generate_crash_state(&mut log);
        assert!(first);
        assert_eq!(state.len(), 2);

        let (second, state) = permuter.generate_crash_state(&mut log);
        assert!(second);
        let indices: Vec<u32> = state.iter().map(|wd| wd.bio_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn strategy_exhaustion_returns_false_and_keeps_memo_clean() {
        let mut permuter = Permuter::new(Scripted::new(vec![vec![0]]));
        permuter.init_flag(512, &trace_of(1));

        let mut log = TestLog::default();
        assert!(permuter.generate_crash_state(&mut log).0);
        // Script exhausted: strategy repeats [0] with fresh == false; the
        // duplicate must not be re-emitted as new.
        let (again, _) = permuter.generate_crash_state(&mut log);
        assert!(!again);
    }

    #[test]
    fn retry_bound_is_floor_when_memo_is_small() {
        let mut permuter = Permuter::new(FnStrategy(|epochs: &[Epoch], out: &mut Vec<EpochOp>| {
            // Always propose the full single epoch; fresh forever.
            if let Some(e) = epochs.first() {
                out.extend(e.ops.iter().cloned());
            }
            true
        }));
        permuter.init_flag(512, &trace_of(2));

        let mut log = TestLog::default();
        assert!(permuter.generate_crash_state(&mut log).0);

        // Second call can only re-propose the memoised state; the loop must
        // give up after MIN_RETRIES attempts and return false.
        let (new_state, state) = permuter.generate_crash_state(&mut log);
        assert!(!new_state);
        assert_eq!(state.len(), 2);
        assert_eq!(log.crash_state.len(), 2);
    }

    #[test]
    fn retry_bound_counts_proposals() {
        let calls = std::rc::Rc::new(std::cell::Cell::new(0_usize));
        let calls_in = std::rc::Rc::clone(&calls);
        let mut permuter = Permuter::new(FnStrategy(move |epochs: &[Epoch], out: &mut Vec<EpochOp>| {
            calls_in.set(calls_in.get() + 1);
            if let Some(e) = epochs.first() {
                out.push(e.ops[0].clone());
            }
            true
        }));
        permuter.init_flag(512, &trace_of(1));

        let mut log = TestLog::default();
        assert!(permuter.generate_crash_state(&mut log).0);
        calls.set(0);
        assert!(!permuter.generate_crash_state(&mut log).0);
        // Memo holds one state, so the bound is the floor.
        assert_eq!(calls.get(), MIN_RETRIES);
    }

    #[test]
    fn whole_op_states_are_never_repeated() {
        // Script cycles through every subset of {0,1}; the memo must emit
        // each exactly once.
        let mut permuter = Permuter::new(Scripted::new(vec![
            vec![],
            vec![0],
            vec![0],
            vec![0, 1],
            vec![1],
            vec![1],
        ]));
        permuter.init_flag(512, &trace_of(2));

        let mut log = TestLog::default();
        let mut seen: HashSet<Vec<u32>> = HashSet::new();
        loop {
            let (new_state, state) = permuter.generate_crash_state(&mut log);
            if !new_state {
                break;
            }
            let key: Vec<u32> = state.iter().map(|wd| wd.bio_index).collect();
            assert!(seen.insert(key), "crash state emitted twice");
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn sector_states_key_on_bio_and_sector_index() {
        // One two-sector op: proposals covering sector 0 vs sector 1 are
        // distinct states even though the bio index matches.
        let trace = vec![
            BlockWrite::new(
                0,
                1024,
                0,
                WriteFlags::WRITE,
                PayloadBuf::from_vec(vec![7; 1024]),
            )
            .expect("valid test record"),
        ];

        struct OneSector {
            turn: usize,
        }
        impl ReorderStrategy for OneSector {
            fn propose_state(
                &mut self,
                _epochs: &[Epoch],
                _out: &mut Vec<EpochOp>,
                _log: &mut TestLog,
            ) -> bool {
                false
            }

            fn propose_sector_state(
                &mut self,
                epochs: &[Epoch],
                sector_size: u32,
                out: &mut Vec<DiskWriteData>,
                _log: &mut TestLog,
            ) -> bool {
                let sectors = epochs[0].ops[0].to_sectors(sector_size);
                out.push(sectors[self.turn % 2].to_write_data());
                self.turn += 1;
                true
            }
        }

        let mut permuter = Permuter::new(OneSector { turn: 0 });
        permuter.init_flag(512, &trace);

        let mut log = TestLog::default();
        let (first, state) = permuter.generate_sector_crash_state(&mut log);
        assert!(first);
        assert_eq!(state[0].bio_sector_index, 0);

        let (second, state) = permuter.generate_sector_crash_state(&mut log);
        assert!(second);
        assert_eq!(state[0].bio_sector_index, 1);
        assert!(!state[0].is_whole_op);
        assert_eq!(state[0].data_offset, 512);
        assert_eq!(log.crash_state, state);
    }

    #[test]
    fn memo_survives_reingestion() {
        let mut permuter = Permuter::new(Scripted::new(vec![vec![0], vec![0]]));
        permuter.init_flag(512, &trace_of(1));
        let mut log = TestLog::default();
        assert!(permuter.generate_crash_state(&mut log).0);

        permuter.init_flag(512, &trace_of(1));
        assert_eq!(permuter.epochs().len(), 1);
        // Same proposal after re-init is still a duplicate.
        let (new_state, _) = permuter.generate_crash_state(&mut log);
        assert!(!new_state);
    }
}
