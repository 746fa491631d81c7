//! The per-thread context: engine, reclamation, logs, and policy state.
//!
//! A [`ThreadCtx`] is created once per thread and reused across an unbounded
//! number of operations. All scoped APIs (steps and transactions) borrow it
//! mutably, which is what makes a context single-threaded by construction:
//! two scopes cannot overlap on one context.

use std::ptr::NonNull;
use std::sync::Arc;

use orestm_types::{FastRand, Timestamp};
use smallvec::SmallVec;

use crate::clock;
use crate::cm::Cm;
use crate::orec::{Orec, OreCtx};
use crate::redo_log::RedoLog;
use crate::registry::{Slot, registry};
use crate::smr::{Retired, SmrCtx};
use crate::undo_log::UndoLog;

/// An object/version pair observed during a traversal.
///
/// Step-mode searches record these so a failed attempt can resume from the
/// deepest still-valid prefix instead of the root. The pointer is erased;
/// the recording data structure knows the real node type.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    /// The observed object.
    pub obj: *mut (),
    /// The version its orec held when it was observed.
    pub ver: Timestamp,
}

/// An operation-local stack of traversal snapshots.
pub type SnapStack = SmallVec<[Snapshot; 8]>;

/// Per-thread state for every engine facility.
pub struct ThreadCtx {
    pub(crate) ore: OreCtx,
    pub(crate) smr: SmrCtx,
    pub(crate) rng: FastRand,
    pub(crate) cm: Cm,
    op_depth: u32,
    /// Orecs to validate at commit (and on extension).
    pub(crate) readset: SmallVec<[NonNull<Orec>; 32]>,
    /// Orecs a lazy transaction must acquire at commit.
    pub(crate) lockset: SmallVec<[NonNull<Orec>; 16]>,
    pub(crate) undolog: UndoLog,
    pub(crate) redolog: RedoLog,
    /// Speculative allocations, freed if the transaction aborts.
    pub(crate) mallocs: Vec<Retired>,
    /// Pending retirements, handed to SMR if the transaction commits.
    pub(crate) frees: Vec<Retired>,
    /// Set while the current transaction runs without orec instrumentation.
    pub(crate) irrevocable: bool,
}

impl ThreadCtx {
    /// Construct a context and join the global registry.
    #[must_use]
    pub fn new() -> Self {
        let slot: Arc<Slot> = registry().register();
        let ore = OreCtx::new(Arc::clone(&slot));
        let seed = clock::now_relaxed() ^ ore.lock_word();
        Self {
            smr: SmrCtx::new(slot),
            rng: FastRand::new(seed),
            cm: Cm::default(),
            op_depth: 0,
            readset: SmallVec::new(),
            lockset: SmallVec::new(),
            undolog: UndoLog::new(),
            redolog: RedoLog::new(),
            mallocs: Vec::new(),
            frees: Vec::new(),
            irrevocable: false,
            ore,
        }
    }

    /// Replace the contention manager.
    pub fn set_contention_manager(&mut self, cm: Cm) {
        self.cm = cm;
    }

    /// Start an operation (publish to reclamation).
    ///
    /// Nesting is counted, so a data structure may bracket internally even
    /// when the caller already holds an operation open.
    pub fn op_begin(&mut self) {
        if self.op_depth == 0 {
            self.smr.enter();
        }
        self.op_depth += 1;
    }

    /// End an operation (stamp retirements, maybe sweep).
    pub fn op_end(&mut self) {
        debug_assert!(self.op_depth > 0, "op_end without matching op_begin");
        self.op_depth -= 1;
        if self.op_depth == 0 {
            self.smr.exit();
        }
    }

    /// Produce a random value from the thread-local generator.
    #[inline]
    pub fn rand_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    /// Produce a random word from the thread-local generator.
    #[inline]
    pub fn rand_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// The timestamp of this thread's most recent write-scope commit.
    #[inline]
    #[must_use]
    pub fn last_wo_end_time(&self) -> Timestamp {
        self.ore.last_wo_end_time()
    }

    /// Block until every other thread's current scope started after
    /// `commit_ts`.
    ///
    /// Used to safely finalize effects that became unreachable at
    /// `commit_ts`: once quiesced, no scope that could have observed the
    /// prior state is still running.
    pub fn quiesce_after(&self, commit_ts: Timestamp) {
        registry().quiesce(commit_ts, self.ore.slot());
    }
}

impl Default for ThreadCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ThreadCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCtx")
            .field("lock_word", &self.ore.lock_word())
            .field("op_depth", &self.op_depth)
            .field("readset", &self.readset.len())
            .field("lockset", &self.lockset.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadCtx;

    #[test]
    fn op_brackets_nest() {
        let mut me = ThreadCtx::new();
        me.op_begin();
        me.op_begin(); // a map op inside a user op
        me.op_end();
        me.op_end();
    }

    #[test]
    fn contexts_get_distinct_seeds() {
        let mut a = ThreadCtx::new();
        let mut b = ThreadCtx::new();
        // Not a strong guarantee, but the lock-word XOR makes collisions
        // vanishingly unlikely.
        assert_ne!(a.rand_u64(), b.rand_u64());
    }
}
