//! Ownership records and the per-thread engine context.
//!
//! An orec publishes, in one atomic word, either the timestamp at which its
//! group of locations last changed or the identity of the thread currently
//! entitled to change them. [`OreCtx`] is the per-thread mechanism for
//! reading and safely writing orecs. It is deliberately only a mechanism:
//! it does not touch program data, validate read sets, or reclaim memory.
//! The scoped-context and field layers build those protocols on top.
//!
//! An `OreCtx` is a reusable descriptor: one per thread, reused across an
//! unbounded number of operations.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use orestm_types::{END_OF_TIME, Timestamp};
use smallvec::SmallVec;

use crate::clock;
use crate::registry::{Slot, registry};

/// The MSB is the lock bit for orecs.
pub(crate) const LOCK_BIT: u64 = 1 << 63;

/// Issues each context a distinct low-63-bit identity for its lock word.
static NEXT_CTX_ID: AtomicU64 = AtomicU64::new(1);

/// How orecs should be released during an unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwind {
    /// Restore each acquired orec to the value it held before acquisition.
    /// Correct for commit-time write-back, where aborting leaves memory
    /// untouched.
    Rollback,
    /// Restore each acquired orec to one *past* its pre-acquisition value,
    /// guaranteeing a version change. Required by check-once read protocols
    /// combined with undo logging, where aborting rewrites memory.
    Bump,
}

/// An ownership record: a versioned lock word plus the owner's saved
/// previous value.
///
/// `curr` encodes one of:
/// - a commit timestamp (MSB clear, value at most the last clock reading),
/// - the lock word of the owning context (MSB set), or
/// - [`END_OF_TIME`], which validation routines use as a failure sentinel.
///
/// The only way `curr` transitions from a timestamp to a lock word is a CAS
/// by an acquiring context; the only way it returns to a timestamp is a
/// store by the owner at release. `prev` is written by the owner at
/// acquisition and read only by the owner.
pub struct Orec {
    curr: AtomicU64,
    /// Owner-private; atomic only so the struct stays `Sync` without an
    /// `UnsafeCell`, always accessed relaxed.
    prev: AtomicU64,
}

impl Orec {
    /// Construct an unheld orec with version 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            curr: AtomicU64::new(0),
            prev: AtomicU64::new(0),
        }
    }

    #[inline]
    fn load_acquire(&self) -> u64 {
        self.curr.load(Ordering::Acquire)
    }
}

impl Default for Orec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Orec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let curr = self.curr.load(Ordering::Relaxed);
        f.debug_struct("Orec")
            .field("locked", &(curr & LOCK_BIT != 0))
            .field("value", &(curr & !LOCK_BIT))
            .finish()
    }
}

/// Per-thread engine context: the state needed to read orecs, acquire them,
/// and release them to new timestamps.
pub struct OreCtx {
    /// Registry slot whose `scope_ts` doubles as this context's published
    /// start time.
    slot: Arc<Slot>,
    /// This thread's unique lock word (MSB plus context id).
    my_lock: u64,
    /// All orecs held by the current write scope.
    ///
    /// Entries are pointers rather than borrows because a scope outlives any
    /// single call; the SMR contract keeps every acquired orec's ownable
    /// alive until release (an ownable is only retired by a scope that owns
    /// its orec, and reclamation waits for all concurrent operations).
    locks: SmallVec<[NonNull<Orec>; 16]>,
    /// Time of the last write-scope release.
    last_wo_end_time: Timestamp,
    /// Set between `unwind` and the scope-closing `wo_end`, which it turns
    /// into a no-op.
    unwound: bool,
}

impl OreCtx {
    /// Construct a context, claiming a registry slot and a unique lock word.
    pub(crate) fn new(slot: Arc<Slot>) -> Self {
        let id = NEXT_CTX_ID.fetch_add(1, Ordering::Relaxed);
        assert!(id < LOCK_BIT, "context id space exhausted");
        Self {
            slot,
            my_lock: LOCK_BIT | id,
            locks: SmallVec::new(),
            last_wo_end_time: 0,
            unwound: false,
        }
    }

    /// The registry slot backing this context.
    pub(crate) fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }

    /// This context's lock word.
    #[inline]
    #[must_use]
    pub fn lock_word(&self) -> u64 {
        self.my_lock
    }

    /// The start time of the current scope, or [`END_OF_TIME`] when idle.
    #[inline]
    #[must_use]
    pub fn start_time(&self) -> Timestamp {
        self.slot.scope_ts.load(Ordering::Relaxed)
    }

    /// The timestamp returned by the most recent write-scope release.
    #[inline]
    #[must_use]
    pub fn last_wo_end_time(&self) -> Timestamp {
        self.last_wo_end_time
    }

    /// Begin a read scope: publish a fresh start time.
    ///
    /// The swap is sequentially consistent so that every subsequent orec
    /// read happens after the publication is visible; without that, a
    /// reclaimer could miss this scope and free something it is about to
    /// read.
    pub fn ro_begin(&mut self) {
        let time = clock::now_relaxed();
        self.slot.scope_ts.swap(time, Ordering::SeqCst);
    }

    /// End a read scope: publish idle.
    pub fn ro_end(&mut self) {
        self.slot.scope_ts.swap(END_OF_TIME, Ordering::SeqCst);
    }

    /// Begin a write scope.
    pub fn wo_begin(&mut self) {
        let time = clock::now_relaxed();
        self.slot.scope_ts.swap(time, Ordering::SeqCst);
        self.unwound = false;
    }

    /// Check that `orec` is not too new and not locked by another thread.
    ///
    /// Returns the observed value on success, [`END_OF_TIME`] on failure.
    #[inline]
    #[must_use]
    pub fn check_orec(&self, orec: &Orec) -> Timestamp {
        let res = orec.load_acquire();
        if res <= self.start_time() || res == self.my_lock {
            res
        } else {
            END_OF_TIME
        }
    }

    /// [`OreCtx::check_orec`], additionally reporting whether the orec was
    /// locked (by anyone) at the time of the check.
    #[inline]
    #[must_use]
    pub fn check_orec_locked(&self, orec: &Orec) -> (Timestamp, bool) {
        let res = orec.load_acquire();
        let locked = res & LOCK_BIT != 0;
        if res <= self.start_time() || res == self.my_lock {
            (res, locked)
        } else {
            (END_OF_TIME, locked)
        }
    }

    /// Check that `orec`'s value is still at most `val`.
    #[inline]
    #[must_use]
    pub fn check_continuation(&self, orec: &Orec, val: Timestamp) -> bool {
        orec.load_acquire() <= val
    }

    /// [`OreCtx::check_continuation`], additionally reporting whether the
    /// caller owns the orec.
    #[inline]
    #[must_use]
    pub fn check_continuation_mine(&self, orec: &Orec, val: Timestamp) -> (bool, bool) {
        let res = orec.load_acquire();
        (res <= val, res == self.my_lock)
    }

    /// Acquire `orec` if its version is consistent with this scope's start
    /// time. Idempotent for orecs the caller already owns.
    #[must_use]
    pub fn acquire_consistent(&mut self, orec: &Orec) -> bool {
        let val = orec.curr.load(Ordering::Relaxed);
        if val == self.my_lock {
            return true;
        }
        if val > self.start_time() {
            // Subsumes the lock-bit check: lock words exceed any timestamp.
            return false;
        }
        if orec
            .curr
            .compare_exchange(val, self.my_lock, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        orec.prev.store(val, Ordering::Relaxed);
        self.locks.push(NonNull::from(orec));
        true
    }

    /// [`OreCtx::acquire_consistent`], additionally reporting whether the
    /// failure (or prior success) was due to the orec being locked.
    #[must_use]
    pub fn acquire_consistent_locked(&mut self, orec: &Orec) -> (bool, bool) {
        let val = orec.curr.load(Ordering::Relaxed);
        if val == self.my_lock {
            return (true, true);
        }
        if val > self.start_time() {
            return (false, val & LOCK_BIT != 0);
        }
        if orec
            .curr
            .compare_exchange(val, self.my_lock, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return (false, false);
        }
        orec.prev.store(val, Ordering::Relaxed);
        self.locks.push(NonNull::from(orec));
        (true, false)
    }

    /// Acquire `orec` only if its value is still at most `val`, chaining a
    /// writer acquisition onto a previous read's observed version.
    #[must_use]
    pub fn acquire_continuation(&mut self, orec: &Orec, val: Timestamp) -> bool {
        let observed = orec.curr.load(Ordering::Relaxed);
        if observed > val {
            return observed == self.my_lock;
        }
        if orec
            .curr
            .compare_exchange(observed, self.my_lock, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        orec.prev.store(observed, Ordering::Relaxed);
        self.locks.push(NonNull::from(orec));
        true
    }

    /// Acquire `orec` regardless of its timestamp, failing only if another
    /// thread holds it.
    #[must_use]
    pub fn acquire_aggressive(&mut self, orec: &Orec) -> bool {
        let val = orec.curr.load(Ordering::Relaxed);
        if val & LOCK_BIT != 0 {
            // If it's locked, it had better be ours.
            return val == self.my_lock;
        }
        if orec
            .curr
            .compare_exchange(val, self.my_lock, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            orec.prev.store(val, Ordering::Relaxed);
            self.locks.push(NonNull::from(orec));
            return true;
        }
        false
    }

    /// Whether the current operation holds any orecs.
    #[inline]
    #[must_use]
    pub fn has_orecs(&self) -> bool {
        !self.locks.is_empty()
    }

    /// End a write scope, advancing every held orec to a fresh timestamp.
    ///
    /// Safe to call after [`OreCtx::unwind`], in which case it only clears
    /// the unwound flag. The clock is read *after* the scope is published
    /// idle, and the release stores carry that value, which is the
    /// linearization point of the scope.
    pub fn wo_end(&mut self) {
        if self.unwound {
            self.unwound = false;
            return;
        }
        self.slot.scope_ts.swap(END_OF_TIME, Ordering::SeqCst);
        self.last_wo_end_time = clock::now_relaxed();
        for orec in self.locks.drain(..) {
            // SAFETY: each entry was pushed by an acquire_* call this scope;
            // the owning ownable cannot have been reclaimed while we hold
            // its orec (see `locks` field invariant).
            let orec = unsafe { orec.as_ref() };
            orec.curr.store(self.last_wo_end_time, Ordering::Release);
        }
    }

    /// Undo writes to orecs, turning the scope-closing `wo_end` into a
    /// no-op.
    pub fn unwind(&mut self, how: Unwind) {
        self.unwound = true;
        self.slot.scope_ts.swap(END_OF_TIME, Ordering::SeqCst);
        for orec in self.locks.drain(..) {
            // SAFETY: as in `wo_end`.
            let orec = unsafe { orec.as_ref() };
            let prev = orec.prev.load(Ordering::Relaxed);
            let restored = match how {
                Unwind::Rollback => prev,
                // prev was a committed timestamp, so prev + 1 cannot exceed
                // the (strictly monotone, already-advanced) clock.
                Unwind::Bump => prev + 1,
            };
            orec.curr.store(restored, Ordering::Release);
        }
    }
}

impl Drop for OreCtx {
    fn drop(&mut self) {
        debug_assert!(!self.has_orecs(), "context dropped while holding orecs");
        registry().release(&self.slot);
    }
}

#[cfg(test)]
mod tests {
    use orestm_types::END_OF_TIME;

    use super::{Orec, OreCtx, Unwind};
    use crate::registry::registry;

    fn ctx() -> OreCtx {
        OreCtx::new(registry().register())
    }

    #[test]
    fn fresh_orec_checks_clean_inside_a_scope() {
        let mut me = ctx();
        let orec = Orec::new();
        me.ro_begin();
        assert_ne!(me.check_orec(&orec), END_OF_TIME);
        let (ts, locked) = me.check_orec_locked(&orec);
        assert_eq!(ts, 0);
        assert!(!locked);
        me.ro_end();
    }

    #[test]
    fn acquire_release_advances_the_version() {
        let mut me = ctx();
        let orec = Orec::new();

        me.wo_begin();
        assert!(me.acquire_consistent(&orec));
        assert!(me.has_orecs());
        // Re-acquisition of an owned orec is idempotent.
        assert!(me.acquire_consistent(&orec));
        me.wo_end();

        let committed = me.last_wo_end_time();
        assert!(committed > 0);

        // A later scope sees the new version as consistent.
        me.ro_begin();
        assert_eq!(me.check_orec(&orec), committed);
        me.ro_end();
    }

    #[test]
    fn locked_orec_fails_other_contexts() {
        let mut a = ctx();
        let mut b = ctx();
        let orec = Orec::new();

        a.wo_begin();
        assert!(a.acquire_consistent(&orec));

        b.wo_begin();
        assert!(!b.acquire_consistent(&orec));
        let (acquired, locked) = b.acquire_consistent_locked(&orec);
        assert!(!acquired);
        assert!(locked);
        assert_eq!(b.check_orec(&orec), END_OF_TIME);
        assert!(!b.acquire_aggressive(&orec));
        b.wo_end();

        a.wo_end();

        // After release, b can acquire.
        b.wo_begin();
        assert!(b.acquire_aggressive(&orec));
        b.wo_end();
    }

    #[test]
    fn stale_orec_fails_consistent_but_not_aggressive() {
        let mut a = ctx();
        let mut b = ctx();
        let orec = Orec::new();

        // b opens its scope first, then a commits through the orec, making
        // it newer than b's start time.
        b.wo_begin();
        a.wo_begin();
        assert!(a.acquire_consistent(&orec));
        a.wo_end();

        assert!(!b.acquire_consistent(&orec));
        assert!(b.acquire_aggressive(&orec));
        b.wo_end();
    }

    #[test]
    fn unwind_rollback_restores_the_old_version() {
        let mut me = ctx();
        let orec = Orec::new();

        me.wo_begin();
        assert!(me.acquire_consistent(&orec));
        me.unwind(Unwind::Rollback);
        me.wo_end(); // must be a no-op

        me.ro_begin();
        assert_eq!(me.check_orec(&orec), 0);
        me.ro_end();
    }

    #[test]
    fn unwind_bump_changes_the_version() {
        let mut me = ctx();
        let orec = Orec::new();

        me.wo_begin();
        assert!(me.acquire_consistent(&orec));
        me.unwind(Unwind::Bump);
        me.wo_end();

        me.ro_begin();
        assert_eq!(me.check_orec(&orec), 1);
        me.ro_end();
    }

    #[test]
    fn continuation_checks_compare_against_the_recorded_version() {
        let mut a = ctx();
        let mut b = ctx();
        let orec = Orec::new();

        a.ro_begin();
        let seen = a.check_orec(&orec);
        a.ro_end();
        assert_ne!(seen, END_OF_TIME);

        // Untouched orec: the continuation holds.
        assert!(a.check_continuation(&orec, seen));

        // Another thread commits through it: the continuation breaks.
        b.wo_begin();
        assert!(b.acquire_consistent(&orec));
        b.wo_end();
        assert!(!a.check_continuation(&orec, seen));

        // But the new owner itself reports `mine` while holding it.
        b.wo_begin();
        assert!(b.acquire_consistent(&orec));
        let (ok, mine) = b.check_continuation_mine(&orec, seen);
        assert!(!ok);
        assert!(mine);
        b.wo_end();
    }

    #[test]
    fn acquire_continuation_respects_the_observed_bound() {
        let mut a = ctx();
        let mut b = ctx();
        let orec = Orec::new();

        a.ro_begin();
        let seen = a.check_orec(&orec);
        a.ro_end();

        // b commits through the orec; a's continuation acquisition fails.
        b.wo_begin();
        assert!(b.acquire_consistent(&orec));
        b.wo_end();

        a.wo_begin();
        assert!(!a.acquire_continuation(&orec, seen));
        a.wo_end();

        // With the up-to-date version, it succeeds.
        a.ro_begin();
        let seen = a.check_orec(&orec);
        a.ro_end();
        a.wo_begin();
        assert!(a.acquire_continuation(&orec, seen));
        a.wo_end();
    }

    #[test]
    fn lock_words_are_unique_per_context() {
        let a = ctx();
        let b = ctx();
        assert_ne!(a.lock_word(), b.lock_word());
        assert!(a.lock_word() & super::LOCK_BIT != 0);
    }
}
