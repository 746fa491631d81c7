//! Step-mode scoped contexts.
//!
//! Steps are short critical sections that read or acquire orecs directly,
//! with no log bookkeeping: validation is the programmer's job. A read step
//! brackets `ro_begin`/`ro_end`; a write step brackets `wo_begin`/`wo_end`,
//! and can be unwound to discard its acquisitions. Step-mode data
//! structures compose whole operations out of sequences of steps, chaining
//! them with observed orec versions.

use std::ptr::NonNull;

use orestm_types::Timestamp;

use crate::ctx::ThreadCtx;
use crate::orec::Unwind;
use crate::policy::Ownable;
use crate::smr::Retired;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::RStep<'_> {}
    impl Sealed for super::WStep<'_> {}
}

/// Implemented by both step guards; step fields accept either.
pub trait StepScope: sealed::Sealed {
    /// The start time of the step.
    fn start_time(&self) -> Timestamp;

    /// Validate that `obj`'s orec is usable by this step: not too new, not
    /// locked by another thread. Returns the observed version, or
    /// [`orestm_types::END_OF_TIME`] on failure.
    fn check_orec(&self, obj: &impl Ownable) -> Timestamp;

    /// Check that `obj`'s orec value is still at most `ver`.
    fn check_continuation(&self, obj: &impl Ownable, ver: Timestamp) -> bool;
}

/// RAII guard for a read-only step.
pub struct RStep<'a> {
    ctx: &'a mut ThreadCtx,
}

impl<'a> RStep<'a> {
    /// Open a read step.
    pub fn new(ctx: &'a mut ThreadCtx) -> Self {
        ctx.ore.ro_begin();
        Self { ctx }
    }
}

impl StepScope for RStep<'_> {
    #[inline]
    fn start_time(&self) -> Timestamp {
        self.ctx.ore.start_time()
    }

    #[inline]
    fn check_orec(&self, obj: &impl Ownable) -> Timestamp {
        self.ctx.ore.check_orec(obj.orec())
    }

    #[inline]
    fn check_continuation(&self, obj: &impl Ownable, ver: Timestamp) -> bool {
        self.ctx.ore.check_continuation(obj.orec(), ver)
    }
}

impl Drop for RStep<'_> {
    fn drop(&mut self) {
        self.ctx.ore.ro_end();
    }
}

/// RAII guard for a writing step.
///
/// Dropping the guard releases every acquired orec to a fresh commit
/// timestamp; [`WStep::unwind`] instead restores them, discarding the step.
pub struct WStep<'a> {
    ctx: &'a mut ThreadCtx,
}

impl<'a> WStep<'a> {
    /// Open a writing step.
    pub fn new(ctx: &'a mut ThreadCtx) -> Self {
        ctx.ore.wo_begin();
        Self { ctx }
    }

    /// Acquire `obj`'s orec if it is consistent with this step's start
    /// time.
    #[must_use]
    pub fn acquire_consistent(&mut self, obj: &impl Ownable) -> bool {
        self.ctx.ore.acquire_consistent(obj.orec())
    }

    /// Acquire `obj`'s orec only if its version is still `ver`.
    #[must_use]
    pub fn acquire_continuation(&mut self, obj: &impl Ownable, ver: Timestamp) -> bool {
        self.ctx.ore.acquire_continuation(obj.orec(), ver)
    }

    /// Acquire `obj`'s orec regardless of its version, failing only if
    /// another thread holds it.
    #[must_use]
    pub fn acquire_aggressive(&mut self, obj: &impl Ownable) -> bool {
        self.ctx.ore.acquire_aggressive(obj.orec())
    }

    /// Discard the step: restore every acquired orec and close the scope.
    pub fn unwind(self) {
        // The drop that follows sees the unwound flag and turns wo_end into
        // a no-op.
        self.ctx.ore.unwind(Unwind::Rollback);
    }

    /// Schedule `obj` for reclamation.
    ///
    /// Only call from steps that will not unwind: retirement is handed to
    /// SMR immediately and is not undone by [`WStep::unwind`].
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `Box::into_raw`, the caller must hold the
    /// object's orec, and the object must be unreachable from the data
    /// structure once this step commits.
    pub unsafe fn reclaim<T>(&mut self, ptr: NonNull<T>) {
        // SAFETY: ownership transfer per the caller's contract.
        let retired = unsafe { Retired::new(ptr) };
        self.ctx.smr.retire(retired);
    }
}

impl StepScope for WStep<'_> {
    #[inline]
    fn start_time(&self) -> Timestamp {
        self.ctx.ore.start_time()
    }

    #[inline]
    fn check_orec(&self, obj: &impl Ownable) -> Timestamp {
        self.ctx.ore.check_orec(obj.orec())
    }

    #[inline]
    fn check_continuation(&self, obj: &impl Ownable, ver: Timestamp) -> bool {
        self.ctx.ore.check_continuation(obj.orec(), ver)
    }
}

impl Drop for WStep<'_> {
    fn drop(&mut self) {
        self.ctx.ore.wo_end();
    }
}

#[cfg(test)]
mod tests {
    use orestm_types::END_OF_TIME;

    use super::{RStep, StepScope, WStep};
    use crate::ctx::ThreadCtx;
    use crate::orec::Orec;
    use crate::policy::Ownable;

    struct Obj {
        orec: Orec,
    }

    impl Ownable for Obj {
        fn orec(&self) -> &Orec {
            &self.orec
        }
    }

    #[test]
    fn read_step_validates_and_records_versions() {
        let mut me = ThreadCtx::new();
        let obj = Obj { orec: Orec::new() };

        let tx = RStep::new(&mut me);
        let ver = tx.check_orec(&obj);
        assert_ne!(ver, END_OF_TIME);
        assert!(tx.check_continuation(&obj, ver));
        drop(tx);

        // The version survives across steps while nothing commits.
        let tx = RStep::new(&mut me);
        assert!(tx.check_continuation(&obj, ver));
    }

    #[test]
    fn write_step_commit_invalidates_old_versions() {
        let mut me = ThreadCtx::new();
        let obj = Obj { orec: Orec::new() };

        let tx = RStep::new(&mut me);
        let ver = tx.check_orec(&obj);
        drop(tx);

        let mut tx = WStep::new(&mut me);
        assert!(tx.acquire_continuation(&obj, ver));
        drop(tx); // commit: orec advances

        let tx = RStep::new(&mut me);
        assert!(!tx.check_continuation(&obj, ver));
        assert_ne!(tx.check_orec(&obj), END_OF_TIME);
    }

    #[test]
    fn unwound_step_leaves_versions_untouched() {
        let mut me = ThreadCtx::new();
        let obj = Obj { orec: Orec::new() };

        let tx = RStep::new(&mut me);
        let ver = tx.check_orec(&obj);
        drop(tx);

        let mut tx = WStep::new(&mut me);
        assert!(tx.acquire_consistent(&obj));
        tx.unwind();

        let tx = RStep::new(&mut me);
        assert!(tx.check_continuation(&obj, ver));
    }

    #[test]
    fn next_step_after_unwind_is_clean() {
        let mut me = ThreadCtx::new();
        let obj = Obj { orec: Orec::new() };

        let mut tx = WStep::new(&mut me);
        assert!(tx.acquire_consistent(&obj));
        tx.unwind();

        // A fresh write step must work normally (the unwound flag must not
        // leak into it).
        let mut tx = WStep::new(&mut me);
        assert!(tx.acquire_consistent(&obj));
        drop(tx);
        assert!(me.last_wo_end_time() > 0);
    }
}
