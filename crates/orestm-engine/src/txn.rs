//! Transactional-mode scoped contexts.
//!
//! Transactions are composite operations with automatic conflict detection:
//! field reads validate orecs and accumulate a read set; field writes either
//! apply eagerly under an undo log or defer into a redo log replayed at
//! commit. Where the original mechanism would longjmp to a register
//! checkpoint on abort, this layer threads an [`Abort`] value through
//! `Result` and re-runs the body closure: the runners ([`ro_run`],
//! [`wo_run`]) loop until a body execution commits.
//!
//! The access policy is a type parameter. All fields of one data structure
//! must go through a single policy; mixing policies on one structure voids
//! the consistency argument.

use std::ptr::NonNull;

use orestm_types::{END_OF_TIME, Timestamp};

use crate::atomics::{self, Scalar};
use crate::ctx::ThreadCtx;
use crate::metrics::GLOBAL_ENGINE_METRICS;
use crate::orec::{Orec, Unwind};
use crate::policy::Ownable;
use crate::registry::registry;
use crate::smr::Retired;
use crate::undo_log::UndoEntry;

/// The control-flow signal for a transactional abort.
///
/// Not an error in the application sense: the runners catch it, roll back,
/// back off, and retry. It only escapes the engine if a body returns it
/// from a context that cannot retry, which the runners never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort;

/// Result alias for transactional bodies and field accesses.
pub type TxResult<T> = Result<T, Abort>;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::EagerC1 {}
    impl Sealed for super::EagerC2 {}
    impl Sealed for super::Lazy {}
    impl Sealed for super::WbLock {}
    impl<P: super::AccessPolicy> Sealed for super::RoTxn<'_, P> {}
    impl<P: super::AccessPolicy> Sealed for super::WoTxn<'_, P> {}
}

// ---------------------------------------------------------------------------
// Shared validation helpers
// ---------------------------------------------------------------------------

/// Check every read-set orec against the current start time.
fn validate(ctx: &mut ThreadCtx) -> TxResult<()> {
    for orec in &ctx.readset {
        // SAFETY: read-set entries point at orecs of ownables that are kept
        // alive by SMR for at least the duration of this operation.
        if ctx.ore.check_orec(unsafe { orec.as_ref() }) == END_OF_TIME {
            return Err(Abort);
        }
    }
    Ok(())
}

/// Check every read-set orec against `old_start` (timestamp extension).
fn validate_from(ctx: &mut ThreadCtx, old_start: Timestamp) -> TxResult<()> {
    for orec in &ctx.readset {
        // SAFETY: as in `validate`.
        let (ok, mine) = ctx
            .ore
            .check_continuation_mine(unsafe { orec.as_ref() }, old_start);
        if !ok && !mine {
            return Err(Abort);
        }
    }
    Ok(())
}

/// Bump the start time to a fresh clock read, then prove the read set was
/// still valid at the old one.
fn extend(ctx: &mut ThreadCtx) -> TxResult<()> {
    let old_start = ctx.ore.start_time();
    ctx.ore.wo_begin();
    validate_from(ctx, old_start)?;
    GLOBAL_ENGINE_METRICS.record_extension();
    Ok(())
}

/// Acquire every lock-set orec consistently.
fn acquire_all(ctx: &mut ThreadCtx) -> TxResult<()> {
    for i in 0..ctx.lockset.len() {
        let orec = ctx.lockset[i];
        // SAFETY: as in `validate`.
        if !ctx.ore.acquire_consistent(unsafe { orec.as_ref() }) {
            return Err(Abort);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Access policies
// ---------------------------------------------------------------------------

/// The strategy a transaction uses for field access, write buffering, and
/// rollback.
///
/// The methods are engine plumbing invoked by [`crate::field::TField`];
/// bodies never call them directly.
pub trait AccessPolicy: sealed::Sealed + 'static {
    /// Human-readable policy name for logs.
    const NAME: &'static str;
    /// True when writes buffer in the redo log.
    const USES_REDO: bool;

    /// Transactional read of `addr`, validated against `orec`.
    ///
    /// # Safety
    ///
    /// `addr` must be a live, naturally aligned, atomically accessed `T`
    /// guarded by `orec`.
    #[doc(hidden)]
    unsafe fn read<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T>;

    /// Read when the caller guarantees this is not the first access of the
    /// owning object by this transaction (the orec is already in the read
    /// set or owned), so nothing needs to be logged.
    ///
    /// # Safety
    ///
    /// As for [`AccessPolicy::read`].
    #[doc(hidden)]
    unsafe fn re_read<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T>;

    /// Read in the middle of a straight-line sequence of reads of one
    /// object, where the bracketing accesses perform the validation.
    ///
    /// # Safety
    ///
    /// As for [`AccessPolicy::read`].
    #[doc(hidden)]
    unsafe fn read_in_seq<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T) -> T;

    /// Read when the caller owns the object's orec.
    ///
    /// Policies without encounter-time ownership cannot exploit the
    /// premise and fall back to the general read.
    ///
    /// # Safety
    ///
    /// As for [`AccessPolicy::read`].
    #[doc(hidden)]
    unsafe fn read_mine<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T> {
        let _ = orec;
        // SAFETY: forwarded from the caller.
        Ok(unsafe { Self::read_in_seq(ctx, addr) })
    }

    /// Transactional write of `val` to `addr` under `orec`.
    ///
    /// # Safety
    ///
    /// As for [`AccessPolicy::read`], for writes.
    #[doc(hidden)]
    unsafe fn write<T: Scalar>(
        ctx: &mut ThreadCtx,
        addr: *mut T,
        orec: &Orec,
        val: T,
    ) -> TxResult<()>;

    /// Write when the caller already owns `orec`.
    ///
    /// # Safety
    ///
    /// As for [`AccessPolicy::write`], plus actual ownership of the orec.
    #[doc(hidden)]
    unsafe fn write_mine<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, val: T);

    /// Writer commit: make every buffered effect globally visible and
    /// release the orecs. Returns `Err` with all orec state restored.
    #[doc(hidden)]
    fn commit_writer(ctx: &mut ThreadCtx) -> TxResult<()>;

    /// Restore orec and memory state after a failed execution.
    #[doc(hidden)]
    fn rollback(ctx: &mut ThreadCtx);
}

/// Encounter-time locking with undo logging and check-once orecs.
///
/// Aborts release orecs by committing the (undone) state at a fresh
/// timestamp, which gives check-once readers the version change they rely
/// on.
pub struct EagerC1;

/// Encounter-time locking with undo logging and check-twice orecs.
///
/// Aborts bump orecs one past their pre-acquisition version.
pub struct EagerC2;

/// Commit-time write-back with commit-time locking.
pub struct Lazy;

/// Commit-time write-back with encounter-time locking.
pub struct WbLock;

// --- eager (undo) helpers ---------------------------------------------------

/// Shared eager write path: consistently acquire, log old bytes, store.
unsafe fn eager_write<T: Scalar>(
    ctx: &mut ThreadCtx,
    addr: *mut T,
    orec: &Orec,
    val: T,
) -> TxResult<()> {
    loop {
        let (acquired, locked) = ctx.ore.acquire_consistent_locked(orec);
        if acquired {
            // SAFETY: forwarded from the caller.
            unsafe {
                ctx.undolog.push(UndoEntry::capture(addr));
                atomics::safe_write(addr, val);
            }
            return Ok(());
        }
        if locked {
            return Err(Abort);
        }
        extend(ctx)?;
    }
}

unsafe fn eager_write_mine<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, val: T) {
    // SAFETY: forwarded from the caller.
    unsafe {
        ctx.undolog.push(UndoEntry::capture(addr));
        atomics::safe_write(addr, val);
    }
}

impl AccessPolicy for EagerC1 {
    const NAME: &'static str = "eager_c1";
    const USES_REDO: bool = false;

    unsafe fn read<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T> {
        loop {
            // Read the location, then the orec.
            // SAFETY: forwarded from the caller.
            let from_mem = unsafe { atomics::safe_read(addr) };
            let (post, locked) = ctx.ore.check_orec_locked(orec);
            if post != END_OF_TIME {
                if !locked {
                    ctx.readset.push(NonNull::from(orec));
                }
                return Ok(from_mem);
            }
            if locked {
                return Err(Abort);
            }
            extend(ctx)?;
        }
    }

    unsafe fn re_read<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T> {
        // SAFETY: forwarded from the caller.
        let from_mem = unsafe { atomics::safe_read(addr) };
        if ctx.ore.check_orec(orec) == END_OF_TIME {
            return Err(Abort);
        }
        Ok(from_mem)
    }

    unsafe fn read_in_seq<T: Scalar>(_ctx: &mut ThreadCtx, addr: *mut T) -> T {
        // SAFETY: forwarded from the caller.
        unsafe { atomics::safe_read(addr) }
    }

    unsafe fn write<T: Scalar>(
        ctx: &mut ThreadCtx,
        addr: *mut T,
        orec: &Orec,
        val: T,
    ) -> TxResult<()> {
        // SAFETY: forwarded from the caller.
        unsafe { eager_write(ctx, addr, orec, val) }
    }

    unsafe fn write_mine<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, val: T) {
        // SAFETY: forwarded from the caller.
        unsafe { eager_write_mine(ctx, addr, val) }
    }

    fn commit_writer(ctx: &mut ThreadCtx) -> TxResult<()> {
        // Locks were taken at encounter time; only the reads need checking.
        validate(ctx)?;
        ctx.ore.wo_end();
        Ok(())
    }

    fn rollback(ctx: &mut ThreadCtx) {
        // SAFETY: the logged addresses are covered by orecs this scope still
        // holds, so their owners are alive.
        unsafe { ctx.undolog.undo_writes() };
        // Release by committing the restored state at a fresh timestamp:
        // check-once readers need the version to move.
        ctx.ore.wo_end();
    }
}

impl AccessPolicy for EagerC2 {
    const NAME: &'static str = "eager_c2";
    const USES_REDO: bool = false;

    unsafe fn read<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T> {
        loop {
            let (pre, locked) = ctx.ore.check_orec_locked(orec);
            // SAFETY: forwarded from the caller.
            let from_mem = unsafe { atomics::safe_read(addr) };
            if locked && pre != END_OF_TIME {
                // Owned by this transaction: no second check needed.
                return Ok(from_mem);
            }
            let post = ctx.ore.check_orec(orec);
            if pre == post && pre != END_OF_TIME {
                ctx.readset.push(NonNull::from(orec));
                return Ok(from_mem);
            }
            if locked {
                return Err(Abort);
            }
            extend(ctx)?;
        }
    }

    unsafe fn re_read<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T> {
        let (pre, locked) = ctx.ore.check_orec_locked(orec);
        // SAFETY: forwarded from the caller.
        let from_mem = unsafe { atomics::safe_read(addr) };
        if locked && pre != END_OF_TIME {
            return Ok(from_mem);
        }
        let post = ctx.ore.check_orec(orec);
        // Even a transient pre/post mismatch will fail commit validation
        // once orecs are bumped, so abort now.
        if pre != post || pre == END_OF_TIME {
            return Err(Abort);
        }
        Ok(from_mem)
    }

    unsafe fn read_in_seq<T: Scalar>(_ctx: &mut ThreadCtx, addr: *mut T) -> T {
        // SAFETY: forwarded from the caller.
        unsafe { atomics::safe_read(addr) }
    }

    unsafe fn write<T: Scalar>(
        ctx: &mut ThreadCtx,
        addr: *mut T,
        orec: &Orec,
        val: T,
    ) -> TxResult<()> {
        // SAFETY: forwarded from the caller.
        unsafe { eager_write(ctx, addr, orec, val) }
    }

    unsafe fn write_mine<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, val: T) {
        // SAFETY: forwarded from the caller.
        unsafe { eager_write_mine(ctx, addr, val) }
    }

    fn commit_writer(ctx: &mut ThreadCtx) -> TxResult<()> {
        validate(ctx)?;
        ctx.ore.wo_end();
        Ok(())
    }

    fn rollback(ctx: &mut ThreadCtx) {
        // SAFETY: as in EagerC1::rollback.
        unsafe { ctx.undolog.undo_writes() };
        // Check-twice readers tolerate resets, but the version must still
        // move past what concurrent check-once continuations recorded.
        ctx.ore.unwind(Unwind::Bump);
    }
}

// --- lazy (redo) helpers ----------------------------------------------------

/// Shared redo commit path: acquire outstanding locks, validate, write back.
fn redo_commit(ctx: &mut ThreadCtx) -> TxResult<()> {
    acquire_all(ctx)?;
    validate(ctx)?;
    // SAFETY: logged addresses are guarded by orecs now held by this scope.
    unsafe { ctx.redolog.writeback() };
    ctx.ore.wo_end();
    Ok(())
}

fn redo_rollback(ctx: &mut ThreadCtx) {
    ctx.ore.unwind(Unwind::Rollback);
}

impl AccessPolicy for Lazy {
    const NAME: &'static str = "lazy";
    const USES_REDO: bool = true;

    unsafe fn read<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T> {
        if let Some(val) = ctx.redolog.get(addr) {
            return Ok(val);
        }
        loop {
            // SAFETY: forwarded from the caller.
            let from_mem = unsafe { atomics::safe_read(addr) };
            let (ts, mut locked) = ctx.ore.check_orec_locked(orec);
            if ts != END_OF_TIME {
                ctx.readset.push(NonNull::from(orec));
                return Ok(from_mem);
            }
            // Lazy transactions hold no encounter-time locks, so the owner
            // will release soon; wait rather than abort.
            while locked {
                (_, locked) = ctx.ore.check_orec_locked(orec);
                std::hint::spin_loop();
            }
            extend(ctx)?;
        }
    }

    unsafe fn re_read<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T> {
        if let Some(val) = ctx.redolog.get(addr) {
            return Ok(val);
        }
        // SAFETY: forwarded from the caller.
        let from_mem = unsafe { atomics::safe_read(addr) };
        if ctx.ore.check_orec(orec) == END_OF_TIME {
            return Err(Abort);
        }
        Ok(from_mem)
    }

    unsafe fn read_in_seq<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T) -> T {
        if let Some(val) = ctx.redolog.get(addr) {
            return val;
        }
        // SAFETY: forwarded from the caller.
        unsafe { atomics::safe_read(addr) }
    }

    unsafe fn read_mine<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T> {
        // A lazy transaction never owns the orec during execution, so the
        // caller's premise buys nothing; run the general protocol.
        // SAFETY: forwarded from the caller.
        unsafe { Self::read(ctx, addr, orec) }
    }

    unsafe fn write<T: Scalar>(
        ctx: &mut ThreadCtx,
        addr: *mut T,
        orec: &Orec,
        val: T,
    ) -> TxResult<()> {
        ctx.lockset.push(NonNull::from(orec));
        // SAFETY: forwarded from the caller.
        unsafe { ctx.redolog.insert(addr, val) };
        Ok(())
    }

    unsafe fn write_mine<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, val: T) {
        // SAFETY: forwarded from the caller.
        unsafe { ctx.redolog.insert(addr, val) };
    }

    fn commit_writer(ctx: &mut ThreadCtx) -> TxResult<()> {
        redo_commit(ctx)
    }

    fn rollback(ctx: &mut ThreadCtx) {
        redo_rollback(ctx);
    }
}

impl AccessPolicy for WbLock {
    const NAME: &'static str = "wb_lock";
    const USES_REDO: bool = true;

    unsafe fn read<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T> {
        // Check-once orecs: the lock state cannot shortcut the redo probe.
        if let Some(val) = ctx.redolog.get(addr) {
            return Ok(val);
        }
        loop {
            // SAFETY: forwarded from the caller.
            let from_mem = unsafe { atomics::safe_read(addr) };
            let (ts, locked) = ctx.ore.check_orec_locked(orec);
            if ts != END_OF_TIME {
                // Skip logging reads of orecs this transaction owns.
                if !locked {
                    ctx.readset.push(NonNull::from(orec));
                }
                return Ok(from_mem);
            }
            if locked {
                return Err(Abort);
            }
            extend(ctx)?;
        }
    }

    unsafe fn re_read<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, orec: &Orec) -> TxResult<T> {
        if let Some(val) = ctx.redolog.get(addr) {
            return Ok(val);
        }
        // SAFETY: forwarded from the caller.
        let from_mem = unsafe { atomics::safe_read(addr) };
        if ctx.ore.check_orec(orec) == END_OF_TIME {
            return Err(Abort);
        }
        Ok(from_mem)
    }

    unsafe fn read_in_seq<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T) -> T {
        if let Some(val) = ctx.redolog.get(addr) {
            return val;
        }
        // SAFETY: forwarded from the caller.
        unsafe { atomics::safe_read(addr) }
    }

    unsafe fn write<T: Scalar>(
        ctx: &mut ThreadCtx,
        addr: *mut T,
        orec: &Orec,
        val: T,
    ) -> TxResult<()> {
        // Buffer first, then take the lock eagerly.
        // SAFETY: forwarded from the caller.
        unsafe { ctx.redolog.insert(addr, val) };
        loop {
            let (acquired, locked) = ctx.ore.acquire_consistent_locked(orec);
            if acquired {
                return Ok(());
            }
            if locked {
                return Err(Abort);
            }
            extend(ctx)?;
        }
    }

    unsafe fn write_mine<T: Scalar>(ctx: &mut ThreadCtx, addr: *mut T, val: T) {
        // SAFETY: forwarded from the caller.
        unsafe { ctx.redolog.insert(addr, val) };
    }

    fn commit_writer(ctx: &mut ThreadCtx) -> TxResult<()> {
        // Locks were taken at set() time; acquire_all covers any continuation
        // inheritances that queued locks, then validate and write back.
        redo_commit(ctx)
    }

    fn rollback(ctx: &mut ThreadCtx) {
        redo_rollback(ctx);
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Shared surface of [`RoTxn`] and [`WoTxn`], used by field accessors and
/// hybrid continuations.
pub trait TxnScope: sealed::Sealed {
    /// The access policy of this scope.
    type Policy: AccessPolicy;

    /// Engine context access for field plumbing.
    #[doc(hidden)]
    fn ctx_mut(&mut self) -> &mut ThreadCtx;

    /// The scope's current start time.
    fn start_time(&self) -> Timestamp;

    /// Inherit an orec observation from a previous step-mode read: fold
    /// `obj` into the read set and confirm its version is still at most
    /// `ver`.
    ///
    /// This is the hybrid-continuation contract: on success the composite
    /// of the step and this transaction is linearizable as one operation.
    #[must_use]
    fn inherit(&mut self, obj: &impl Ownable, ver: Timestamp) -> bool;
}

fn inherit_impl(ctx: &mut ThreadCtx, orec: &Orec, ver: Timestamp) -> bool {
    ctx.readset.push(NonNull::from(orec));
    ctx.ore.check_continuation(orec, ver)
}

/// A read-only transaction scope.
pub struct RoTxn<'a, P: AccessPolicy> {
    ctx: &'a mut ThreadCtx,
    done: bool,
    _policy: std::marker::PhantomData<P>,
}

impl<'a, P: AccessPolicy> RoTxn<'a, P> {
    /// Begin when the scope was already published by the runner's gate.
    fn begin_gated(ctx: &'a mut ThreadCtx) -> Self {
        Self {
            ctx,
            done: false,
            _policy: std::marker::PhantomData,
        }
    }

    fn commit(mut self) {
        self.done = true;
        self.ctx.ore.ro_end();
        self.ctx.readset.clear();
        self.ctx.cm.after_commit();
    }

    fn rollback(mut self) {
        self.done = true;
        self.ctx.ore.ro_end();
        self.ctx.readset.clear();
        GLOBAL_ENGINE_METRICS.record_abort();
    }
}

impl<P: AccessPolicy> TxnScope for RoTxn<'_, P> {
    type Policy = P;

    fn ctx_mut(&mut self) -> &mut ThreadCtx {
        self.ctx
    }

    fn start_time(&self) -> Timestamp {
        self.ctx.ore.start_time()
    }

    fn inherit(&mut self, obj: &impl Ownable, ver: Timestamp) -> bool {
        inherit_impl(self.ctx, obj.orec(), ver)
    }
}

impl<P: AccessPolicy> Drop for RoTxn<'_, P> {
    fn drop(&mut self) {
        if !self.done {
            self.ctx.ore.ro_end();
            self.ctx.readset.clear();
        }
    }
}

/// A writing transaction scope.
pub struct WoTxn<'a, P: AccessPolicy> {
    ctx: &'a mut ThreadCtx,
    done: bool,
    _policy: std::marker::PhantomData<P>,
}

impl<'a, P: AccessPolicy> WoTxn<'a, P> {
    /// Begin when the scope was already published by the runner's gate.
    fn begin_gated(ctx: &'a mut ThreadCtx) -> Self {
        Self {
            ctx,
            done: false,
            _policy: std::marker::PhantomData,
        }
    }

    /// Log a speculative allocation. If the transaction aborts, the node is
    /// destroyed; if it commits, ownership has passed to the structure.
    pub fn log_new<T>(&mut self, node: Box<T>) -> NonNull<T> {
        let ptr = NonNull::from(Box::leak(node));
        // SAFETY: freshly leaked from a Box and exclusively ours until the
        // transaction publishes it.
        self.ctx.mallocs.push(unsafe { Retired::new(ptr) });
        ptr
    }

    /// Schedule an object for reclamation if the transaction commits.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::into_raw`, and the commit of this
    /// transaction must make the object unreachable from the structure.
    pub unsafe fn reclaim<T>(&mut self, ptr: NonNull<T>) {
        // SAFETY: per the caller's contract.
        self.ctx.frees.push(unsafe { Retired::new(ptr) });
    }

    /// Whether this transaction currently runs without instrumentation.
    #[must_use]
    pub fn is_irrevocable(&self) -> bool {
        self.ctx.irrevocable
    }

    /// Enter irrevocable mode: claim the global token, wait for every other
    /// thread to quiesce, and prove the reads so far are still valid.
    ///
    /// On success the transaction can no longer abort; field accesses stop
    /// being instrumented. Fails (with an abort) if another thread holds
    /// the token or validation fails.
    pub fn become_irrevocable(&mut self) -> TxResult<()> {
        if self.ctx.irrevocable {
            return Ok(());
        }
        let lock_word = self.ctx.ore.lock_word();
        if !registry().try_acquire_irrevocability(lock_word, self.ctx.ore.slot()) {
            return Err(Abort);
        }
        if validate(self.ctx).is_err() {
            registry().release_irrevocability(lock_word);
            return Err(Abort);
        }
        // Flush buffered writes: from here on, stores go straight to
        // memory, so anything in the redo log must land first.
        if P::USES_REDO && !self.ctx.redolog.is_empty() {
            for i in 0..self.ctx.lockset.len() {
                let orec = self.ctx.lockset[i];
                // Aggressive is safe: the world is quiesced, and staleness
                // of blind-write orecs does not affect the validated reads.
                // SAFETY: as in `validate`.
                if !self.ctx.ore.acquire_aggressive(unsafe { orec.as_ref() }) {
                    registry().release_irrevocability(lock_word);
                    return Err(Abort);
                }
            }
            // SAFETY: every logged address is guarded by an orec now held.
            unsafe { self.ctx.redolog.writeback() };
        }
        // Everything logged so far is now permanent.
        self.ctx.redolog.clear();
        self.ctx.lockset.clear();
        self.ctx.undolog.clear();
        self.ctx.readset.clear();
        self.ctx.mallocs.clear();
        self.ctx.irrevocable = true;
        GLOBAL_ENGINE_METRICS.record_irrevocable();
        tracing::debug!(target: "orestm::txn", policy = P::NAME, "transaction became irrevocable");
        Ok(())
    }

    fn commit(mut self) -> TxResult<()> {
        self.done = true;
        let ctx = &mut *self.ctx;

        if ctx.irrevocable {
            ctx.irrevocable = false;
            ctx.ore.wo_end();
            registry().release_irrevocability(ctx.ore.lock_word());
            finalize_commit(ctx);
            return Ok(());
        }

        // Read-only fast path.
        if !ctx.ore.has_orecs() && ctx.lockset.is_empty() {
            ctx.ore.ro_end();
            finalize_commit(ctx);
            return Ok(());
        }

        match P::commit_writer(ctx) {
            Ok(()) => {
                finalize_commit(ctx);
                Ok(())
            }
            Err(Abort) => {
                P::rollback(ctx);
                abort_cleanup(ctx);
                Err(Abort)
            }
        }
    }

    fn rollback(mut self) {
        self.done = true;
        let ctx = &mut *self.ctx;
        debug_assert!(!ctx.irrevocable, "irrevocable transactions cannot abort");
        if ctx.irrevocable {
            // Contract violation in release builds: release the token so the
            // process does not wedge, but the direct writes stand.
            ctx.irrevocable = false;
            ctx.ore.wo_end();
            registry().release_irrevocability(ctx.ore.lock_word());
            finalize_commit(ctx);
            return;
        }
        P::rollback(ctx);
        abort_cleanup(ctx);
    }
}

/// Post-commit bookkeeping shared by every commit path.
fn finalize_commit(ctx: &mut ThreadCtx) {
    // Speculative allocations are now owned by the structure.
    ctx.mallocs.clear();
    // Retirements become real: hand them to SMR.
    for retired in ctx.frees.drain(..) {
        ctx.smr.retire(retired);
    }
    ctx.undolog.clear();
    ctx.redolog.clear();
    ctx.lockset.clear();
    ctx.readset.clear();
    GLOBAL_ENGINE_METRICS.record_commit();
    ctx.cm.after_commit();
}

/// Post-abort bookkeeping shared by every abort path. Policy rollback must
/// already have run.
fn abort_cleanup(ctx: &mut ThreadCtx) {
    // Retirements are cancelled: the objects remain reachable.
    ctx.frees.clear();
    // Speculative allocations were never published; free them now.
    for mut retired in ctx.mallocs.drain(..) {
        // SAFETY: allocated by log_new this execution and never made
        // reachable (eager link writes to them were just undone).
        unsafe { retired.reclaim() };
    }
    ctx.undolog.clear();
    ctx.redolog.clear();
    ctx.lockset.clear();
    ctx.readset.clear();
    GLOBAL_ENGINE_METRICS.record_abort();
}

impl<P: AccessPolicy> TxnScope for WoTxn<'_, P> {
    type Policy = P;

    fn ctx_mut(&mut self) -> &mut ThreadCtx {
        self.ctx
    }

    fn start_time(&self) -> Timestamp {
        self.ctx.ore.start_time()
    }

    fn inherit(&mut self, obj: &impl Ownable, ver: Timestamp) -> bool {
        inherit_impl(self.ctx, obj.orec(), ver)
    }
}

impl<P: AccessPolicy> Drop for WoTxn<'_, P> {
    fn drop(&mut self) {
        if !self.done {
            // A panic is unwinding through the body; restore shared state.
            // An irrevocable body cannot be rolled back (its writes went
            // straight to memory), so treat its progress as committed and
            // release the token rather than wedging the process.
            if self.ctx.irrevocable {
                self.ctx.irrevocable = false;
                self.ctx.ore.wo_end();
                registry().release_irrevocability(self.ctx.ore.lock_word());
                finalize_commit(self.ctx);
            } else {
                P::rollback(self.ctx);
                abort_cleanup(self.ctx);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Runners
// ---------------------------------------------------------------------------

/// Wait out any irrevocable writer, with the publish-then-check ordering
/// that makes the token race-free: either the holder sees our published
/// scope and waits, or we see the token and retreat.
fn irrevocability_gate(ctx: &mut ThreadCtx, writer: bool) {
    loop {
        if writer {
            ctx.ore.wo_begin();
        } else {
            ctx.ore.ro_begin();
        }
        if !registry().irrevocability_held() {
            return;
        }
        // Just enough to exit the epoch, nothing more.
        ctx.ore.ro_end();
        registry().wait_irrevocability_clear();
    }
}

/// Run `body` as a read-only transaction, retrying until it commits.
///
/// The body may be executed multiple times; it must not have side effects
/// outside the transaction other than through its captured locals, and any
/// such effects must be idempotent across retries.
pub fn ro_run<P, R, F>(me: &mut ThreadCtx, mut body: F) -> R
where
    P: AccessPolicy,
    F: FnMut(&mut RoTxn<'_, P>) -> TxResult<R>,
{
    loop {
        irrevocability_gate(me, false);
        let mut tx = RoTxn::begin_gated(me);
        match body(&mut tx) {
            Ok(result) => {
                tx.commit();
                return result;
            }
            Err(Abort) => {
                tx.rollback();
            }
        }
        me.cm.after_abort(&mut me.rng);
        tracing::trace!(target: "orestm::txn", policy = P::NAME, "read transaction retrying");
    }
}

/// Run `body` as a writing transaction, retrying until it commits.
///
/// Returning `Err(Abort)` from the body rolls the execution back and
/// retries it after contention-manager backoff. The runner returns only
/// once an execution commits.
pub fn wo_run<P, R, F>(me: &mut ThreadCtx, mut body: F) -> R
where
    P: AccessPolicy,
    F: FnMut(&mut WoTxn<'_, P>) -> TxResult<R>,
{
    loop {
        irrevocability_gate(me, true);
        let request_irrevoc = me.cm.before_begin();
        let mut tx = WoTxn::<P>::begin_gated(me);
        if request_irrevoc {
            // Contention manager requested irrevocability; best effort.
            let _ = tx.become_irrevocable();
        }
        if let Some(result) = run_body(&mut body, tx) {
            return result;
        }
        me.cm.after_abort(&mut me.rng);
        tracing::trace!(target: "orestm::txn", policy = P::NAME, "write transaction retrying");
    }
}

fn run_body<P, R, F>(body: &mut F, mut tx: WoTxn<'_, P>) -> Option<R>
where
    P: AccessPolicy,
    F: FnMut(&mut WoTxn<'_, P>) -> TxResult<R>,
{
    match body(&mut tx) {
        Ok(result) => match tx.commit() {
            Ok(()) => Some(result),
            Err(Abort) => None,
        },
        Err(Abort) => {
            tx.rollback();
            None
        }
    }
}
