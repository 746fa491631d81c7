//! Timestamp-based safe memory reclamation.
//!
//! An in-flight operation collects objects it wants destroyed if it
//! completes. At operation end the survivors are stamped with the current
//! clock and moved to a per-thread `unreachable` queue ordered by stamp.
//! Every [`SWEEP_THRESHOLD`] operation exits, the thread computes the oldest
//! operation timestamp published by any thread and destroys everything
//! stamped strictly before it.
//!
//! The reachability argument: a thread performing an optimistic read of an
//! object published its operation timestamp before acquiring the reference,
//! and a retiring thread stamps after the object became unreachable from
//! the structure. Any thread whose published time is idle or newer than a
//! record's stamp therefore cannot hold a reference into it.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use orestm_types::{END_OF_TIME, Timestamp};

use crate::clock;
use crate::metrics::GLOBAL_ENGINE_METRICS;
use crate::registry::{Slot, registry};

/// Operation exits between sweeps of the unreachable queue.
const SWEEP_THRESHOLD: u32 = 1024;

/// A type-erased retired allocation: the pointer plus a shim that reboxes
/// and drops it.
pub struct Retired {
    ptr: *mut u8,
    drop_fn: unsafe fn(*mut u8),
}

// SAFETY: a Retired is a unique owner of its allocation (the retire
// contract requires the object to be unreachable); moving that ownership
// across threads is sound, matching what a cross-thread drop of the boxed
// value would do.
unsafe impl Send for Retired {}

impl Retired {
    /// Take ownership of `ptr` for deferred destruction.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `Box::into_raw` (or equivalent) for a live
    /// `T`, and the caller must be its unique owner from this point on.
    #[must_use]
    pub unsafe fn new<T>(ptr: NonNull<T>) -> Self {
        unsafe fn shim<T>(ptr: *mut u8) {
            // SAFETY: `ptr` was produced from a Box<T> by `Retired::new`.
            drop(unsafe { Box::from_raw(ptr.cast::<T>()) });
        }
        Self {
            ptr: ptr.as_ptr().cast(),
            drop_fn: shim::<T>,
        }
    }

    /// Destroy the object now.
    ///
    /// # Safety
    ///
    /// No thread may still hold a reference into the object; callers
    /// establish this through the timestamp argument above.
    pub(crate) unsafe fn reclaim(&mut self) {
        // SAFETY: forwarded from the caller; the shim matches the pointee.
        unsafe { (self.drop_fn)(self.ptr) }
    }
}

impl std::fmt::Debug for Retired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retired").field("ptr", &self.ptr).finish()
    }
}

/// Per-thread reclamation context.
///
/// All contexts share the registry's published-timestamp slots; each keeps
/// its own pending list and unreachable queue, so reclamation never
/// contends between threads except for the (read-only) minimum scan.
pub struct SmrCtx {
    slot: Arc<Slot>,
    /// Objects the current operation wants destroyed if it completes.
    pending: Vec<Retired>,
    /// Logically unreachable, possibly still referenced by concurrent
    /// optimistic readers. Ordered by stamp, oldest first.
    unreachable: VecDeque<(Retired, Timestamp)>,
    exits_until_sweep: u32,
}

impl SmrCtx {
    pub(crate) fn new(slot: Arc<Slot>) -> Self {
        Self {
            slot,
            pending: Vec::new(),
            unreachable: VecDeque::new(),
            exits_until_sweep: SWEEP_THRESHOLD,
        }
    }

    /// Begin a region that will optimistically access reclaimable objects.
    pub fn enter(&mut self) {
        self.slot.smr_ts.swap(clock::now_strong(), Ordering::SeqCst);
    }

    /// Exit the region, stamping this operation's retirements.
    pub fn exit(&mut self) {
        self.slot.smr_ts.swap(END_OF_TIME, Ordering::SeqCst);
        if self.pending.is_empty() {
            return;
        }
        let stamp = clock::now_strong();
        for retired in self.pending.drain(..) {
            self.unreachable.push_back((retired, stamp));
        }
        self.exits_until_sweep -= 1;
        if self.exits_until_sweep > 0 {
            return;
        }
        self.exits_until_sweep = SWEEP_THRESHOLD;
        self.sweep();
    }

    /// Schedule an object for destruction if the current operation
    /// completes.
    pub(crate) fn retire(&mut self, retired: Retired) {
        GLOBAL_ENGINE_METRICS.record_retired();
        self.pending.push(retired);
    }

    /// Destroy every unreachable record stamped before the oldest running
    /// operation.
    fn sweep(&mut self) {
        let oldest = registry().min_published();
        let mut reclaimed = 0_usize;
        // The queue is ordered oldest-first, so stop at the first survivor.
        while let Some((_, stamp)) = self.unreachable.front() {
            if *stamp >= oldest {
                break;
            }
            if let Some((mut retired, _)) = self.unreachable.pop_front() {
                // SAFETY: stamped before `oldest`, so no live operation can
                // still reference the object (see module docs).
                unsafe { retired.reclaim() };
                reclaimed += 1;
            }
        }
        reclaimed += registry().sweep_orphans(oldest);
        if reclaimed > 0 {
            GLOBAL_ENGINE_METRICS.record_reclaimed(reclaimed as u64);
            tracing::trace!(
                target: "orestm::smr",
                reclaimed,
                backlog = self.unreachable.len(),
                "swept unreachable queue"
            );
        }
    }
}

impl Drop for SmrCtx {
    fn drop(&mut self) {
        // A dying thread cannot wait for the rest of the process to
        // quiesce, so its stamped queue is adopted by the registry and its
        // unstamped pendings are stamped on the way out.
        let stamp = clock::now_strong();
        let pending = self.pending.drain(..).map(|r| (r, stamp));
        let mut orphans: Vec<(Retired, Timestamp)> = self.unreachable.drain(..).collect();
        orphans.extend(pending);
        if !orphans.is_empty() {
            registry().adopt_orphans(orphans);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{Retired, SmrCtx};
    use crate::registry::registry;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn retired_counter(dropped: &Arc<AtomicUsize>) -> Retired {
        let boxed = Box::new(DropCounter(Arc::clone(dropped)));
        let ptr = NonNull::from(Box::leak(boxed));
        // SAFETY: ptr came from Box::into_raw-equivalent and is uniquely
        // owned here.
        unsafe { Retired::new(ptr) }
    }

    /// Sweep until `dropped` reaches `expected`; other tests in this binary
    /// may transiently publish old timestamps, which delays (never loses)
    /// reclamation.
    fn sweep_until(smr: &mut SmrCtx, dropped: &Arc<AtomicUsize>, expected: usize) {
        for _ in 0..1_000 {
            smr.sweep();
            if dropped.load(Ordering::SeqCst) == expected {
                return;
            }
            std::thread::yield_now();
        }
        panic!("retirements never became reclaimable");
    }

    #[test]
    fn retirement_defers_until_exit_and_sweep() {
        let mut smr = SmrCtx::new(registry().register());
        let dropped = Arc::new(AtomicUsize::new(0));

        smr.enter();
        smr.retire(retired_counter(&dropped));
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        smr.exit();
        // Stamped but not yet swept (threshold not reached).
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        // Force sweeps directly; no operation of ours is pinning an old
        // timestamp.
        sweep_until(&mut smr, &dropped, 1);
    }

    #[test]
    fn sweep_respects_a_concurrent_old_reader() {
        let reg = registry();
        let reader_slot = reg.register();
        let mut smr = SmrCtx::new(reg.register());
        let dropped = Arc::new(AtomicUsize::new(0));

        // The reader publishes an old timestamp before retirement happens.
        reader_slot
            .smr_ts
            .store(crate::clock::now_strong(), Ordering::SeqCst);

        smr.enter();
        smr.retire(retired_counter(&dropped));
        smr.exit();
        smr.sweep();
        assert_eq!(
            dropped.load(Ordering::SeqCst),
            0,
            "reclaimed under a live reader"
        );

        // Reader finishes; the record becomes reclaimable.
        reader_slot
            .smr_ts
            .store(orestm_types::END_OF_TIME, Ordering::SeqCst);
        sweep_until(&mut smr, &dropped, 1);
        reg.release(&reader_slot);
    }

    #[test]
    fn dropped_context_hands_retirements_to_the_registry() {
        let dropped = Arc::new(AtomicUsize::new(0));
        {
            let mut smr = SmrCtx::new(registry().register());
            smr.enter();
            smr.retire(retired_counter(&dropped));
            smr.exit();
            // smr drops here with a stamped record still queued.
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        // Another context's sweep adopts and reclaims the orphan.
        let mut other = SmrCtx::new(registry().register());
        sweep_until(&mut other, &dropped, 1);
    }
}
