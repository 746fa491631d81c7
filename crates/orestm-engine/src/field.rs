//! Typed wrappers that force shared scalar fields through the engine.
//!
//! A field owns its storage and exposes only scope-parameterized accessors,
//! so there is no way to touch the value without being inside a step or a
//! transaction. [`SField`] is the step-mode flavor: razor-thin accessors
//! whose validation is the caller's responsibility. [`TField`] is the
//! transactional flavor: its accessors run the active policy's full
//! read/write protocol, including logging and conflict handling.

use std::cell::UnsafeCell;
use std::sync::atomic::Ordering;

use crate::atomics::{self, Scalar};
use crate::policy::Ownable;
use crate::step::{StepScope, WStep};
use crate::txn::{AccessPolicy, TxResult, TxnScope, WoTxn};

// ---------------------------------------------------------------------------
// Step-mode fields
// ---------------------------------------------------------------------------

/// A shared scalar accessed from step scopes.
///
/// The caller is responsible for correctness: validate the owner's orec
/// after a read, or hold the orec before a write. The accessors only
/// guarantee that the loads and stores themselves are atomic.
#[repr(transparent)]
pub struct SField<T> {
    cell: UnsafeCell<T>,
}

// SAFETY: all shared access goes through atomic operations of the scalar's
// width (the concurrent accessors are only available for T: Scalar).
unsafe impl<T: Scalar> Sync for SField<T> {}
// SAFETY: the field is plain data; ownership may move between threads.
unsafe impl<T: Scalar> Send for SField<T> {}

impl<T> SField<T> {
    /// Construct a field holding `val`.
    #[must_use]
    pub const fn new(val: T) -> Self {
        Self {
            cell: UnsafeCell::new(val),
        }
    }

    /// Read with exclusive access (teardown paths, `&mut self` proves no
    /// concurrency).
    #[inline]
    pub fn get_mut(&mut self) -> T
    where
        T: Copy,
    {
        // SAFETY: exclusive borrow; no concurrent access is possible.
        unsafe { *self.cell.get() }
    }
}

impl<T: Scalar> SField<T> {
    /// Read the field from any step. Acquire-ordered, so the subsequent
    /// orec check observes at least this read's version.
    #[inline]
    pub fn get(&self, _tx: &impl StepScope) -> T {
        // SAFETY: the cell is live (self is borrowed) and only accessed
        // atomically through these methods.
        unsafe { atomics::safe_read(self.cell.get()) }
    }

    /// Write the field from a writing step whose owner orec is held.
    ///
    /// Release-ordered: when the written value is a pointer to a node the
    /// step just initialized, a reader that acquires it must also see the
    /// initialization. Ownership of the orec already serializes writers.
    #[inline]
    pub fn set(&self, val: T, _tx: &WStep<'_>) {
        // SAFETY: as in `get`.
        unsafe {
            atomics::store(
                self.cell.get().cast(),
                T::WIDTH,
                val.to_bits(),
                Ordering::Release,
            );
        }
    }
}

impl<T: Scalar + Default> Default for SField<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Scalar + std::fmt::Debug> std::fmt::Debug for SField<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Debug output is inherently racy; an acquire read keeps it sane.
        // SAFETY: as in `get`.
        let val = unsafe { atomics::safe_read(self.cell.get()) };
        write!(f, "SField({val:?})")
    }
}

// ---------------------------------------------------------------------------
// Transactional fields
// ---------------------------------------------------------------------------

/// A shared scalar accessed from transactional scopes.
///
/// The general accessors ([`TField::get`], [`TField::set`]) are always
/// correct. The specialised variants encode caller knowledge the policy can
/// exploit to skip logging or validation; using one when its premise does
/// not hold voids the transaction's consistency.
#[repr(transparent)]
pub struct TField<T> {
    cell: UnsafeCell<T>,
}

// SAFETY: all shared access goes through atomic operations of the scalar's
// width (directly, or via the undo/redo logs which use the same
// primitives); the concurrent accessors are only available for T: Scalar.
unsafe impl<T: Scalar> Sync for TField<T> {}
// SAFETY: the field is plain data; ownership may move between threads.
unsafe impl<T: Scalar> Send for TField<T> {}

impl<T> TField<T> {
    /// Construct a field holding `val`.
    #[must_use]
    pub const fn new(val: T) -> Self {
        Self {
            cell: UnsafeCell::new(val),
        }
    }

    /// Read with exclusive access (teardown paths, `&mut self` proves no
    /// concurrency).
    #[inline]
    pub fn get_mut(&mut self) -> T
    where
        T: Copy,
    {
        // SAFETY: exclusive borrow; no concurrent access is possible.
        unsafe { *self.cell.get() }
    }
}

impl<T: Scalar> TField<T> {
    /// Transactional read (general-purpose).
    pub fn get<S: TxnScope>(&self, tx: &mut S, owner: &impl Ownable) -> TxResult<T> {
        let ctx = tx.ctx_mut();
        if ctx.irrevocable {
            // SAFETY: the cell is live and accessed atomically.
            return Ok(unsafe { atomics::safe_read(self.cell.get()) });
        }
        // SAFETY: the cell is live, naturally aligned, atomically accessed,
        // and guarded by the owner's orec per this field's placement.
        unsafe { S::Policy::read(ctx, self.cell.get(), owner.orec()) }
    }

    /// Transactional read when this is guaranteed not to be the
    /// transaction's first access of `owner`.
    pub fn re_get<S: TxnScope>(&self, tx: &mut S, owner: &impl Ownable) -> TxResult<T> {
        let ctx = tx.ctx_mut();
        if ctx.irrevocable {
            // SAFETY: as in `get`.
            return Ok(unsafe { atomics::safe_read(self.cell.get()) });
        }
        // SAFETY: as in `get`.
        unsafe { S::Policy::re_read(ctx, self.cell.get(), owner.orec()) }
    }

    /// Transactional read in the middle of a straight-line sequence of
    /// reads of `owner`, where the bracketing accesses validate.
    pub fn get_in_seq<S: TxnScope>(&self, tx: &mut S, _owner: &impl Ownable) -> T {
        let ctx = tx.ctx_mut();
        // SAFETY: as in `get`.
        unsafe { S::Policy::read_in_seq(ctx, self.cell.get()) }
    }

    /// Transactional read when `owner` is already owned by `tx`.
    pub fn get_mine<P: AccessPolicy>(
        &self,
        tx: &mut WoTxn<'_, P>,
        owner: &impl Ownable,
    ) -> TxResult<T> {
        let ctx = tx.ctx_mut();
        if ctx.irrevocable {
            // SAFETY: as in `get`.
            return Ok(unsafe { atomics::safe_read(self.cell.get()) });
        }
        // SAFETY: as in `get`, plus the caller's ownership premise.
        unsafe { P::read_mine(ctx, self.cell.get(), owner.orec()) }
    }

    /// Transactional write (general-purpose).
    pub fn set<P: AccessPolicy>(
        &self,
        tx: &mut WoTxn<'_, P>,
        owner: &impl Ownable,
        val: T,
    ) -> TxResult<()> {
        let ctx = tx.ctx_mut();
        if ctx.irrevocable {
            // SAFETY: as in `get`; irrevocable writers are globally
            // exclusive.
            unsafe { atomics::safe_write(self.cell.get(), val) };
            return Ok(());
        }
        // SAFETY: as in `get`.
        unsafe { P::write(ctx, self.cell.get(), owner.orec(), val) }
    }

    /// Transactional write when `owner` is already owned by `tx`.
    pub fn set_mine<P: AccessPolicy>(
        &self,
        tx: &mut WoTxn<'_, P>,
        owner: &impl Ownable,
        val: T,
    ) {
        let ctx = tx.ctx_mut();
        let _ = owner;
        if ctx.irrevocable {
            // SAFETY: as in `set`.
            unsafe { atomics::safe_write(self.cell.get(), val) };
            return;
        }
        // SAFETY: as in `set`, plus the caller's ownership guarantee.
        unsafe { P::write_mine(ctx, self.cell.get(), val) }
    }

    /// Write to captured (not-yet-shared) memory, such as a node this
    /// transaction allocated and has not yet linked in. No logging, no
    /// locking.
    pub fn set_cap<P: AccessPolicy>(&self, _tx: &WoTxn<'_, P>, val: T) {
        // SAFETY: the cell is live; relaxed is enough because the object
        // only becomes shared through a later, release-ordered link write.
        unsafe {
            atomics::store(
                self.cell.get().cast(),
                T::WIDTH,
                val.to_bits(),
                Ordering::Relaxed,
            );
        }
    }

    /// Read from captured (not-yet-shared) memory. The counterpart of
    /// [`TField::set_cap`] for chunks a transaction is still assembling.
    pub fn get_cap<P: AccessPolicy>(&self, _tx: &WoTxn<'_, P>) -> T {
        // SAFETY: the cell is live; the object is private to the caller.
        unsafe { atomics::safe_read(self.cell.get()) }
    }

    /// Step-mode read of a transactional field.
    ///
    /// Hybrid data structures traverse in step mode over the same nodes
    /// their transactions write; the caller validates the owner's orec, as
    /// with [`SField::get`].
    #[inline]
    pub fn get_step(&self, _tx: &impl StepScope) -> T {
        // SAFETY: as in `get`.
        unsafe { atomics::safe_read(self.cell.get()) }
    }

    /// Step-mode write of a transactional field; the owner's orec must be
    /// held by the writing step. Release-ordered, as [`SField::set`].
    #[inline]
    pub fn set_step(&self, val: T, _tx: &WStep<'_>) {
        // SAFETY: as in `get`.
        unsafe {
            atomics::store(
                self.cell.get().cast(),
                T::WIDTH,
                val.to_bits(),
                Ordering::Release,
            );
        }
    }
}

impl<T: Scalar + Default> Default for TField<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Scalar + std::fmt::Debug> std::fmt::Debug for TField<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SAFETY: as in `SField::fmt`.
        let val = unsafe { atomics::safe_read(self.cell.get()) };
        write!(f, "TField({val:?})")
    }
}
