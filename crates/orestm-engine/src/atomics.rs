//! Width-dispatched raw atomic memory access.
//!
//! The undo log, the redo log and the typed fields all need to read and
//! write program memory with atomicity at the width of the accessed scalar,
//! through nothing more than an address and a width tag. This module is the
//! single unsafe choke-point for that: everything else manipulates plain
//! `u64` bit patterns.
//!
//! Mixed-size access caveat: the redo log's write-back coalesces adjacent
//! valid bytes into the widest naturally aligned stores it can. A concurrent
//! optimistic reader may load one of the covered scalars at its own (narrower)
//! width. Every such racing read is validated against an orec afterwards and
//! discarded on mismatch, so a torn combination is never *used*, but the
//! accesses themselves must still be atomic, which is why plain loads and
//! stores are never emitted here.

use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};

use orestm_types::Width;

/// Atomically load `width` bytes from `addr`, acquire-ordered, zero-extended
/// into a `u64`.
///
/// # Safety
///
/// `addr` must be valid for reads of `width.bytes()` bytes, naturally
/// aligned for that width, and all concurrent access to those bytes must be
/// atomic.
#[inline]
pub unsafe fn load_acquire(addr: *mut u8, width: Width) -> u64 {
    // SAFETY: caller guarantees validity, alignment, and atomic-only access.
    unsafe {
        match width {
            Width::W1 => u64::from(AtomicU8::from_ptr(addr).load(Ordering::Acquire)),
            Width::W2 => u64::from(AtomicU16::from_ptr(addr.cast()).load(Ordering::Acquire)),
            Width::W4 => u64::from(AtomicU32::from_ptr(addr.cast()).load(Ordering::Acquire)),
            Width::W8 => AtomicU64::from_ptr(addr.cast()).load(Ordering::Acquire),
        }
    }
}

/// Atomically store the low `width` bytes of `bits` to `addr`.
///
/// # Safety
///
/// Same contract as [`load_acquire`], for writes.
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn store(addr: *mut u8, width: Width, bits: u64, order: Ordering) {
    // SAFETY: caller guarantees validity, alignment, and atomic-only access.
    unsafe {
        match width {
            Width::W1 => AtomicU8::from_ptr(addr).store(bits as u8, order),
            Width::W2 => AtomicU16::from_ptr(addr.cast()).store(bits as u16, order),
            Width::W4 => AtomicU32::from_ptr(addr.cast()).store(bits as u32, order),
            Width::W8 => AtomicU64::from_ptr(addr.cast()).store(bits, order),
        }
    }
}

/// A scalar the engine can log and access atomically.
///
/// Covers the integral, boolean and raw-pointer types of at most one
/// machine word. The bit conversions are exact round trips; widths follow
/// the type's size, so a `Scalar` is always naturally aligned at least as
/// strictly as its width requires.
///
/// # Safety
///
/// Implementations must report a `WIDTH` equal to the type's size and must
/// round-trip every value bit-exactly through `to_bits`/`from_bits`.
pub unsafe trait Scalar: Copy + 'static {
    /// The access width of this scalar.
    const WIDTH: Width;

    /// The value as a zero-extended bit pattern.
    fn to_bits(self) -> u64;

    /// Recover a value from a bit pattern produced by [`Scalar::to_bits`].
    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_scalar_int {
    ($($ty:ty => $width:expr, $un:ty;)*) => {$(
        // SAFETY: WIDTH matches size_of, and the unsigned cast round-trips.
        unsafe impl Scalar for $ty {
            const WIDTH: Width = $width;

            #[inline]
            fn to_bits(self) -> u64 {
                self as $un as u64
            }

            #[inline]
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            fn from_bits(bits: u64) -> Self {
                bits as $un as $ty
            }
        }
    )*};
}

impl_scalar_int! {
    u8 => Width::W1, u8;
    u16 => Width::W2, u16;
    u32 => Width::W4, u32;
    u64 => Width::W8, u64;
    i8 => Width::W1, u8;
    i16 => Width::W2, u16;
    i32 => Width::W4, u32;
    i64 => Width::W8, u64;
    usize => Width::W8, u64;
    isize => Width::W8, u64;
}

// SAFETY: bool is one byte and only the values 0 and 1 are produced.
unsafe impl Scalar for bool {
    const WIDTH: Width = Width::W1;

    #[inline]
    fn to_bits(self) -> u64 {
        u64::from(self)
    }

    #[inline]
    fn from_bits(bits: u64) -> Self {
        bits != 0
    }
}

// SAFETY: raw pointers are one machine word; the usize round trip preserves
// the address (provenance is not tracked through the logs, which is the
// documented contract of logged pointer fields).
unsafe impl<T: 'static> Scalar for *mut T {
    const WIDTH: Width = Width::W8;

    #[inline]
    fn to_bits(self) -> u64 {
        self as usize as u64
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn from_bits(bits: u64) -> Self {
        bits as usize as Self
    }
}

// SAFETY: as for `*mut T`.
unsafe impl<T: 'static> Scalar for *const T {
    const WIDTH: Width = Width::W8;

    #[inline]
    fn to_bits(self) -> u64 {
        self as usize as u64
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn from_bits(bits: u64) -> Self {
        bits as usize as Self
    }
}

/// Perform a speculative acquire-ordered read of a scalar in memory.
///
/// # Safety
///
/// `addr` must point to a live, initialized `T` accessed only atomically.
#[inline]
pub unsafe fn safe_read<T: Scalar>(addr: *mut T) -> T {
    // SAFETY: forwarded to the caller's contract.
    T::from_bits(unsafe { load_acquire(addr.cast(), T::WIDTH) })
}

/// Perform a release-ordered write of a scalar to memory.
///
/// # Safety
///
/// As for [`safe_read`], for writes.
#[inline]
pub unsafe fn safe_write<T: Scalar>(addr: *mut T, val: T) {
    // SAFETY: forwarded to the caller's contract.
    unsafe { store(addr.cast(), T::WIDTH, val.to_bits(), Ordering::Release) }
}
