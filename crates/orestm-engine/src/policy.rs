//! Orec placement policies: per-object and per-stripe.
//!
//! Data objects tracked by the engine ("ownables") carry a policy-provided
//! handle that resolves to their orec. The per-object policy embeds the orec
//! in the object; the per-stripe policy hashes the object's address into a
//! global table and caches the resulting reference, so the (comparatively
//! expensive) hash runs once, at construction.
//!
//! Two ownables may share a stripe. That produces false conflicts but never
//! unsafety, so the table size is purely a throughput knob; it is fixed
//! process-wide, as in a striped-lock table.

use orestm_types::mix13;

use crate::orec::Orec;

/// Number of entries in the global stripe table. Power of two.
pub const STRIPE_COUNT: usize = 1 << 20;

static STRIPES: [Orec; STRIPE_COUNT] = [const { Orec::new() }; STRIPE_COUNT];

/// An object whose synchronization is mediated by an orec.
pub trait Ownable {
    /// The orec guarding this object.
    fn orec(&self) -> &Orec;
}

/// Resolves a policy handle to its orec.
pub trait OrecHandle: Send + Sync + 'static {
    /// The orec this handle designates.
    fn orec(&self) -> &Orec;
}

/// Maps ownables to orecs.
///
/// Implementations are zero-sized markers selected as a type parameter of
/// the data structures; the choice is compiled in, exactly like choosing a
/// lock granularity.
pub trait OrecPolicy: Send + Sync + 'static {
    /// Per-ownable storage for reaching the orec.
    type Handle: OrecHandle;

    /// A handle usable before the object's final address is known.
    ///
    /// Construction is two-phase: objects are built with a placeholder and
    /// then bound to their address, because a striped handle is a function
    /// of where the allocator put the object.
    fn placeholder() -> Self::Handle;

    /// The handle for an ownable living at `addr`.
    fn attach(addr: usize) -> Self::Handle;
}

/// Each ownable embeds its own orec.
pub struct PerObject;

impl OrecHandle for Orec {
    #[inline]
    fn orec(&self) -> &Orec {
        self
    }
}

impl OrecPolicy for PerObject {
    type Handle = Orec;

    #[inline]
    fn placeholder() -> Orec {
        Orec::new()
    }

    #[inline]
    fn attach(_addr: usize) -> Orec {
        Orec::new()
    }
}

/// Ownables share orecs drawn from the global stripe table.
pub struct PerStripe;

/// A cached reference into the stripe table.
pub struct StripeRef(&'static Orec);

impl OrecHandle for StripeRef {
    #[inline]
    fn orec(&self) -> &Orec {
        self.0
    }
}

impl OrecPolicy for PerStripe {
    type Handle = StripeRef;

    #[inline]
    fn placeholder() -> StripeRef {
        StripeRef(&STRIPES[0])
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn attach(addr: usize) -> StripeRef {
        let idx = (mix13(addr as u64) as usize) & (STRIPE_COUNT - 1);
        StripeRef(&STRIPES[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::{OrecHandle, OrecPolicy, PerObject, PerStripe, STRIPE_COUNT};

    #[test]
    fn per_object_handles_are_distinct_orecs() {
        let a = PerObject::attach(0x1000);
        let b = PerObject::attach(0x1000);
        assert!(!std::ptr::eq(a.orec(), b.orec()));
    }

    #[test]
    fn per_stripe_is_deterministic_per_address() {
        let a = PerStripe::attach(0x7f00_dead_1000);
        let b = PerStripe::attach(0x7f00_dead_1000);
        assert!(std::ptr::eq(a.orec(), b.orec()));
    }

    #[test]
    fn nearby_addresses_disperse_across_stripes() {
        // 64-byte-spaced allocations (a typical node stride) should not pile
        // onto a handful of stripes.
        let mut seen = std::collections::HashSet::new();
        for i in 0..256_usize {
            let handle = PerStripe::attach(0x5000_0000 + i * 64);
            seen.insert(std::ptr::addr_of!(*handle.orec()) as usize);
        }
        assert!(seen.len() > 200, "only {} distinct stripes", seen.len());
        assert!(seen.len() <= STRIPE_COUNT);
    }
}
