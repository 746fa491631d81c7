//! Contention management.
//!
//! The engine itself is oblivious to contention: a failed acquisition just
//! returns `false`. The scoped runners consult a contention manager at
//! begin, commit and abort. The default manager applies randomized
//! exponential backoff after aborts, which is enough to break livelock
//! between symmetric retry loops.

use orestm_types::FastRand;

/// Policy hook invoked only at begin/commit/abort.
#[derive(Debug, Clone)]
pub enum Cm {
    /// No contention management at all.
    Noop,
    /// Randomized exponential backoff on abort.
    ExpBackoff(ExpBackoff),
}

impl Default for Cm {
    fn default() -> Self {
        Self::ExpBackoff(ExpBackoff::default())
    }
}

impl Cm {
    /// Run before a transaction begins. Returns `true` if the transaction
    /// should become irrevocable immediately.
    #[must_use]
    pub fn before_begin(&mut self) -> bool {
        false
    }

    /// Run after a transaction finishes cleaning up from an abort.
    pub fn after_abort(&mut self, rng: &mut FastRand) {
        match self {
            Self::Noop => {}
            Self::ExpBackoff(b) => b.backoff(rng),
        }
    }

    /// Run after a transaction finishes cleaning up from a commit.
    pub fn after_commit(&mut self) {
        match self {
            Self::Noop => {}
            Self::ExpBackoff(b) => b.consec_aborts = 0,
        }
    }
}

/// Randomized exponential backoff state.
///
/// Backoff durations are spin iterations bounded by powers of two between
/// `2^min_exp` and `2^max_exp`, growing with consecutive aborts.
#[derive(Debug, Clone)]
pub struct ExpBackoff {
    min_exp: u32,
    max_exp: u32,
    consec_aborts: u32,
}

impl Default for ExpBackoff {
    fn default() -> Self {
        Self::new(4, 16)
    }
}

impl ExpBackoff {
    /// Construct with the given exponent bounds.
    #[must_use]
    pub fn new(min_exp: u32, max_exp: u32) -> Self {
        Self {
            min_exp: min_exp.min(max_exp),
            max_exp,
            consec_aborts: 0,
        }
    }

    fn backoff(&mut self, rng: &mut FastRand) {
        self.consec_aborts += 1;
        let exp = (self.min_exp + self.consec_aborts).min(self.max_exp);
        let spins = rng.next_u64() & ((1 << exp) - 1);
        for _ in 0..spins {
            std::hint::spin_loop();
        }
    }
}
