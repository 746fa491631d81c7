//! Concurrent, linearizable maps built on the orestm engine.
//!
//! Every map shares one surface — `new(ctx, &MapConfig)`, `get`, `insert`
//! (insert-if-absent, not upsert), `remove` — and one set of guarantees:
//! operations are linearizable with respect to each other, write scopes
//! linearize at their commit-time clock read, read scopes at their begin.
//! What differs is the synchronization style each structure demonstrates:
//!
//! | map                | style                                   |
//! |--------------------|-----------------------------------------|
//! | [`DlistOmap`]      | step mode, snapshot-resumable traversal |
//! | [`SlistOmap`]      | transactional (policy-generic)          |
//! | [`SkiplistOmap`]   | step mode, multi-level stitching        |
//! | [`IbstOmap`]       | hybrid: step traversal + inheriting txn |
//! | [`RbtreeOmap`]     | transactional (lazy write-back)         |
//! | [`ResizableUmap`]  | step mode, lazy cooperative resizing    |
//! | [`InterlockedUmap`]| transactional chunked hashing           |
//!
//! Keys are totally ordered where the container is ordered, hashable where
//! unordered. Values are engine scalars (at most one aligned word) unless a
//! structure stores them through a transactional field. Maps are generic
//! over the orec placement policy; per-object and per-stripe instances are
//! interchangeable.

pub mod carumap;
pub mod dlist;
pub mod ibst;
pub mod iht;
pub mod rbtree;
pub mod skiplist;
pub mod slist;

pub use carumap::ResizableUmap;
pub use dlist::DlistOmap;
pub use ibst::IbstOmap;
pub use iht::InterlockedUmap;
pub use rbtree::RbtreeOmap;
pub use skiplist::SkiplistOmap;
pub use slist::SlistOmap;
