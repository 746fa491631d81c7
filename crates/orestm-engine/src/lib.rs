//! The ownership-record timestamp engine.
//!
//! This crate is the synchronization substrate under the `orestm` maps: a
//! global timestamp clock, ownership records (orecs) with a CAS-based
//! acquire/release lifecycle, per-thread undo and redo logs with
//! byte-granularity atomic write-back, timestamp-based safe memory
//! reclamation, and an epoch registry providing quiescence and
//! irrevocability.
//!
//! Three usage styles share the substrate and may be mixed freely:
//!
//! - **Step mode** ([`RStep`], [`WStep`]): short critical sections that
//!   read and acquire orecs directly, with programmer-managed validation.
//! - **Transactional mode** ([`ro_run`], [`wo_run`]): composite operations
//!   with automatic conflict detection under a selectable access policy
//!   ([`EagerC1`], [`EagerC2`], [`Lazy`], [`WbLock`]).
//! - **Hybrid mode**: a chain of step reads whose observed orec versions a
//!   subsequent transaction inherits ([`TxnScope::inherit`]), composing the
//!   chain and the transaction into one linearizable operation.
//!
//! The engine is blocking in the classical sense: acquisition can spin
//! against a concurrent owner, mediated by the contention manager. Engine
//! primitives never construct errors; they report failure through `false`
//! or [`orestm_types::END_OF_TIME`], and the scoped layers translate
//! failure into abort-and-retry.

pub mod atomics;
pub mod clock;
pub mod cm;
pub mod ctx;
pub mod field;
pub mod metrics;
pub mod orec;
pub mod policy;
pub mod redo_log;
pub mod registry;
pub mod smr;
pub mod step;
pub mod txn;
pub mod undo_log;

pub use atomics::Scalar;
pub use cm::{Cm, ExpBackoff};
pub use ctx::{SnapStack, Snapshot, ThreadCtx};
pub use field::{SField, TField};
pub use metrics::{EngineMetrics, EngineMetricsSnapshot, GLOBAL_ENGINE_METRICS};
pub use orec::{Orec, OreCtx, Unwind};
pub use policy::{OrecHandle, OrecPolicy, Ownable, PerObject, PerStripe, StripeRef};
pub use redo_log::RedoLog;
pub use registry::{Registry, registry};
pub use smr::Retired;
pub use step::{RStep, StepScope, WStep};
pub use txn::{
    Abort, AccessPolicy, EagerC1, EagerC2, Lazy, RoTxn, TxResult, TxnScope, WbLock, WoTxn, ro_run,
    wo_run,
};
pub use undo_log::{UndoEntry, UndoLog};
