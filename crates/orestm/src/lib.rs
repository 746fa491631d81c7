//! orestm: concurrent, linearizable ordered and unordered maps on an
//! ownership-record timestamp engine.
//!
//! The engine ([`orestm_engine`]) provides the synchronization substrate —
//! a monotone timestamp clock, versioned ownership records, undo/redo logs
//! with byte-granularity atomic write-back, timestamp-based safe memory
//! reclamation, and quiescence/irrevocability — usable in three styles that
//! mix freely:
//!
//! - **step mode**: short, hand-validated critical sections;
//! - **transactional mode**: composite operations with automatic conflict
//!   detection under a pluggable access policy;
//! - **hybrid mode**: step-mode observations inherited by a transactional
//!   finalizer.
//!
//! The maps ([`orestm_maps`]) are the structures those contracts were built
//! to serve.
//!
//! # Example
//!
//! ```
//! use orestm::{DlistOmap, MapConfig, ThreadCtx};
//!
//! let mut ctx = ThreadCtx::new();
//! let map: DlistOmap<u64, u64> =
//!     DlistOmap::new(&mut ctx, &MapConfig::default()).expect("valid config");
//! assert!(map.insert(&mut ctx, 2, 20));
//! assert_eq!(map.get(&mut ctx, 2), Some(20));
//! assert!(map.remove(&mut ctx, 2));
//! assert_eq!(map.get(&mut ctx, 2), None);
//! ```

pub use orestm_engine::{
    Abort, AccessPolicy, Cm, EagerC1, EagerC2, EngineMetricsSnapshot, ExpBackoff,
    GLOBAL_ENGINE_METRICS, Lazy, Orec, OreCtx, OrecPolicy, Ownable, PerObject, PerStripe, RStep,
    RoTxn, SField, Scalar, StepScope, TField, ThreadCtx, TxResult, TxnScope, Unwind, WStep, WbLock,
    WoTxn, ro_run, wo_run,
};
pub use orestm_error::{OrestmError, Result};
pub use orestm_maps::{
    DlistOmap, IbstOmap, InterlockedUmap, RbtreeOmap, ResizableUmap, SkiplistOmap, SlistOmap,
};
pub use orestm_types::{END_OF_TIME, MapConfig, Timestamp};
