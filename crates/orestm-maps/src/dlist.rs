//! Doubly-linked ordered map, step mode.
//!
//! Traversal runs in read steps: a predecessor query walks forward from the
//! head (or from a saved snapshot), validating each hop against orecs, and
//! returns the found node together with its observed version. Mutators then
//! open a write step that chains onto that observation with a continuation
//! acquisition, lock the affected neighbors, and splice.
//!
//! Snapshots make failed searches cheap to resume: every `snapshot_freq`
//! nodes the traversal records an (object, version) checkpoint, and a retry
//! restarts from the deepest checkpoint that still validates.
//!
//! The unchecked-traversal mode skips per-hop orec checks during the
//! read-only walk and validates only the endpoints. It trades robustness
//! under adversarial schedules for speed; the structure stays memory-safe
//! either way because nodes are reclaimed through SMR.

use std::ptr::{self, NonNull};

use orestm_engine::{
    Orec, Ownable, OrecHandle, OrecPolicy, PerObject, RStep, SField, Scalar, SnapStack, Snapshot,
    StepScope, ThreadCtx, WStep,
};
use orestm_error::Result;
use orestm_types::{END_OF_TIME, MapConfig, Timestamp};

/// A list node. Sentinels carry no key; any node whose key is `None` and is
/// reached by a forward hop is the tail.
struct Node<K, V: Scalar, P: OrecPolicy> {
    orec: P::Handle,
    prev: SFieldPtr<K, V, P>,
    next: SFieldPtr<K, V, P>,
    key: Option<K>,
    val: SField<V>,
}

type SFieldPtr<K, V, P> = SField<*mut Node<K, V, P>>;

impl<K, V: Scalar, P: OrecPolicy> Ownable for Node<K, V, P> {
    fn orec(&self) -> &Orec {
        self.orec.orec()
    }
}

/// A node and the version its orec held when it was last validated.
struct Leq<K, V: Scalar, P: OrecPolicy> {
    obj: *mut Node<K, V, P>,
    ver: Timestamp,
}

impl<K, V: Scalar, P: OrecPolicy> Clone for Leq<K, V, P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K, V: Scalar, P: OrecPolicy> Copy for Leq<K, V, P> {}

/// An ordered map over a doubly-linked list with sentinel endpoints.
///
/// Keys are `Copy` because traversals read them while speculating; values
/// are engine scalars so lookups can read them atomically and validate
/// afterwards instead of locking.
pub struct DlistOmap<K, V: Scalar, P: OrecPolicy = PerObject> {
    head: *mut Node<K, V, P>,
    tail: *mut Node<K, V, P>,
    snapshot_freq: u32,
    avoid_orec_checks: bool,
}

// SAFETY: all shared node state is reached through engine fields and orecs;
// the raw pointers are an implementation detail of a concurrent structure.
unsafe impl<K: Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy> Send for DlistOmap<K, V, P> {}
// SAFETY: as above.
unsafe impl<K: Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy> Sync for DlistOmap<K, V, P> {}

impl<K, V, P> DlistOmap<K, V, P>
where
    K: Copy + Ord + 'static,
    V: Scalar,
    P: OrecPolicy,
{
    /// Construct an empty map: two connected sentinels.
    ///
    /// # Errors
    ///
    /// Fails if `cfg` does not validate (zero `snapshot_freq`).
    pub fn new(me: &mut ThreadCtx, cfg: &MapConfig) -> Result<Self> {
        cfg.validate()?;
        let head = Self::alloc(None, V::from_bits(0));
        let tail = Self::alloc(None, V::from_bits(0));
        // Nothing is shared yet, so no orecs need acquiring, but field
        // writes still require a step context.
        let tx = WStep::new(me);
        // SAFETY: freshly allocated, exclusively ours.
        unsafe {
            (*head).next.set(tail, &tx);
            (*tail).prev.set(head, &tx);
        }
        drop(tx);
        Ok(Self {
            head,
            tail,
            snapshot_freq: cfg.snapshot_freq,
            avoid_orec_checks: false,
        })
    }

    /// Enable the unchecked read-only traversal mode.
    #[must_use]
    pub fn with_unchecked_traversal(mut self) -> Self {
        self.avoid_orec_checks = true;
        self
    }

    fn alloc(key: Option<K>, val: V) -> *mut Node<K, V, P> {
        let mut node = Box::new(Node {
            orec: P::placeholder(),
            prev: SField::new(ptr::null_mut()),
            next: SField::new(ptr::null_mut()),
            key,
            val: SField::new(val),
        });
        node.orec = P::attach(ptr::addr_of!(*node) as usize);
        Box::into_raw(node)
    }

    /// Inclusive predecessor query: the largest node with key at most `key`,
    /// or the head sentinel. Never returns the tail.
    ///
    /// There is no atomicity between this query and its caller: the caller
    /// must validate (or chain onto) the returned version before trusting
    /// the node.
    fn get_leq(&self, me: &mut ThreadCtx, snaps: &mut SnapStack, key: K) -> Leq<K, V, P> {
        loop {
            let tx = RStep::new(me);

            // Start at the head, or at the latest snapshot on a retry.
            // Snapshots are always keyed strictly below `key`.
            let mut curr: Leq<K, V, P> = match snaps.last() {
                None => Leq {
                    obj: self.head,
                    ver: 0,
                },
                Some(s) => Leq {
                    obj: s.obj.cast(),
                    ver: s.ver,
                },
            };

            // The start point cannot have been reclaimed (SMR covers the
            // whole operation), so its next pointer can be read before it
            // is validated.
            // SAFETY: reachable nodes stay allocated for the operation.
            let mut next = unsafe { (*curr.obj).next.get(&tx) };

            if curr.obj == self.head {
                // Save head's version in case head ends up being returned.
                curr.ver = tx.check_orec(unsafe { &*curr.obj });
                if curr.ver == END_OF_TIME {
                    continue;
                }
            } else if !tx.check_continuation(unsafe { &*curr.obj }, curr.ver) {
                // Stale snapshot: drop it and retry from the next-deepest.
                snaps.pop();
                continue;
            }

            let mut until_snapshot = self.snapshot_freq;

            // Search forward from `next`; breaking restarts the query.
            loop {
                // SAFETY: as above; `next` came from a validated (or about
                // to be validated) hop and SMR keeps it allocated.
                let next_ref = unsafe { &*next };
                let next_next = next_ref.next.get(&tx);
                let nkey = match next_ref.key {
                    // Keyless successor: the tail. Stop at curr.
                    None => {
                        if self.avoid_orec_checks {
                            curr.ver = tx.check_orec(unsafe { &*curr.obj });
                            if curr.ver == END_OF_TIME {
                                break;
                            }
                        }
                        return curr;
                    }
                    Some(k) => k,
                };

                let mut next_ver = 0;
                if !self.avoid_orec_checks {
                    next_ver = tx.check_orec(next_ref);
                    if next_ver == END_OF_TIME {
                        break; // inconsistent hop; restart from a snapshot
                    }
                }

                if nkey > key {
                    if self.avoid_orec_checks {
                        curr.ver = tx.check_orec(unsafe { &*curr.obj });
                        if curr.ver == END_OF_TIME {
                            break;
                        }
                    }
                    return curr;
                }
                if nkey == key {
                    if self.avoid_orec_checks {
                        next_ver = tx.check_orec(next_ref);
                        if next_ver == END_OF_TIME {
                            break;
                        }
                    }
                    return Leq {
                        obj: next,
                        ver: next_ver,
                    };
                }

                // Keep traversing; maybe checkpoint first.
                until_snapshot -= 1;
                if until_snapshot == 0 {
                    if self.avoid_orec_checks {
                        curr.ver = tx.check_orec(unsafe { &*curr.obj });
                        if curr.ver != END_OF_TIME {
                            snaps.push(Snapshot {
                                obj: curr.obj.cast(),
                                ver: curr.ver,
                            });
                        }
                    } else {
                        snaps.push(Snapshot {
                            obj: curr.obj.cast(),
                            ver: curr.ver,
                        });
                    }
                    until_snapshot = self.snapshot_freq;
                }
                curr.obj = next;
                if !self.avoid_orec_checks {
                    curr.ver = next_ver;
                }
                next = next_next;
            }
        }
    }

    /// Look up `key`.
    pub fn get(&self, me: &mut ThreadCtx, key: K) -> Option<V> {
        me.op_begin();
        let result = self.get_inner(me, key);
        me.op_end();
        result
    }

    fn get_inner(&self, me: &mut ThreadCtx, key: K) -> Option<V> {
        let mut snaps = SnapStack::new();
        loop {
            let found = self.get_leq(me, &mut snaps, key);
            // SAFETY: SMR keeps the returned node allocated.
            let node = unsafe { &*found.obj };
            // The key is immutable, so a fast not-found exit needs no
            // validation.
            if found.obj == self.head || node.key != Some(key) {
                return None;
            }

            // Hand-over-hand finish: read the value atomically, then
            // confirm the node was still current.
            let tx = RStep::new(me);
            let val = node.val.get(&tx);
            if !tx.check_continuation(node, found.ver) {
                drop(tx);
                continue;
            }
            return Some(val);
        }
    }

    /// Insert `key -> val` if absent. Returns `false` when the key exists.
    pub fn insert(&self, me: &mut ThreadCtx, key: K, val: V) -> bool {
        me.op_begin();
        let result = self.insert_inner(me, key, val);
        me.op_end();
        result
    }

    fn insert_inner(&self, me: &mut ThreadCtx, key: K, val: V) -> bool {
        let mut snaps = SnapStack::new();
        loop {
            let found = self.get_leq(me, &mut snaps, key);
            // SAFETY: as in get_inner.
            let node = unsafe { &*found.obj };
            if found.obj != self.head && node.key == Some(key) {
                return false;
            }

            // Either the head, or the largest smaller key: splice after it.
            let mut tx = WStep::new(me);
            if !tx.acquire_continuation(node, found.ver) {
                tx.unwind();
                continue;
            }
            let next = node.next.get(&tx);
            // SAFETY: successor of an owned node, kept allocated by SMR.
            let next_ref = unsafe { &*next };
            // The successor's version does not matter, only exclusivity.
            if !tx.acquire_aggressive(next_ref) {
                tx.unwind();
                continue;
            }

            let new_node = Self::alloc(Some(key), val);
            // SAFETY: freshly allocated, not yet visible.
            let new_ref = unsafe { &*new_node };
            new_ref.next.set(next, &tx);
            new_ref.prev.set(found.obj, &tx);
            node.next.set(new_node, &tx);
            next_ref.prev.set(new_node, &tx);
            return true;
        }
    }

    /// Remove `key`. Returns `false` when the key is absent.
    pub fn remove(&self, me: &mut ThreadCtx, key: K) -> bool {
        me.op_begin();
        let result = self.remove_inner(me, key);
        me.op_end();
        result
    }

    fn remove_inner(&self, me: &mut ThreadCtx, key: K) -> bool {
        let mut snaps = SnapStack::new();
        loop {
            let found = self.get_leq(me, &mut snaps, key);
            // SAFETY: as in get_inner.
            let node = unsafe { &*found.obj };
            if found.obj == self.head || node.key != Some(key) {
                return false;
            }

            let mut tx = WStep::new(me);
            // Locking the target is what makes unlinking safe without mark
            // bits: the orec change stops anyone else from trusting it.
            if !tx.acquire_continuation(node, found.ver) {
                tx.unwind();
                continue;
            }
            let pred = node.prev.get(&tx);
            let succ = node.next.get(&tx);
            // SAFETY: neighbors of an owned node, kept allocated by SMR.
            let (pred_ref, succ_ref) = unsafe { (&*pred, &*succ) };
            if !tx.acquire_aggressive(pred_ref) || !tx.acquire_aggressive(succ_ref) {
                tx.unwind();
                continue;
            }

            pred_ref.next.set(succ, &tx);
            succ_ref.prev.set(pred, &tx);
            // SAFETY: unlinked above while holding its orec; unreachable
            // once this step commits.
            unsafe {
                tx.reclaim(NonNull::new_unchecked(found.obj));
            }
            return true;
        }
    }
}

impl<K, V: Scalar, P: OrecPolicy> Drop for DlistOmap<K, V, P> {
    fn drop(&mut self) {
        // Exclusive access: free the chain directly.
        let mut curr = self.head;
        while !curr.is_null() {
            // SAFETY: nodes were allocated by Self::alloc and are owned by
            // the list; &mut self guarantees no concurrent operation.
            let mut node = unsafe { Box::from_raw(curr) };
            curr = node.next.get_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use orestm_engine::{PerObject, PerStripe, ThreadCtx};
    use orestm_types::MapConfig;

    use super::DlistOmap;

    fn small_cfg() -> MapConfig {
        MapConfig::default().with_snapshot_freq(4)
    }

    #[test]
    fn sequential_insert_get_remove() {
        let mut me = ThreadCtx::new();
        let map: DlistOmap<u64, u64> = DlistOmap::new(&mut me, &small_cfg()).expect("config");

        assert!(map.insert(&mut me, 2, 20));
        assert!(map.insert(&mut me, 4, 40));
        assert!(map.insert(&mut me, 6, 60));
        assert_eq!(map.get(&mut me, 4), Some(40));
        assert_eq!(map.get(&mut me, 5), None);

        assert!(map.remove(&mut me, 2));
        assert!(!map.remove(&mut me, 2));
        assert_eq!(map.get(&mut me, 2), None);
        assert_eq!(map.get(&mut me, 4), Some(40));
    }

    #[test]
    fn duplicate_insert_preserves_the_original_value() {
        let mut me = ThreadCtx::new();
        let map: DlistOmap<u64, u64> = DlistOmap::new(&mut me, &small_cfg()).expect("config");

        assert!(map.insert(&mut me, 7, 70));
        assert!(!map.insert(&mut me, 7, 71));
        assert_eq!(map.get(&mut me, 7), Some(70));
    }

    #[test]
    fn many_keys_stress_snapshot_resumption() {
        let mut me = ThreadCtx::new();
        let map: DlistOmap<u64, u64> = DlistOmap::new(&mut me, &small_cfg()).expect("config");
        for k in 0..200 {
            assert!(map.insert(&mut me, k, k * 10));
        }
        for k in 0..200 {
            assert_eq!(map.get(&mut me, k), Some(k * 10));
        }
        for k in (0..200).step_by(2) {
            assert!(map.remove(&mut me, k));
        }
        for k in 0..200 {
            let expect = if k % 2 == 0 { None } else { Some(k * 10) };
            assert_eq!(map.get(&mut me, k), expect);
        }
    }

    #[test]
    fn unchecked_traversal_mode_matches_checked_results() {
        let mut me = ThreadCtx::new();
        let map: DlistOmap<u32, u32> = DlistOmap::new(&mut me, &small_cfg())
            .expect("config")
            .with_unchecked_traversal();
        for k in [5_u32, 1, 9, 3, 7] {
            assert!(map.insert(&mut me, k, k + 100));
        }
        for k in [1_u32, 3, 5, 7, 9] {
            assert_eq!(map.get(&mut me, k), Some(k + 100));
        }
        assert_eq!(map.get(&mut me, 4), None);
        assert!(map.remove(&mut me, 5));
        assert_eq!(map.get(&mut me, 5), None);
    }

    #[test]
    fn per_stripe_policy_behaves_identically() {
        let mut me = ThreadCtx::new();
        let map: DlistOmap<u64, u64, PerStripe> =
            DlistOmap::new(&mut me, &small_cfg()).expect("config");
        for k in 0..32 {
            assert!(map.insert(&mut me, k, k));
        }
        for k in 0..32 {
            assert_eq!(map.get(&mut me, k), Some(k));
        }
    }

    #[test]
    fn concurrent_disjoint_inserts_all_land() {
        let map: DlistOmap<u64, u64, PerObject> = {
            let mut me = ThreadCtx::new();
            DlistOmap::new(&mut me, &small_cfg()).expect("config")
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..100_u64 {
                        let k = t + 4 * i;
                        assert!(map.insert(&mut me, k, k * 2));
                    }
                });
            }
        });

        let mut me = ThreadCtx::new();
        for k in 0..400_u64 {
            assert_eq!(map.get(&mut me, k), Some(k * 2));
        }
        assert_eq!(map.get(&mut me, 400), None);
    }

    #[test]
    fn conflicting_inserts_pick_exactly_one_winner() {
        let map: DlistOmap<u64, u64> = {
            let mut me = ThreadCtx::new();
            DlistOmap::new(&mut me, &small_cfg()).expect("config")
        };

        let winners: Vec<bool> = std::thread::scope(|s| {
            (0..4_u64)
                .map(|t| {
                    let map = &map;
                    s.spawn(move || {
                        let mut me = ThreadCtx::new();
                        map.insert(&mut me, 7, t)
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().expect("inserter"))
                .collect()
        });

        assert_eq!(winners.iter().filter(|&&w| w).count(), 1);
        let mut me = ThreadCtx::new();
        assert!(map.get(&mut me, 7).is_some());
    }

    #[test]
    fn concurrent_mixed_workload_stays_consistent() {
        let map: DlistOmap<u64, u64> = {
            let mut me = ThreadCtx::new();
            DlistOmap::new(&mut me, &small_cfg()).expect("config")
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..200_u64 {
                        let k = (t * 31 + i * 7) % 64;
                        match i % 3 {
                            0 => {
                                let _ = map.insert(&mut me, k, k);
                            }
                            1 => {
                                let _ = map.remove(&mut me, k);
                            }
                            _ => {
                                if let Some(v) = map.get(&mut me, k) {
                                    assert_eq!(v, k);
                                }
                            }
                        }
                    }
                });
            }
        });
    }
}
