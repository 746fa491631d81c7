//! Internal binary search tree, hybrid mode.
//!
//! Traversal and insertion run in step mode: a read step walks from the
//! sentinel toward the key, pushing validated (node, version) checkpoints
//! so a retry resumes from the deepest prefix that still holds, and insert
//! finishes with a single continuation acquisition of the parent.
//!
//! Removal is the hybrid showcase: the step-mode traversal locates the
//! target (and, for two-child nodes, its successor) together with observed
//! versions, and a subsequent write transaction *inherits* those versions
//! into its read set before unstitching. If any intervening writer touched
//! the nodes, the inheritance or the commit validation fails and the
//! operation retries from the top — the step chain and the transaction
//! compose into one linearizable operation.
//!
//! The sentinel's left child is the true root; the sentinel itself stores
//! a dummy key that is never compared.

use std::ptr::{self, NonNull};

use orestm_engine::{
    Orec, Ownable, OrecHandle, OrecPolicy, PerObject, RStep, Scalar, SnapStack, Snapshot,
    StepScope, TField, ThreadCtx, TxnScope, WStep, WbLock, wo_run,
};
use orestm_error::Result;
use orestm_types::{END_OF_TIME, MapConfig, Timestamp};

const LEFT: usize = 0;
const RIGHT: usize = 1;

struct Node<K: Scalar, V: Scalar, P: OrecPolicy> {
    orec: P::Handle,
    children: [TField<*mut Node<K, V, P>>; 2],
    /// Mutable: removal overwrites a two-child node with its successor's
    /// pair instead of relinking the successor.
    key: TField<K>,
    val: TField<V>,
}

impl<K: Scalar, V: Scalar, P: OrecPolicy> Ownable for Node<K, V, P> {
    fn orec(&self) -> &Orec {
        self.orec.orec()
    }
}

/// A node pointer (possibly null) with its observed version.
struct Seen<K: Scalar, V: Scalar, P: OrecPolicy> {
    obj: *mut Node<K, V, P>,
    ver: Timestamp,
}

impl<K: Scalar, V: Scalar, P: OrecPolicy> Clone for Seen<K, V, P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K: Scalar, V: Scalar, P: OrecPolicy> Copy for Seen<K, V, P> {}

/// What the hybrid finalizer decided.
enum Outcome {
    Done(bool),
    Retry,
}

/// An ordered map over an unbalanced internal BST.
pub struct IbstOmap<K: Scalar, V: Scalar, P: OrecPolicy = PerObject> {
    sentinel: *mut Node<K, V, P>,
}

// SAFETY: all shared node state goes through engine fields and orecs.
unsafe impl<K: Scalar + Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy> Send
    for IbstOmap<K, V, P>
{
}
// SAFETY: as above.
unsafe impl<K: Scalar + Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy> Sync
    for IbstOmap<K, V, P>
{
}

impl<K, V, P> IbstOmap<K, V, P>
where
    K: Scalar + Ord,
    V: Scalar,
    P: OrecPolicy,
{
    /// Construct an empty tree (just the sentinel).
    ///
    /// # Errors
    ///
    /// Fails if `cfg` does not validate.
    pub fn new(me: &mut ThreadCtx, cfg: &MapConfig) -> Result<Self> {
        cfg.validate()?;
        let _ = me;
        let sentinel = Self::alloc(K::from_bits(0), V::from_bits(0));
        Ok(Self { sentinel })
    }

    fn alloc(key: K, val: V) -> *mut Node<K, V, P> {
        let mut node = Box::new(Node {
            orec: P::placeholder(),
            children: [TField::new(ptr::null_mut()), TField::new(ptr::null_mut())],
            key: TField::new(key),
            val: TField::new(val),
        });
        node.orec = P::attach(ptr::addr_of!(*node) as usize);
        Box::into_raw(node)
    }

    /// Search for `key`, returning the holding node (or null) and its
    /// parent, each with a validated version.
    ///
    /// The checkpoint stack lets a retry resume mid-path: its longest
    /// still-valid prefix is kept, the rest dropped. The caller clears the
    /// stack before the first call of an operation.
    fn get_node(
        &self,
        me: &mut ThreadCtx,
        snaps: &mut SnapStack,
        key: K,
    ) -> (Seen<K, V, P>, Seen<K, V, P>) {
        loop {
            let tx = RStep::new(me);
            let mut parent: Seen<K, V, P>;
            let mut child: Seen<K, V, P>;

            if snaps.len() <= 1 {
                // Start from {sentinel, root}.
                parent = Seen {
                    obj: self.sentinel,
                    ver: 0,
                };
                // SAFETY: the sentinel lives as long as the map.
                let p_ref = unsafe { &*parent.obj };
                child = Seen {
                    obj: p_ref.children[LEFT].get_step(&tx),
                    ver: 0,
                };
                parent.ver = tx.check_orec(p_ref);
                if parent.ver == END_OF_TIME {
                    continue;
                }
                snaps.clear();
                snaps.push(Snapshot {
                    obj: parent.obj.cast(),
                    ver: parent.ver,
                });
            } else {
                // Trim the stack to its longest valid prefix.
                let mut valid = snaps.len();
                for (i, cp) in snaps.iter().enumerate() {
                    // SAFETY: checkpointed nodes stay allocated under SMR.
                    let node = unsafe { &*cp.obj.cast::<Node<K, V, P>>() };
                    if !tx.check_continuation(node, cp.ver) {
                        valid = i;
                        break;
                    }
                }
                snaps.truncate(valid);
                if snaps.len() <= 1 {
                    continue;
                }
                let Some(top) = snaps.last().copied() else {
                    continue;
                };
                parent = Seen {
                    obj: top.obj.cast(),
                    ver: top.ver,
                };
                // SAFETY: as above.
                let p_ref = unsafe { &*parent.obj };
                let parent_key = p_ref.key.get_step(&tx);
                child = Seen {
                    obj: p_ref.children[usize::from(key >= parent_key)].get_step(&tx),
                    ver: 0,
                };
                if !tx.check_continuation(p_ref, parent.ver) {
                    continue;
                }
            }

            // Walk downward until a null child or the key.
            loop {
                if child.obj.is_null() {
                    // A consistent read of the parent: we already
                    // linearized ("not found").
                    return (child, parent);
                }
                // SAFETY: as above.
                let c_ref = unsafe { &*child.obj };
                let child_key = c_ref.key.get_step(&tx);
                let grandchild = c_ref.children[usize::from(key >= child_key)].get_step(&tx);
                child.ver = tx.check_orec(c_ref);
                if child.ver == END_OF_TIME {
                    break; // retry from the checkpoints
                }
                if child_key == key {
                    return (child, parent);
                }
                // Matching nodes must never enter the checkpoint stack.
                snaps.push(Snapshot {
                    obj: child.obj.cast(),
                    ver: child.ver,
                });
                parent = child;
                child = Seen {
                    obj: grandchild,
                    ver: 0,
                };
            }
        }
    }

    /// Find the successor (leftmost descendant of the right child) of a
    /// two-child node, plus its parent. Fails with null results on any
    /// inconsistency.
    fn get_succ_pair(
        &self,
        me: &mut ThreadCtx,
        node: Seen<K, V, P>,
    ) -> Option<(Seen<K, V, P>, Seen<K, V, P>)> {
        // The successor is close by, so no checkpoints; but the search is
        // willing to retry since `node` itself is unlikely to change.
        loop {
            let tx = RStep::new(me);
            // SAFETY: as in get_node.
            let n_ref = unsafe { &*node.obj };
            if !tx.check_continuation(n_ref, node.ver) {
                return None;
            }
            let mut parent = node;
            let mut child = Seen {
                obj: n_ref.children[RIGHT].get_step(&tx),
                ver: 0,
            };
            if !tx.check_continuation(n_ref, node.ver) {
                return None;
            }

            loop {
                // SAFETY: as above.
                let c_ref = unsafe { &*child.obj };
                let next = c_ref.children[LEFT].get_step(&tx);
                child.ver = tx.check_orec(c_ref);
                if child.ver == END_OF_TIME {
                    break; // retry
                }
                if next.is_null() {
                    return Some((child, parent));
                }
                parent = child;
                child = Seen { obj: next, ver: 0 };
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
            let (curr, _) = self.get_node(me, &mut snaps, key);
            if curr.obj.is_null() {
                return None;
            }
            let tx = RStep::new(me);
            // SAFETY: as in get_node.
            let node = unsafe { &*curr.obj };
            let val = node.val.get_step(&tx);
            if !tx.check_continuation(node, curr.ver) {
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
            let (child, parent) = self.get_node(me, &mut snaps, key);
            if !child.obj.is_null() {
                return false;
            }
            let mut tx = WStep::new(me);
            // SAFETY: as in get_node.
            let p_ref = unsafe { &*parent.obj };
            if tx.acquire_continuation(p_ref, parent.ver) {
                // A null child under a still-valid parent: link the new
                // node. The sentinel's payload hangs off its left side.
                let c_id = if parent.obj == self.sentinel {
                    LEFT
                } else {
                    usize::from(key > p_ref.key.get_step(&tx))
                };
                let new_node = Self::alloc(key, val);
                p_ref.children[c_id].set_step(new_node, &tx);
                return true;
            }
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
            let (target, parent) = self.get_node(me, &mut snaps, key);
            if target.obj.is_null() {
                return false;
            }

            // Consistently read the target's children in one more step.
            // SAFETY: as in get_node.
            let t_ref = unsafe { &*target.obj };
            let (t_left, t_right) = {
                let tx = RStep::new(me);
                let right = t_ref.children[RIGHT].get_step(&tx);
                let left = t_ref.children[LEFT].get_step(&tx);
                if !tx.check_continuation(t_ref, target.ver) {
                    continue;
                }
                (left, right)
            };

            if t_left.is_null() || t_right.is_null() {
                // At most one child: the write transaction inherits the
                // step observations and splices the grandchild up.
                let grandchild = if t_left.is_null() { t_right } else { t_left };
                match self.unstitch_simple(me, target, parent, grandchild) {
                    Outcome::Done(done) => return done,
                    Outcome::Retry => continue,
                }
            } else {
                // Two children: overwrite with the successor's pair, then
                // unstitch the successor.
                let Some((succ, s_parent)) = self.get_succ_pair(me, target) else {
                    continue;
                };
                match self.unstitch_succ(me, target, succ, s_parent) {
                    Outcome::Done(done) => return done,
                    Outcome::Retry => continue,
                }
            }
        }
    }

    /// Hybrid finalizer for the zero/one-child case.
    fn unstitch_simple(
        &self,
        me: &mut ThreadCtx,
        target: Seen<K, V, P>,
        parent: Seen<K, V, P>,
        grandchild: *mut Node<K, V, P>,
    ) -> Outcome {
        wo_run::<WbLock, _, _>(me, |tx| {
            // SAFETY: step-observed nodes stay allocated under SMR.
            let (t_ref, p_ref) = unsafe { (&*target.obj, &*parent.obj) };
            // Inheritance folds the step observations into this
            // transaction; any intervening writer invalidates them and the
            // whole composite retries from the traversal.
            if !tx.inherit(t_ref, target.ver) || !tx.inherit(p_ref, parent.ver) {
                return Ok(Outcome::Retry);
            }

            let c_id = if p_ref.children[LEFT].get(tx, p_ref)? == target.obj {
                LEFT
            } else {
                RIGHT
            };
            p_ref.children[c_id].set(tx, p_ref, grandchild)?;
            // Writing the target takes its orec, so the commit republishes
            // it at a new version and concurrent step readers discover the
            // unlink instead of trusting a detached node.
            t_ref.children[LEFT].set(tx, t_ref, ptr::null_mut())?;
            // SAFETY: unreachable once this transaction commits.
            unsafe { tx.reclaim(NonNull::new_unchecked(target.obj)) };
            Ok(Outcome::Done(true))
        })
    }

    /// Hybrid finalizer for the two-child case: copy the successor's pair
    /// into the target, then unstitch the successor.
    fn unstitch_succ(
        &self,
        me: &mut ThreadCtx,
        target: Seen<K, V, P>,
        succ: Seen<K, V, P>,
        s_parent: Seen<K, V, P>,
    ) -> Outcome {
        wo_run::<WbLock, _, _>(me, |tx| {
            // SAFETY: as in unstitch_simple.
            let (t_ref, s_ref, sp_ref) =
                unsafe { (&*target.obj, &*succ.obj, &*s_parent.obj) };
            if !tx.inherit(t_ref, target.ver)
                || !tx.inherit(s_ref, succ.ver)
                || !tx.inherit(sp_ref, s_parent.ver)
            {
                return Ok(Outcome::Retry);
            }

            let s_key = s_ref.key.get(tx, s_ref)?;
            let s_val = s_ref.val.get(tx, s_ref)?;
            t_ref.key.set(tx, t_ref, s_key)?;
            t_ref.val.set(tx, t_ref, s_val)?;

            let s_right = s_ref.children[RIGHT].get(tx, s_ref)?;
            if s_parent.obj == target.obj {
                // The successor is the target's own right child.
                sp_ref.children[RIGHT].set(tx, sp_ref, s_right)?;
            } else {
                sp_ref.children[LEFT].set(tx, sp_ref, s_right)?;
            }
            // Writing the successor takes its orec, republishing it so
            // step readers with a stale reference notice the unlink.
            s_ref.children[RIGHT].set(tx, s_ref, ptr::null_mut())?;
            // SAFETY: unreachable once this transaction commits.
            unsafe { tx.reclaim(NonNull::new_unchecked(succ.obj)) };
            Ok(Outcome::Done(true))
        })
    }

}

impl<K: Scalar, V: Scalar, P: OrecPolicy> Drop for IbstOmap<K, V, P> {
    fn drop(&mut self) {
        // SAFETY: exclusive access during drop.
        let mut sentinel = unsafe { Box::from_raw(self.sentinel) };
        let root = sentinel.children[LEFT].get_mut();
        drop(sentinel);
        drop_children::<K, V, P>(root);
    }
}

fn drop_children<K: Scalar, V: Scalar, P: OrecPolicy>(node: *mut Node<K, V, P>) {
    if node.is_null() {
        return;
    }
    // SAFETY: exclusive access during drop; every node is Box-allocated.
    let mut boxed = unsafe { Box::from_raw(node) };
    let left = boxed.children[LEFT].get_mut();
    let right = boxed.children[RIGHT].get_mut();
    drop(boxed);
    drop_children::<K, V, P>(left);
    drop_children::<K, V, P>(right);
}

#[cfg(test)]
mod tests {
    use orestm_engine::{PerStripe, ThreadCtx};
    use orestm_types::MapConfig;

    use super::IbstOmap;

    #[test]
    fn sequential_operations() {
        let mut me = ThreadCtx::new();
        let cfg = MapConfig::default();
        let map: IbstOmap<u64, u64> = IbstOmap::new(&mut me, &cfg).expect("config");

        for k in [50_u64, 25, 75, 12, 37, 62, 87] {
            assert!(map.insert(&mut me, k, k + 1));
        }
        assert!(!map.insert(&mut me, 37, 0));
        for k in [12_u64, 25, 37, 50, 62, 75, 87] {
            assert_eq!(map.get(&mut me, k), Some(k + 1));
        }
        assert_eq!(map.get(&mut me, 13), None);
    }

    #[test]
    fn remove_leaf_one_child_and_two_children() {
        let mut me = ThreadCtx::new();
        let cfg = MapConfig::default();
        let map: IbstOmap<u64, u64> = IbstOmap::new(&mut me, &cfg).expect("config");

        for k in [50_u64, 25, 75, 12, 37, 62, 87, 30] {
            assert!(map.insert(&mut me, k, k));
        }
        // Leaf.
        assert!(map.remove(&mut me, 12));
        assert_eq!(map.get(&mut me, 12), None);
        // One child (37 has child 30).
        assert!(map.remove(&mut me, 37));
        assert_eq!(map.get(&mut me, 37), None);
        assert_eq!(map.get(&mut me, 30), Some(30));
        // Two children (the root).
        assert!(map.remove(&mut me, 50));
        assert_eq!(map.get(&mut me, 50), None);
        for k in [25_u64, 30, 62, 75, 87] {
            assert_eq!(map.get(&mut me, k), Some(k), "key {k} lost");
        }
        assert!(!map.remove(&mut me, 50));
    }

    #[test]
    fn root_removal_when_root_is_only_node() {
        let mut me = ThreadCtx::new();
        let map: IbstOmap<u32, u32> = IbstOmap::new(&mut me, &MapConfig::default()).expect("config");
        assert!(map.insert(&mut me, 1, 2));
        assert!(map.remove(&mut me, 1));
        assert_eq!(map.get(&mut me, 1), None);
        assert!(map.insert(&mut me, 1, 3));
        assert_eq!(map.get(&mut me, 1), Some(3));
    }

    #[test]
    fn randomized_single_thread_against_model() {
        use std::collections::BTreeMap;
        let mut me = ThreadCtx::new();
        let map: IbstOmap<u64, u64, PerStripe> =
            IbstOmap::new(&mut me, &MapConfig::default()).expect("config");
        let mut model = BTreeMap::new();
        let mut state = 0x1234_5678_u64;
        for _ in 0..2_000 {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let k = (state >> 33) % 128;
            match state % 3 {
                0 => assert_eq!(map.insert(&mut me, k, k * 7), model.insert(k, k * 7).is_none()),
                1 => assert_eq!(map.remove(&mut me, k), model.remove(&k).is_some()),
                _ => assert_eq!(map.get(&mut me, k), model.get(&k).copied()),
            }
        }
    }

    #[test]
    fn concurrent_mixed_workload() {
        let map: IbstOmap<u64, u64> = {
            let mut me = ThreadCtx::new();
            IbstOmap::new(&mut me, &MapConfig::default()).expect("config")
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..300_u64 {
                        let k = (t * 131 + i * 17) % 96;
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

    #[test]
    fn concurrent_disjoint_inserts_then_full_drain() {
        let map: IbstOmap<u64, u64> = {
            let mut me = ThreadCtx::new();
            IbstOmap::new(&mut me, &MapConfig::default()).expect("config")
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..64_u64 {
                        assert!(map.insert(&mut me, t + 4 * i, i));
                    }
                });
            }
        });

        let mut me = ThreadCtx::new();
        for k in 0..256_u64 {
            assert!(map.remove(&mut me, k), "key {k} missing");
        }
        for k in 0..256_u64 {
            assert_eq!(map.get(&mut me, k), None);
        }
    }
}
