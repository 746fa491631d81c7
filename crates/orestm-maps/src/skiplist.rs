//! Skip-list ordered map, step mode.
//!
//! Nodes carry a tower of index levels above the data layer; each tower
//! entry caches the successor's key next to the successor pointer so index
//! traversal does not dereference the successor to make a routing decision.
//! Traversals race forward without per-hop validation (keys are immutable
//! and unstitches never change a dead node's next pointers), validating
//! only where a decision becomes visible to the caller.
//!
//! Mutators try to perform the largest write step they can: a short node
//! (height 0) stitches in one acquisition; a tall node locks the
//! predecessors at every level and stitches bottom-up. With `max_levels`
//! configured to zero, the structure degenerates to a flat ordered list.

use std::ptr::{self, NonNull};

use orestm_engine::{
    Orec, Ownable, OrecHandle, OrecPolicy, PerObject, RStep, SField, Scalar, StepScope, ThreadCtx,
    WStep,
};
use orestm_error::Result;
use orestm_types::{END_OF_TIME, MapConfig};
use smallvec::SmallVec;

/// One tower entry: the successor at this level and a cache of its key.
struct Level<K: Scalar, V: Scalar, P: OrecPolicy> {
    key: SField<K>,
    next: SField<*mut Node<K, V, P>>,
}

/// A node. `height` counts index layers only; every node has a data layer
/// at tower index 0. Sentinels use a dummy key that is never compared.
struct Node<K: Scalar, V: Scalar, P: OrecPolicy> {
    orec: P::Handle,
    key: K,
    val: SField<V>,
    height: u8,
    tower: Box<[Level<K, V, P>]>,
}

impl<K: Scalar, V: Scalar, P: OrecPolicy> Ownable for Node<K, V, P> {
    fn orec(&self) -> &Orec {
        self.orec.orec()
    }
}

type Preds<K, V, P> = SmallVec<[*mut Node<K, V, P>; 16]>;

/// An ordered map over a skip list with cached successor keys.
pub struct SkiplistOmap<K: Scalar, V: Scalar, P: OrecPolicy = PerObject> {
    index_layers: usize,
    head: *mut Node<K, V, P>,
    tail: *mut Node<K, V, P>,
}

// SAFETY: all shared node state goes through engine fields and orecs.
unsafe impl<K: Scalar + Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy> Send
    for SkiplistOmap<K, V, P>
{
}
// SAFETY: as above.
unsafe impl<K: Scalar + Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy> Sync
    for SkiplistOmap<K, V, P>
{
}

impl<K, V, P> SkiplistOmap<K, V, P>
where
    K: Scalar + Ord,
    V: Scalar,
    P: OrecPolicy,
{
    /// Construct an empty skip list: head stitched to tail at every level.
    ///
    /// # Errors
    ///
    /// Fails if `cfg` does not validate (`max_levels` above the ceiling).
    pub fn new(me: &mut ThreadCtx, cfg: &MapConfig) -> Result<Self> {
        cfg.validate()?;
        let index_layers = cfg.max_levels as usize;
        let head = Self::alloc(index_layers as u8, K::from_bits(0), V::from_bits(0));
        let tail = Self::alloc(index_layers as u8, K::from_bits(0), V::from_bits(0));
        let tx = WStep::new(me);
        // SAFETY: both sentinels are private until `Self` is returned.
        let head_ref = unsafe { &*head };
        for level in 0..=index_layers {
            head_ref.tower[level].next.set(tail, &tx);
        }
        drop(tx);
        Ok(Self {
            index_layers,
            head,
            tail,
        })
    }

    fn alloc(height: u8, key: K, val: V) -> *mut Node<K, V, P> {
        let tower = (0..=height)
            .map(|_| Level {
                key: SField::new(K::from_bits(0)),
                next: SField::new(ptr::null_mut()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let mut node = Box::new(Node {
            orec: P::placeholder(),
            key,
            val: SField::new(val),
            height,
            tower,
        });
        node.orec = P::attach(ptr::addr_of!(*node) as usize);
        Box::into_raw(node)
    }

    /// Pick a height for a new node: geometric with drop-off one half,
    /// clamped to the configured ceiling.
    fn random_level(&self, me: &mut ThreadCtx) -> usize {
        let r = me.rand_u32();
        let level = r.wrapping_add(1).trailing_zeros() as usize;
        level.min(self.index_layers)
    }

    /// Look up `key`.
    pub fn get(&self, me: &mut ThreadCtx, key: K) -> Option<V> {
        me.op_begin();
        let result = self.get_inner(me, key);
        me.op_end();
        result
    }

    fn get_inner(&self, me: &mut ThreadCtx, key: K) -> Option<V> {
        loop {
            let tx = RStep::new(me);
            let Some(found) = self.get_leq(&tx, key) else {
                continue;
            };
            if found == self.head {
                return None;
            }
            // SAFETY: SMR keeps every reachable node allocated for the
            // duration of the operation.
            let node = unsafe { &*found };
            if node.key != key {
                return None;
            }
            // Lookups only need the node to still be in the list, owned or
            // not, so check after reading the value.
            let val = node.val.get(&tx);
            if tx.check_orec(node) == END_OF_TIME {
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
        let target_height = self.random_level(me);
        let mut preds: Preds<K, V, P> = SmallVec::from_elem(ptr::null_mut(), self.index_layers);

        loop {
            let mut tx = WStep::new(me);
            let Some(found) = self.get_leq_with_preds(&tx, key, &mut preds, target_height) else {
                continue;
            };
            // SAFETY: as in get_inner.
            let node = unsafe { &*found };
            // Keys are immutable, so a duplicate can be rejected without
            // validation.
            if found != self.head && node.key == key {
                return false;
            }

            // Acquire the data-layer predecessor.
            if !tx.acquire_consistent(node) {
                tx.unwind();
                continue;
            }
            let succ = node.tower[0].next.get(&tx);

            if target_height == 0 {
                // Short insert: the new node is fully initialized before it
                // becomes visible, so it never needs acquiring.
                let new_node = Self::alloc(0, key, val);
                // SAFETY: fresh allocation; `succ` is pinned by SMR.
                let (new_ref, succ_ref) = unsafe { (&*new_node, &*succ) };
                new_ref.tower[0].key.set(succ_ref.key, &tx);
                new_ref.tower[0].next.set(succ, &tx);
                node.tower[0].key.set(key, &tx);
                node.tower[0].next.set(new_node, &tx);
                return true;
            }

            // Tall insert: lock predecessors at every target level.
            if self.index_stitch(&mut tx, found, succ, &preds, key, val, target_height) {
                return true;
            }
            tx.unwind();
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
        let mut preds: Preds<K, V, P> = SmallVec::from_elem(ptr::null_mut(), self.index_layers);

        loop {
            let mut tx = WStep::new(me);
            let Some(pred) = self.get_lt_with_preds(&tx, key, &mut preds) else {
                continue;
            };
            // SAFETY: as in get_inner.
            let pred_ref = unsafe { &*pred };
            let found = pred_ref.tower[0].next.get(&tx);
            if found.is_null() {
                tx.unwind();
                continue;
            }
            if found == self.tail {
                return false;
            }
            // SAFETY: as above.
            let found_ref = unsafe { &*found };
            if found_ref.key != key {
                return false;
            }

            // Acquire the target first, then the predecessor.
            if !tx.acquire_consistent(found_ref) {
                tx.unwind();
                continue;
            }
            if !tx.acquire_consistent(pred_ref) {
                tx.unwind();
                continue;
            }

            if found_ref.height == 0 {
                let next = found_ref.tower[0].next.get(&tx);
                // SAFETY: as above.
                let next_ref = unsafe { &*next };
                pred_ref.tower[0].next.set(next, &tx);
                pred_ref.tower[0].key.set(next_ref.key, &tx);
                // Null the removed node's pointer so racing traversals
                // restart instead of wandering.
                found_ref.tower[0].next.set(ptr::null_mut(), &tx);
                // SAFETY: unlinked while owned; unreachable after commit.
                unsafe { tx.reclaim(NonNull::new_unchecked(found)) };
                return true;
            }

            if self.index_unstitch(&mut tx, found, pred, &preds) {
                return true;
            }
            tx.unwind();
        }
    }

    /// Predecessor query via the towers: the largest node with key at most
    /// `key`. Returns the head sentinel when everything is larger, `None`
    /// on any observed inconsistency.
    fn get_leq(&self, tx: &impl StepScope, key: K) -> Option<*mut Node<K, V, P>> {
        // SAFETY: sentinels live as long as the map.
        let head_ref = unsafe { &*self.head };
        let mut curr = self.head;

        // Find the highest level with any content.
        let mut level = 0;
        for i in (1..=self.index_layers).rev() {
            if head_ref.tower[i].next.get(tx) != self.tail {
                level = i;
                break;
            }
        }

        // Over and down through the index layers.
        while level > 0 {
            curr = self.index_leq(tx, key, curr, level)?;
            // SAFETY: as in get_inner.
            let curr_ref = unsafe { &*curr };
            if curr != self.head && curr_ref.key == key {
                return Some(curr);
            }
            level -= 1;
        }

        self.data_leq(tx, key, curr)
    }

    /// `get_leq` specialized for insert: also records the predecessor at
    /// each level up to `target_height`.
    fn get_leq_with_preds(
        &self,
        tx: &WStep<'_>,
        key: K,
        preds: &mut Preds<K, V, P>,
        target_height: usize,
    ) -> Option<*mut Node<K, V, P>> {
        // SAFETY: sentinels live as long as the map.
        let head_ref = unsafe { &*self.head };
        let mut curr = self.head;

        let mut level = 0;
        for i in (1..=self.index_layers).rev() {
            if head_ref.tower[i].next.get(tx) != self.tail {
                level = i;
                break;
            }
            preds[i - 1] = self.head;
        }

        while level > 0 {
            curr = self.index_leq(tx, key, curr, level)?;
            // SAFETY: as in get_inner.
            let curr_ref = unsafe { &*curr };
            if curr != self.head && curr_ref.key == key {
                return Some(curr);
            }
            if level <= target_height {
                preds[level - 1] = curr;
            }
            level -= 1;
        }

        self.data_leq(tx, key, curr)
    }

    /// Strict predecessor query for remove: records predecessors at every
    /// level.
    fn get_lt_with_preds(
        &self,
        tx: &WStep<'_>,
        key: K,
        preds: &mut Preds<K, V, P>,
    ) -> Option<*mut Node<K, V, P>> {
        // SAFETY: sentinels live as long as the map.
        let head_ref = unsafe { &*self.head };
        let mut curr = self.head;

        let mut level = 0;
        for i in (1..=self.index_layers).rev() {
            if head_ref.tower[i].next.get(tx) != self.tail {
                level = i;
                break;
            }
            preds[i - 1] = self.head;
        }

        while level > 0 {
            curr = self.index_lt(tx, key, curr, level)?;
            preds[level - 1] = curr;
            level -= 1;
        }

        self.data_lt(tx, key, curr)
    }

    /// Forward scan in one index level, stopping at the largest key at most
    /// `key`. May return owned nodes; the caller validates.
    fn index_leq(
        &self,
        tx: &impl StepScope,
        key: K,
        start: *mut Node<K, V, P>,
        level: usize,
    ) -> Option<*mut Node<K, V, P>> {
        // Keys are immutable and unstitches never edit a dead node's next,
        // so the scan can race forward and let the caller validate.
        let mut curr = start;
        loop {
            // SAFETY: as in get_inner.
            let curr_ref = unsafe { &*curr };
            let next = curr_ref.tower[level].next.get(tx);
            let next_key = curr_ref.tower[level].key.get(tx);
            if tx.check_orec(curr_ref) == END_OF_TIME {
                return None;
            }
            if next.is_null() {
                return None;
            }
            if next == self.tail {
                return Some(curr);
            }
            if next_key == key {
                return Some(next);
            }
            if next_key > key {
                return Some(curr);
            }
            curr = next;
        }
    }

    /// As [`SkiplistOmap::index_leq`], but strictly less than `key`.
    fn index_lt(
        &self,
        tx: &impl StepScope,
        key: K,
        start: *mut Node<K, V, P>,
        level: usize,
    ) -> Option<*mut Node<K, V, P>> {
        let mut curr = start;
        loop {
            // SAFETY: as in get_inner.
            let curr_ref = unsafe { &*curr };
            let next = curr_ref.tower[level].next.get(tx);
            let next_key = curr_ref.tower[level].key.get(tx);
            if tx.check_orec(curr_ref) == END_OF_TIME {
                return None;
            }
            if next.is_null() {
                return None;
            }
            if next == self.tail || next_key >= key {
                return Some(curr);
            }
            curr = next;
        }
    }

    /// Data-layer scan for the largest key at most `key`.
    fn data_leq(
        &self,
        tx: &impl StepScope,
        key: K,
        start: *mut Node<K, V, P>,
    ) -> Option<*mut Node<K, V, P>> {
        let mut curr = start;
        // SAFETY: as in get_inner.
        let mut next = unsafe { &*curr }.tower[0].next.get(tx);
        loop {
            if next.is_null() {
                return None;
            }
            if next == self.tail {
                return Some(curr);
            }
            // SAFETY: as above.
            let next_ref = unsafe { &*next };
            let nkey = next_ref.key;
            if nkey > key {
                return Some(curr);
            }
            if nkey == key {
                return Some(next);
            }
            curr = next;
            next = next_ref.tower[0].next.get(tx);
        }
    }

    /// Data-layer scan for the largest key strictly below `key`.
    fn data_lt(
        &self,
        tx: &impl StepScope,
        key: K,
        start: *mut Node<K, V, P>,
    ) -> Option<*mut Node<K, V, P>> {
        let mut curr = start;
        // SAFETY: as in get_inner.
        let mut next = unsafe { &*curr }.tower[0].next.get(tx);
        loop {
            if next.is_null() {
                return None;
            }
            if next == self.tail {
                return Some(curr);
            }
            // SAFETY: as above.
            let next_ref = unsafe { &*next };
            if next_ref.key >= key {
                return Some(curr);
            }
            curr = next;
            next = next_ref.tower[0].next.get(tx);
        }
    }

    /// Stitch a tall node in at every level, bottom-up, after acquiring the
    /// predecessor of each level. `n` (data-layer predecessor) and the
    /// caller's step already hold `n`.
    #[allow(clippy::too_many_arguments)]
    fn index_stitch(
        &self,
        tx: &mut WStep<'_>,
        n: *mut Node<K, V, P>,
        succ: *mut Node<K, V, P>,
        preds: &Preds<K, V, P>,
        key: K,
        val: V,
        target_height: usize,
    ) -> bool {
        for level in 0..target_height {
            // SAFETY: predecessors were captured this step and stay
            // allocated under SMR.
            if !tx.acquire_consistent(unsafe { &*preds[level] }) {
                return false;
            }
        }

        // Fully initialize the node before making it visible at any level;
        // that is what lets us skip acquiring it.
        let new_node = Self::alloc(target_height as u8, key, val);
        // SAFETY: fresh allocation.
        let new_ref = unsafe { &*new_node };
        for level in 0..target_height {
            // SAFETY: acquired above.
            let pred_ref = unsafe { &*preds[level] };
            let level_succ = pred_ref.tower[level + 1].next.get(tx);
            // SAFETY: pinned by SMR.
            let level_succ_ref = unsafe { &*level_succ };
            new_ref.tower[level + 1].key.set(level_succ_ref.key, tx);
            new_ref.tower[level + 1].next.set(level_succ, tx);
        }
        // SAFETY: pinned by SMR.
        let succ_ref = unsafe { &*succ };
        new_ref.tower[0].key.set(succ_ref.key, tx);
        new_ref.tower[0].next.set(succ, tx);

        // Visible in the data layer first, then index levels bottom-up.
        // SAFETY: `n` is held by this step.
        let n_ref = unsafe { &*n };
        n_ref.tower[0].next.set(new_node, tx);
        n_ref.tower[0].key.set(key, tx);
        for level in 0..target_height {
            // SAFETY: acquired above.
            let pred_ref = unsafe { &*preds[level] };
            pred_ref.tower[level + 1].next.set(new_node, tx);
            pred_ref.tower[level + 1].key.set(key, tx);
        }
        true
    }

    /// Unstitch a tall node top-down after acquiring every level's
    /// predecessor, then null its pointers and retire it.
    fn index_unstitch(
        &self,
        tx: &mut WStep<'_>,
        node: *mut Node<K, V, P>,
        prev: *mut Node<K, V, P>,
        preds: &Preds<K, V, P>,
    ) -> bool {
        // SAFETY: `node` is held by this step.
        let node_ref = unsafe { &*node };
        let height = node_ref.height as usize;
        for level in 0..height {
            // SAFETY: as in index_stitch.
            if !tx.acquire_consistent(unsafe { &*preds[level] }) {
                return false;
            }
        }

        for level in (0..=height).rev() {
            let pre = if level > 0 { preds[level - 1] } else { prev };
            // SAFETY: acquired above (or `prev`, held by the caller).
            let pre_ref = unsafe { &*pre };
            let next = node_ref.tower[level].next.get(tx);
            // SAFETY: pinned by SMR.
            let next_ref = unsafe { &*next };
            pre_ref.tower[level].key.set(next_ref.key, tx);
            pre_ref.tower[level].next.set(next, tx);
        }

        for level in (0..=height).rev() {
            node_ref.tower[level].next.set(ptr::null_mut(), tx);
        }
        // SAFETY: unlinked while owned; unreachable after commit.
        unsafe { tx.reclaim(NonNull::new_unchecked(node)) };
        true
    }
}

impl<K: Scalar, V: Scalar, P: OrecPolicy> Drop for SkiplistOmap<K, V, P> {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // SAFETY: exclusive access; the data layer links every node.
            let mut node = unsafe { Box::from_raw(curr) };
            curr = node.tower[0].next.get_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use orestm_engine::{PerStripe, ThreadCtx};
    use orestm_types::MapConfig;

    use super::SkiplistOmap;

    #[test]
    fn sequential_operations() {
        let mut me = ThreadCtx::new();
        let cfg = MapConfig::default().with_max_levels(8);
        let map: SkiplistOmap<u64, u64> = SkiplistOmap::new(&mut me, &cfg).expect("config");

        for k in [9_u64, 2, 7, 4, 1, 8, 3] {
            assert!(map.insert(&mut me, k, k * 3));
        }
        assert!(!map.insert(&mut me, 7, 0));
        for k in [1_u64, 2, 3, 4, 7, 8, 9] {
            assert_eq!(map.get(&mut me, k), Some(k * 3));
        }
        assert_eq!(map.get(&mut me, 5), None);
        assert!(map.remove(&mut me, 7));
        assert!(!map.remove(&mut me, 7));
        assert_eq!(map.get(&mut me, 7), None);
    }

    #[test]
    fn tall_and_short_nodes_coexist() {
        let mut me = ThreadCtx::new();
        let cfg = MapConfig::default().with_max_levels(12);
        let map: SkiplistOmap<u64, u64> = SkiplistOmap::new(&mut me, &cfg).expect("config");
        // Enough keys that the geometric levels produce towers of several
        // heights.
        for k in 0..512 {
            assert!(map.insert(&mut me, k, !k));
        }
        for k in 0..512 {
            assert_eq!(map.get(&mut me, k), Some(!k));
        }
        for k in (0..512).step_by(2) {
            assert!(map.remove(&mut me, k));
        }
        for k in 0..512 {
            let expect = if k % 2 == 0 { None } else { Some(!k) };
            assert_eq!(map.get(&mut me, k), expect);
        }
    }

    #[test]
    fn flat_configuration_still_works() {
        let mut me = ThreadCtx::new();
        let cfg = MapConfig::default().with_max_levels(0);
        let map: SkiplistOmap<u32, u32> = SkiplistOmap::new(&mut me, &cfg).expect("config");
        for k in 0..64 {
            assert!(map.insert(&mut me, k, k + 1));
        }
        for k in 0..64 {
            assert_eq!(map.get(&mut me, k), Some(k + 1));
        }
        assert!(map.remove(&mut me, 32));
        assert_eq!(map.get(&mut me, 32), None);
    }

    #[test]
    fn concurrent_disjoint_inserts() {
        let map: SkiplistOmap<u64, u64, PerStripe> = {
            let mut me = ThreadCtx::new();
            let cfg = MapConfig::default().with_max_levels(10);
            SkiplistOmap::new(&mut me, &cfg).expect("config")
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..128_u64 {
                        let k = t + 4 * i;
                        assert!(map.insert(&mut me, k, k));
                    }
                });
            }
        });

        let mut me = ThreadCtx::new();
        for k in 0..512_u64 {
            assert_eq!(map.get(&mut me, k), Some(k));
        }
    }

    #[test]
    fn concurrent_removals_leave_disjoint_survivors() {
        let map: SkiplistOmap<u64, u64> = {
            let mut me = ThreadCtx::new();
            let cfg = MapConfig::default().with_max_levels(10);
            let map = SkiplistOmap::new(&mut me, &cfg).expect("config");
            for k in 0..256 {
                assert!(map.insert(&mut me, k, k));
            }
            map
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..64_u64 {
                        let k = t + 4 * i;
                        assert!(map.remove(&mut me, k), "key {k} vanished");
                    }
                });
            }
        });

        let mut me = ThreadCtx::new();
        for k in 0..256_u64 {
            assert_eq!(map.get(&mut me, k), None);
        }
    }
}
