//! Interlocked hash table, transactional mode.
//!
//! A tree of pointer lists terminating in element lists: each level hashes
//! the key with a level-salted hash, so repeated collisions are unlikely to
//! persist as the tree deepens. A full element list is rehashed into a new,
//! twice-as-wide pointer list in O(1) — only the one full chunk moves.
//!
//! The max-depth trick for constant-time access is deliberately omitted;
//! worst-case depth is O(log log n), which nobody will notice. Node kind
//! lives in the type (a tagged body enum), not in the pointer.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr;

use orestm_engine::{
    Abort, AccessPolicy, Orec, Ownable, OrecHandle, OrecPolicy, PerObject, Scalar, TField,
    ThreadCtx, TxResult, WbLock, WoTxn, ro_run, wo_run,
};
use orestm_error::Result;
use orestm_types::{MapConfig, mix13};

struct Pair<K: Scalar, V: Scalar> {
    key: TField<K>,
    val: TField<V>,
}

/// Node payload. The discriminant is fixed at construction, so it can be
/// inspected without consulting the orec, like a const field.
enum Body<K: Scalar, V: Scalar, P: OrecPolicy> {
    /// A chunk of key/value slots with a live count.
    Elements {
        count: TField<u64>,
        pairs: Box<[Pair<K, V>]>,
    },
    /// A bucket array one level deeper.
    Pointers {
        buckets: Box<[TField<*mut Node<K, V, P>>]>,
    },
}

struct Node<K: Scalar, V: Scalar, P: OrecPolicy> {
    orec: P::Handle,
    body: Body<K, V, P>,
}

impl<K: Scalar, V: Scalar, P: OrecPolicy> Ownable for Node<K, V, P> {
    fn orec(&self) -> &Orec {
        self.orec.orec()
    }
}

/// An unordered map over an interlocked hash table.
pub struct InterlockedUmap<K: Scalar, V: Scalar, P: OrecPolicy = PerObject, A: AccessPolicy = WbLock>
{
    elist_size: u64,
    plist_size: u64,
    root: *mut Node<K, V, P>,
    _policy: PhantomData<A>,
}

// SAFETY: all shared state goes through engine fields and orecs.
unsafe impl<K: Scalar + Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy, A: AccessPolicy> Send
    for InterlockedUmap<K, V, P, A>
{
}
// SAFETY: as above.
unsafe impl<K: Scalar + Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy, A: AccessPolicy> Sync
    for InterlockedUmap<K, V, P, A>
{
}

impl<K, V, P, A> InterlockedUmap<K, V, P, A>
where
    K: Scalar + Eq + Hash,
    V: Scalar,
    P: OrecPolicy,
    A: AccessPolicy,
{
    /// Construct a table with a root pointer list of `cfg.buckets` entries
    /// and element chunks of `cfg.chunksize` slots.
    ///
    /// # Errors
    ///
    /// Fails if `cfg` does not validate.
    pub fn new(me: &mut ThreadCtx, cfg: &MapConfig) -> Result<Self> {
        cfg.validate()?;
        let _ = me;
        let root = Box::into_raw(Self::make_plist(cfg.buckets));
        Ok(Self {
            elist_size: cfg.chunksize,
            plist_size: cfg.buckets,
            root,
            _policy: PhantomData,
        })
    }

    fn make_plist(size: u64) -> Box<Node<K, V, P>> {
        let buckets = (0..size)
            .map(|_| TField::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let mut node = Box::new(Node {
            orec: P::placeholder(),
            body: Body::Pointers { buckets },
        });
        node.orec = P::attach(ptr::addr_of!(*node) as usize);
        node
    }

    fn make_elist(size: u64) -> Box<Node<K, V, P>> {
        let pairs = (0..size)
            .map(|_| Pair {
                key: TField::new(K::from_bits(0)),
                val: TField::new(V::from_bits(0)),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let mut node = Box::new(Node {
            orec: P::placeholder(),
            body: Body::Elements {
                count: TField::new(0),
                pairs,
            },
        });
        node.orec = P::attach(ptr::addr_of!(*node) as usize);
        node
    }

    /// Hash `key` at `level`, salting with the level so keys that collide
    /// at one depth are unlikely to collide again below it.
    fn level_hash(key: &K, level: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        mix13(level ^ hasher.finish())
    }

    /// Look up `key`.
    pub fn get(&self, me: &mut ThreadCtx, key: K) -> Option<V> {
        me.op_begin();
        let result = ro_run::<A, _, _>(me, |tx| {
            let mut curr = self.root;
            let mut depth = 1_u64;
            let mut count = self.plist_size;
            loop {
                // SAFETY: the root lives as long as the map; deeper nodes
                // stay allocated under SMR.
                let curr_ref = unsafe { &*curr };
                let Body::Pointers { buckets } = &curr_ref.body else {
                    return Ok(None);
                };
                let idx = (Self::level_hash(&key, depth) % count) as usize;
                let below = buckets[idx].get(tx, curr_ref)?;
                if below.is_null() {
                    return Ok(None);
                }
                // SAFETY: as above.
                let below_ref = unsafe { &*below };
                match &below_ref.body {
                    Body::Pointers { .. } => {
                        curr = below;
                        depth += 1;
                        count *= 2;
                    }
                    Body::Elements { count, pairs } => {
                        let live = count.get(tx, below_ref)?;
                        for pair in pairs.iter().take(live as usize) {
                            if pair.key.get(tx, below_ref)? == key {
                                return Ok(Some(pair.val.get(tx, below_ref)?));
                            }
                        }
                        return Ok(None);
                    }
                }
            }
        });
        me.op_end();
        result
    }

    /// Insert `key -> val` if absent. Returns `false` when the key exists.
    pub fn insert(&self, me: &mut ThreadCtx, key: K, val: V) -> bool {
        me.op_begin();
        let result = wo_run::<A, _, _>(me, |tx| self.insert_tx(tx, key, val));
        me.op_end();
        result
    }

    fn insert_tx(&self, tx: &mut WoTxn<'_, A>, key: K, val: V) -> TxResult<bool> {
        let mut curr = self.root;
        let mut depth = 1_u64;
        let mut count = self.plist_size;
        loop {
            // SAFETY: as in `get`.
            let curr_ref = unsafe { &*curr };
            let Body::Pointers { buckets } = &curr_ref.body else {
                return Ok(false);
            };
            let idx = (Self::level_hash(&key, depth) % count) as usize;
            let below = buckets[idx].get(tx, curr_ref)?;

            // Empty bucket: a fresh chunk with just this pair.
            if below.is_null() {
                let elist = tx.log_new(Self::make_elist(self.elist_size));
                // SAFETY: captured allocation, private until linked.
                let e_ref = unsafe { elist.as_ref() };
                Self::captured_insert(tx, e_ref, key, val);
                buckets[idx].set(tx, curr_ref, elist.as_ptr())?;
                return Ok(true);
            }

            // SAFETY: as above.
            let below_ref = unsafe { &*below };
            match &below_ref.body {
                Body::Pointers { .. } => {
                    curr = below;
                    depth += 1;
                    count *= 2;
                }
                Body::Elements {
                    count: live_count,
                    pairs,
                } => {
                    let live = live_count.get(tx, below_ref)?;
                    for pair in pairs.iter().take(live as usize) {
                        if pair.key.get(tx, below_ref)? == key {
                            return Ok(false);
                        }
                    }

                    if live < self.elist_size {
                        // Room in the chunk: append.
                        pairs[live as usize].key.set(tx, below_ref, key)?;
                        pairs[live as usize].val.set(tx, below_ref, val)?;
                        live_count.set(tx, below_ref, live + 1)?;
                        return Ok(true);
                    }

                    // Full chunk: rehash it one level down, then keep
                    // traversing (pathological collisions can recur).
                    let plist = self.rehash(tx, below_ref, depth, count)?;
                    buckets[idx].set(tx, curr_ref, plist)?;
                }
            }
        }
    }

    /// Build a new pointer list twice the width of the current level and
    /// scatter the full chunk `source` into it. O(1): only one chunk moves.
    fn rehash(
        &self,
        tx: &mut WoTxn<'_, A>,
        source: &Node<K, V, P>,
        depth: u64,
        count: u64,
    ) -> TxResult<*mut Node<K, V, P>> {
        let plist = tx.log_new(Self::make_plist(count * 2));
        // SAFETY: captured allocation, private until returned and linked.
        let p_ref = unsafe { plist.as_ref() };
        let Body::Pointers { buckets } = &p_ref.body else {
            return Err(Abort);
        };

        let Body::Elements {
            count: src_count,
            pairs: src_pairs,
        } = &source.body
        else {
            return Err(Abort);
        };
        let live = src_count.get(tx, source)?;
        for pair in src_pairs.iter().take(live as usize) {
            let k = pair.key.get(tx, source)?;
            let v = pair.val.get(tx, source)?;
            let idx = (Self::level_hash(&k, depth + 1) % (count * 2)) as usize;
            let mut dest = buckets[idx].get_cap(tx);
            if dest.is_null() {
                dest = tx.log_new(Self::make_elist(self.elist_size)).as_ptr();
                buckets[idx].set_cap(tx, dest);
            }
            // SAFETY: destination chunks are captured allocations.
            let dest_ref = unsafe { &*dest };
            Self::captured_insert(tx, dest_ref, k, v);
        }

        // The caller owns the pointer to `source`, so it can be retired.
        let source_ptr = ptr::from_ref(source).cast_mut();
        // SAFETY: unreachable once the caller replaces the bucket pointer
        // and the transaction commits.
        unsafe { tx.reclaim(std::ptr::NonNull::new_unchecked(source_ptr)) };
        Ok(plist.as_ptr())
    }

    /// Append into a chunk this transaction allocated (no logging needed).
    fn captured_insert(tx: &WoTxn<'_, A>, elist: &Node<K, V, P>, key: K, val: V) {
        if let Body::Elements { count, pairs } = &elist.body {
            let c = count.get_cap(tx);
            pairs[c as usize].key.set_cap(tx, key);
            pairs[c as usize].val.set_cap(tx, val);
            count.set_cap(tx, c + 1);
        }
    }

    /// Remove `key`. Returns `false` when the key is absent.
    pub fn remove(&self, me: &mut ThreadCtx, key: K) -> bool {
        me.op_begin();
        let result = wo_run::<A, _, _>(me, |tx| {
            let mut curr = self.root;
            let mut depth = 1_u64;
            let mut count = self.plist_size;
            loop {
                // SAFETY: as in `get`.
                let curr_ref = unsafe { &*curr };
                let Body::Pointers { buckets } = &curr_ref.body else {
                    return Ok(false);
                };
                let idx = (Self::level_hash(&key, depth) % count) as usize;
                let below = buckets[idx].get(tx, curr_ref)?;
                if below.is_null() {
                    return Ok(false);
                }
                // SAFETY: as above.
                let below_ref = unsafe { &*below };
                match &below_ref.body {
                    Body::Pointers { .. } => {
                        curr = below;
                        depth += 1;
                        count *= 2;
                    }
                    Body::Elements {
                        count: live_count,
                        pairs,
                    } => {
                        let live = live_count.get(tx, below_ref)?;
                        for i in 0..live as usize {
                            if pairs[i].key.get(tx, below_ref)? == key {
                                // Overwrite with the last pair, then shrink.
                                if live > 1 {
                                    let last_k =
                                        pairs[live as usize - 1].key.get(tx, below_ref)?;
                                    let last_v =
                                        pairs[live as usize - 1].val.get(tx, below_ref)?;
                                    pairs[i].key.set(tx, below_ref, last_k)?;
                                    pairs[i].val.set(tx, below_ref, last_v)?;
                                }
                                live_count.set(tx, below_ref, live - 1)?;
                                return Ok(true);
                            }
                        }
                        return Ok(false);
                    }
                }
            }
        });
        me.op_end();
        result
    }
}

impl<K: Scalar, V: Scalar, P: OrecPolicy, A: AccessPolicy> Drop for InterlockedUmap<K, V, P, A> {
    fn drop(&mut self) {
        drop_node::<K, V, P>(self.root);
    }
}

fn drop_node<K: Scalar, V: Scalar, P: OrecPolicy>(node: *mut Node<K, V, P>) {
    if node.is_null() {
        return;
    }
    // SAFETY: exclusive access during drop; every node is Box-allocated.
    let mut boxed = unsafe { Box::from_raw(node) };
    if let Body::Pointers { buckets } = &mut boxed.body {
        for bucket in buckets.iter_mut() {
            drop_node::<K, V, P>(bucket.get_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use orestm_engine::{Lazy, PerStripe, ThreadCtx};
    use orestm_types::MapConfig;

    use super::InterlockedUmap;

    fn tiny_cfg() -> MapConfig {
        // Small chunks so rehashing happens early.
        MapConfig::default().with_buckets(4).with_chunksize(2)
    }

    #[test]
    fn sequential_operations_across_rehashes() {
        let mut me = ThreadCtx::new();
        let map: InterlockedUmap<u64, u64> =
            InterlockedUmap::new(&mut me, &tiny_cfg()).expect("config");

        for k in 0..256 {
            assert!(map.insert(&mut me, k, k + 9));
        }
        for k in 0..256 {
            assert_eq!(map.get(&mut me, k), Some(k + 9), "key {k}");
        }
        assert!(!map.insert(&mut me, 17, 0));
        assert_eq!(map.get(&mut me, 17), Some(17 + 9));
        for k in (0..256).step_by(2) {
            assert!(map.remove(&mut me, k));
        }
        for k in 0..256 {
            let expect = if k % 2 == 0 { None } else { Some(k + 9) };
            assert_eq!(map.get(&mut me, k), expect);
        }
    }

    #[test]
    fn remove_from_chunk_compacts() {
        let mut me = ThreadCtx::new();
        let cfg = MapConfig::default().with_buckets(1).with_chunksize(8);
        let map: InterlockedUmap<u32, u32> = InterlockedUmap::new(&mut me, &cfg).expect("config");
        for k in 0..6 {
            assert!(map.insert(&mut me, k, k));
        }
        // Remove from the middle; the last pair takes its slot.
        assert!(map.remove(&mut me, 2));
        assert_eq!(map.get(&mut me, 2), None);
        for k in [0_u32, 1, 3, 4, 5] {
            assert_eq!(map.get(&mut me, k), Some(k));
        }
    }

    #[test]
    fn lazy_policy_works_too() {
        let mut me = ThreadCtx::new();
        let map: InterlockedUmap<u64, u64, PerStripe, Lazy> =
            InterlockedUmap::new(&mut me, &tiny_cfg()).expect("config");
        for k in 0..64 {
            assert!(map.insert(&mut me, k, !k));
        }
        for k in 0..64 {
            assert_eq!(map.get(&mut me, k), Some(!k));
        }
    }

    #[test]
    fn concurrent_disjoint_inserts() {
        let map: InterlockedUmap<u64, u64> = {
            let mut me = ThreadCtx::new();
            InterlockedUmap::new(&mut me, &tiny_cfg()).expect("config")
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..64_u64 {
                        let k = t + 4 * i;
                        assert!(map.insert(&mut me, k, k));
                    }
                });
            }
        });

        let mut me = ThreadCtx::new();
        for k in 0..256_u64 {
            assert_eq!(map.get(&mut me, k), Some(k), "key {k}");
        }
    }

    #[test]
    fn concurrent_mixed_workload() {
        let map: InterlockedUmap<u64, u64> = {
            let mut me = ThreadCtx::new();
            InterlockedUmap::new(&mut me, &tiny_cfg()).expect("config")
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..200_u64 {
                        let k = (t * 41 + i * 3) % 64;
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
