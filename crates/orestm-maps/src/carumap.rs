//! Resizable chained unordered map, step mode.
//!
//! Closed addressing over an array of doubly-linked lists, with lazy
//! cooperative expansion in the style of nonblocking resizable hash tables:
//! a resize installs a fresh, twice-as-large `active` table whose buckets
//! start null and demotes the old table to `frozen`. Any operation that
//! lands on a null active bucket first migrates the corresponding frozen
//! bucket (splitting it into the two active buckets it maps to), commits
//! that migration as its own step, and retries — a poor man's open-nested
//! transaction. A bucket head's `closed` flag marks it as already migrated.
//!
//! The `active`/`frozen` pair is guarded by a dedicated anchor orec, so a
//! table swap invalidates every observation that depended on the old pair.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr::{self, NonNull};

use orestm_engine::{
    Orec, Ownable, OrecHandle, OrecPolicy, PerObject, RStep, SField, Scalar, StepScope, ThreadCtx,
    WStep,
};
use orestm_error::Result;
use orestm_types::{END_OF_TIME, MapConfig, Timestamp, mix13};

/// A list node. Bucket heads use `closed`; data nodes use `key`/`val`; the
/// tail is the node whose `next` is null.
struct Node<K, V: Scalar, P: OrecPolicy> {
    orec: P::Handle,
    prev: SField<*mut Node<K, V, P>>,
    next: SField<*mut Node<K, V, P>>,
    /// On bucket heads: has this bucket been rehashed into the new table?
    closed: SField<bool>,
    key: Option<K>,
    val: SField<V>,
}

impl<K, V: Scalar, P: OrecPolicy> Ownable for Node<K, V, P> {
    fn orec(&self) -> &Orec {
        self.orec.orec()
    }
}

/// A bucket array. Inlined into nothing: the header owns the bucket slice,
/// and the table is itself an ownable so it can be retired through SMR.
struct Table<K, V: Scalar, P: OrecPolicy> {
    orec: P::Handle,
    size: u64,
    buckets: Box<[SField<*mut Node<K, V, P>>]>,
}

impl<K, V: Scalar, P: OrecPolicy> Ownable for Table<K, V, P> {
    fn orec(&self) -> &Orec {
        self.orec.orec()
    }
}

/// The standalone ownable guarding the `active`/`frozen` table pair.
struct Anchor<P: OrecPolicy> {
    orec: P::Handle,
}

impl<P: OrecPolicy> Ownable for Anchor<P> {
    fn orec(&self) -> &Orec {
        self.orec.orec()
    }
}

/// Result of trying to migrate one frozen bucket.
enum BucketMigration {
    /// Couldn't acquire every node; retry.
    CannotAcquire,
    /// Someone else already migrated it.
    AlreadyResized,
    /// Migrated by this call.
    Migrated,
}

/// An unordered map over a resizable array of doubly-linked lists.
pub struct ResizableUmap<K, V: Scalar, P: OrecPolicy = PerObject> {
    anchor: Box<Anchor<P>>,
    active: SField<*mut Table<K, V, P>>,
    frozen: SField<*mut Table<K, V, P>>,
    resize_threshold: u64,
}

// SAFETY: all shared state goes through engine fields and orecs.
unsafe impl<K: Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy> Send for ResizableUmap<K, V, P> {}
// SAFETY: as above.
unsafe impl<K: Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy> Sync for ResizableUmap<K, V, P> {}

impl<K, V, P> ResizableUmap<K, V, P>
where
    K: Copy + Eq + Hash + 'static,
    V: Scalar,
    P: OrecPolicy,
{
    /// Construct a map whose active table has `cfg.buckets` initialized
    /// (empty) buckets; the frozen table starts null, so nothing ever
    /// consults it before the first resize.
    ///
    /// # Errors
    ///
    /// Fails if `cfg` does not validate (`buckets` must be a nonzero power
    /// of two).
    pub fn new(me: &mut ThreadCtx, cfg: &MapConfig) -> Result<Self> {
        cfg.validate()?;
        let mut anchor = Box::new(Anchor {
            orec: P::placeholder(),
        });
        anchor.orec = P::attach(ptr::addr_of!(*anchor) as usize);

        let tx = WStep::new(me);
        let active = Self::alloc_table(cfg.buckets);
        // SAFETY: the table is private until `Self` is returned.
        let active_ref = unsafe { &*active };
        for bucket in active_ref.buckets.iter() {
            bucket.set(Self::create_list(&tx), &tx);
        }
        drop(tx);

        Ok(Self {
            anchor,
            active: SField::new(active),
            frozen: SField::new(ptr::null_mut()),
            resize_threshold: cfg.resize_threshold,
        })
    }

    fn alloc_table(size: u64) -> *mut Table<K, V, P> {
        let buckets = (0..size)
            .map(|_| SField::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let mut table = Box::new(Table {
            orec: P::placeholder(),
            size,
            buckets,
        });
        table.orec = P::attach(ptr::addr_of!(*table) as usize);
        Box::into_raw(table)
    }

    fn alloc_node(key: Option<K>, val: V) -> *mut Node<K, V, P> {
        let mut node = Box::new(Node {
            orec: P::placeholder(),
            prev: SField::new(ptr::null_mut()),
            next: SField::new(ptr::null_mut()),
            closed: SField::new(false),
            key,
            val: SField::new(val),
        });
        node.orec = P::attach(ptr::addr_of!(*node) as usize);
        Box::into_raw(node)
    }

    /// Build an empty bucket: head sentinel linked to tail sentinel.
    fn create_list(tx: &WStep<'_>) -> *mut Node<K, V, P> {
        let head = Self::alloc_node(None, V::from_bits(0));
        let tail = Self::alloc_node(None, V::from_bits(0));
        // SAFETY: both nodes are private until the bucket is published.
        unsafe {
            (*head).next.set(tail, tx);
            (*tail).prev.set(head, tx);
        }
        head
    }

    /// Hash `key` into a table of `size` buckets. The hash function never
    /// changes across resizes; only the modulus does, so a doubled table
    /// splits each bucket into exactly two.
    fn table_hash(key: &K, size: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        mix13(hasher.finish()) % size
    }

    /// Find the bucket in the active table for `key`.
    ///
    /// Returns `None` after performing (or observing) bucket migration or
    /// on inconsistency; the caller should let its step commit and retry,
    /// which publishes any migration as its own open-nested step.
    fn get_bucket(&self, tx: &mut WStep<'_>, key: &K) -> Option<(*mut Node<K, V, P>, Timestamp)> {
        let a_tbl = self.active.get(tx);
        let a_ver = tx.check_orec(&*self.anchor);
        if a_ver == END_OF_TIME {
            return None;
        }
        // SAFETY: validated against the anchor above; tables retired on
        // resize stay allocated under SMR.
        let a_ref = unsafe { &*a_tbl };
        let a_idx = Self::table_hash(key, a_ref.size);
        let a_bucket = a_ref.buckets[a_idx as usize].get(tx);
        if !a_bucket.is_null() {
            // The caller validates the bucket itself.
            return Some((a_bucket, a_ver));
        }

        // Null bucket: migrate the matching frozen bucket first.
        let f_tbl = self.frozen.get(tx);
        if tx.check_orec(&*self.anchor) == END_OF_TIME {
            // This operation was delayed; the rehash finished elsewhere.
            return None;
        }
        // SAFETY: as above.
        let f_ref = unsafe { &*f_tbl };
        let f_idx = Self::table_hash(key, f_ref.size);
        let f_bucket = f_ref.buckets[f_idx as usize].get(tx);
        // SAFETY: bucket heads live until their table is reclaimed.
        if !tx.acquire_consistent(unsafe { &*f_bucket }) {
            return None; // someone else is working in the old bucket
        }
        // If this fails it is because someone else migrated, which is fine.
        let _ = self.migrate_bucket(tx, f_bucket, f_idx, f_ref.size, a_ref);
        None
    }

    /// Split one (acquired) frozen bucket into the two active buckets it
    /// maps to, and close it.
    fn migrate_bucket(
        &self,
        tx: &mut WStep<'_>,
        f_list: *mut Node<K, V, P>,
        f_idx: u64,
        f_size: u64,
        a_tbl: &Table<K, V, P>,
    ) -> BucketMigration {
        // SAFETY: bucket heads live until their table is reclaimed.
        let head_ref = unsafe { &*f_list };
        // A closed flag is effectively const once set.
        if head_ref.closed.get(tx) {
            return BucketMigration::AlreadyResized;
        }
        if !self.acquire_whole_list(tx, f_list) {
            return BucketMigration::CannotAcquire;
        }

        // Shuffle every data node into one of two fresh lists.
        let l1 = Self::create_list(tx);
        let l2 = Self::create_list(tx);
        let mut curr = head_ref.next.get(tx);
        loop {
            // SAFETY: the whole list is acquired; nodes cannot move.
            let curr_ref = unsafe { &*curr };
            let next = curr_ref.next.get(tx);
            if next.is_null() {
                break; // curr is the tail
            }
            let dest = match curr_ref.key {
                Some(k) if Self::table_hash(&k, a_tbl.size) == f_idx => l1,
                Some(_) => l2,
                None => {
                    curr = next;
                    continue;
                }
            };
            // Push-front into the destination list.
            // SAFETY: destination lists are private to this migration.
            let dest_ref = unsafe { &*dest };
            let succ = dest_ref.next.get(tx);
            dest_ref.next.set(curr, tx);
            curr_ref.next.set(succ, tx);
            curr_ref.prev.set(dest, tx);
            unsafe { &*succ }.prev.set(curr, tx);
            curr = next;
        }
        // Leave the frozen bucket empty (head -> tail) and closed.
        head_ref.next.set(curr, tx);
        a_tbl.buckets[f_idx as usize].set(l1, tx);
        a_tbl.buckets[(f_idx + f_size) as usize].set(l2, tx);
        head_ref.closed.set(true, tx);
        BucketMigration::Migrated
    }

    /// Acquire every node of a bucket list, sentinels included.
    fn acquire_whole_list(&self, tx: &mut WStep<'_>, head: *mut Node<K, V, P>) -> bool {
        let mut curr = head;
        while !curr.is_null() {
            // SAFETY: list nodes stay allocated under SMR.
            let curr_ref = unsafe { &*curr };
            if !tx.acquire_consistent(curr_ref) {
                return false;
            }
            curr = curr_ref.next.get(tx);
        }
        true
    }

    /// Search `bucket` for `key`.
    ///
    /// Returns `None` on inconsistency, `(head, count)` when absent, and
    /// `(node, 0)` when found.
    fn list_get_or_head(
        &self,
        tx: &WStep<'_>,
        key: &K,
        head: *mut Node<K, V, P>,
    ) -> Option<(*mut Node<K, V, P>, u64)> {
        // SAFETY: as in migrate_bucket.
        let head_ref = unsafe { &*head };
        let mut curr = head_ref.next.get(tx);
        if tx.check_orec(head_ref) == END_OF_TIME {
            return None;
        }
        let mut count = 0_u64;
        loop {
            // SAFETY: as above.
            let curr_ref = unsafe { &*curr };
            // The tail's null next is effectively const: no validation.
            if curr_ref.next.get(tx).is_null() {
                return Some((head, count));
            }
            if curr_ref.key.as_ref() == Some(key) {
                return Some((curr, 0));
            }
            let next = curr_ref.next.get(tx);
            if tx.check_orec(curr_ref) == END_OF_TIME {
                return None;
            }
            curr = next;
            count += 1;
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
        loop {
            let mut tx = WStep::new(me);
            let Some((bucket, _)) = self.get_bucket(&mut tx, &key) else {
                continue; // commit (publishing any migration) and retry
            };
            let Some((node, _)) = self.list_get_or_head(&tx, &key, bucket) else {
                tx.unwind();
                continue;
            };
            if node == bucket {
                tx.unwind(); // nothing was written
                return None;
            }
            // SAFETY: as in migrate_bucket.
            let node_ref = unsafe { &*node };
            let val = node_ref.val.get(&tx);
            if tx.check_orec(node_ref) == END_OF_TIME {
                tx.unwind();
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
        // If the bucket has grown past the threshold, insert and linearize
        // first, then expand in a separate step.
        let trigger_ver;
        loop {
            let mut tx = WStep::new(me);
            let Some((bucket, a_ver)) = self.get_bucket(&mut tx, &key) else {
                continue;
            };
            let Some((node, count)) = self.list_get_or_head(&tx, &key, bucket) else {
                tx.unwind();
                continue;
            };
            if node != bucket {
                tx.unwind();
                return false; // already present
            }

            // Lock the head and its successor, then stitch in at the front.
            // SAFETY: as in migrate_bucket.
            let bucket_ref = unsafe { &*bucket };
            if !tx.acquire_consistent(bucket_ref) {
                tx.unwind();
                continue;
            }
            let next = bucket_ref.next.get(&tx);
            // SAFETY: as above.
            let next_ref = unsafe { &*next };
            if !tx.acquire_aggressive(next_ref) {
                tx.unwind();
                continue;
            }

            let new_node = Self::alloc_node(Some(key), val);
            // SAFETY: private until linked.
            let new_ref = unsafe { &*new_node };
            new_ref.next.set(next, &tx);
            new_ref.prev.set(bucket, &tx);
            bucket_ref.next.set(new_node, &tx);
            next_ref.prev.set(new_node, &tx);

            if count >= self.resize_threshold {
                trigger_ver = a_ver;
                break; // commit the insert, then resize
            }
            return true;
        }

        self.resize(me, trigger_ver);
        true
    }

    /// Remove `key`. Returns `false` when the key is absent.
    pub fn remove(&self, me: &mut ThreadCtx, key: K) -> bool {
        me.op_begin();
        let result = self.remove_inner(me, key);
        me.op_end();
        result
    }

    fn remove_inner(&self, me: &mut ThreadCtx, key: K) -> bool {
        loop {
            let mut tx = WStep::new(me);
            let Some((bucket, _)) = self.get_bucket(&mut tx, &key) else {
                continue;
            };
            let Some((node, _)) = self.list_get_or_head(&tx, &key, bucket) else {
                tx.unwind();
                continue;
            };
            if node == bucket {
                tx.unwind();
                return false;
            }

            // SAFETY: as in migrate_bucket.
            let node_ref = unsafe { &*node };
            if !tx.acquire_consistent(node_ref) {
                tx.unwind();
                continue;
            }
            let pred = node_ref.prev.get(&tx);
            let succ = node_ref.next.get(&tx);
            // SAFETY: neighbors of an owned node.
            let (pred_ref, succ_ref) = unsafe { (&*pred, &*succ) };
            if !tx.acquire_aggressive(pred_ref) || !tx.acquire_aggressive(succ_ref) {
                tx.unwind();
                continue;
            }

            pred_ref.next.set(succ, &tx);
            succ_ref.prev.set(pred, &tx);
            // SAFETY: unlinked while owned; unreachable after commit.
            unsafe { tx.reclaim(NonNull::new_unchecked(node)) };
            return true;
        }
    }

    /// Expand the active table. Finishes any in-flight previous resize
    /// first (migrating stragglers), then swaps `active` into `frozen` and
    /// installs a table twice the size.
    fn resize(&self, me: &mut ThreadCtx, mut a_ver: Timestamp) {
        loop {
            let (f_tbl, a_tbl) = {
                let tx = RStep::new(me);
                let f = self.frozen.get(&tx);
                let a = self.active.get(&tx);
                if !tx.check_continuation(&*self.anchor, a_ver) {
                    return; // someone else must be starting a resize
                }
                (f, a)
            };

            if f_tbl.is_null() {
                // No frozen table: install a doubled active table. Build
                // the table before taking the anchor, to keep the critical
                // section short.
                // SAFETY: validated above; kept allocated under SMR.
                let a_size = unsafe { &*a_tbl }.size;
                let new_tbl = Self::alloc_table(a_size * 2);
                let mut tx = WStep::new(me);
                if !tx.acquire_continuation(&*self.anchor, a_ver) {
                    // Someone else is resizing, and that's good enough.
                    // The new table is private, so no SMR is needed.
                    // SAFETY: just allocated, never published.
                    drop(unsafe { Box::from_raw(new_tbl) });
                    return;
                }
                self.frozen.set(a_tbl, &tx);
                self.active.set(new_tbl, &tx);
                tracing::debug!(
                    target: "orestm::maps",
                    old_size = a_size,
                    new_size = a_size * 2,
                    "installed doubled hash table"
                );
                return;
            }

            // Drain the frozen table, then try again with the refreshed
            // anchor version.
            match self.finish_resize(me, a_ver, f_tbl) {
                Some(new_ver) => a_ver = new_ver,
                None => return, // someone else stole the finish
            }
        }
    }

    /// Migrate every remaining frozen bucket, uninstall the frozen table,
    /// and reclaim it. Returns the refreshed anchor version, or `None` if
    /// a concurrent resize got there first.
    fn finish_resize(
        &self,
        me: &mut ThreadCtx,
        a_ver: Timestamp,
        f_tbl: *mut Table<K, V, P>,
    ) -> Option<Timestamp> {
        // SAFETY: the frozen table is kept allocated under SMR.
        let f_ref = unsafe { &*f_tbl };
        let mut next_index = 0_u64;
        while next_index != f_ref.size {
            let mut tx = WStep::new(me);
            let a_tbl = self.active.get(&tx);
            // SAFETY: as above.
            let a_ref = unsafe { &*a_tbl };
            let bucket = f_ref.buckets[next_index as usize].get(&tx);
            match self.migrate_bucket(&mut tx, bucket, next_index, f_ref.size, a_ref) {
                BucketMigration::CannotAcquire => {
                    // Might just be an operation in the bucket; retry it.
                    tx.unwind();
                    continue;
                }
                BucketMigration::AlreadyResized => {
                    // The whole phase may have finished elsewhere.
                    if !tx.check_continuation(&*self.anchor, a_ver) {
                        tx.unwind();
                        return None;
                    }
                }
                BucketMigration::Migrated => {}
            }
            next_index += 1;
        }

        // Uninstall the emptied frozen table.
        {
            let mut tx = WStep::new(me);
            if !tx.acquire_continuation(&*self.anchor, a_ver) {
                return None;
            }
            self.frozen.set(ptr::null_mut(), &tx);
        }
        let new_ver = me.last_wo_end_time();

        // Reclaim the frozen buckets (all empty now) and the table.
        {
            let mut tx = WStep::new(me);
            for i in 0..f_ref.size {
                let head = f_ref.buckets[i as usize].get(&tx);
                let tail = unsafe { &*head }.next.get(&tx);
                // SAFETY: closed buckets are empty head->tail pairs,
                // unreachable since the frozen table was uninstalled.
                unsafe {
                    tx.reclaim(NonNull::new_unchecked(head));
                    tx.reclaim(NonNull::new_unchecked(tail));
                }
            }
            // SAFETY: unreachable as above.
            unsafe { tx.reclaim(NonNull::new_unchecked(f_tbl)) };
        }
        Some(new_ver)
    }
}

impl<K, V: Scalar, P: OrecPolicy> Drop for ResizableUmap<K, V, P> {
    fn drop(&mut self) {
        for table in [self.active.get_mut(), self.frozen.get_mut()] {
            if table.is_null() {
                continue;
            }
            // SAFETY: exclusive access during drop; tables and their lists
            // are owned by the map.
            let mut table = unsafe { Box::from_raw(table) };
            for bucket in table.buckets.iter_mut() {
                let mut curr = bucket.get_mut();
                while !curr.is_null() {
                    // SAFETY: as above.
                    let mut node = unsafe { Box::from_raw(curr) };
                    curr = node.next.get_mut();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use orestm_engine::{PerStripe, ThreadCtx};
    use orestm_types::MapConfig;

    use super::ResizableUmap;

    fn tiny_cfg() -> MapConfig {
        // Small table and low threshold so tests exercise the resize path.
        MapConfig::default().with_buckets(2).with_resize_threshold(2)
    }

    #[test]
    fn rejects_non_power_of_two_buckets() {
        let mut me = ThreadCtx::new();
        let cfg = MapConfig::default().with_buckets(12);
        assert!(ResizableUmap::<u64, u64>::new(&mut me, &cfg).is_err());
    }

    #[test]
    fn bucket_table_of_size_one_is_accepted() {
        let mut me = ThreadCtx::new();
        let cfg = MapConfig::default().with_buckets(1).with_resize_threshold(64);
        let map: ResizableUmap<u64, u64> = ResizableUmap::new(&mut me, &cfg).expect("config");
        for k in 0..16 {
            assert!(map.insert(&mut me, k, k));
        }
        for k in 0..16 {
            assert_eq!(map.get(&mut me, k), Some(k));
        }
    }

    #[test]
    fn sequential_operations_across_resizes() {
        let mut me = ThreadCtx::new();
        let map: ResizableUmap<u64, u64> = ResizableUmap::new(&mut me, &tiny_cfg()).expect("config");

        for k in 0..256 {
            assert!(map.insert(&mut me, k, k * 3));
        }
        for k in 0..256 {
            assert_eq!(map.get(&mut me, k), Some(k * 3), "key {k}");
        }
        assert_eq!(map.get(&mut me, 256), None);
        for k in (0..256).step_by(2) {
            assert!(map.remove(&mut me, k));
        }
        for k in 0..256 {
            let expect = if k % 2 == 0 { None } else { Some(k * 3) };
            assert_eq!(map.get(&mut me, k), expect);
        }
    }

    #[test]
    fn duplicate_inserts_fail_without_modifying() {
        let mut me = ThreadCtx::new();
        let map: ResizableUmap<u32, u32> =
            ResizableUmap::new(&mut me, &tiny_cfg()).expect("config");
        assert!(map.insert(&mut me, 9, 90));
        assert!(!map.insert(&mut me, 9, 91));
        assert_eq!(map.get(&mut me, 9), Some(90));
    }

    #[test]
    fn concurrent_inserts_during_resizes() {
        let map: ResizableUmap<u64, u64, PerStripe> = {
            let mut me = ThreadCtx::new();
            ResizableUmap::new(&mut me, &tiny_cfg()).expect("config")
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..128_u64 {
                        let k = t + 4 * i;
                        assert!(map.insert(&mut me, k, k + 7));
                    }
                });
            }
        });

        let mut me = ThreadCtx::new();
        for k in 0..512_u64 {
            assert_eq!(map.get(&mut me, k), Some(k + 7), "key {k}");
        }
    }

    #[test]
    fn concurrent_mixed_workload() {
        let map: ResizableUmap<u64, u64> = {
            let mut me = ThreadCtx::new();
            ResizableUmap::new(&mut me, &tiny_cfg()).expect("config")
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..300_u64 {
                        let k = (t * 61 + i * 13) % 128;
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
