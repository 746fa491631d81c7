//! Singly-linked ordered map, transactional mode.
//!
//! Every operation is one transaction: traversal reads go through the
//! field layer (validating and accumulating the read set), and mutators
//! rely on the engine's commit to make the splice atomic. Compare the
//! step-mode doubly-linked list, where the programmer choreographs the
//! locking by hand; here the access policy does all of it.

use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use orestm_engine::{
    AccessPolicy, EagerC1, Orec, Ownable, OrecHandle, OrecPolicy, PerObject, Scalar, TField,
    ThreadCtx, TxResult, TxnScope, ro_run, wo_run,
};
use orestm_error::Result;
use orestm_types::MapConfig;

/// A list node; sentinels carry no key.
struct Node<K, V: Scalar, P: OrecPolicy> {
    orec: P::Handle,
    next: TField<*mut Node<K, V, P>>,
    key: Option<K>,
    val: TField<V>,
}

impl<K, V: Scalar, P: OrecPolicy> Ownable for Node<K, V, P> {
    fn orec(&self) -> &Orec {
        self.orec.orec()
    }
}

/// An ordered map over a singly-linked list with sentinel endpoints,
/// accessed through transactions under the access policy `A`.
pub struct SlistOmap<K, V: Scalar, P: OrecPolicy = PerObject, A: AccessPolicy = EagerC1> {
    head: *mut Node<K, V, P>,
    tail: *mut Node<K, V, P>,
    _policy: PhantomData<A>,
}

// SAFETY: all shared node state goes through engine fields and orecs.
unsafe impl<K: Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy, A: AccessPolicy> Send
    for SlistOmap<K, V, P, A>
{
}
// SAFETY: as above.
unsafe impl<K: Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy, A: AccessPolicy> Sync
    for SlistOmap<K, V, P, A>
{
}

impl<K, V, P, A> SlistOmap<K, V, P, A>
where
    K: Copy + Ord + 'static,
    V: Scalar,
    P: OrecPolicy,
    A: AccessPolicy,
{
    /// Construct an empty map: head sentinel linked to tail sentinel.
    ///
    /// # Errors
    ///
    /// Fails if `cfg` does not validate.
    pub fn new(me: &mut ThreadCtx, cfg: &MapConfig) -> Result<Self> {
        cfg.validate()?;
        let head = Self::alloc(None, V::from_bits(0));
        let tail = Self::alloc(None, V::from_bits(0));
        wo_run::<A, _, _>(me, |tx| {
            // Both sentinels are still private to this constructor.
            // SAFETY: freshly allocated.
            unsafe { &*head }.next.set_cap(tx, tail);
            Ok(())
        });
        Ok(Self {
            head,
            tail,
            _policy: PhantomData,
        })
    }

    fn alloc(key: Option<K>, val: V) -> *mut Node<K, V, P> {
        let mut node = Box::new(Node {
            orec: P::placeholder(),
            next: TField::new(ptr::null_mut()),
            key,
            val: TField::new(val),
        });
        node.orec = P::attach(ptr::addr_of!(*node) as usize);
        Box::into_raw(node)
    }

    fn make_node(key: K, val: V) -> Box<Node<K, V, P>> {
        let mut node = Box::new(Node {
            orec: P::placeholder(),
            next: TField::new(ptr::null_mut()),
            key: Some(key),
            val: TField::new(val),
        });
        node.orec = P::attach(ptr::addr_of!(*node) as usize);
        node
    }

    /// Inclusive predecessor query: the largest node with key at most `key`
    /// (strictly below it in `lt_mode`), or the head sentinel.
    fn get_leq<S>(&self, tx: &mut S, key: K, lt_mode: bool) -> TxResult<*mut Node<K, V, P>>
    where
        S: TxnScope<Policy = A>,
    {
        let mut curr = self.head;
        loop {
            // SAFETY: nodes reachable during the operation stay allocated
            // (SMR), and field reads validate through the policy.
            let curr_ref = unsafe { &*curr };
            let next = curr_ref.next.get(tx, curr_ref)?;
            if next == self.tail {
                return Ok(curr);
            }
            // SAFETY: as above.
            let next_ref = unsafe { &*next };
            let Some(nkey) = next_ref.key else {
                return Ok(curr);
            };
            if lt_mode && nkey >= key || !lt_mode && nkey > key {
                return Ok(curr);
            }
            if nkey == key {
                return Ok(next);
            }
            curr = next;
        }
    }

    /// Look up `key`.
    pub fn get(&self, me: &mut ThreadCtx, key: K) -> Option<V> {
        me.op_begin();
        let result = ro_run::<A, _, _>(me, |tx| {
            let found = self.get_leq(tx, key, false)?;
            // SAFETY: as in get_leq.
            let node = unsafe { &*found };
            if found == self.head || node.key != Some(key) {
                return Ok(None);
            }
            Ok(Some(node.val.get(tx, node)?))
        });
        me.op_end();
        result
    }

    /// Insert `key -> val` if absent. Returns `false` when the key exists.
    pub fn insert(&self, me: &mut ThreadCtx, key: K, val: V) -> bool {
        me.op_begin();
        let result = wo_run::<A, _, _>(me, |tx| {
            let found = self.get_leq(tx, key, false)?;
            // SAFETY: as in get_leq.
            let node = unsafe { &*found };
            if found != self.head && node.key == Some(key) {
                return Ok(false);
            }

            // Stitch in a new node after `found`.
            let succ = node.next.get(tx, node)?;
            let new_node = tx.log_new(Self::make_node(key, val));
            // SAFETY: speculative allocation, private until linked below.
            unsafe { new_node.as_ref() }.next.set_cap(tx, succ);
            node.next.set(tx, node, new_node.as_ptr())?;
            Ok(true)
        });
        me.op_end();
        result
    }

    /// Remove `key`. Returns `false` when the key is absent.
    pub fn remove(&self, me: &mut ThreadCtx, key: K) -> bool {
        me.op_begin();
        let result = wo_run::<A, _, _>(me, |tx| {
            // A strictly-less query yields the predecessor even when the
            // key is present.
            let prev = self.get_leq(tx, key, true)?;
            // SAFETY: as in get_leq.
            let prev_ref = unsafe { &*prev };
            let curr = prev_ref.next.get(tx, prev_ref)?;
            if curr == self.tail {
                return Ok(false);
            }
            // SAFETY: as above.
            let curr_ref = unsafe { &*curr };
            if curr_ref.key != Some(key) {
                return Ok(false);
            }
            let next = curr_ref.next.get(tx, curr_ref)?;
            prev_ref.next.set(tx, prev_ref, next)?;
            // SAFETY: unlinked by this transaction; unreachable once it
            // commits, which is when reclaim takes effect.
            unsafe { tx.reclaim(NonNull::new_unchecked(curr)) };
            Ok(true)
        });
        me.op_end();
        result
    }
}

impl<K, V: Scalar, P: OrecPolicy, A: AccessPolicy> Drop for SlistOmap<K, V, P, A> {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // SAFETY: exclusive access; nodes are owned by the list.
            let mut node = unsafe { Box::from_raw(curr) };
            curr = node.next.get_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use orestm_engine::{EagerC2, Lazy, PerObject, PerStripe, ThreadCtx, WbLock};
    use orestm_types::MapConfig;

    use super::SlistOmap;

    #[test]
    fn sequential_operations_under_default_policy() {
        let mut me = ThreadCtx::new();
        let cfg = MapConfig::default();
        let map: SlistOmap<u64, u64> = SlistOmap::new(&mut me, &cfg).expect("config");

        assert!(map.insert(&mut me, 3, 30));
        assert!(map.insert(&mut me, 1, 10));
        assert!(map.insert(&mut me, 2, 20));
        assert!(!map.insert(&mut me, 2, 21));
        assert_eq!(map.get(&mut me, 1), Some(10));
        assert_eq!(map.get(&mut me, 2), Some(20));
        assert_eq!(map.get(&mut me, 4), None);
        assert!(map.remove(&mut me, 1));
        assert!(!map.remove(&mut me, 1));
        assert_eq!(map.get(&mut me, 1), None);
        assert_eq!(map.get(&mut me, 3), Some(30));
    }

    fn policy_roundtrip<A: orestm_engine::AccessPolicy>() {
        let mut me = ThreadCtx::new();
        let cfg = MapConfig::default();
        let map: SlistOmap<u32, u32, PerObject, A> = SlistOmap::new(&mut me, &cfg).expect("config");
        for k in 0..64 {
            assert!(map.insert(&mut me, k, k ^ 0xFF));
        }
        for k in 0..64 {
            assert_eq!(map.get(&mut me, k), Some(k ^ 0xFF));
        }
        for k in (0..64).step_by(3) {
            assert!(map.remove(&mut me, k));
        }
        for k in 0..64 {
            let expect = if k % 3 == 0 { None } else { Some(k ^ 0xFF) };
            assert_eq!(map.get(&mut me, k), expect);
        }
    }

    #[test]
    fn eager_check_twice_policy_roundtrip() {
        policy_roundtrip::<EagerC2>();
    }

    #[test]
    fn lazy_policy_roundtrip() {
        policy_roundtrip::<Lazy>();
    }

    #[test]
    fn write_back_lock_policy_roundtrip() {
        policy_roundtrip::<WbLock>();
    }

    #[test]
    fn concurrent_inserts_and_removes_converge() {
        let map: SlistOmap<u64, u64, PerStripe> = {
            let mut me = ThreadCtx::new();
            SlistOmap::new(&mut me, &MapConfig::default()).expect("config")
        };

        std::thread::scope(|s| {
            for t in 0..4_u64 {
                let map = &map;
                s.spawn(move || {
                    let mut me = ThreadCtx::new();
                    for i in 0..50_u64 {
                        let k = t + 4 * i;
                        assert!(map.insert(&mut me, k, k + 1));
                    }
                    for i in 0..50_u64 {
                        let k = t + 4 * i;
                        assert!(map.remove(&mut me, k));
                    }
                });
            }
        });

        let mut me = ThreadCtx::new();
        for k in 0..200_u64 {
            assert_eq!(map.get(&mut me, k), None);
        }
    }

    proptest::proptest! {
        #![proptest_config(proptest::test_runner::Config {
            cases: 64,
            ..proptest::test_runner::Config::default()
        })]

        #[test]
        fn prop_matches_a_reference_map(
            ops in proptest::collection::vec((0_u8..3, 0_u32..32), 1..200),
        ) {
            use std::collections::BTreeMap;
            let mut me = ThreadCtx::new();
            let map: SlistOmap<u32, u32> =
                SlistOmap::new(&mut me, &MapConfig::default()).expect("config");
            let mut model = BTreeMap::new();

            for (op, k) in ops {
                match op {
                    0 => proptest::prop_assert_eq!(
                        map.insert(&mut me, k, k + 1),
                        model.insert(k, k + 1).is_none()
                    ),
                    1 => proptest::prop_assert_eq!(
                        map.remove(&mut me, k),
                        model.remove(&k).is_some()
                    ),
                    _ => proptest::prop_assert_eq!(map.get(&mut me, k), model.get(&k).copied()),
                }
            }
        }
    }

    #[test]
    fn conflicting_inserts_have_one_winner() {
        let map: SlistOmap<u64, u64> = {
            let mut me = ThreadCtx::new();
            SlistOmap::new(&mut me, &MapConfig::default()).expect("config")
        };

        let wins: usize = std::thread::scope(|s| {
            (0..4_u64)
                .map(|t| {
                    let map = &map;
                    s.spawn(move || {
                        let mut me = ThreadCtx::new();
                        map.insert(&mut me, 42, t)
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().expect("inserter"))
                .filter(|&won| won)
                .count()
        });
        assert_eq!(wins, 1);
    }
}
