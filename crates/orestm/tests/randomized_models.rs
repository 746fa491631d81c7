//! Randomized single-threaded conformance: every map must agree with a
//! reference `BTreeMap`/`HashMap` over arbitrary operation sequences.

use std::collections::BTreeMap;

use orestm::{DlistOmap, MapConfig, RbtreeOmap, SkiplistOmap, ThreadCtx};
use proptest::prelude::*;

fn cfg() -> MapConfig {
    MapConfig::default()
        .with_snapshot_freq(4)
        .with_max_levels(6)
}

fn op_seq() -> impl Strategy<Value = Vec<(u8, u64)>> {
    prop::collection::vec((0_u8..3, 0_u64..48), 1..250)
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 48, ..ProptestConfig::default() })]

    #[test]
    fn dlist_matches_reference(ops in op_seq()) {
        let mut ctx = ThreadCtx::new();
        let map: DlistOmap<u64, u64> = DlistOmap::new(&mut ctx, &cfg()).expect("config");
        let mut model = BTreeMap::new();
        for (op, k) in ops {
            match op {
                0 => prop_assert_eq!(map.insert(&mut ctx, k, !k), model.insert(k, !k).is_none()),
                1 => prop_assert_eq!(map.remove(&mut ctx, k), model.remove(&k).is_some()),
                _ => prop_assert_eq!(map.get(&mut ctx, k), model.get(&k).copied()),
            }
        }
    }

    #[test]
    fn skiplist_matches_reference(ops in op_seq()) {
        let mut ctx = ThreadCtx::new();
        let map: SkiplistOmap<u64, u64> = SkiplistOmap::new(&mut ctx, &cfg()).expect("config");
        let mut model = BTreeMap::new();
        for (op, k) in ops {
            match op {
                0 => prop_assert_eq!(map.insert(&mut ctx, k, !k), model.insert(k, !k).is_none()),
                1 => prop_assert_eq!(map.remove(&mut ctx, k), model.remove(&k).is_some()),
                _ => prop_assert_eq!(map.get(&mut ctx, k), model.get(&k).copied()),
            }
        }
    }

    #[test]
    fn rbtree_matches_reference(ops in op_seq()) {
        let mut ctx = ThreadCtx::new();
        let map: RbtreeOmap<u64, u64> = RbtreeOmap::new(&mut ctx, &cfg()).expect("config");
        let mut model = BTreeMap::new();
        for (op, k) in ops {
            match op {
                0 => prop_assert_eq!(map.insert(&mut ctx, k, !k), model.insert(k, !k).is_none()),
                1 => prop_assert_eq!(map.remove(&mut ctx, k), model.remove(&k).is_some()),
                _ => prop_assert_eq!(map.get(&mut ctx, k), model.get(&k).copied()),
            }
        }
    }
}
