//! The shared map contract, exercised end-to-end against every structure.
//!
//! Each suite runs the same scenarios: sequential insert/get behavior,
//! sequential remove, concurrent disjoint inserts, and conflicting inserts
//! with exactly one winner.

use orestm::{
    DlistOmap, IbstOmap, InterlockedUmap, MapConfig, RbtreeOmap, ResizableUmap, SkiplistOmap,
    SlistOmap, ThreadCtx,
};

fn test_cfg() -> MapConfig {
    MapConfig::default()
        .with_buckets(4)
        .with_resize_threshold(3)
        .with_chunksize(2)
        .with_max_levels(8)
        .with_snapshot_freq(8)
}

macro_rules! omap_suite {
    ($suite:ident, $map:ty) => {
        mod $suite {
            use super::*;

            fn build(ctx: &mut ThreadCtx) -> $map {
                <$map>::new(ctx, &test_cfg()).expect("test config must validate")
            }

            #[test]
            fn sequential_insert_then_get() {
                let mut ctx = ThreadCtx::new();
                let map = build(&mut ctx);
                assert!(map.insert(&mut ctx, 2, 0xA));
                assert!(map.insert(&mut ctx, 4, 0xB));
                assert!(map.insert(&mut ctx, 6, 0xC));
                assert_eq!(map.get(&mut ctx, 4), Some(0xB));
                assert_eq!(map.get(&mut ctx, 5), None);
            }

            #[test]
            fn sequential_remove() {
                let mut ctx = ThreadCtx::new();
                let map = build(&mut ctx);
                assert!(map.insert(&mut ctx, 2, 0xA));
                assert!(map.insert(&mut ctx, 4, 0xB));
                assert!(map.remove(&mut ctx, 2));
                assert_eq!(map.get(&mut ctx, 2), None);
                assert_eq!(map.get(&mut ctx, 4), Some(0xB));
            }

            #[test]
            fn insert_remove_round_trip_leaves_key_set_unchanged() {
                let mut ctx = ThreadCtx::new();
                let map = build(&mut ctx);
                for k in 0..32_u64 {
                    assert!(map.insert(&mut ctx, k, k));
                }
                assert!(map.insert(&mut ctx, 100, 1));
                assert!(map.remove(&mut ctx, 100));
                for k in 0..32_u64 {
                    assert_eq!(map.get(&mut ctx, k), Some(k));
                }
                assert_eq!(map.get(&mut ctx, 100), None);
            }

            #[test]
            fn duplicate_insert_returns_false_and_keeps_value() {
                let mut ctx = ThreadCtx::new();
                let map = build(&mut ctx);
                assert!(map.insert(&mut ctx, 7, 70));
                assert!(!map.insert(&mut ctx, 7, 71));
                assert_eq!(map.get(&mut ctx, 7), Some(70));
            }

            #[test]
            fn concurrent_disjoint_inserts() {
                let map = {
                    let mut ctx = ThreadCtx::new();
                    build(&mut ctx)
                };
                std::thread::scope(|s| {
                    let odd = &map;
                    s.spawn(move || {
                        let mut ctx = ThreadCtx::new();
                        for k in [1_u64, 3, 5] {
                            assert!(odd.insert(&mut ctx, k, k * 10));
                        }
                    });
                    let even = &map;
                    s.spawn(move || {
                        let mut ctx = ThreadCtx::new();
                        for k in [2_u64, 4, 6] {
                            assert!(even.insert(&mut ctx, k, k * 10));
                        }
                    });
                });
                let mut ctx = ThreadCtx::new();
                for k in 1..=6_u64 {
                    assert_eq!(map.get(&mut ctx, k), Some(k * 10));
                }
                assert_eq!(map.get(&mut ctx, 7), None);
                assert_eq!(map.get(&mut ctx, 0), None);
            }

            #[test]
            fn conflicting_inserts_have_exactly_one_winner() {
                let map = {
                    let mut ctx = ThreadCtx::new();
                    build(&mut ctx)
                };
                let winners: usize = std::thread::scope(|s| {
                    (0..4_u64)
                        .map(|t| {
                            let map = &map;
                            s.spawn(move || {
                                let mut ctx = ThreadCtx::new();
                                map.insert(&mut ctx, 7, t)
                            })
                        })
                        .collect::<Vec<_>>()
                        .into_iter()
                        .map(|h| h.join().expect("inserter panicked"))
                        .filter(|&won| won)
                        .count()
                });
                assert_eq!(winners, 1);
                let mut ctx = ThreadCtx::new();
                assert!(map.get(&mut ctx, 7).is_some());
            }

            #[test]
            fn concurrent_churn_on_a_small_key_range() {
                let map = {
                    let mut ctx = ThreadCtx::new();
                    build(&mut ctx)
                };
                std::thread::scope(|s| {
                    for t in 0..4_u64 {
                        let map = &map;
                        s.spawn(move || {
                            let mut ctx = ThreadCtx::new();
                            for i in 0..150_u64 {
                                let k = (t * 23 + i * 5) % 32;
                                match i % 3 {
                                    0 => {
                                        let _ = map.insert(&mut ctx, k, k);
                                    }
                                    1 => {
                                        let _ = map.remove(&mut ctx, k);
                                    }
                                    _ => {
                                        // A present key always carries the
                                        // value it was inserted with.
                                        if let Some(v) = map.get(&mut ctx, k) {
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
    };
}

omap_suite!(dlist, DlistOmap<u64, u64>);
omap_suite!(slist, SlistOmap<u64, u64>);
omap_suite!(skiplist, SkiplistOmap<u64, u64>);
omap_suite!(ibst, IbstOmap<u64, u64>);
omap_suite!(rbtree, RbtreeOmap<u64, u64>);
omap_suite!(carumap, ResizableUmap<u64, u64>);
omap_suite!(iht, InterlockedUmap<u64, u64>);
