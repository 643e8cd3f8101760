//! Property tests for the id allocator.
//!
//! For any interleaving of allocate/deallocate calls, `check(id)` must
//! reflect the net allocation state, freed ids must be the first to be
//! reused, and the tree-backed pool must agree with a naive set-based
//! model.

use std::collections::BTreeSet;

use proptest::prelude::*;

use memkit::IdPool;

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    AllocateId(u64),
    Deallocate(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // Values are offsets from the pool's begin.
    prop_oneof![
        2 => Just(Op::Allocate),
        2 => (0u64..4096).prop_map(Op::AllocateId),
        3 => (0u64..4096).prop_map(Op::Deallocate),
    ]
}

/// Naive reference model: a sorted set of allocated ids.
struct Model {
    begin: u64,
    used: BTreeSet<u64>,
}

impl Model {
    fn allocate(&mut self) -> u64 {
        let mut id = self.begin;
        while self.used.contains(&id) {
            id += 1;
        }
        self.used.insert(id);
        id
    }

    fn allocate_id(&mut self, id: u64) -> bool {
        self.used.insert(id)
    }

    fn deallocate(&mut self, id: u64) -> bool {
        self.used.remove(&id)
    }
}

proptest! {
    #[test]
    fn pool_agrees_with_the_set_model(
        begin in prop_oneof![Just(0u64), Just(1u64), Just(100u64)],
        shrink in any::<bool>(),
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        // Small blocks force multi-level trees even for small id ranges.
        let mut pool = IdPool::with_block_bits(begin, 32).with_shrink(shrink);
        let mut model = Model { begin, used: BTreeSet::new() };

        for op in ops {
            match op {
                Op::Allocate => {
                    let got = pool.allocate().unwrap();
                    let want = model.allocate();
                    prop_assert_eq!(got, want);
                }
                Op::AllocateId(offset) => {
                    let id = begin + offset;
                    let got = pool.allocate_id(id).unwrap();
                    let want = model.allocate_id(id);
                    prop_assert_eq!(got, want);
                }
                Op::Deallocate(offset) => {
                    let id = begin + offset;
                    let got = pool.deallocate(id).unwrap();
                    let want = model.deallocate(id);
                    prop_assert_eq!(got, want);
                }
            }
        }

        // Final states agree, inside and beyond the touched range.
        for id in begin..begin + 4200 {
            prop_assert_eq!(pool.check(id), model.used.contains(&id));
        }
    }

    #[test]
    fn below_begin_is_always_a_range_error(
        begin in 1u64..1000,
        id in 0u64..1000,
    ) {
        let mut pool = IdPool::new(begin);
        if id < begin {
            prop_assert!(pool.allocate_id(id).is_err());
            prop_assert!(pool.deallocate(id).is_err());
            prop_assert!(!pool.check(id));
        } else {
            prop_assert!(pool.allocate_id(id).is_ok());
            prop_assert!(pool.check(id));
        }
    }

    #[test]
    fn freed_id_is_reused_by_the_next_implicit_allocate(
        count in 1usize..100,
        victim in 0usize..100,
    ) {
        let victim = victim % count;
        let mut pool = IdPool::with_block_bits(0, 32);
        let ids: Vec<u64> = (0..count).map(|_| pool.allocate().unwrap()).collect();
        pool.deallocate(ids[victim]).unwrap();
        prop_assert_eq!(pool.allocate().unwrap(), ids[victim]);
    }
}
