use proptest::prelude::*;
use stagger_dispatch::Priority;

/// (min, max, items_per_worker) with 1 <= min <= max
pub fn concurrency_bounds_strategy() -> impl Strategy<Value = (usize, usize, usize)> {
    (1usize..8, 0usize..32, 1usize..50).prop_map(|(min, extra, ipw)| (min, min + extra, ipw))
}

pub fn queue_depth_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![0u64..200, 200u64..100_000, Just(u64::MAX)]
}

pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::High),
        Just(Priority::Standard),
        Just(Priority::Low),
    ]
}
