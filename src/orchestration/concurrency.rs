//! # Concurrency Controller
//!
//! Sizes the worker pool for a batch from the current queue depth:
//! `clamp(ceil(depth / items_per_worker), min, max)`. Keeps per-worker load
//! roughly constant while never dropping to zero workers or exceeding the
//! ceiling the downstream can take.

use crate::config::DispatchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyController {
    min: usize,
    max: usize,
    items_per_worker: usize,
}

impl ConcurrencyController {
    pub fn new(min: usize, max: usize, items_per_worker: usize) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
            items_per_worker: items_per_worker.max(1),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config.min_concurrency,
            config.max_concurrency,
            config.items_per_worker,
        )
    }

    /// Monotonic non-decreasing in `queue_depth`; always within `[min, max]`
    /// (`max` wins if the bounds are inverted).
    pub fn compute(queue_depth: u64, min: usize, max: usize, items_per_worker: usize) -> usize {
        let per_worker = items_per_worker.max(1) as u64;
        let wanted = usize::try_from(queue_depth.div_ceil(per_worker)).unwrap_or(usize::MAX);
        wanted.max(min).min(max)
    }

    pub fn effective(&self, queue_depth: u64) -> usize {
        Self::compute(queue_depth, self.min, self.max, self.items_per_worker)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
