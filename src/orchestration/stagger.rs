//! # Stagger Scheduler
//!
//! Deterministic start offsets for the items of a batch, so invocations fan out
//! over time instead of bursting. The baseline is `index * unit_delay`; priority
//! shrinks or stretches the unit, and a backlog beyond `depth_threshold` widens
//! spacing further, up to `max_spacing_multiplier`.

use crate::config::StaggerConfig;
use crate::constants::Priority;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct StaggerScheduler {
    unit_delay: Duration,
    high_priority_divisor: u32,
    low_priority_multiplier: u32,
    depth_threshold: u64,
    depth_spacing_factor: f64,
    max_spacing_multiplier: f64,
}

impl StaggerScheduler {
    pub fn from_config(config: &StaggerConfig) -> Self {
        Self {
            unit_delay: config.unit_delay(),
            high_priority_divisor: config.high_priority_divisor.max(1),
            low_priority_multiplier: config.low_priority_multiplier.max(1),
            depth_threshold: config.depth_threshold.max(1),
            depth_spacing_factor: config.depth_spacing_factor.max(0.0),
            max_spacing_multiplier: config.max_spacing_multiplier.max(1.0),
        }
    }

    /// Baseline policy: priority and depth ignored
    pub fn with_unit_delay(unit_delay: Duration) -> Self {
        Self::from_config(&StaggerConfig {
            unit_delay_ms: u64::try_from(unit_delay.as_millis()).unwrap_or(u64::MAX),
            depth_spacing_factor: 0.0,
            ..StaggerConfig::default()
        })
    }

    pub fn baseline_offset(&self, index: usize) -> Duration {
        scale(self.unit_delay, index)
    }

    pub fn offset(&self, index: usize, queue_depth: u64, priority: Priority) -> Duration {
        let unit = self.priority_unit(priority);
        let multiplier = self.depth_multiplier(queue_depth);
        let unit = if multiplier > 1.0 {
            Duration::try_from_secs_f64(unit.as_secs_f64() * multiplier).unwrap_or(Duration::MAX)
        } else {
            unit
        };
        scale(unit, index)
    }

    fn priority_unit(&self, priority: Priority) -> Duration {
        match priority {
            Priority::High => self.unit_delay / self.high_priority_divisor,
            Priority::Standard => self.unit_delay,
            Priority::Low => self
                .unit_delay
                .checked_mul(self.low_priority_multiplier)
                .unwrap_or(Duration::MAX),
        }
    }

    /// 1.0 up to the threshold, then grows linearly with the excess backlog
    pub fn depth_multiplier(&self, queue_depth: u64) -> f64 {
        if queue_depth <= self.depth_threshold {
            return 1.0;
        }
        let excess = (queue_depth - self.depth_threshold) as f64 / self.depth_threshold as f64;
        (1.0 + self.depth_spacing_factor * excess).min(self.max_spacing_multiplier)
    }
}

impl Default for StaggerScheduler {
    fn default() -> Self {
        Self::from_config(&StaggerConfig::default())
    }
}

fn scale(unit: Duration, index: usize) -> Duration {
    u32::try_from(index)
        .ok()
        .and_then(|n| unit.checked_mul(n))
        .unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_spreads_batch() {
        let scheduler = StaggerScheduler::default();
        assert_eq!(scheduler.offset(0, 50, Priority::Standard), Duration::ZERO);
        assert_eq!(scheduler.offset(9, 50, Priority::Standard), Duration::from_secs(9));
        assert_eq!(scheduler.baseline_offset(9), Duration::from_secs(9));
    }

    #[test]
    fn test_priority_scaling() {
        let scheduler = StaggerScheduler::default();
        assert_eq!(scheduler.offset(4, 0, Priority::High), Duration::from_secs(2));
        assert_eq!(scheduler.offset(4, 0, Priority::Low), Duration::from_secs(8));
    }

    #[test]
    fn test_depth_widens_spacing_up_to_cap() {
        let scheduler = StaggerScheduler::default();
        assert_eq!(scheduler.depth_multiplier(100), 1.0);
        assert_eq!(scheduler.depth_multiplier(300), 2.0);
        assert_eq!(scheduler.depth_multiplier(1_000_000), 4.0);
        assert_eq!(scheduler.offset(2, 300, Priority::Standard), Duration::from_secs(4));
    }

    #[test]
    fn test_deterministic() {
        let scheduler = StaggerScheduler::default();
        assert_eq!(
            scheduler.offset(7, 450, Priority::High),
            scheduler.offset(7, 450, Priority::High)
        );
    }

    #[test]
    fn test_unit_delay_constructor_ignores_depth() {
        let scheduler = StaggerScheduler::with_unit_delay(Duration::from_millis(250));
        assert_eq!(
            scheduler.offset(4, 10_000, Priority::Standard),
            Duration::from_secs(1)
        );
    }
}
