//! Generation membership and promotion policy.

use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    Young,
    Old,
}

/// Tenuring and major-collection policy for the generational strategies.
///
/// The old generation grows a soft threshold the way the young/old split is
/// usually tuned: after each major collection the next threshold is a
/// multiple of what survived, clamped by a maximum growth rate.
pub(crate) struct GenerationManager {
    promotion_threshold: u8,
    major_collection_threshold: f64,
    growth_rate_max: f64,
    next_major_collection_threshold: usize,
    next_major_collection_initial: usize,
    min_old_size: usize,
}

impl GenerationManager {
    pub(crate) fn new(config: &Config) -> Self {
        let min_old_size = (config.old_capacity / 4)
            .max((config.young_capacity as f64 * 1.82) as usize)
            .min(config.old_capacity);
        let mut this = Self {
            promotion_threshold: config.promotion_threshold,
            major_collection_threshold: 1.82,
            growth_rate_max: 1.4,
            next_major_collection_threshold: min_old_size,
            next_major_collection_initial: min_old_size,
            min_old_size,
        };
        this.set_major_threshold_from(0.0);
        this
    }

    pub(crate) fn set_major_threshold_from(&mut self, mut threshold: f64) {
        let threshold_max =
            (self.next_major_collection_initial as f64 * self.growth_rate_max) as usize;

        if threshold > threshold_max as f64 {
            threshold = threshold_max as _;
        }
        if threshold < self.min_old_size as f64 {
            threshold = self.min_old_size as _;
        }
        self.next_major_collection_initial = threshold as _;
        self.next_major_collection_threshold = threshold as _;
        tracing::debug!(
            threshold = self.next_major_collection_threshold,
            "major threshold set"
        );
    }

    /// True when a record that has already survived `age` young cycles must
    /// be tenured instead of copied back into the young generation.
    pub(crate) fn should_promote(&self, age: u8) -> bool {
        age >= self.promotion_threshold
    }

    pub(crate) fn major_due(&self, old_used: usize) -> bool {
        old_used > self.next_major_collection_threshold
    }

    pub(crate) fn after_major(&mut self, old_used: usize) {
        self.set_major_threshold_from(old_used as f64 * self.major_collection_threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Strategy;

    #[test]
    fn promotion_threshold_is_inclusive() {
        let config = Config {
            strategy: Strategy::Serial,
            promotion_threshold: 15,
            ..Config::default()
        };
        let manager = GenerationManager::new(&config);
        assert!(!manager.should_promote(14));
        assert!(manager.should_promote(15));
    }

    #[test]
    fn major_threshold_tracks_survivors() {
        let config = Config {
            strategy: Strategy::Serial,
            young_capacity: 1024,
            old_capacity: 64 * 1024,
            ..Config::default()
        };
        let mut manager = GenerationManager::new(&config);
        let before = manager.next_major_collection_threshold;
        assert!(manager.major_due(before + 1));
        manager.after_major(before * 2);
        assert!(manager.next_major_collection_threshold > before);
    }
}
