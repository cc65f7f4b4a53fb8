//! # Pulsar
//!
//! Pulsar is a pluggable garbage collection engine for language runtimes in
//! Rust. The host runtime keeps its own object model; Pulsar sees only an
//! abstract object graph (allocations, their sizes and their outgoing
//! references by identity) plus the roots the runtime reports, and takes
//! care of reachability tracing, reclamation, compaction and promotion.
//!
//! ## Collection strategies
//!
//! One heap, four interchangeable strategies selected through [`Config`]:
//! - [`Strategy::Serial`]: single-threaded stop-the-world
//!   mark-sweep-compact, generational.
//! - [`Strategy::Parallel`]: the same phases fanned out across a worker
//!   pool, with per-worker pre-reserved compaction targets.
//! - [`Strategy::ConcurrentMarkSweep`]: marking runs alongside the mutator
//!   under an incremental-update write barrier; one brief final pause, then
//!   an in-place sweep.
//! - [`Strategy::RegionIncremental`]: concurrent marking plus bounded
//!   evacuation of the regions with the most garbage, so pauses scale with
//!   the per-cycle region budget instead of heap size.

use std::time::Duration;

pub mod api;
pub mod barrier;
pub mod cms;
pub mod collector;
pub mod compact;
pub mod error;
pub mod generation;
pub mod global;
pub mod heap;
pub mod marking;
pub mod object;
pub mod parallel;
pub mod regional;
pub mod safepoint;
pub mod scheduler;
pub mod serial;
pub mod space;
pub mod statistics;
pub mod sweep;

#[cfg(test)]
mod tests;

pub use api::{CycleSink, RootList, RootProvider};
pub use collector::Phase;
pub use error::{GcError, Result};
pub use generation::Generation;
pub use heap::Heap;
pub use object::ObjectId;
pub use statistics::{
    CollectionCycle, CycleEvent, CycleKind, GcReason, HeapStatistics,
};

/// Collection strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Serial,
    Parallel,
    ConcurrentMarkSweep,
    RegionIncremental,
}

/// Configuration for heap constructor.
#[derive(Debug, Clone)]
pub struct Config {
    pub strategy: Strategy,
    /// Young-generation capacity for the generational strategies; part of
    /// the uniform heap capacity otherwise.
    pub young_capacity: usize,
    pub old_capacity: usize,
    /// Size the heap is carved into regions of.
    pub region_size: usize,
    /// Young cycles an object must survive before it is tenured.
    pub promotion_threshold: u8,
    /// Soft ceiling on a single stop-the-world pause. Overruns complete
    /// anyway and are reported on the cycle record.
    pub pause_deadline: Duration,
    /// Occupancy ratio that triggers a collection cycle. Values above 1.0
    /// disable the trigger.
    pub occupancy_trigger: f64,
    /// Worker threads for the parallel strategy.
    pub workers: usize,
    /// Remembered-set entry limit; overflow degrades the next cycle to a
    /// full-heap rescan.
    pub remembered_set_limit: usize,
    /// Free-list fragmentation ratio above which concurrent mark-sweep
    /// escalates to a compacting pass.
    pub fragmentation_threshold: f64,
    /// Regions the incremental strategy evacuates per cycle.
    pub regions_per_cycle: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: Strategy::Serial,
            young_capacity: 4 * 1024 * 1024,
            old_capacity: 32 * 1024 * 1024,
            region_size: 32 * 1024,
            promotion_threshold: 15,
            pause_deadline: Duration::from_millis(10),
            occupancy_trigger: 0.85,
            workers: 4,
            remembered_set_limit: 16 * 1024,
            fragmentation_threshold: 0.35,
            regions_per_cycle: 4,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.region_size < 2 * space::MIN_ALLOCATION {
            return Err(GcError::InvalidConfig("region_size too small"));
        }
        if self.young_capacity + self.old_capacity < self.region_size {
            return Err(GcError::InvalidConfig("heap smaller than one region"));
        }
        if self.occupancy_trigger <= 0.0 {
            return Err(GcError::InvalidConfig(
                "occupancy_trigger must be positive",
            ));
        }
        if self.workers == 0 {
            return Err(GcError::InvalidConfig("workers must be at least 1"));
        }
        if self.regions_per_cycle == 0 {
            return Err(GcError::InvalidConfig(
                "regions_per_cycle must be at least 1",
            ));
        }
        if self.promotion_threshold == 0 {
            return Err(GcError::InvalidConfig(
                "promotion_threshold must be at least 1",
            ));
        }
        Ok(())
    }
}
