//! Strategy dispatch.
//!
//! The four collection strategies share one phase state machine
//! (`Idle → Marking → Reclaiming → (Compacting|Promoting)? → Idle`) and are
//! selected through a tagged variant rather than inheritance: each variant
//! orchestrates the shared phase functions in `marking`, `sweep` and
//! `compact` under its own concurrency mode.

use crate::cms::CmsCollector;
use crate::compact::ForwardingTable;
use crate::error::Result;
use crate::global::GlobalState;
use crate::object::{ObjectId, ObjectTable};
use crate::parallel::ParallelCollector;
use crate::regional::RegionalCollector;
use crate::safepoint::PauseScope;
use crate::serial::SerialCollector;
use crate::space::RegionSpace;
use crate::statistics::{CollectionCycle, CycleKind, GcReason};
use crate::{Config, Strategy};

/// Collector state machine phase, exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle = 0,
    Marking = 1,
    Reclaiming = 2,
    Compacting = 3,
    Promoting = 4,
}

impl Phase {
    pub(crate) fn from_u8(value: u8) -> Phase {
        match value {
            1 => Phase::Marking,
            2 => Phase::Reclaiming,
            3 => Phase::Compacting,
            4 => Phase::Promoting,
            _ => Phase::Idle,
        }
    }
}

/// Everything a stop-the-world phase may touch, borrowed for the duration of
/// the pause.
pub(crate) struct StwContext<'a> {
    pub state: &'a GlobalState,
    pub table: &'a mut ObjectTable,
    pub space: &'a mut RegionSpace,
    pub forwarding: &'a mut ForwardingTable,
    pub roots: &'a [ObjectId],
}

impl StwContext<'_> {
    /// The cycle's root snapshot, re-resolved through the forwarding table.
    /// A phase that runs after a relocation (major after minor) must not use
    /// the identities captured at cycle start.
    pub(crate) fn current_roots(&self) -> Result<Vec<ObjectId>> {
        self.roots
            .iter()
            .map(|&root| self.forwarding.resolve(root))
            .collect()
    }
}

pub(crate) enum Collector {
    Serial(SerialCollector),
    Parallel(ParallelCollector),
    ConcurrentMarkSweep(CmsCollector),
    RegionIncremental(RegionalCollector),
}

impl Collector {
    pub(crate) fn new(config: &Config) -> Self {
        match config.strategy {
            Strategy::Serial => Collector::Serial(SerialCollector::new(config)),
            Strategy::Parallel => Collector::Parallel(ParallelCollector::new(config)),
            Strategy::ConcurrentMarkSweep => Collector::ConcurrentMarkSweep(CmsCollector::new()),
            Strategy::RegionIncremental => Collector::RegionIncremental(RegionalCollector::new()),
        }
    }

    /// Runs one cycle with the mutator fully suspended. The Serial and
    /// Parallel strategies always collect this way; the concurrent strategies
    /// land here only when an allocation failure forces a degraded
    /// synchronous cycle.
    pub(crate) fn run_stw(
        &mut self,
        state: &GlobalState,
        kind: CycleKind,
        reason: GcReason,
    ) -> Result<CollectionCycle> {
        let pause = PauseScope::begin(&state.safepoint, state.config.pause_deadline);
        let mut table = state.objects.write();
        let mut space = state.space.lock();
        let mut forwarding = state.forwarding.lock();
        let roots = state.snapshot_roots(&table, &mut forwarding)?;
        let mut cycle =
            CollectionCycle::new(state.config.strategy, kind, reason, space.used_bytes());

        let result = {
            let mut ctx = StwContext {
                state,
                table: &mut table,
                space: &mut space,
                forwarding: &mut forwarding,
                roots: &roots,
            };
            match self {
                Collector::Serial(collector) => collector.run(&mut ctx, kind, &mut cycle),
                Collector::Parallel(collector) => collector.run(&mut ctx, kind, &mut cycle),
                Collector::ConcurrentMarkSweep(collector) => {
                    collector.run_degraded(&mut ctx, &mut cycle)
                }
                Collector::RegionIncremental(collector) => {
                    collector.run_degraded(&mut ctx, &mut cycle)
                }
            }
        };

        cycle.end_occupancy = space.used_bytes();
        drop(forwarding);
        drop(space);
        drop(table);
        pause.finish(&mut cycle);
        state.set_phase(Phase::Idle);
        result?;
        state.record_cycle(cycle.clone());
        Ok(cycle)
    }
}
