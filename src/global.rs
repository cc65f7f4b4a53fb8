//! Process-scoped collector state shared between the mutator-facing heap
//! handle and the background collector thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize};

use atomic::Ordering;
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use crate::api::{CycleSink, RootProvider};
use crate::barrier::RememberedSet;
use crate::collector::Phase;
use crate::compact::ForwardingTable;
use crate::error::{GcError, Result};
use crate::generation::Generation;
use crate::object::{ObjectId, ObjectTable};
use crate::safepoint::Safepoint;
use crate::scheduler::Scheduler;
use crate::space::RegionSpace;
use crate::statistics::{formatted_size, CollectionCycle};
use crate::{Config, Strategy};

const HISTORY_LIMIT: usize = 64;

pub(crate) struct Totals {
    pub gc_cycles: AtomicUsize,
    pub reclaimed_bytes: AtomicUsize,
    pub allocated_bytes: AtomicUsize,
    pub objects_allocated: AtomicUsize,
}

pub(crate) struct GlobalState {
    pub config: Config,
    pub objects: RwLock<ObjectTable>,
    pub space: Mutex<RegionSpace>,
    pub remembered: RememberedSet,
    pub forwarding: Mutex<ForwardingTable>,
    /// Owners re-greyed by the write barrier while marking runs
    /// concurrently; drained by the marker and the final pause.
    pub barrier_worklist: SegQueue<ObjectId>,
    pub marking_active: AtomicBool,
    /// While a concurrent cycle is in flight new allocations are born black
    /// so the sweep that follows cannot reclaim them.
    pub alloc_black: AtomicBool,
    pub abort_requested: AtomicBool,
    pub phase: AtomicU8,
    pub safepoint: Safepoint,
    pub scheduler: Scheduler,
    pub roots: Mutex<Vec<Box<dyn RootProvider>>>,
    pub sinks: Mutex<Vec<Box<dyn CycleSink>>>,
    pub history: Mutex<VecDeque<CollectionCycle>>,
    pub totals: Totals,
}

impl GlobalState {
    pub(crate) fn new(config: Config) -> Self {
        let space = match config.strategy {
            Strategy::Serial | Strategy::Parallel => RegionSpace::generational(
                config.young_capacity,
                config.old_capacity,
                config.region_size,
            ),
            Strategy::ConcurrentMarkSweep | Strategy::RegionIncremental => RegionSpace::uniform(
                config.young_capacity + config.old_capacity,
                config.region_size,
            ),
        };
        Self {
            remembered: RememberedSet::new(config.remembered_set_limit),
            config,
            objects: RwLock::new(ObjectTable::new()),
            space: Mutex::new(space),
            forwarding: Mutex::new(ForwardingTable::new()),
            barrier_worklist: SegQueue::new(),
            marking_active: AtomicBool::new(false),
            alloc_black: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            phase: AtomicU8::new(Phase::Idle as u8),
            safepoint: Safepoint::new(),
            scheduler: Scheduler::new(),
            roots: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            totals: Totals {
                gc_cycles: AtomicUsize::new(0),
                reclaimed_bytes: AtomicUsize::new(0),
                allocated_bytes: AtomicUsize::new(0),
                objects_allocated: AtomicUsize::new(0),
            },
        }
    }

    /// Where mutator allocations land: the young generation for generational
    /// strategies, the untagged region set otherwise.
    pub(crate) fn allocation_tag(&self) -> Option<Generation> {
        match self.config.strategy {
            Strategy::Serial | Strategy::Parallel => Some(Generation::Young),
            _ => None,
        }
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Resolves every provider root through the forwarding table into a
    /// per-cycle snapshot, compressing the table on the way so later lookups
    /// are one hop.
    pub(crate) fn snapshot_roots(
        &self,
        table: &ObjectTable,
        forwarding: &mut ForwardingTable,
    ) -> Result<Vec<ObjectId>> {
        forwarding.compress()?;
        let mut roots = Vec::new();
        for provider in self.roots.lock().iter() {
            for id in provider.current_roots() {
                let resolved = forwarding.resolve(id)?;
                if !table.contains(resolved) {
                    return Err(GcError::UnknownObject(id));
                }
                roots.push(resolved);
            }
        }
        Ok(roots)
    }

    pub(crate) fn record_cycle(&self, cycle: CollectionCycle) {
        self.totals.gc_cycles.fetch_add(1, Ordering::Relaxed);
        self.totals
            .reclaimed_bytes
            .fetch_add(cycle.reclaimed_bytes, Ordering::Relaxed);
        tracing::info!(
            strategy = ?cycle.strategy,
            kind = ?cycle.kind,
            reason = ?cycle.reason,
            reclaimed = %formatted_size(cycle.reclaimed_bytes),
            promoted = %formatted_size(cycle.promoted_bytes),
            marked = cycle.marked_objects,
            pause_ms = cycle.total_pause().as_secs_f64() * 1000.0,
            "collection cycle"
        );
        for sink in self.sinks.lock().iter() {
            sink.on_cycle(&cycle);
        }
        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(cycle);
    }

    pub(crate) fn last_cycle(&self) -> Option<CollectionCycle> {
        self.history.lock().back().cloned()
    }
}
