//! Mutator-facing heap handle.
//!
//! Every entry point pledges at the safepoint first, so stop-the-world
//! phases see a quiescent mutator, then takes the heap locks in a fixed
//! order (object table, region space, forwarding table). Reference mutations
//! run their write barriers synchronously with the edge update.

use std::sync::Arc;

use atomic::Ordering;
use parking_lot::Mutex;

use crate::api::{CycleSink, RootProvider};
use crate::barrier::marking_barrier;
use crate::cms::CollectorThread;
use crate::collector::{Collector, Phase};
use crate::error::{GcError, Result};
use crate::generation::Generation;
use crate::object::{ObjectId, ObjectRecord, GC_BLACK, GC_WHITE};
use crate::space::{align_usize, MIN_ALLOCATION};
use crate::statistics::{CollectionCycle, CycleKind, GcReason, HeapStatistics};
use crate::global::GlobalState;
use crate::{Config, Strategy};

/// A garbage-collected heap over an abstract object graph.
///
/// The mutator allocates records, wires references between them through
/// [`write_reference`](Heap::write_reference) (which runs the write barrier),
/// and registers [`RootProvider`]s that the collector consults at the start
/// of every cycle. Collection runs on allocation pressure, on crossing the
/// occupancy high-water mark, or on explicit request.
pub struct Heap {
    state: Arc<GlobalState>,
    collector: Mutex<Collector>,
    thread: Option<CollectorThread>,
}

impl Heap {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(GlobalState::new(config));
        let collector = Mutex::new(Collector::new(&state.config));
        let thread = match state.config.strategy {
            Strategy::ConcurrentMarkSweep | Strategy::RegionIncremental => {
                Some(CollectorThread::spawn(state.clone()))
            }
            Strategy::Serial | Strategy::Parallel => None,
        };
        Ok(Self {
            state,
            collector,
            thread,
        })
    }

    pub fn with_strategy(strategy: Strategy) -> Result<Self> {
        Self::new(Config {
            strategy,
            ..Config::default()
        })
    }

    pub fn add_root_provider(&self, provider: impl RootProvider + 'static) {
        self.state.roots.lock().push(Box::new(provider));
    }

    pub fn add_cycle_sink(&self, sink: impl CycleSink + 'static) {
        self.state.sinks.lock().push(Box::new(sink));
    }

    /// Allocates `size` units. On allocation failure a collection cycle is
    /// triggered synchronously; `AllocationFailure` is surfaced only if the
    /// request still cannot be satisfied afterwards.
    pub fn allocate(&self, size: usize) -> Result<ObjectId> {
        let size = align_usize(size.max(1), MIN_ALLOCATION);
        self.state.safepoint.pledge();
        if let Some(id) = self.try_allocate(size) {
            self.check_occupancy();
            return Ok(id);
        }
        self.allocate_slow(size)
    }

    fn try_allocate(&self, size: usize) -> Option<ObjectId> {
        let mut table = self.state.objects.write();
        let mut space = self.state.space.lock();
        let tag = self.state.allocation_tag();
        let (region, offset) = space.allocate(tag, size)?;
        let color = if self.state.alloc_black.load(Ordering::Acquire) {
            GC_BLACK
        } else {
            GC_WHITE
        };
        let id = table.insert(ObjectRecord::new(size, tag, region, offset, color));
        space.note_member(region, id);
        self.state
            .totals
            .allocated_bytes
            .fetch_add(size, Ordering::Relaxed);
        self.state
            .totals
            .objects_allocated
            .fetch_add(1, Ordering::Relaxed);
        Some(id)
    }

    #[cold]
    fn allocate_slow(&self, size: usize) -> Result<ObjectId> {
        match self.state.config.strategy {
            Strategy::Serial | Strategy::Parallel => {
                if self.state.scheduler.try_begin() {
                    let minor = self.run_stw_cycle(CycleKind::Minor, GcReason::AllocationFailure);
                    self.state.scheduler.end();
                    minor?;
                    if let Some(id) = self.try_allocate(size) {
                        return Ok(id);
                    }
                    if self.state.scheduler.try_begin() {
                        let full = self.run_stw_cycle(CycleKind::Full, GcReason::AllocationFailure);
                        self.state.scheduler.end();
                        full?;
                    }
                } else {
                    // a cycle is already in flight; it satisfies this trigger
                    self.state.scheduler.wait_idle();
                    self.state.safepoint.pledge();
                }
                if let Some(id) = self.try_allocate(size) {
                    return Ok(id);
                }
            }
            Strategy::ConcurrentMarkSweep | Strategy::RegionIncremental => {
                if !self.state.scheduler.try_begin() {
                    // let the in-flight concurrent cycle finish first
                    self.state.scheduler.wait_idle();
                    self.state.safepoint.pledge();
                    if let Some(id) = self.try_allocate(size) {
                        return Ok(id);
                    }
                    if !self.state.scheduler.try_begin() {
                        return Err(self.out_of_memory(size));
                    }
                }
                let degraded =
                    self.run_stw_cycle(CycleKind::Degraded, GcReason::AllocationFailure);
                self.state.scheduler.end();
                degraded?;
                if let Some(id) = self.try_allocate(size) {
                    return Ok(id);
                }
            }
        }
        Err(self.out_of_memory(size))
    }

    fn out_of_memory(&self, requested: usize) -> GcError {
        GcError::AllocationFailure {
            requested,
            available: self.state.space.lock().free_bytes(),
        }
    }

    fn check_occupancy(&self) {
        let occupancy = self.state.space.lock().occupancy();
        if occupancy < self.state.config.occupancy_trigger {
            return;
        }
        match self.state.config.strategy {
            Strategy::Serial | Strategy::Parallel => {
                if self.state.scheduler.try_begin() {
                    let result =
                        self.run_stw_cycle(CycleKind::Minor, GcReason::OccupancyThreshold);
                    self.state.scheduler.end();
                    if let Err(err) = result {
                        tracing::error!(%err, "occupancy-triggered cycle failed");
                    }
                }
            }
            Strategy::ConcurrentMarkSweep | Strategy::RegionIncremental => {
                // asynchronous: hand the trigger to the collector thread
                if self.state.scheduler.try_begin() {
                    if let Some(thread) = &self.thread {
                        thread.request(GcReason::OccupancyThreshold);
                    } else {
                        self.state.scheduler.end();
                    }
                }
            }
        }
    }

    fn run_stw_cycle(&self, kind: CycleKind, reason: GcReason) -> Result<CollectionCycle> {
        self.collector.lock().run_stw(&self.state, kind, reason)
    }

    /// Explicitly requests a full collection cycle and waits for it to
    /// complete. Returns `None` when the request coalesced into a cycle that
    /// was already in flight.
    pub fn collect(&self) -> Result<Option<CollectionCycle>> {
        self.state.safepoint.pledge();
        match self.state.config.strategy {
            Strategy::Serial | Strategy::Parallel => {
                if !self.state.scheduler.try_begin() {
                    self.state.scheduler.wait_idle();
                    return Ok(None);
                }
                let result = self.run_stw_cycle(CycleKind::Full, GcReason::RequestedByUser);
                self.state.scheduler.end();
                result.map(Some)
            }
            Strategy::ConcurrentMarkSweep | Strategy::RegionIncremental => {
                if !self.state.scheduler.try_begin() {
                    self.state.scheduler.wait_idle();
                    return Ok(None);
                }
                if let Some(thread) = &self.thread {
                    thread.request(GcReason::RequestedByUser);
                    self.state.scheduler.wait_idle();
                    Ok(self.state.last_cycle())
                } else {
                    self.state.scheduler.end();
                    Err(GcError::CorruptGraph("collector thread missing"))
                }
            }
        }
    }

    /// Young-generation-only cycle for the generational strategies; falls
    /// back to a full cycle otherwise.
    pub fn minor_collection(&self) -> Result<Option<CollectionCycle>> {
        match self.state.config.strategy {
            Strategy::Serial | Strategy::Parallel => {
                self.state.safepoint.pledge();
                if !self.state.scheduler.try_begin() {
                    self.state.scheduler.wait_idle();
                    return Ok(None);
                }
                let result = self.run_stw_cycle(CycleKind::Minor, GcReason::RequestedByUser);
                self.state.scheduler.end();
                result.map(Some)
            }
            _ => self.collect(),
        }
    }

    /// Asks a concurrent cycle to abandon marking. Honored only while the
    /// Marking phase is running; once Reclaiming begins the cycle always
    /// completes.
    pub fn request_abort(&self) {
        if self.state.marking_active.load(Ordering::Acquire) {
            self.state.abort_requested.store(true, Ordering::Release);
        }
    }

    /// Follows forwarding entries left by relocation to the current identity.
    pub fn resolve(&self, id: ObjectId) -> Result<ObjectId> {
        self.state.safepoint.pledge();
        let table = self.state.objects.read();
        let forwarding = self.state.forwarding.lock();
        let resolved = forwarding.resolve(id)?;
        if table.contains(resolved) {
            Ok(resolved)
        } else {
            Err(GcError::UnknownObject(id))
        }
    }

    /// Adds a reference edge `owner → target`, running the write barrier
    /// synchronously with the update.
    pub fn write_reference(&self, owner: ObjectId, target: ObjectId) -> Result<()> {
        self.state.safepoint.pledge();
        let mut table = self.state.objects.write();
        let forwarding = self.state.forwarding.lock();
        let owner = forwarding.resolve(owner)?;
        let target = forwarding.resolve(target)?;
        drop(forwarding);

        let (target_generation, target_region) = match table.get(target) {
            Some(record) => (record.generation(), record.region),
            None => return Err(GcError::UnknownObject(target)),
        };
        let Some(owner_record) = table.get(owner) else {
            return Err(GcError::UnknownObject(owner));
        };

        if self.state.marking_active.load(Ordering::Acquire) {
            marking_barrier(&self.state.barrier_worklist, owner, owner_record);
        }
        match self.state.config.strategy {
            Strategy::Serial | Strategy::Parallel => {
                if owner_record.generation() == Some(Generation::Old)
                    && target_generation == Some(Generation::Young)
                {
                    self.state.remembered.insert(owner, target);
                }
            }
            Strategy::RegionIncremental => {
                if owner_record.region != target_region {
                    self.state.remembered.insert(owner, target);
                }
            }
            Strategy::ConcurrentMarkSweep => {}
        }

        if let Some(record) = table.get_mut(owner) {
            record.references.push(target);
        }
        Ok(())
    }

    /// Removes one occurrence of the edge `owner → target`.
    pub fn remove_reference(&self, owner: ObjectId, target: ObjectId) -> Result<()> {
        self.state.safepoint.pledge();
        let mut table = self.state.objects.write();
        let forwarding = self.state.forwarding.lock();
        let owner = forwarding.resolve(owner)?;
        let target = forwarding.resolve(target)?;
        drop(forwarding);
        let Some(record) = table.get_mut(owner) else {
            return Err(GcError::UnknownObject(owner));
        };
        if let Some(position) = record.references.iter().position(|&t| t == target) {
            record.references.remove(position);
        }
        Ok(())
    }

    pub fn clear_references(&self, owner: ObjectId) -> Result<()> {
        self.state.safepoint.pledge();
        let mut table = self.state.objects.write();
        let forwarding = self.state.forwarding.lock();
        let owner = forwarding.resolve(owner)?;
        drop(forwarding);
        let Some(record) = table.get_mut(owner) else {
            return Err(GcError::UnknownObject(owner));
        };
        record.references.clear();
        Ok(())
    }

    pub fn references(&self, id: ObjectId) -> Result<Vec<ObjectId>> {
        let id = self.resolve(id)?;
        let table = self.state.objects.read();
        table
            .get(id)
            .map(|record| record.references().to_vec())
            .ok_or(GcError::UnknownObject(id))
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.resolve(id).is_ok()
    }

    pub fn generation_of(&self, id: ObjectId) -> Result<Option<Generation>> {
        let id = self.resolve(id)?;
        let table = self.state.objects.read();
        table
            .get(id)
            .map(|record| record.generation())
            .ok_or(GcError::UnknownObject(id))
    }

    pub fn region_of(&self, id: ObjectId) -> Result<usize> {
        let id = self.resolve(id)?;
        let table = self.state.objects.read();
        table
            .get(id)
            .map(|record| record.region)
            .ok_or(GcError::UnknownObject(id))
    }

    pub fn age_of(&self, id: ObjectId) -> Result<u8> {
        let id = self.resolve(id)?;
        let table = self.state.objects.read();
        table
            .get(id)
            .map(|record| record.age())
            .ok_or(GcError::UnknownObject(id))
    }

    pub fn occupancy(&self) -> f64 {
        self.state.space.lock().occupancy()
    }

    pub fn used_bytes(&self) -> usize {
        self.state.space.lock().used_bytes()
    }

    pub fn capacity(&self) -> usize {
        self.state.space.lock().capacity()
    }

    pub fn live_objects(&self) -> usize {
        self.state.objects.read().live_objects()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn statistics(&self) -> HeapStatistics {
        // lock order: object table strictly before region space
        let live_objects = self.state.objects.read().live_objects();
        let space = self.state.space.lock();
        HeapStatistics {
            used_bytes: space.used_bytes(),
            capacity: space.capacity(),
            fragmentation: space.fragmentation(),
            live_objects,
            total_gc_cycles: self.state.totals.gc_cycles.load(Ordering::Relaxed),
            total_reclaimed_bytes: self.state.totals.reclaimed_bytes.load(Ordering::Relaxed),
            total_allocated_bytes: self.state.totals.allocated_bytes.load(Ordering::Relaxed),
            total_objects_allocated: self
                .state
                .totals
                .objects_allocated
                .load(Ordering::Relaxed),
            remembered_set_entries: self.state.remembered.len(),
        }
    }

    pub fn cycle_history(&self) -> Vec<CollectionCycle> {
        self.state.history.lock().iter().cloned().collect()
    }

    pub fn last_cycle(&self) -> Option<CollectionCycle> {
        self.state.last_cycle()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.as_mut() {
            thread.shutdown();
        }
    }
}
