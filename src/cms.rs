//! Concurrent mark-sweep.
//!
//! The cycle starts with a brief initial pause that snapshots the roots and
//! seeds the grey set, marks concurrently with the mutator under the
//! incremental-update write barrier, then takes one short final pause that
//! re-scans only the barrier deltas and the root set. Reclaiming sweeps in
//! place without relocation; fragmentation is the accepted tradeoff, and
//! once it crosses the configured threshold the cycle escalates to a full
//! compacting pass.
//!
//! When an allocation failure strikes while no concurrent cycle can help,
//! the strategy degrades to running every stage inside a single
//! stop-the-world pause.

use std::sync::Arc;
use std::thread::JoinHandle;

use atomic::Ordering;

use crate::collector::{Phase, StwContext};
use crate::compact::{evacuate, fixup_references, ForwardingTable, Move};
use crate::error::{GcError, Result};
use crate::global::GlobalState;
use crate::marking::{concurrent_mark, reset_colors, scan_object, SynchronousMarking};
use crate::object::{ObjectId, ObjectTable, GC_BLACK, GC_WHITE};
use crate::safepoint::PauseScope;
use crate::space::RegionSpace;
use crate::statistics::{CollectionCycle, CycleEvent, CycleKind, GcReason};
use crate::sweep::{sweep, SweepScope};

/// Objects processed per table write lock while sweeping concurrently.
const SWEEP_SLICE: usize = 128;

pub(crate) struct CmsCollector;

impl CmsCollector {
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) fn run_degraded(
        &mut self,
        ctx: &mut StwContext<'_>,
        cycle: &mut CollectionCycle,
    ) -> Result<()> {
        degraded_stw(ctx, cycle)
    }
}

/// All stages of a uniform-heap cycle inside one pause: synchronous mark,
/// sweep, and a compacting pass if fragmentation crossed the threshold.
/// Shared by the CMS and region-incremental degraded paths.
pub(crate) fn degraded_stw(
    ctx: &mut StwContext<'_>,
    cycle: &mut CollectionCycle,
) -> Result<()> {
    ctx.state.set_phase(Phase::Marking);
    let roots = ctx.current_roots()?;
    let mut marking = SynchronousMarking::new(ctx.table, false);
    for &root in &roots {
        marking.mark_root(root);
    }
    let stats = marking.run()?;
    cycle.marked_objects += stats.visited;

    ctx.state.set_phase(Phase::Reclaiming);
    let swept = sweep(ctx.table, ctx.space, SweepScope::Full)?;
    cycle.reclaimed_bytes += swept.reclaimed_bytes;

    if ctx.space.fragmentation() > ctx.state.config.fragmentation_threshold {
        ctx.state.set_phase(Phase::Compacting);
        cycle.events.push(CycleEvent::FragmentationEscalation);
        compact_uniform(ctx.table, ctx.space, ctx.forwarding)?;
    }
    Ok(())
}

/// Evacuates every live record onto a fresh bump across the untagged region
/// set and rewrites the graph's edges.
pub(crate) fn compact_uniform(
    table: &mut ObjectTable,
    space: &mut RegionSpace,
    forwarding: &mut ForwardingTable,
) -> Result<()> {
    let mut moves: Vec<Move> = table
        .iter()
        .map(|(id, record)| Move {
            old: id,
            dest: None,
            new_age: record.age(),
        })
        .collect();
    moves.sort_by_key(|mv| mv.old);
    space.reset_generation(None);
    evacuate(table, space, forwarding, &moves)?;
    fixup_references(table, forwarding)?;
    Ok(())
}

/// One full concurrent cycle, driven from the collector thread.
pub(crate) fn concurrent_cycle(state: &GlobalState, reason: GcReason) -> Result<()> {
    let mut cycle = CollectionCycle::new(
        state.config.strategy,
        CycleKind::Concurrent,
        reason,
        state.space.lock().used_bytes(),
    );

    // initial pause: snapshot roots, seed the grey set, start the barrier
    let seeds = {
        let pause = PauseScope::begin(&state.safepoint, state.config.pause_deadline);
        let table = state.objects.write();
        let mut forwarding = state.forwarding.lock();
        let roots = state.snapshot_roots(&table, &mut forwarding)?;
        drop(forwarding);
        // abort requests only count while Marking is actually running
        state.abort_requested.store(false, Ordering::Release);
        state.alloc_black.store(true, Ordering::Release);
        state.marking_active.store(true, Ordering::Release);
        let mut seeds = Vec::new();
        for root in roots {
            if let Some(record) = table.get(root) {
                if record.try_mark() {
                    seeds.push(root);
                }
            }
        }
        drop(table);
        pause.finish(&mut cycle);
        seeds
    };

    state.set_phase(Phase::Marking);
    let marked = concurrent_mark(
        &state.objects,
        &state.barrier_worklist,
        &state.abort_requested,
        seeds,
    )?;
    let Some(stats) = marked else {
        // abort requested mid-marking: discard the marks, reclaim nothing.
        // births go back to white before the reset walk snapshots the table,
        // so no black straggler survives into the next cycle
        state.marking_active.store(false, Ordering::Release);
        state.alloc_black.store(false, Ordering::Release);
        reset_colors(&state.objects);
        cycle.events.push(CycleEvent::Aborted);
        state.set_phase(Phase::Idle);
        state.record_cycle(cycle);
        return Ok(());
    };
    cycle.marked_objects += stats.visited;
    tracing::debug!(
        visited = stats.visited,
        bytes = stats.bytes,
        "concurrent marking finished"
    );

    // final pause: re-scan only the barrier deltas and the current roots
    {
        let pause = PauseScope::begin(&state.safepoint, state.config.pause_deadline);
        let table = state.objects.write();
        let mut forwarding = state.forwarding.lock();
        let roots = state.snapshot_roots(&table, &mut forwarding)?;
        drop(forwarding);
        let mut worklist: Vec<ObjectId> = Vec::new();
        while let Some(id) = state.barrier_worklist.pop() {
            worklist.push(id);
        }
        for root in roots {
            if let Some(record) = table.get(root) {
                if record.try_mark() {
                    worklist.push(root);
                }
            }
        }
        while let Some(id) = worklist.pop() {
            let mut pushed = std::mem::take(&mut worklist);
            scan_object(&table, id, false, &mut |t| pushed.push(t))?;
            worklist = pushed;
            cycle.marked_objects += 1;
        }
        state.marking_active.store(false, Ordering::Release);
        drop(table);
        pause.finish(&mut cycle);
    }

    // reclaiming proceeds without relocation, concurrently with the mutator
    state.set_phase(Phase::Reclaiming);
    let ids = {
        let table = state.objects.write();
        let ids = table.ids();
        // births after this snapshot are invisible to the sweep, so they can
        // go back to being born white; births before it are in `ids` and get
        // whitened by the sweep itself
        state.alloc_black.store(false, Ordering::Release);
        drop(table);
        ids
    };
    for chunk in ids.chunks(SWEEP_SLICE) {
        let mut table = state.objects.write();
        let mut space = state.space.lock();
        for &id in chunk {
            let Some(record) = table.get(id) else { continue };
            match record.color() {
                GC_WHITE => {
                    let record = table
                        .remove(id)
                        .ok_or(GcError::CorruptGraph("swept slot vanished mid-walk"))?;
                    if !space.free(record.region, record.offset, record.size) {
                        return Err(GcError::CorruptGraph(
                            "sweep freed an unallocated placement",
                        ));
                    }
                    cycle.reclaimed_bytes += record.size;
                }
                GC_BLACK => record.force_color(GC_WHITE),
                _ => return Err(GcError::CorruptGraph("grey record reached the sweep phase")),
            }
        }
    }
    state.space.lock().coalesce();

    let fragmentation = state.space.lock().fragmentation();
    if fragmentation > state.config.fragmentation_threshold {
        let pause = PauseScope::begin(&state.safepoint, state.config.pause_deadline);
        state.set_phase(Phase::Compacting);
        let mut table = state.objects.write();
        let mut space = state.space.lock();
        let mut forwarding = state.forwarding.lock();
        compact_uniform(&mut table, &mut space, &mut forwarding)?;
        cycle.events.push(CycleEvent::FragmentationEscalation);
        drop(forwarding);
        drop(space);
        drop(table);
        pause.finish(&mut cycle);
    }

    state.set_phase(Phase::Idle);
    cycle.end_occupancy = state.space.lock().used_bytes();
    state.record_cycle(cycle);
    Ok(())
}

pub(crate) enum CollectorRequest {
    Cycle(GcReason),
    Shutdown,
}

/// Handle to the background collector thread used by the concurrent
/// strategies. Requests are only sent after the scheduler granted the
/// active-cycle slot; the thread releases it when the cycle ends.
pub(crate) struct CollectorThread {
    tx: flume::Sender<CollectorRequest>,
    join: Option<JoinHandle<()>>,
}

impl CollectorThread {
    pub(crate) fn spawn(state: Arc<GlobalState>) -> Self {
        let (tx, rx) = flume::unbounded();
        let join = std::thread::Builder::new()
            .name("pulsar-gc".into())
            .spawn(move || collector_routine(state, rx))
            .expect("failed to spawn collector thread");
        Self {
            tx,
            join: Some(join),
        }
    }

    pub(crate) fn request(&self, reason: GcReason) {
        let _ = self.tx.send(CollectorRequest::Cycle(reason));
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.tx.send(CollectorRequest::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for CollectorThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn collector_routine(state: Arc<GlobalState>, rx: flume::Receiver<CollectorRequest>) {
    while let Ok(request) = rx.recv() {
        match request {
            CollectorRequest::Shutdown => break,
            CollectorRequest::Cycle(reason) => {
                let result = match state.config.strategy {
                    crate::Strategy::RegionIncremental => {
                        crate::regional::incremental_cycle(&state, reason)
                    }
                    _ => concurrent_cycle(&state, reason),
                };
                if let Err(err) = result {
                    tracing::error!(%err, "collection cycle failed");
                    state.marking_active.store(false, Ordering::Release);
                    state.alloc_black.store(false, Ordering::Release);
                    state.set_phase(Phase::Idle);
                }
                state.scheduler.end();
            }
        }
    }
}
