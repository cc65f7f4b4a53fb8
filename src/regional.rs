//! Incremental region-based collection with partial compaction.
//!
//! Marking runs concurrently (same driver and write barrier as the
//! concurrent mark-sweep strategy). Reclaiming then evacuates only a bounded,
//! priority-ordered subset of regions per cycle: highest garbage-to-capacity
//! ratio first, ties broken by lowest region id, so the pause is bounded by
//! the regions processed rather than heap size. Cross-region references are
//! resolved through the remembered set, never a full-heap scan.

use ahash::AHashSet;
use atomic::Ordering;

use crate::collector::{Phase, StwContext};
use crate::compact::{evacuate, fixup_owners, fixup_references, Move};
use crate::error::{GcError, Result};
use crate::global::GlobalState;
use crate::marking::{concurrent_mark, reset_colors, scan_object};
use crate::object::{ObjectId, ObjectTable, GC_BLACK, GC_WHITE};
use crate::safepoint::PauseScope;
use crate::statistics::{CollectionCycle, CycleEvent, CycleKind, GcReason};

pub(crate) struct RegionalCollector;

impl RegionalCollector {
    pub(crate) fn new() -> Self {
        Self
    }

    /// Allocation-failure fallback: everything in one pause, reclaiming by
    /// sweep instead of evacuation so every region's garbage is recovered at
    /// once.
    pub(crate) fn run_degraded(
        &mut self,
        ctx: &mut StwContext<'_>,
        cycle: &mut CollectionCycle,
    ) -> Result<()> {
        crate::cms::degraded_stw(ctx, cycle)
    }
}

/// Picks the regions to evacuate this cycle: non-empty garbage, highest
/// garbage/capacity ratio first, lowest id on ties, at most
/// `regions_per_cycle`.
fn select_regions(
    garbage_by_region: &[(usize, usize, usize)],
    regions_per_cycle: usize,
) -> Vec<usize> {
    let mut candidates: Vec<&(usize, usize, usize)> = garbage_by_region
        .iter()
        .filter(|&&(_, garbage, _)| garbage > 0)
        .collect();
    candidates.sort_by(|&&(a_id, a_garbage, a_cap), &&(b_id, b_garbage, b_cap)| {
        let a_ratio = a_garbage as f64 / a_cap as f64;
        let b_ratio = b_garbage as f64 / b_cap as f64;
        b_ratio
            .partial_cmp(&a_ratio)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a_id.cmp(&b_id))
    });
    candidates
        .into_iter()
        .take(regions_per_cycle)
        .map(|&(id, _, _)| id)
        .collect()
}

pub(crate) fn incremental_cycle(state: &GlobalState, reason: GcReason) -> Result<()> {
    let mut cycle = CollectionCycle::new(
        state.config.strategy,
        CycleKind::Incremental,
        reason,
        state.space.lock().used_bytes(),
    );

    // initial pause, same shape as the concurrent mark-sweep cycle
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

    // still concurrent: estimate per-region live bytes from the fresh marks.
    // only used to rank regions; the evacuation pause re-reads the selected
    // regions' members authoritatively.
    let live_by_region: Vec<usize> = {
        let table = state.objects.read();
        let space = state.space.lock();
        let mut live = vec![0usize; space.region_count()];
        for (_, record) in table.iter() {
            if record.color() == GC_BLACK {
                live[record.region] += record.size();
            }
        }
        live
    };

    // evacuation pause
    {
        let pause = PauseScope::begin(&state.safepoint, state.config.pause_deadline);
        let mut table = state.objects.write();
        let mut space = state.space.lock();
        let mut forwarding = state.forwarding.lock();

        // re-scan barrier deltas and roots before trusting the marks
        let roots = state.snapshot_roots(&table, &mut forwarding)?;
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

        let garbage_by_region: Vec<(usize, usize, usize)> = space
            .regions()
            .iter()
            .map(|r| {
                (
                    r.id(),
                    r.used().saturating_sub(live_by_region[r.id()]),
                    r.capacity(),
                )
            })
            .collect();
        let selected = select_regions(&garbage_by_region, state.config.regions_per_cycle);

        evacuate_selected(state, &mut table, &mut space, &mut forwarding, &selected, &mut cycle)?;

        cycle.end_occupancy = space.used_bytes();
        drop(forwarding);
        drop(space);
        drop(table);
        pause.finish(&mut cycle);
    }

    // whiten the survivors in the untouched regions without holding a pause;
    // births flip back to white first so the reset walk's snapshot covers
    // every black record there is
    state.alloc_black.store(false, Ordering::Release);
    reset_colors(&state.objects);
    state.set_phase(Phase::Idle);
    state.record_cycle(cycle);
    Ok(())
}

/// Evacuates the selected regions: live members move out, dead members are
/// dropped, the regions reset to empty, and incoming references are patched
/// through the remembered set.
fn evacuate_selected(
    state: &GlobalState,
    table: &mut ObjectTable,
    space: &mut crate::space::RegionSpace,
    forwarding: &mut crate::compact::ForwardingTable,
    selected: &[usize],
    cycle: &mut CollectionCycle,
) -> Result<()> {
    if selected.is_empty() {
        return Ok(());
    }
    state.set_phase(Phase::Reclaiming);
    for &region in selected {
        space.set_evacuating(region, true);
    }

    let member_lists: Vec<(usize, Vec<ObjectId>)> = selected
        .iter()
        .map(|&region| (region, space.region(region).members().to_vec()))
        .collect();

    let mut moves = Vec::new();
    let mut seen = AHashSet::new();
    for (region, members) in member_lists {
        for id in members {
            if !seen.insert(id) {
                continue;
            }
            let Some(record) = table.get(id) else { continue };
            if record.region != region {
                // slot id was reclaimed and reissued elsewhere; the stale
                // member entry dies with the region reset
                continue;
            }
            match record.color() {
                GC_BLACK => moves.push(Move {
                    old: id,
                    dest: None,
                    new_age: record.age(),
                }),
                GC_WHITE => {
                    let record = table
                        .remove(id)
                        .ok_or(GcError::CorruptGraph("swept slot vanished mid-walk"))?;
                    cycle.reclaimed_bytes += record.size;
                }
                _ => {
                    return Err(GcError::CorruptGraph(
                        "grey record reached the sweep phase",
                    ))
                }
            }
        }
    }
    moves.sort_by_key(|mv| mv.old);

    state.set_phase(Phase::Compacting);
    let relocated = evacuate(table, space, forwarding, &moves)?;
    for &region in selected {
        space.reset_region(region);
    }

    if state.remembered.is_overflowed() {
        // can't bound the incoming-edge scan any more: full fixup, then
        // rebuild the cross-region edge set from scratch
        cycle.events.push(CycleEvent::RememberedSetOverflow);
        fixup_references(table, forwarding)?;
        state.remembered.clear();
        state.remembered.reset_overflow();
        for (id, record) in table.iter() {
            for &target in record.references() {
                if let Some(t) = table.get(target) {
                    if t.region != record.region {
                        state.remembered.insert(id, target);
                    }
                }
            }
        }
    } else {
        let mut owners: Vec<ObjectId> = relocated.relocated.clone();
        owners.extend(state.remembered.snapshot().iter().map(|&(o, _)| o));
        fixup_owners(table, forwarding, &owners)?;
        state
            .remembered
            .rewrite(forwarding, table, |o, t| o.region != t.region)?;
        // evacuated records landed in new regions; record their fresh
        // cross-region edges
        for &id in &relocated.relocated {
            let Some(record) = table.get(id) else { continue };
            for &target in record.references() {
                if let Some(t) = table.get(target) {
                    if t.region != record.region {
                        state.remembered.insert(id, target);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_garbage_first_with_lowest_id_tie_break() {
        // region 3 at 90% garbage, everything else at 10%
        let mut regions = Vec::new();
        for id in 0..10usize {
            let garbage = if id == 3 { 90 } else { 10 };
            regions.push((id, garbage, 100));
        }
        let selected = select_regions(&regions, 2);
        assert_eq!(selected, vec![3, 0]);
    }

    #[test]
    fn empty_regions_are_never_selected() {
        let regions = vec![(0, 0, 100), (1, 40, 100)];
        assert_eq!(select_regions(&regions, 4), vec![1]);
    }
}
