//! Parallel stop-the-world mark-sweep-compact.
//!
//! Same phases and generational structure as the serial strategy, with
//! marking and sweeping partitioned across a worker pool. Compaction
//! pre-reserves a disjoint set of destination regions per worker before any
//! relocation begins, so no two workers can ever compute overlapping
//! destination ranges; if a worker outgrows its reservation the whole pass
//! falls back to the serial evacuation path.

use parking_lot::Mutex;
use scoped_threadpool::Pool;

use crate::collector::{Phase, StwContext};
use crate::compact::{apply_placements, evacuate, Placement};
use crate::generation::{Generation, GenerationManager};
use crate::marking::parallel_mark;
use crate::object::ObjectId;
use crate::serial::{
    finish_major, finish_minor, plan_old_compaction, plan_young_evacuation,
};
use crate::error::Result;
use crate::statistics::{CollectionCycle, CycleEvent, CycleKind, GcReason};
use crate::sweep::{parallel_sweep, sweep, SweepScope};
use crate::Config;

pub(crate) struct ParallelCollector {
    gen: GenerationManager,
    pool: Pool,
}

impl ParallelCollector {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            gen: GenerationManager::new(config),
            pool: Pool::new(config.workers.max(1) as u32),
        }
    }

    pub(crate) fn run(
        &mut self,
        ctx: &mut StwContext<'_>,
        kind: CycleKind,
        cycle: &mut CollectionCycle,
    ) -> Result<()> {
        match kind {
            CycleKind::Minor => {
                self.minor(ctx, cycle)?;
                if self.gen.major_due(ctx.space.used_in(Some(Generation::Old))) {
                    cycle.kind = CycleKind::Full;
                    cycle.reason = GcReason::OldSpaceFull;
                    self.major(ctx, cycle)?;
                }
            }
            CycleKind::Major => self.major(ctx, cycle)?,
            _ => {
                self.minor(ctx, cycle)?;
                self.major(ctx, cycle)?;
            }
        }
        Ok(())
    }

    fn minor(&mut self, ctx: &mut StwContext<'_>, cycle: &mut CollectionCycle) -> Result<()> {
        ctx.state.set_phase(Phase::Marking);
        let roots = ctx.current_roots()?;
        let overflowed = ctx.state.remembered.is_overflowed();
        let stats = if overflowed {
            cycle.events.push(CycleEvent::RememberedSetOverflow);
            parallel_mark(&mut self.pool, ctx.table, &roots, &[], false)?
        } else {
            let edges = ctx.state.remembered.snapshot();
            parallel_mark(&mut self.pool, ctx.table, &roots, &edges, true)?
        };
        cycle.marked_objects += stats.visited;

        ctx.state.set_phase(Phase::Reclaiming);
        let swept = sweep(ctx.table, ctx.space, SweepScope::YoungOnly)?;
        cycle.reclaimed_bytes += swept.reclaimed_bytes;

        ctx.state.set_phase(Phase::Promoting);
        let moves = plan_young_evacuation(ctx.table, &self.gen, &swept.survivors)?;
        ctx.space.reset_generation(Some(Generation::Young));
        let relocated = evacuate(ctx.table, ctx.space, ctx.forwarding, &moves)?;
        cycle.promoted_bytes += relocated.promoted_bytes;

        finish_minor(ctx, &relocated.relocated, overflowed)
    }

    fn major(&mut self, ctx: &mut StwContext<'_>, cycle: &mut CollectionCycle) -> Result<()> {
        ctx.state.set_phase(Phase::Marking);
        let roots = ctx.current_roots()?;
        let stats = parallel_mark(&mut self.pool, ctx.table, &roots, &[], false)?;
        cycle.marked_objects += stats.visited;

        ctx.state.set_phase(Phase::Reclaiming);
        let swept = parallel_sweep(&mut self.pool, ctx.table, ctx.space, SweepScope::Full)?;
        cycle.reclaimed_bytes += swept.reclaimed_bytes;

        ctx.state.set_phase(Phase::Compacting);
        let moves = plan_old_compaction(ctx.table, &swept.survivors);
        let sized: Vec<(ObjectId, usize, u8)> = moves
            .iter()
            .filter_map(|mv| {
                ctx.table
                    .get(mv.old)
                    .map(|r| (mv.old, r.size(), mv.new_age))
            })
            .collect();
        ctx.space.reset_generation(Some(Generation::Old));

        match self.plan_placements(ctx, &sized) {
            Some(placements) => {
                apply_placements(ctx.table, ctx.space, ctx.forwarding, &placements)?;
            }
            None => {
                // a worker outgrew its reservation (or there were too few
                // regions to partition); nothing was committed, so the
                // serial path can lay the survivors out from scratch
                evacuate(ctx.table, ctx.space, ctx.forwarding, &moves)?;
            }
        }
        finish_major(ctx, &mut self.gen)
    }

    /// Splits old-generation survivors into contiguous per-worker slices and
    /// lets every worker bump-place its slice inside its own reserved
    /// regions. Returns `None` when the reservation cannot be honored.
    fn plan_placements(
        &mut self,
        ctx: &mut StwContext<'_>,
        survivors: &[(ObjectId, usize, u8)],
    ) -> Option<Vec<Placement>> {
        if survivors.is_empty() {
            return Some(Vec::new());
        }
        let workers = self.pool.thread_count() as usize;
        let region_size = ctx.space.region_size();
        let regions = ctx.space.region_ids(Some(Generation::Old));
        let capacities: Vec<(usize, usize)> = regions
            .iter()
            .map(|&id| (id, ctx.space.region(id).capacity()))
            .collect();

        let total_bytes: usize = survivors.iter().map(|&(_, size, _)| size).sum();
        let share = total_bytes / workers + 1;

        // contiguous slices of roughly equal byte volume
        let mut slices: Vec<&[(ObjectId, usize, u8)]> = Vec::new();
        let mut start = 0;
        let mut acc = 0;
        for (index, &(_, size, _)) in survivors.iter().enumerate() {
            acc += size;
            if acc >= share && slices.len() + 1 < workers {
                slices.push(&survivors[start..=index]);
                start = index + 1;
                acc = 0;
            }
        }
        if start < survivors.len() {
            slices.push(&survivors[start..]);
        }

        // pre-reserve disjoint destination regions per slice
        let mut assignments: Vec<Vec<(usize, usize)>> = Vec::with_capacity(slices.len());
        let mut next_region = 0;
        for slice in &slices {
            let bytes: usize = slice.iter().map(|&(_, size, _)| size).sum();
            let need = bytes / region_size + 2;
            if next_region + need > capacities.len() {
                return None;
            }
            assignments.push(capacities[next_region..next_region + need].to_vec());
            next_region += need;
        }

        let placements = Mutex::new(Vec::with_capacity(survivors.len()));
        let overflow = Mutex::new(false);
        self.pool.scoped(|scoped| {
            for (slice, regions) in slices.iter().zip(assignments.iter()) {
                let placements = &placements;
                let overflow = &overflow;
                scoped.execute(move || {
                    let mut cursors: Vec<(usize, usize, usize)> = regions
                        .iter()
                        .map(|&(id, capacity)| (id, 0usize, capacity))
                        .collect();
                    let mut local = Vec::with_capacity(slice.len());
                    for &(id, size, age) in slice.iter() {
                        let slot = cursors
                            .iter_mut()
                            .find(|(_, cursor, capacity)| *cursor + size <= *capacity);
                        match slot {
                            Some((region, cursor, _)) => {
                                local.push(Placement {
                                    old: id,
                                    region: *region,
                                    offset: *cursor,
                                    dest: Some(Generation::Old),
                                    new_age: age,
                                });
                                *cursor += size;
                            }
                            None => {
                                *overflow.lock() = true;
                                return;
                            }
                        }
                    }
                    placements.lock().extend(local);
                });
            }
        });

        if overflow.into_inner() {
            return None;
        }
        Some(placements.into_inner())
    }
}
