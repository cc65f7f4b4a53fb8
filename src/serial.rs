//! Single-threaded stop-the-world mark-sweep-compact, generational.
//!
//! Minor cycles trace only the young generation, seeded from the roots and
//! the remembered set, then evacuate survivors onto a fresh young bump (or
//! into the old generation once they pass the tenuring threshold). Major
//! cycles mark the full heap, sweep, and compact the old generation. The
//! parallel strategy reuses the planning and fixup halves of these cycles
//! with its own marking and sweeping drivers.

use crate::collector::{Phase, StwContext};
use crate::compact::{evacuate, fixup_owners, fixup_references, Move};
use crate::error::{GcError, Result};
use crate::generation::{Generation, GenerationManager};
use crate::marking::SynchronousMarking;
use crate::object::{ObjectId, ObjectTable, GC_WHITE};
use crate::statistics::{formatted_size, CollectionCycle, CycleEvent, CycleKind, GcReason};
use crate::sweep::{sweep, SweepScope};
use crate::Config;

pub(crate) struct SerialCollector {
    gen: GenerationManager,
}

impl SerialCollector {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            gen: GenerationManager::new(config),
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
            // the set is no longer sound, rescan the full heap instead
            cycle.events.push(CycleEvent::RememberedSetOverflow);
            let mut marking = SynchronousMarking::new(ctx.table, false);
            for &root in &roots {
                marking.mark_root(root);
            }
            marking.run()?
        } else {
            let edges = ctx.state.remembered.snapshot();
            let mut marking = SynchronousMarking::new(ctx.table, true);
            for &root in &roots {
                marking.mark_root(root);
            }
            marking.seed_remembered(&edges);
            marking.run()?
        };
        cycle.marked_objects += stats.visited;

        ctx.state.set_phase(Phase::Reclaiming);
        let swept = sweep(ctx.table, ctx.space, SweepScope::YoungOnly)?;
        cycle.reclaimed_bytes += swept.reclaimed_bytes;

        ctx.state.set_phase(Phase::Promoting);
        let moves = plan_young_evacuation(ctx.table, &self.gen, &swept.survivors)?;
        // survivors are copied out wholesale, so the entire young space can
        // be reset to an empty bump before re-placing them
        ctx.space.reset_generation(Some(Generation::Young));
        let relocated = evacuate(ctx.table, ctx.space, ctx.forwarding, &moves)?;
        cycle.promoted_bytes += relocated.promoted_bytes;
        tracing::debug!(
            freed = swept.freed_objects,
            evacuated = %formatted_size(relocated.moved_bytes),
            promoted = %formatted_size(relocated.promoted_bytes),
            "young collection"
        );

        finish_minor(ctx, &relocated.relocated, overflowed)
    }

    fn major(&mut self, ctx: &mut StwContext<'_>, cycle: &mut CollectionCycle) -> Result<()> {
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

        ctx.state.set_phase(Phase::Compacting);
        let moves = plan_old_compaction(ctx.table, &swept.survivors);
        ctx.space.reset_generation(Some(Generation::Old));
        let relocated = evacuate(ctx.table, ctx.space, ctx.forwarding, &moves)?;
        tracing::debug!(
            freed = swept.freed_objects,
            compacted = %formatted_size(relocated.moved_bytes),
            "old collection"
        );
        finish_major(ctx, &mut self.gen)
    }
}

/// Decides, per young survivor, whether it is tenured or copied back into
/// the young generation with one more survived cycle on its age.
pub(crate) fn plan_young_evacuation(
    table: &ObjectTable,
    gen: &GenerationManager,
    survivors: &[ObjectId],
) -> Result<Vec<Move>> {
    let mut moves = Vec::with_capacity(survivors.len());
    for &id in survivors {
        let record = table
            .get(id)
            .ok_or(GcError::CorruptGraph("young survivor vanished before evacuation"))?;
        let age = record.age();
        if gen.should_promote(age) {
            moves.push(Move {
                old: id,
                dest: Some(Generation::Old),
                new_age: age,
            });
        } else {
            moves.push(Move {
                old: id,
                dest: Some(Generation::Young),
                new_age: age + 1,
            });
        }
    }
    Ok(moves)
}

pub(crate) fn plan_old_compaction(table: &ObjectTable, survivors: &[ObjectId]) -> Vec<Move> {
    let mut moves: Vec<Move> = survivors
        .iter()
        .filter_map(|&id| {
            let record = table.get(id)?;
            if record.generation() != Some(Generation::Old) {
                return None;
            }
            Some(Move {
                old: id,
                dest: Some(Generation::Old),
                new_age: record.age(),
            })
        })
        .collect();
    moves.sort_by_key(|mv| mv.old);
    moves
}

/// Post-evacuation half of a minor cycle: reference fixup bounded by the
/// remembered set when it is sound, full rescan when it is not, then
/// remembered-set maintenance.
pub(crate) fn finish_minor(
    ctx: &mut StwContext<'_>,
    relocated: &[ObjectId],
    overflowed: bool,
) -> Result<()> {
    if overflowed {
        fixup_references(ctx.table, ctx.forwarding)?;
        // the full rescan blackened old records a young-only sweep never
        // whitens; clear them so the next cycle starts from white
        for (_, record) in ctx.table.iter() {
            if record.generation() == Some(Generation::Old) {
                record.force_color(GC_WHITE);
            }
        }
        rebuild_remembered(ctx);
        return Ok(());
    }

    // incoming edges to moved young objects come from the relocated records
    // themselves, the remembered owners, or the roots (which resolve through
    // the forwarding table)
    let mut owners: Vec<ObjectId> = relocated.to_vec();
    owners.extend(ctx.state.remembered.snapshot().iter().map(|&(o, _)| o));
    fixup_owners(ctx.table, ctx.forwarding, &owners)?;
    ctx.state
        .remembered
        .rewrite(ctx.forwarding, ctx.table, |o, t| {
            o.generation() == Some(Generation::Old) && t.generation() == Some(Generation::Young)
        })?;
    // tenured records may still point into the young generation
    for &id in relocated {
        let Some(record) = ctx.table.get(id) else { continue };
        if record.generation() != Some(Generation::Old) {
            continue;
        }
        for &target in record.references() {
            if ctx.table.get(target).map(|t| t.generation()) == Some(Some(Generation::Young)) {
                ctx.state.remembered.insert(id, target);
            }
        }
    }
    Ok(())
}

pub(crate) fn finish_major(ctx: &mut StwContext<'_>, gen: &mut GenerationManager) -> Result<()> {
    fixup_references(ctx.table, ctx.forwarding)?;
    ctx.state
        .remembered
        .rewrite(ctx.forwarding, ctx.table, |o, t| {
            o.generation() == Some(Generation::Old) && t.generation() == Some(Generation::Young)
        })?;
    gen.after_major(ctx.space.used_in(Some(Generation::Old)));
    Ok(())
}

/// Re-establishes the remembered set's soundness invariant after a cycle that
/// could not trust it: every live old→young edge is re-recorded.
pub(crate) fn rebuild_remembered(ctx: &mut StwContext<'_>) {
    ctx.state.remembered.clear();
    ctx.state.remembered.reset_overflow();
    for (id, record) in ctx.table.iter() {
        if record.generation() != Some(Generation::Old) {
            continue;
        }
        for &target in record.references() {
            if ctx.table.get(target).map(|t| t.generation()) == Some(Some(Generation::Young)) {
                ctx.state.remembered.insert(id, target);
            }
        }
    }
}
