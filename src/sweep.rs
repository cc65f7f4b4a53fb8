//! Reclaiming phase: frees every record the tracer left white and whitens
//! the black survivors for the next cycle.

use parking_lot::Mutex;
use scoped_threadpool::Pool;

use crate::error::{GcError, Result};
use crate::generation::Generation;
use crate::object::{ObjectId, ObjectTable, GC_BLACK, GC_WHITE};
use crate::space::RegionSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepScope {
    Full,
    YoungOnly,
}

pub(crate) struct SweepOutcome {
    pub reclaimed_bytes: usize,
    pub freed_objects: usize,
    /// Black records found in scope, whitened for the next cycle.
    pub survivors: Vec<ObjectId>,
}

fn in_scope(scope: SweepScope, generation: Option<Generation>) -> bool {
    match scope {
        SweepScope::Full => true,
        SweepScope::YoungOnly => generation == Some(Generation::Young),
    }
}

pub(crate) fn sweep(
    table: &mut ObjectTable,
    space: &mut RegionSpace,
    scope: SweepScope,
) -> Result<SweepOutcome> {
    let mut outcome = SweepOutcome {
        reclaimed_bytes: 0,
        freed_objects: 0,
        survivors: Vec::new(),
    };
    for id in table.ids() {
        let Some(record) = table.get(id) else { continue };
        if !in_scope(scope, record.generation()) {
            continue;
        }
        match record.color() {
            GC_WHITE => {
                let record = table
                    .remove(id)
                    .ok_or(GcError::CorruptGraph("swept slot vanished mid-walk"))?;
                if !space.free(record.region, record.offset, record.size) {
                    return Err(GcError::CorruptGraph("sweep freed an unallocated placement"));
                }
                outcome.reclaimed_bytes += record.size;
                outcome.freed_objects += 1;
            }
            GC_BLACK => {
                record.force_color(GC_WHITE);
                outcome.survivors.push(id);
            }
            _ => return Err(GcError::CorruptGraph("grey record reached the sweep phase")),
        }
    }
    space.coalesce();
    Ok(outcome)
}

/// Sweep with the classification walk partitioned across workers. Workers
/// whiten survivors in place (the color is atomic) and report dead identities
/// back; the frees themselves are applied on the calling thread, which owns
/// the region space.
pub(crate) fn parallel_sweep(
    pool: &mut Pool,
    table: &mut ObjectTable,
    space: &mut RegionSpace,
    scope: SweepScope,
) -> Result<SweepOutcome> {
    let ids = table.ids();
    let n_threads = (pool.thread_count() as usize).max(1);
    let chunk_size = ids.len() / n_threads + 1;
    let dead = Mutex::new(Vec::new());
    let survivors = Mutex::new(Vec::new());
    let failure: Mutex<Option<GcError>> = Mutex::new(None);

    {
        let table = &*table;
        pool.scoped(|scoped| {
            for chunk in ids.chunks(chunk_size) {
                let dead = &dead;
                let survivors = &survivors;
                let failure = &failure;
                scoped.execute(move || {
                    let mut local_dead = Vec::new();
                    let mut local_survivors = Vec::new();
                    for &id in chunk {
                        let Some(record) = table.get(id) else { continue };
                        if !in_scope(scope, record.generation()) {
                            continue;
                        }
                        match record.color() {
                            GC_WHITE => local_dead.push(id),
                            GC_BLACK => {
                                record.force_color(GC_WHITE);
                                local_survivors.push(id);
                            }
                            _ => {
                                let mut failure = failure.lock();
                                if failure.is_none() {
                                    *failure = Some(GcError::CorruptGraph(
                                        "grey record reached the sweep phase",
                                    ));
                                }
                                return;
                            }
                        }
                    }
                    dead.lock().extend(local_dead);
                    survivors.lock().extend(local_survivors);
                });
            }
        });
    }

    if let Some(err) = failure.into_inner() {
        return Err(err);
    }

    let mut outcome = SweepOutcome {
        reclaimed_bytes: 0,
        freed_objects: 0,
        survivors: survivors.into_inner(),
    };
    for id in dead.into_inner() {
        let record = table
            .remove(id)
            .ok_or(GcError::CorruptGraph("swept slot vanished mid-walk"))?;
        if !space.free(record.region, record.offset, record.size) {
            return Err(GcError::CorruptGraph("sweep freed an unallocated placement"));
        }
        outcome.reclaimed_bytes += record.size;
        outcome.freed_objects += 1;
    }
    space.coalesce();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectRecord;

    #[test]
    fn sweep_frees_white_and_whitens_black() {
        let mut space = RegionSpace::uniform(128, 128);
        let mut table = ObjectTable::new();
        let (region, offset) = space.allocate(None, 32).unwrap();
        let live = table.insert(ObjectRecord::new(32, None, region, offset, GC_BLACK));
        let (region, offset) = space.allocate(None, 32).unwrap();
        let dead = table.insert(ObjectRecord::new(32, None, region, offset, GC_WHITE));

        let outcome = sweep(&mut table, &mut space, SweepScope::Full).unwrap();
        assert_eq!(outcome.reclaimed_bytes, 32);
        assert_eq!(outcome.freed_objects, 1);
        assert_eq!(outcome.survivors, vec![live]);
        assert!(!table.contains(dead));
        assert_eq!(table.get(live).unwrap().color(), GC_WHITE);
        assert_eq!(space.used_bytes(), 32);
    }
}
