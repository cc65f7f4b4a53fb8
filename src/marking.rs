//! Reachability tracing.
//!
//! Three drivers over the same tri-color worklist algorithm: synchronous
//! (one thread inside a pause), parallel (work-stealing workers inside a
//! pause) and concurrent (a background thread interleaving with the mutator
//! in bounded slices). All of them advance colors White→Grey→Black through
//! compare-and-set, which makes revisits no-ops and terminates traversal of
//! cyclic graphs.

use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::thread;
use std::time::Duration;

use atomic::Ordering;
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use scoped_threadpool::Pool;

use crate::error::{GcError, Result};
use crate::generation::Generation;
use crate::object::{ObjectId, ObjectTable, GC_BLACK, GC_WHITE};

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MarkStats {
    pub visited: usize,
    pub bytes: usize,
}

/// Blackens `id` and greys its white successors. The shared step of every
/// marking driver.
pub(crate) fn scan_object(
    table: &ObjectTable,
    id: ObjectId,
    young_only: bool,
    push: &mut dyn FnMut(ObjectId),
) -> Result<usize> {
    let record = table
        .get(id)
        .ok_or(GcError::CorruptGraph("grey identity missing from table"))?;
    record.force_color(GC_BLACK);
    for &target in record.references() {
        let Some(t) = table.get(target) else {
            return Err(GcError::CorruptGraph("reference to a reclaimed slot"));
        };
        if young_only && t.generation() != Some(Generation::Young) {
            continue;
        }
        if t.try_mark() {
            push(target);
        }
    }
    Ok(record.size())
}

/// Single-threaded marking inside a stop-the-world pause.
pub(crate) struct SynchronousMarking<'a> {
    table: &'a ObjectTable,
    young_only: bool,
    worklist: Vec<ObjectId>,
}

impl<'a> SynchronousMarking<'a> {
    pub(crate) fn new(table: &'a ObjectTable, young_only: bool) -> Self {
        Self {
            table,
            young_only,
            worklist: Vec::new(),
        }
    }

    fn eligible(&self, id: ObjectId) -> Option<&crate::object::ObjectRecord> {
        let record = self.table.get(id)?;
        if self.young_only && record.generation() != Some(Generation::Young) {
            return None;
        }
        Some(record)
    }

    pub(crate) fn mark_root(&mut self, id: ObjectId) {
        if let Some(record) = self.eligible(id) {
            if record.try_mark() {
                self.worklist.push(id);
            }
        }
    }

    /// Seeds the worklist from remembered old→young edges so a young-only
    /// cycle never scans the old generation itself.
    pub(crate) fn seed_remembered(&mut self, edges: &[(ObjectId, ObjectId)]) {
        for &(owner, _) in edges {
            let Some(record) = self.table.get(owner) else {
                continue;
            };
            for &target in record.references() {
                if let Some(t) = self.eligible(target) {
                    if t.try_mark() {
                        self.worklist.push(target);
                    }
                }
            }
        }
    }

    pub(crate) fn run(&mut self) -> Result<MarkStats> {
        let mut stats = MarkStats::default();
        while let Some(id) = self.worklist.pop() {
            let mut pushed = std::mem::take(&mut self.worklist);
            let bytes = scan_object(self.table, id, self.young_only, &mut |t| pushed.push(t))?;
            self.worklist = pushed;
            stats.visited += 1;
            stats.bytes += bytes;
        }
        Ok(stats)
    }
}

/// Work-stealing termination protocol: a worker that runs dry votes to stop
/// and re-registers if new work shows up before everyone has voted.
pub(crate) struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub(crate) fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub(crate) fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::Relaxed) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);

        loop {
            if nworkers == 0 {
                return true;
            }

            let result = self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );

            match result {
                Ok(_) => {
                    // workers didn't terminate in time, there is still work
                    return false;
                }
                Err(prev_nworkers) => {
                    nworkers = prev_nworkers;
                }
            }
        }
    }
}

struct MarkWorker<'a> {
    task_id: usize,
    young_only: bool,
    table: &'a ObjectTable,
    worker: Worker<ObjectId>,
    injector: &'a Injector<ObjectId>,
    stealers: &'a [Stealer<ObjectId>],
    terminator: &'a Terminator,
    visited: &'a AtomicUsize,
    bytes: &'a AtomicUsize,
    failure: &'a Mutex<Option<GcError>>,
}

impl<'a> MarkWorker<'a> {
    fn pop(&mut self) -> Option<ObjectId> {
        self.pop_worker()
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_worker(&mut self) -> Option<ObjectId> {
        self.worker.pop()
    }

    fn pop_global(&mut self) -> Option<ObjectId> {
        loop {
            match self.injector.steal_batch_and_pop(&self.worker) {
                Steal::Empty => break,
                Steal::Success(value) => return Some(value),
                Steal::Retry => continue,
            }
        }
        None
    }

    fn steal(&self) -> Option<ObjectId> {
        if self.stealers.len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());

        for _ in 0..2 * self.stealers.len() {
            let mut stealer_id = self.task_id;
            while stealer_id == self.task_id {
                stealer_id = range.sample(&mut rng);
            }

            let stealer = &self.stealers[stealer_id];
            loop {
                match stealer.steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(id) => return Some(id),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn run(&mut self) {
        loop {
            if self.failure.lock().is_some() {
                break;
            }
            let id = if let Some(id) = self.pop() {
                id
            } else if self.terminator.try_terminate() {
                break;
            } else {
                continue;
            };

            let worker = &self.worker;
            match scan_object(self.table, id, self.young_only, &mut |t| worker.push(t)) {
                Ok(bytes) => {
                    self.visited.fetch_add(1, Ordering::Relaxed);
                    self.bytes.fetch_add(bytes, Ordering::Relaxed);
                }
                Err(err) => {
                    let mut failure = self.failure.lock();
                    if failure.is_none() {
                        *failure = Some(err);
                    }
                    break;
                }
            }
        }
    }
}

/// Marking partitioned across worker tasks inside a stop-the-world pause.
/// The CAS color transition is what keeps two workers from double-marking
/// the same record.
pub(crate) fn parallel_mark(
    pool: &mut Pool,
    table: &ObjectTable,
    roots: &[ObjectId],
    remembered: &[(ObjectId, ObjectId)],
    young_only: bool,
) -> Result<MarkStats> {
    let n_threads = pool.thread_count() as usize;
    let injector = Injector::new();

    {
        // seeding reuses the synchronous driver's eligibility rules
        let mut seed = SynchronousMarking::new(table, young_only);
        for &root in roots {
            seed.mark_root(root);
        }
        seed.seed_remembered(remembered);
        for id in seed.worklist.drain(..) {
            injector.push(id);
        }
    }

    let mut workers = Vec::with_capacity(n_threads);
    let mut stealers = Vec::with_capacity(n_threads);
    for _ in 0..n_threads {
        let w = Worker::new_lifo();
        stealers.push(w.stealer());
        workers.push(w);
    }

    let visited = AtomicUsize::new(0);
    let bytes = AtomicUsize::new(0);
    let failure = Mutex::new(None);
    let terminator = Terminator::new(n_threads);

    pool.scoped(|scoped| {
        for (task_id, worker) in workers.into_iter().enumerate() {
            let injector = &injector;
            let stealers = &stealers;
            let terminator = &terminator;
            let visited = &visited;
            let bytes = &bytes;
            let failure = &failure;
            scoped.execute(move || {
                let mut marker = MarkWorker {
                    task_id,
                    young_only,
                    table,
                    worker,
                    injector,
                    stealers,
                    terminator,
                    visited,
                    bytes,
                    failure,
                };
                marker.run();
            });
        }
    });

    if let Some(err) = failure.into_inner() {
        return Err(err);
    }
    Ok(MarkStats {
        visited: visited.into_inner(),
        bytes: bytes.into_inner(),
    })
}

/// How many objects a concurrent marker processes per table read lock. Keeps
/// the guard short so mutator reference writes interleave.
const CONCURRENT_SLICE: usize = 64;

/// Concurrent marking driven from the collector thread. Returns `None` if an
/// abort was requested; the caller discards the accumulated marks.
pub(crate) fn concurrent_mark(
    objects: &RwLock<ObjectTable>,
    barrier_worklist: &SegQueue<ObjectId>,
    abort: &AtomicBool,
    seeds: Vec<ObjectId>,
) -> Result<Option<MarkStats>> {
    let mut worklist = seeds;
    let mut stats = MarkStats::default();
    loop {
        if abort.swap(false, Ordering::AcqRel) {
            return Ok(None);
        }
        while let Some(id) = barrier_worklist.pop() {
            worklist.push(id);
        }
        if worklist.is_empty() {
            if barrier_worklist.is_empty() {
                break;
            }
            continue;
        }
        let table = objects.read();
        for _ in 0..CONCURRENT_SLICE {
            let Some(id) = worklist.pop() else { break };
            let bytes = scan_object(&table, id, false, &mut |t| worklist.push(t))?;
            stats.visited += 1;
            stats.bytes += bytes;
        }
    }
    Ok(Some(stats))
}

/// Whitens every record, in bounded slices. Used after an aborted cycle and
/// after an incremental cycle where sweeping touched only a region subset.
pub(crate) fn reset_colors(objects: &RwLock<ObjectTable>) {
    let ids = objects.read().ids();
    for chunk in ids.chunks(256) {
        let table = objects.read();
        for &id in chunk {
            if let Some(record) = table.get(id) {
                record.force_color(GC_WHITE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectRecord, GC_GREY};

    fn record(size: usize) -> ObjectRecord {
        ObjectRecord::new(size, None, 0, 0, GC_WHITE)
    }

    #[test]
    fn cyclic_graph_terminates() {
        let mut table = ObjectTable::new();
        let a = table.insert(record(16));
        let b = table.insert(record(16));
        table.get_mut(a).unwrap().references.push(b);
        table.get_mut(b).unwrap().references.push(a);

        let mut marking = SynchronousMarking::new(&table, false);
        marking.mark_root(a);
        let stats = marking.run().unwrap();
        assert_eq!(stats.visited, 2);
        assert_eq!(table.get(a).unwrap().color(), GC_BLACK);
        assert_eq!(table.get(b).unwrap().color(), GC_BLACK);
    }

    #[test]
    fn young_only_skips_old_targets() {
        let mut table = ObjectTable::new();
        let young = table.insert(ObjectRecord::new(
            16,
            Some(Generation::Young),
            0,
            0,
            GC_WHITE,
        ));
        let old = table.insert(ObjectRecord::new(16, Some(Generation::Old), 1, 0, GC_WHITE));
        table.get_mut(young).unwrap().references.push(old);

        let mut marking = SynchronousMarking::new(&table, true);
        marking.mark_root(young);
        marking.mark_root(old);
        let stats = marking.run().unwrap();
        assert_eq!(stats.visited, 1);
        assert_eq!(table.get(old).unwrap().color(), GC_WHITE);
    }

    #[test]
    fn dangling_reference_is_corruption() {
        let mut table = ObjectTable::new();
        let a = table.insert(record(16));
        table.get_mut(a).unwrap().references.push(ObjectId(999));
        table.get(a).unwrap().force_color(GC_GREY);
        let err = scan_object(&table, a, false, &mut |_| {}).unwrap_err();
        assert!(matches!(err, GcError::CorruptGraph(_)));
    }
}
