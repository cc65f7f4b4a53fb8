//! Write barrier bookkeeping: the remembered set and the marking-time
//! retreating-wavefront barrier.
//!
//! Both are fed synchronously from the reference-write path; the collector
//! relies on every edge mutation being visible here before the cycle that
//! depends on it completes.

use std::sync::atomic::AtomicBool;

use ahash::AHashSet;
use atomic::Ordering;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::compact::ForwardingTable;
use crate::error::Result;
use crate::object::{ObjectId, ObjectRecord, ObjectTable, GC_BLACK, GC_GREY};

/// Old→young and cross-region reference edges recorded by the write barrier.
///
/// Bounded: once the limit is hit new edges are dropped and the overflow flag
/// forces the next collection to rescan the full heap instead of trusting the
/// set. Degraded pause time, never a correctness failure.
pub struct RememberedSet {
    entries: Mutex<AHashSet<(ObjectId, ObjectId)>>,
    limit: usize,
    overflowed: AtomicBool,
}

impl RememberedSet {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(AHashSet::new()),
            limit,
            overflowed: AtomicBool::new(false),
        }
    }

    pub(crate) fn insert(&self, owner: ObjectId, target: ObjectId) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.limit && !entries.contains(&(owner, target)) {
            if !self.overflowed.swap(true, Ordering::AcqRel) {
                tracing::warn!(limit = self.limit, "remembered set overflow");
            }
            return;
        }
        entries.insert((owner, target));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Clears the overflow flag once a full-heap rescan has re-established
    /// the set's soundness invariant.
    pub(crate) fn reset_overflow(&self) {
        self.overflowed.store(false, Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> Vec<(ObjectId, ObjectId)> {
        self.entries.lock().iter().copied().collect()
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Remaps every entry through the forwarding table and drops the ones
    /// whose endpoints no longer form a recorded-edge candidate.
    pub(crate) fn rewrite<F>(
        &self,
        forwarding: &ForwardingTable,
        table: &ObjectTable,
        keep: F,
    ) -> Result<()>
    where
        F: Fn(&ObjectRecord, &ObjectRecord) -> bool,
    {
        let mut entries = self.entries.lock();
        let old: Vec<_> = entries.drain().collect();
        for (owner, target) in old {
            let owner = forwarding.resolve(owner)?;
            let target = forwarding.resolve(target)?;
            if let (Some(o), Some(t)) = (table.get(owner), table.get(target)) {
                if keep(o, t) {
                    entries.insert((owner, target));
                }
            }
        }
        Ok(())
    }
}

/// Incremental-update barrier used while marking runs concurrently with the
/// mutator: a black owner that takes a new reference retreats to grey and is
/// queued for the marker to revisit before the cycle ends.
#[inline]
pub(crate) fn marking_barrier(
    worklist: &SegQueue<ObjectId>,
    owner: ObjectId,
    record: &ObjectRecord,
) {
    if record.set_color(GC_BLACK, GC_GREY) {
        marking_barrier_slow(worklist, owner);
    }
}

#[cold]
fn marking_barrier_slow(worklist: &SegQueue<ObjectId>, owner: ObjectId) {
    worklist.push(owner);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::GC_WHITE;

    #[test]
    fn overflow_drops_entries_and_raises_flag() {
        let set = RememberedSet::new(2);
        set.insert(ObjectId(1), ObjectId(2));
        set.insert(ObjectId(3), ObjectId(4));
        assert!(!set.is_overflowed());
        set.insert(ObjectId(5), ObjectId(6));
        assert!(set.is_overflowed());
        assert_eq!(set.len(), 2);
        set.reset_overflow();
        assert!(!set.is_overflowed());
    }

    #[test]
    fn barrier_regreys_black_owners_only() {
        let worklist = SegQueue::new();
        let record = ObjectRecord::new(16, None, 0, 0, GC_WHITE);
        marking_barrier(&worklist, ObjectId(7), &record);
        assert!(worklist.pop().is_none());
        record.force_color(GC_BLACK);
        marking_barrier(&worklist, ObjectId(7), &record);
        assert_eq!(worklist.pop(), Some(ObjectId(7)));
        assert_eq!(record.color(), GC_GREY);
    }
}
