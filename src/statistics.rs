//! Observability records: per-cycle summaries and aggregate heap statistics.

use std::time::Duration;

use crate::Strategy;

/// Why a collection cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    RequestedByUser,
    AllocationFailure,
    OccupancyThreshold,
    OldSpaceFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Young-generation cycle of a generational strategy.
    Minor,
    /// Old-generation mark-sweep-compact.
    Major,
    /// Minor followed by major.
    Full,
    /// Concurrent marking cycle with a brief final pause.
    Concurrent,
    /// Bounded evacuation of the highest-garbage regions.
    Incremental,
    /// Concurrent strategy forced to run all phases in one pause.
    Degraded,
}

/// Non-fatal conditions observed during a cycle. These are reports, not
/// errors: the cycle that carries them completed correctly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleEvent {
    /// A stop-the-world pause overran the configured deadline.
    PauseDeadlineExceeded { pause: Duration, deadline: Duration },
    /// The remembered set hit its entry limit; the cycle fell back to a
    /// full-heap rescan.
    RememberedSetOverflow,
    /// Free-list fragmentation crossed the threshold and the cycle escalated
    /// to a compacting pass.
    FragmentationEscalation,
    /// Marking was abandoned on request before any reclamation began.
    Aborted,
}

/// Summary of one collection cycle, emitted to sinks and kept in a bounded
/// history.
#[derive(Debug, Clone)]
pub struct CollectionCycle {
    pub strategy: Strategy,
    pub kind: CycleKind,
    pub reason: GcReason,
    /// Used bytes when the cycle started.
    pub start_occupancy: usize,
    /// Used bytes when the cycle finished.
    pub end_occupancy: usize,
    pub reclaimed_bytes: usize,
    pub promoted_bytes: usize,
    /// Objects visited by the tracer.
    pub marked_objects: usize,
    /// One entry per stop-the-world pause in the cycle.
    pub pauses: Vec<Duration>,
    pub events: Vec<CycleEvent>,
}

impl CollectionCycle {
    pub(crate) fn new(
        strategy: Strategy,
        kind: CycleKind,
        reason: GcReason,
        start_occupancy: usize,
    ) -> Self {
        Self {
            strategy,
            kind,
            reason,
            start_occupancy,
            end_occupancy: start_occupancy,
            reclaimed_bytes: 0,
            promoted_bytes: 0,
            marked_objects: 0,
            pauses: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn total_pause(&self) -> Duration {
        self.pauses.iter().sum()
    }

    pub fn deadline_violated(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, CycleEvent::PauseDeadlineExceeded { .. }))
    }
}

/// Aggregate statistics over the lifetime of a heap.
#[derive(Debug, Clone)]
pub struct HeapStatistics {
    pub used_bytes: usize,
    pub capacity: usize,
    pub live_objects: usize,
    pub total_gc_cycles: usize,
    pub total_reclaimed_bytes: usize,
    pub total_allocated_bytes: usize,
    pub total_objects_allocated: usize,
    pub remembered_set_entries: usize,
    pub fragmentation: f64,
}

pub(crate) struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub(crate) fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Current memory usage: {} of {}",
            formatted_size(self.used_bytes),
            formatted_size(self.capacity)
        )?;
        writeln!(f, "  Live objects: {}", self.live_objects)?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles)?;
        writeln!(
            f,
            "  Total memory allocated: {}",
            formatted_size(self.total_allocated_bytes)
        )?;
        writeln!(
            f,
            "  Total memory reclaimed: {}",
            formatted_size(self.total_reclaimed_bytes)
        )?;
        writeln!(
            f,
            "  Total objects allocated: {}",
            self.total_objects_allocated
        )?;
        writeln!(
            f,
            "  Remembered set entries: {}",
            self.remembered_set_entries
        )?;
        writeln!(f, "  Fragmentation: {:.2}%", self.fragmentation * 100.0)?;
        Ok(())
    }
}
