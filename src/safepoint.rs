//! Brings mutator threads to a stop so a collection phase can run.
//!
//! Mutator-facing heap entry points pledge at the safepoint before touching
//! shared state; while the barrier is armed they park until the collector
//! disarms it. The collector arms the barrier, then acquires the heap locks,
//! which drains any operation already past the pledge.

use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use atomic::Ordering;
use parking_lot::{Condvar, Mutex};

use crate::statistics::{CollectionCycle, CycleEvent};

pub struct Safepoint {
    armed: AtomicBool,
    mutex: Mutex<()>,
    cv_resume: Condvar,
}

impl Safepoint {
    pub(crate) fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cv_resume: Condvar::new(),
        }
    }

    pub(crate) fn arm(&self) {
        let guard = self.mutex.lock();
        debug_assert!(!self.armed.load(Ordering::Relaxed));
        self.armed.store(true, Ordering::SeqCst);
        drop(guard);
    }

    pub(crate) fn disarm(&self) {
        let guard = self.mutex.lock();
        self.armed.store(false, Ordering::SeqCst);
        self.cv_resume.notify_all();
        drop(guard);
    }

    /// Mutator pledge. Returns immediately unless a pause is in progress.
    #[inline]
    pub(crate) fn pledge(&self) {
        if self.armed.load(Ordering::Acquire) {
            self.pledge_slow();
        }
    }

    #[cold]
    fn pledge_slow(&self) {
        let mut guard = self.mutex.lock();
        while self.armed.load(Ordering::Acquire) {
            self.cv_resume.wait(&mut guard);
        }
    }
}

/// Arms the safepoint for one stop-the-world pause and guarantees it is
/// disarmed again even on an error path.
pub(crate) struct PauseScope<'a> {
    safepoint: &'a Safepoint,
    start: Instant,
    deadline: Duration,
    finished: bool,
}

impl<'a> PauseScope<'a> {
    pub(crate) fn begin(safepoint: &'a Safepoint, deadline: Duration) -> Self {
        safepoint.arm();
        Self {
            safepoint,
            start: Instant::now(),
            deadline,
            finished: false,
        }
    }

    /// Ends the pause and records its duration on the cycle, flagging a
    /// deadline overrun as a report-only event.
    pub(crate) fn finish(mut self, cycle: &mut CollectionCycle) -> Duration {
        let elapsed = self.start.elapsed();
        cycle.pauses.push(elapsed);
        if elapsed > self.deadline {
            tracing::warn!(
                pause_ms = elapsed.as_secs_f64() * 1000.0,
                deadline_ms = self.deadline.as_secs_f64() * 1000.0,
                "pause deadline exceeded"
            );
            cycle.events.push(CycleEvent::PauseDeadlineExceeded {
                pause: elapsed,
                deadline: self.deadline,
            });
        }
        self.finished = true;
        self.safepoint.disarm();
        elapsed
    }
}

impl Drop for PauseScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.safepoint.disarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pledge_passes_when_disarmed() {
        let safepoint = Safepoint::new();
        safepoint.pledge();
        safepoint.arm();
        safepoint.disarm();
        safepoint.pledge();
    }

    #[test]
    fn pause_scope_disarms_on_drop() {
        let safepoint = Safepoint::new();
        {
            let _scope = PauseScope::begin(&safepoint, Duration::from_millis(10));
        }
        // would deadlock here if the scope leaked the armed barrier
        safepoint.pledge();
    }
}
