//! Decides when a collection cycle may run.
//!
//! Only one cycle is ever active per heap. Triggers arriving while a cycle is
//! in flight coalesce: the requester either gets `false` from [`try_begin`]
//! and treats the in-flight cycle as satisfying the request, or parks in
//! [`wait_idle`] until it completes.
//!
//! [`try_begin`]: Scheduler::try_begin
//! [`wait_idle`]: Scheduler::wait_idle

use parking_lot::{Condvar, Mutex};

pub(crate) struct Scheduler {
    active: Mutex<bool>,
    cv_idle: Condvar,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            active: Mutex::new(false),
            cv_idle: Condvar::new(),
        }
    }

    /// Claims the single active-cycle slot. `false` means a cycle is already
    /// running and this trigger coalesces into it.
    pub(crate) fn try_begin(&self) -> bool {
        let mut active = self.active.lock();
        if *active {
            false
        } else {
            *active = true;
            true
        }
    }

    pub(crate) fn end(&self) {
        let mut active = self.active.lock();
        *active = false;
        self.cv_idle.notify_all();
    }

    pub(crate) fn wait_idle(&self) {
        let mut active = self.active.lock();
        while *active {
            self.cv_idle.wait(&mut active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_triggers_coalesce() {
        let scheduler = Scheduler::new();
        assert!(scheduler.try_begin());
        assert!(!scheduler.try_begin());
        scheduler.end();
        assert!(scheduler.try_begin());
        scheduler.end();
        scheduler.wait_idle();
    }
}
