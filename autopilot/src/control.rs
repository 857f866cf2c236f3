//! Pause gate shared by a task service and its running executor.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Default)]
pub struct PauseGate {
    paused: Mutex<bool>,
    changed: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        *self.lock() = true;
        debug!("execution paused");
        self.changed.notify_all();
    }

    pub fn resume(&self) {
        *self.lock() = false;
        debug!("execution resumed");
        self.changed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.lock()
    }

    /// Block while paused.
    ///
    /// Wakes at least every `poll` to evaluate `should_abort`. Returns `false`
    /// when aborted while paused, `true` once the gate is open.
    pub fn wait_while_paused(&self, poll: Duration, mut should_abort: impl FnMut() -> bool) -> bool {
        let poll = poll.max(Duration::from_millis(1));
        let mut paused = self.lock();
        while *paused {
            drop(paused);
            if should_abort() {
                return false;
            }
            paused = self.lock();
            if !*paused {
                break;
            }
            paused = self
                .changed
                .wait_timeout(paused, poll)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|err| err.into_inner().0);
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
