use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Cross-thread notification with manual-reset semantics.
///
/// `wait` blocks until the signal is fired. `fire` wakes all waiters and keeps
/// the signal set until `reset` clears it, so a signal can be used both as a
/// one-shot gate (session initialization) and as a resettable wakeup source
/// (the engine worker's event loop).
#[derive(Default)]
pub struct Signal {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the calling thread until the signal is fired.
    pub fn wait(&self) {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            fired = self.cv.wait(fired).unwrap();
        }
    }

    /// Block until the signal is fired or `timeout` elapses.
    /// Returns `true` if the signal was observed fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            let (guard, result) = self.cv.wait_timeout(fired, timeout).unwrap();
            fired = guard;
            if result.timed_out() {
                return *fired;
            }
        }
        true
    }

    /// Set the signal and wake every waiter.
    pub fn fire(&self) {
        *self.fired.lock().unwrap() = true;
        self.cv.notify_all();
    }

    /// Clear the signal so subsequent `wait` calls block again.
    pub fn reset(&self) {
        *self.fired.lock().unwrap() = false;
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.lock().unwrap()
    }
}
