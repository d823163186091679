//! Cancellable timed wait used by the background loops.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Mutex+Condvar pair with a sticky notification flag.
///
/// `wait_for` returns early when `notify` was called (before or during the
/// wait) and consumes the notification.
#[derive(Default)]
pub struct WaitNotifier {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl WaitNotifier {
    /// Fresh notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout`; returns true when woken by `notify`.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut notified = self.notified.lock();
        if !*notified {
            self.cond.wait_for(&mut notified, timeout);
        }
        let was_notified = *notified;
        *notified = false;
        was_notified
    }

    /// Wake the waiter.
    pub fn notify(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cond.notify_all();
    }
}
