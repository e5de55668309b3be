//! Resettable deadline gate shared by the read and write paths.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// A reprogrammable timer.
///
/// `expired` resolves once the programmed instant has passed and never
/// resolves while the deadline is disabled. Reprogramming wakes any pending
/// waiter so it observes the new target.
pub(crate) struct Deadline {
    target: Mutex<Option<Instant>>,
    changed: Notify,
}

impl Deadline {
    pub fn new() -> Self {
        Self {
            target: Mutex::new(None),
            changed: Notify::new(),
        }
    }

    /// Reprogram the deadline. `None` disables it.
    pub fn set(&self, at: Option<Instant>) {
        *self.target.lock() = at;
        self.changed.notify_waiters();
    }

    /// Resolves at or after the programmed instant.
    pub async fn expired(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register for wakeups before reading the target, so a racing
            // `set` cannot slip between the read and the wait.
            notified.as_mut().enable();
            let target = *self.target.lock();
            match target {
                None => notified.await,
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => return,
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }
}
