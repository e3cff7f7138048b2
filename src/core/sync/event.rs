/*!
 * Notification Event
 *
 * Manual-reset event: once set it stays signaled and releases every waiter.
 * Thread and process objects signal one when their teardown completes.
 */

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Manual-reset notification event
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event and wake every waiter
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until signaled; `None` waits forever
    ///
    /// Returns false on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut signaled = self.signaled.lock();
        match timeout {
            None => {
                while !*signaled {
                    self.cond.wait(&mut signaled);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*signaled {
                    if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                        return *signaled;
                    }
                }
                true
            }
        }
    }

    /// Wait until any of `events` is signaled, returning its index
    ///
    /// Polls at `poll`; returns `None` when `timeout` elapses first.
    pub fn wait_any(events: &[&Event], timeout: Option<Duration>, poll: Duration) -> Option<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(index) = events.iter().position(|e| e.is_set()) {
                return Some(index);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            match events.first() {
                // Park on the first event so a lone waiter wakes promptly
                Some(first) if events.len() == 1 => {
                    first.wait(Some(slice));
                }
                _ => std::thread::sleep(slice),
            }
        }
    }
}
