use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use crate::callbacks::TimerCallback;

static NUM_CREATED: AtomicU64 = AtomicU64::new(0);

/// One scheduled callback, optionally repeating.
pub(crate) struct Timer {
    callback: TimerCallback,
    expiration: Mutex<Instant>,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(callback: TimerCallback, when: Instant, interval: Option<Duration>) -> Timer {
        Timer {
            callback,
            expiration: Mutex::new(when),
            interval,
            sequence: NUM_CREATED.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn run(&self) {
        (self.callback)();
    }

    pub(crate) fn expiration(&self) -> Instant {
        *self.expiration.lock().unwrap()
    }

    pub(crate) fn repeat(&self) -> bool {
        self.interval.is_some()
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Move the expiration one interval past `now`. Only meaningful for
    /// repeating timers.
    pub(crate) fn restart(&self, now: Instant) {
        if let Some(interval) = self.interval {
            *self.expiration.lock().unwrap() = now + interval;
        }
    }
}

/// Opaque handle identifying a scheduled timer, for cancellation.
///
/// Holds no strong reference; cancelling a timer that already fired (and
/// does not repeat) is a no-op.
#[derive(Clone)]
pub struct TimerId {
    pub(crate) timer: Weak<Timer>,
    pub(crate) sequence: u64,
}
