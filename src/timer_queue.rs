//! Timer multiplexing: every loop owns one timerfd, armed for the
//! earliest pending expiration, and a sorted map of timers behind it.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::callbacks::TimerCallback;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::timer::{Timer, TimerId};

pub(crate) struct TimerQueue {
    loop_: LoopHandle,
    timerfd: OwnedFd,
    channel: Arc<Channel>,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Sorted by (expiration, sequence); the sequence disambiguates
    /// timers due at the same instant.
    timers: BTreeMap<(Instant, u64), Arc<Timer>>,
    /// Sequences of timers currently scheduled.
    active: HashSet<u64>,
    /// Sequences cancelled from inside their own callback; consulted
    /// before re-arming repeating timers.
    canceling: HashSet<u64>,
    calling_expired: bool,
}

impl TimerQueue {
    /// Must run on the owning loop's thread (registers a channel).
    pub(crate) fn new(loop_: LoopHandle) -> io::Result<Arc<TimerQueue>> {
        let raw = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let timerfd = unsafe { OwnedFd::from_raw_fd(raw) };
        let channel = Channel::new(loop_.clone(), timerfd.as_raw_fd());
        let queue = Arc::new(TimerQueue {
            loop_,
            timerfd,
            channel,
            inner: Mutex::new(Inner {
                timers: BTreeMap::new(),
                active: HashSet::new(),
                canceling: HashSet::new(),
                calling_expired: false,
            }),
        });
        let weak = Arc::downgrade(&queue);
        queue.channel.set_read_callback(move |_| {
            if let Some(queue) = weak.upgrade() {
                queue.handle_read();
            }
        });
        queue.channel.enable_reading();
        Ok(queue)
    }

    /// Thread safe; the insertion itself is marshalled to the loop thread.
    pub(crate) fn add_timer(
        self: Arc<Self>,
        callback: TimerCallback,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let timer = Arc::new(Timer::new(callback, when, interval));
        let id = TimerId { timer: Arc::downgrade(&timer), sequence: timer.sequence() };
        let loop_ = self.loop_.clone();
        loop_.run_in_loop(move || self.add_timer_in_loop(timer));
        id
    }

    /// Thread safe.
    pub(crate) fn cancel(self: Arc<Self>, id: TimerId) {
        let loop_ = self.loop_.clone();
        loop_.run_in_loop(move || self.cancel_in_loop(&id));
    }

    fn add_timer_in_loop(&self, timer: Arc<Timer>) {
        self.loop_.assert_in_loop_thread();
        let earliest_changed = {
            let mut inner = self.inner.lock().unwrap();
            let when = timer.expiration();
            let earliest = inner.timers.keys().next().map(|k| k.0);
            let changed = earliest.is_none_or(|e| when < e);
            inner.active.insert(timer.sequence());
            inner.timers.insert((when, timer.sequence()), timer);
            changed
        };
        if earliest_changed {
            self.reset_timerfd();
        }
    }

    fn cancel_in_loop(&self, id: &TimerId) {
        self.loop_.assert_in_loop_thread();
        let Some(timer) = id.timer.upgrade() else {
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.active.remove(&id.sequence) {
            let removed = inner.timers.remove(&(timer.expiration(), id.sequence));
            debug_assert!(removed.is_some());
        } else if inner.calling_expired {
            // Self-cancel from inside the callback: suppress re-arming.
            inner.canceling.insert(id.sequence);
        }
    }

    fn handle_read(&self) {
        self.loop_.assert_in_loop_thread();
        read_timerfd(self.timerfd.as_raw_fd());
        let now = Instant::now();

        let expired = {
            let mut inner = self.inner.lock().unwrap();
            inner.canceling.clear();
            inner.calling_expired = true;
            let not_due = inner.timers.split_off(&(now, u64::MAX));
            let due = std::mem::replace(&mut inner.timers, not_due);
            let mut expired = Vec::with_capacity(due.len());
            for ((_, sequence), timer) in due {
                inner.active.remove(&sequence);
                expired.push(timer);
            }
            expired
        };

        // Callbacks run unlocked; they may add or cancel timers freely.
        for timer in &expired {
            timer.run();
        }

        self.inner.lock().unwrap().calling_expired = false;
        self.restart_expired(expired, now);
    }

    fn restart_expired(&self, expired: Vec<Arc<Timer>>, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        for timer in expired {
            if timer.repeat() && !inner.canceling.contains(&timer.sequence()) {
                timer.restart(now);
                inner.active.insert(timer.sequence());
                inner.timers.insert((timer.expiration(), timer.sequence()), timer);
            }
        }
        let next = inner.timers.keys().next().map(|k| k.0);
        drop(inner);
        if next.is_some() {
            self.reset_timerfd();
        }
    }

    /// Re-arm the timerfd for the current earliest expiration.
    fn reset_timerfd(&self) {
        let next = self.inner.lock().unwrap().timers.keys().next().map(|k| k.0);
        let Some(when) = next else {
            return;
        };
        // Floor the delay so an already-due timer still produces a
        // readable event instead of disarming the fd.
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(Duration::from_micros(100));
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        let ret = unsafe {
            libc::timerfd_settime(self.timerfd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if ret < 0 {
            error!(err = %io::Error::last_os_error(), "timerfd_settime failed");
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

fn read_timerfd(fd: RawFd) {
    let mut count: u64 = 0;
    let n = unsafe {
        libc::read(fd, &mut count as *mut u64 as *mut libc::c_void, std::mem::size_of::<u64>())
    };
    trace!(count, "timerfd fired");
    if n != std::mem::size_of::<u64>() as isize {
        error!(n, "short read from timerfd");
    }
}
