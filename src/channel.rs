use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::{trace, warn};

use crate::event_loop::LoopHandle;

pub(crate) const NONE_EVENT: i32 = 0;
pub(crate) const READ_EVENT: i32 = (libc::POLLIN | libc::POLLPRI) as i32;
pub(crate) const WRITE_EVENT: i32 = libc::POLLOUT as i32;

pub(crate) type ReadEventCallback = Arc<dyn Fn(Instant) + Send + Sync>;
pub(crate) type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// A selectable I/O channel: one descriptor's interest registration
/// within one event loop.
///
/// The channel does not own the descriptor; it could be a socket, an
/// eventfd or a timerfd. Interest mutation must happen on the owning
/// loop's thread; the backend records its private bookkeeping in
/// `index`.
pub struct Channel {
    loop_: LoopHandle,
    fd: RawFd,
    /// Interest mask, poll(2) constants.
    events: AtomicI32,
    /// Last events observed by the backend.
    revents: AtomicI32,
    /// Backend-private slot (pollfd index, or epoll add-state).
    index: AtomicI32,
    /// Handed to the backend so its registry stays non-owning.
    self_ref: Weak<Channel>,
    handlers: Mutex<Handlers>,
}

#[derive(Default)]
struct Handlers {
    read: Option<ReadEventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
    /// Weak back-reference to the owning object; when set, dispatch is
    /// skipped entirely if the owner is already gone.
    tie: Option<Weak<dyn Any + Send + Sync>>,
}

impl Channel {
    pub(crate) fn new(loop_: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_ref| Channel {
            loop_,
            fd,
            events: AtomicI32::new(NONE_EVENT),
            revents: AtomicI32::new(0),
            index: AtomicI32::new(-1),
            self_ref: self_ref.clone(),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> i32 {
        self.events.load(Ordering::Relaxed)
    }

    pub(crate) fn set_revents(&self, revents: i32) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.store(index, Ordering::Relaxed);
    }

    pub(crate) fn weak_ref(&self) -> Weak<Channel> {
        self.self_ref.clone()
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events() == NONE_EVENT
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.events() & WRITE_EVENT != 0
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.events() & READ_EVENT != 0
    }

    pub(crate) fn set_read_callback(&self, cb: impl Fn(Instant) + Send + Sync + 'static) {
        self.handlers.lock().unwrap().read = Some(Arc::new(cb));
    }

    pub(crate) fn set_write_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().write = Some(Arc::new(cb));
    }

    pub(crate) fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().close = Some(Arc::new(cb));
    }

    pub(crate) fn set_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().error = Some(Arc::new(cb));
    }

    /// Tie this channel to its owner so dispatch cannot outlive it.
    pub(crate) fn tie(&self, owner: Arc<dyn Any + Send + Sync>) {
        self.handlers.lock().unwrap().tie = Some(Arc::downgrade(&owner));
    }

    pub(crate) fn enable_reading(&self) {
        self.events.fetch_or(READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn enable_writing(&self) {
        self.events.fetch_or(WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_reading(&self) {
        self.events.fetch_and(!READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_writing(&self) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_all(&self) {
        self.events.store(NONE_EVENT, Ordering::Relaxed);
        self.update();
    }

    fn update(&self) {
        self.loop_.update_channel(self);
    }

    /// Unregister from the backend. The interest mask must already be
    /// empty; callers disable before removing.
    pub(crate) fn remove(&self) {
        assert!(self.is_none_event());
        self.loop_.remove_channel(self);
    }

    /// Dispatch the events the backend observed, in fixed priority:
    /// close, error, read, write.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        let tie = self.handlers.lock().unwrap().tie.clone();
        match tie {
            Some(weak) => {
                // Owner already destroyed: skip, the events are stale.
                if let Some(_guard) = weak.upgrade() {
                    self.handle_event_with_guard(receive_time);
                }
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let revents = self.revents.load(Ordering::Relaxed);
        trace!(fd = self.fd, revents = %events_to_string(revents), "dispatch");

        // Clone the callbacks out so user code can re-wire handlers
        // from inside a callback without deadlocking.
        let (read, write, close, error) = {
            let h = self.handlers.lock().unwrap();
            (h.read.clone(), h.write.clone(), h.close.clone(), h.error.clone())
        };

        if revents & libc::POLLHUP as i32 != 0 && revents & libc::POLLIN as i32 == 0 {
            warn!(fd = self.fd, "POLLHUP");
            if let Some(cb) = &close {
                cb();
            }
        }
        if revents & libc::POLLNVAL as i32 != 0 {
            warn!(fd = self.fd, "POLLNVAL");
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) as i32 != 0 {
            if let Some(cb) = &error {
                cb();
            }
        }
        if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) as i32 != 0 {
            if let Some(cb) = &read {
                cb(receive_time);
            }
        }
        if revents & libc::POLLOUT as i32 != 0 {
            if let Some(cb) = &write {
                cb();
            }
        }
    }
}

pub(crate) fn events_to_string(events: i32) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (libc::POLLIN as i32, "IN "),
        (libc::POLLPRI as i32, "PRI "),
        (libc::POLLOUT as i32, "OUT "),
        (libc::POLLHUP as i32, "HUP "),
        (libc::POLLRDHUP as i32, "RDHUP "),
        (libc::POLLERR as i32, "ERR "),
        (libc::POLLNVAL as i32, "NVAL "),
    ] {
        if events & bit != 0 {
            out.push_str(name);
        }
    }
    out
}
