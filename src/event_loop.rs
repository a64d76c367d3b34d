//! The reactor core: one loop per thread, waiting on a backend and
//! dispatching channel events, pending tasks and timers.

use std::cell::{Cell, RefCell};
use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Once, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::backend::{self, Backend};
use crate::callbacks::TimerCallback;
use crate::channel::Channel;
use crate::error::Error;
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;

/// Upper bound for one backend wait; pending-task wakeups and timer
/// expirations interrupt it early.
const POLL_TIME_MS: i32 = 10_000;

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THIS_THREAD: RefCell<Option<Weak<LoopShared>>> = const { RefCell::new(None) };
}

// A process serving TCP must not die on writes to closed sockets.
fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// State reachable from any thread through a [`LoopHandle`].
pub(crate) struct LoopShared {
    thread: ThreadId,
    quit: AtomicBool,
    wakeup_fd: OwnedFd,
    pending: Mutex<Vec<Task>>,
    /// Only the loop thread ever locks this; the mutex exists to keep
    /// `LoopShared: Sync` without unsafe.
    backend: Mutex<Box<dyn Backend + Send>>,
    timer_queue: OnceLock<Weak<TimerQueue>>,
    poll_return: Mutex<Instant>,
}

/// An event loop, owned by exactly one thread.
///
/// `EventLoop` itself is deliberately not `Send`; other threads interact
/// with it through the cloneable [`LoopHandle`] returned by
/// [`EventLoop::handle`].
pub struct EventLoop {
    shared: Arc<LoopShared>,
    timer_queue: Arc<TimerQueue>,
    wakeup_channel: Arc<Channel>,
    looping: Cell<bool>,
    iteration: Cell<u64>,
    active: RefCell<Vec<Arc<Channel>>>,
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    /// Create the loop for the current thread.
    ///
    /// Panics if this thread already owns a live loop.
    pub fn new() -> Result<EventLoop, Error> {
        ignore_sigpipe();
        LOOP_IN_THIS_THREAD.with(|slot| {
            if slot.borrow().as_ref().is_some_and(|w| w.strong_count() > 0) {
                panic!("another EventLoop already exists in thread {:?}", thread::current().id());
            }
        });

        let wakeup_fd = create_eventfd()?;
        let backend = backend::new_default_backend().map_err(Error::Io)?;
        let shared = Arc::new(LoopShared {
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            wakeup_fd,
            pending: Mutex::new(Vec::new()),
            backend: Mutex::new(backend),
            timer_queue: OnceLock::new(),
            poll_return: Mutex::new(Instant::now()),
        });
        LOOP_IN_THIS_THREAD.with(|slot| {
            *slot.borrow_mut() = Some(Arc::downgrade(&shared));
        });

        let handle = LoopHandle { shared: shared.clone() };
        let wakeup_channel = Channel::new(handle.clone(), shared.wakeup_fd.as_raw_fd());
        let raw_wakeup = shared.wakeup_fd.as_raw_fd();
        wakeup_channel.set_read_callback(move |_| drain_eventfd(raw_wakeup));
        wakeup_channel.enable_reading();

        let timer_queue = TimerQueue::new(handle).map_err(Error::Io)?;
        shared
            .timer_queue
            .set(Arc::downgrade(&timer_queue))
            .unwrap_or_else(|_| unreachable!());

        trace!(thread = ?shared.thread, "event loop created");
        Ok(EventLoop {
            shared,
            timer_queue,
            wakeup_channel,
            looping: Cell::new(false),
            iteration: Cell::new(0),
            active: RefCell::new(Vec::new()),
            _not_send: PhantomData,
        })
    }

    /// A cloneable, thread-safe reference to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: self.shared.clone() }
    }

    /// Run the loop until [`LoopHandle::quit`] is called.
    ///
    /// Each pass: wait on the backend, dispatch active channels, then
    /// drain the pending-task queue.
    pub fn run(&self) {
        assert!(!self.looping.get());
        self.handle().assert_in_loop_thread();
        self.looping.set(true);
        trace!("event loop start");

        while !self.shared.quit.load(Ordering::Acquire) {
            let mut active = self.active.borrow_mut();
            active.clear();
            let now = {
                let mut backend = self.shared.backend.lock().unwrap();
                backend.poll(POLL_TIME_MS, &mut active)
            };
            *self.shared.poll_return.lock().unwrap() = now;
            self.iteration.set(self.iteration.get() + 1);

            for channel in active.iter() {
                channel.handle_event(now);
            }
            drop(active);

            self.do_pending_tasks();
        }

        trace!("event loop stop");
        self.looping.set(false);
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }

    fn do_pending_tasks(&self) {
        // Swap the queue out first: tasks queued from inside a task run
        // on the next pass, and the queueing path wakes the loop.
        let tasks = std::mem::take(&mut *self.shared.pending.lock().unwrap());
        for task in tasks {
            task();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        LOOP_IN_THIS_THREAD.with(|slot| {
            *slot.borrow_mut() = None;
        });
    }
}

/// Thread-safe handle to an [`EventLoop`]; the only way to reach a loop
/// from another thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop owned by thread {:?} was accessed from thread {:?}",
                self.shared.thread,
                thread::current().id()
            );
        }
    }

    /// Run `task` on the loop thread: immediately when called from it,
    /// otherwise queued with a wakeup.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the end of the current (or next) loop pass, even
    /// when called from the loop thread itself.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.pending.lock().unwrap().push(Box::new(task));
        // Unconditional: a task queued from the loop thread before run()
        // or mid-drain would otherwise wait out a full poll timeout.
        self.wakeup();
    }

    /// Ask the loop to exit after its current pass. Idempotent, callable
    /// from any thread.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `callback` once at `when`.
    pub fn run_at(&self, when: Instant, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.timer_queue().add_timer(Arc::new(callback) as TimerCallback, when, None)
    }

    /// Run `callback` once after `delay`.
    pub fn run_after(&self, delay: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Run `callback` every `interval`, first firing one interval from now.
    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> TimerId {
        let timer_queue = self.timer_queue();
        timer_queue.add_timer(
            Arc::new(callback) as TimerCallback,
            Instant::now() + interval,
            Some(interval),
        )
    }

    /// Cancel a scheduled timer. A no-op if it already fired and does
    /// not repeat.
    pub fn cancel(&self, id: TimerId) {
        self.timer_queue().cancel(id);
    }

    /// When the backend last returned, i.e. the receive time stamped on
    /// the current pass's events.
    pub fn poll_return_time(&self) -> Instant {
        *self.shared.poll_return.lock().unwrap()
    }

    fn timer_queue(&self) -> Arc<TimerQueue> {
        self.shared
            .timer_queue
            .get()
            .and_then(Weak::upgrade)
            .unwrap_or_else(|| panic!("event loop has been destroyed"))
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.shared.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            error!(n, "short write to wakeup fd");
        }
    }

    pub(crate) fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.shared.backend.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.shared.backend.lock().unwrap().remove_channel(channel);
    }
}

fn create_eventfd() -> Result<OwnedFd, Error> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn drain_eventfd(fd: RawFd) {
    let mut count: u64 = 0;
    let n = unsafe {
        libc::read(fd, &mut count as *mut u64 as *mut libc::c_void, std::mem::size_of::<u64>())
    };
    if n != std::mem::size_of::<u64>() as isize {
        error!(n, "short read from wakeup fd");
    }
}
