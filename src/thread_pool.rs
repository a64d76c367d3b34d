//! Loop-per-thread workers and the round-robin pool that owns them.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};

/// Runs before a worker loop starts, on the worker thread; use it for
/// per-thread setup such as naming or affinity.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// A thread whose entire life is one [`EventLoop::run`].
pub struct EventLoopThread {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawn the thread and block until its loop exists.
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> Result<EventLoopThread, Error> {
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                // Loop creation failure on a worker is unrecoverable;
                // the startup handshake below reports it as an error.
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                if let Some(init) = &init {
                    init(&event_loop.handle());
                }
                if tx.send(Ok(event_loop.handle())).is_err() {
                    return;
                }
                event_loop.run();
                debug!("worker loop exited");
            })
            .map_err(Error::ThreadSpawn)?;

        let handle = rx
            .recv()
            .map_err(|_| {
                Error::ThreadSpawn(io::Error::other("worker exited during startup"))
            })??;
        Ok(EventLoopThread { handle, thread: Some(thread) })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Worker loops for a [`TcpServer`](crate::TcpServer), dealt out
/// round-robin. With zero threads the owner's loop does all the I/O.
pub struct EventLoopThreadPool {
    base_loop: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    handles: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: LoopHandle, name: String) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name,
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started);
        self.num_threads = num_threads;
    }

    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> Result<(), Error> {
        assert!(!self.started);
        self.base_loop.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let thread =
                EventLoopThread::start(format!("{}-io-{i}", self.name), init.clone())?;
            self.handles.push(thread.handle().clone());
            self.threads.push(thread);
        }
        if self.num_threads == 0
            && let Some(init) = init
        {
            init(&self.base_loop);
        }
        Ok(())
    }

    /// The loop for the next connection. Round-robin over the workers;
    /// the base loop itself when the pool is empty.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started);
        if self.handles.is_empty() {
            return self.base_loop.clone();
        }
        let handle = self.handles[self.next].clone();
        self.next = (self.next + 1) % self.handles.len();
        handle
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.handles.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.handles.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn worker_thread_runs_tasks_on_its_own_loop() {
        let worker = EventLoopThread::start("pool-test".into(), None).unwrap();
        let (tx, rx) = mpsc::channel();
        worker.handle().run_in_loop(move || {
            tx.send(std::thread::current().name().map(String::from)).unwrap();
        });
        let name = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("pool-test"));
    }

    #[test]
    fn init_callback_runs_once_per_worker() {
        let event_loop = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(event_loop.handle(), "init".into());
        pool.set_thread_num(3);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        pool.start(Some(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn round_robin_cycles_through_workers() {
        let event_loop = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(event_loop.handle(), "rr".into());
        pool.set_thread_num(2);
        pool.start(None).unwrap();

        let ids = Arc::new(Mutex::new(Vec::new()));
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let handle = pool.get_next_loop();
            let ids = ids.clone();
            let (tx, rx) = mpsc::channel();
            handle.run_in_loop(move || {
                ids.lock().unwrap().push(std::thread::current().id());
                tx.send(()).unwrap();
            });
            receivers.push(rx);
        }
        for rx in receivers {
            rx.recv().unwrap();
        }
        let ids = ids.lock().unwrap();
        assert_eq!(ids[0], ids[2]);
        assert_eq!(ids[1], ids[3]);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn empty_pool_hands_out_base_loop() {
        let event_loop = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(event_loop.handle(), "solo".into());
        pool.start(None).unwrap();
        let handle = pool.get_next_loop();
        assert!(handle.is_in_loop_thread());
    }
}
