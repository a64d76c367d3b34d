//! Active connection establishment with capped exponential retry.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sockops::{self, Socket};

const INIT_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 30 * 1000;

pub(crate) type NewConnectionCallback = Arc<dyn Fn(RawFd) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            1 => State::Connecting,
            2 => State::Connected,
            _ => State::Disconnected,
        }
    }
}

/// Drives a non-blocking connect: watches the pending socket for
/// writability, classifies the outcome, and retries transient failures
/// with doubling delay. Hands the connected descriptor off raw; the
/// owner wraps it into a connection.
pub(crate) struct Connector {
    loop_: LoopHandle,
    self_ref: Weak<Connector>,
    server_addr: SocketAddr,
    state: AtomicU8,
    /// User intent: `start` sets it, `stop` clears it. A retry timer
    /// that fires after `stop` sees it cleared and gives up.
    connect: AtomicBool,
    retry_delay_ms: AtomicU64,
    channel: Mutex<Option<Arc<Channel>>>,
    new_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    pub(crate) fn new(loop_: LoopHandle, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|self_ref| Connector {
            loop_,
            self_ref: self_ref.clone(),
            server_addr,
            state: AtomicU8::new(State::Disconnected as u8),
            connect: AtomicBool::new(false),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY_MS),
            channel: Mutex::new(None),
            new_connection: Mutex::new(None),
        })
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection.lock().unwrap() = Some(cb);
    }

    pub(crate) fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Thread safe.
    pub(crate) fn start(&self) {
        self.connect.store(true, Ordering::Release);
        let connector = self.to_arc();
        self.loop_.run_in_loop(move || connector.start_in_loop());
    }

    /// Thread safe. Stops a pending attempt; an established connection
    /// is unaffected.
    pub(crate) fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        let connector = self.to_arc();
        self.loop_.queue_in_loop(move || connector.stop_in_loop());
    }

    /// Begin a fresh attempt with the retry delay reset. Loop thread only.
    pub(crate) fn restart(&self) {
        self.loop_.assert_in_loop_thread();
        self.set_state(State::Disconnected);
        self.retry_delay_ms.store(INIT_RETRY_DELAY_MS, Ordering::Relaxed);
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    fn start_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        debug_assert_eq!(self.state(), State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            self.attempt();
        } else {
            debug!("connect aborted before first attempt");
        }
    }

    fn stop_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            let fd = self.detach_channel();
            // `connect` is false, so this just closes the socket.
            self.retry(fd);
        }
    }

    fn attempt(&self) {
        let socket = match Socket::new_nonblocking(&self.server_addr) {
            Ok(socket) => socket,
            Err(err) => panic!("socket creation failed: {err}"),
        };
        let fd = socket.into_raw();
        let errno = match sockops::connect(fd, &self.server_addr) {
            Ok(()) => 0,
            Err(err) => err.raw_os_error().unwrap_or(0),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(fd),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(fd),

            libc::EACCES
            | libc::EPERM
            | libc::EAFNOSUPPORT
            | libc::EALREADY
            | libc::EBADF
            | libc::EFAULT
            | libc::ENOTSOCK => {
                error!(errno, "connect error");
                close_fd(fd);
            }

            _ => {
                error!(errno, "unexpected connect error");
                close_fd(fd);
            }
        }
    }

    /// The connect is in flight; watch the socket for writability.
    fn connecting(&self, fd: RawFd) {
        self.set_state(State::Connecting);
        let channel = Channel::new(self.loop_.clone(), fd);
        let weak = self.self_ref.clone();
        channel.set_write_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        });
        let weak = self.self_ref.clone();
        channel.set_error_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        });
        let mut slot = self.channel.lock().unwrap();
        debug_assert!(slot.is_none());
        channel.enable_writing();
        *slot = Some(channel);
    }

    /// Unregister the watch channel and take back the raw descriptor.
    /// The channel object itself is freed on the next loop pass, past
    /// any dispatch frame that may still reference it.
    fn detach_channel(&self) -> RawFd {
        let channel = self.channel.lock().unwrap().take();
        let channel = channel.unwrap();
        channel.disable_all();
        channel.remove();
        let fd = channel.fd();
        self.loop_.queue_in_loop(move || drop(channel));
        fd
    }

    fn handle_write(&self) {
        trace!(state = ?self.state(), "connector writable");
        if self.state() != State::Connecting {
            debug_assert_eq!(self.state(), State::Disconnected);
            return;
        }
        let fd = self.detach_channel();
        let errno = sockops::get_socket_error(fd);
        if errno != 0 {
            warn!(
                err = %io::Error::from_raw_os_error(errno),
                "connect finished with error"
            );
            self.retry(fd);
        } else if sockops::is_self_connect(fd) {
            warn!("self connect, retrying");
            self.retry(fd);
        } else {
            self.set_state(State::Connected);
            if self.connect.load(Ordering::Acquire) {
                let cb = self.new_connection.lock().unwrap().clone();
                match cb {
                    Some(cb) => cb(fd),
                    None => close_fd(fd),
                }
            } else {
                close_fd(fd);
            }
        }
    }

    fn handle_error(&self) {
        if self.state() == State::Connecting {
            let fd = self.detach_channel();
            let errno = sockops::get_socket_error(fd);
            error!(err = %io::Error::from_raw_os_error(errno), "connector error");
            self.retry(fd);
        }
    }

    /// Close the failed socket and, if still wanted, schedule the next
    /// attempt with the delay doubled up to the cap.
    fn retry(&self, fd: RawFd) {
        close_fd(fd);
        self.set_state(State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            let delay = self.retry_delay_ms.load(Ordering::Relaxed);
            info!(server = %self.server_addr, delay_ms = delay, "retrying connect");
            let connector = self.to_arc();
            self.loop_.run_after(Duration::from_millis(delay), move || {
                if connector.connect.load(Ordering::Acquire) {
                    connector.start_in_loop();
                }
            });
            self.retry_delay_ms
                .store((delay * 2).min(MAX_RETRY_DELAY_MS), Ordering::Relaxed);
        } else {
            debug!("connect abandoned");
        }
    }

    fn to_arc(&self) -> Arc<Connector> {
        // The connector is always behind the Arc built in new().
        self.self_ref.upgrade().unwrap()
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
