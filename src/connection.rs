//! One established TCP connection, pinned to one event loop.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    WriteCompleteCallback, default_connection_callback, default_message_callback,
};
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sockops::{self, Socket};

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

/// A full-duplex TCP connection with buffered sends.
///
/// Created by [`TcpServer`](crate::TcpServer) or
/// [`TcpClient`](crate::TcpClient), never directly. All I/O happens on
/// the owning loop's thread; `send`, `shutdown` and `force_close` are
/// safe from any thread and marshal themselves over.
pub struct TcpConnection {
    loop_: LoopHandle,
    self_ref: Weak<TcpConnection>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    handlers: Mutex<Handlers>,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

struct Handlers {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

impl TcpConnection {
    pub(crate) fn new(
        loop_: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let channel = Channel::new(loop_.clone(), socket.fd());
        let conn = Arc::new_cyclic(|self_ref| TcpConnection {
            loop_,
            self_ref: self_ref.clone(),
            name,
            state: AtomicU8::new(State::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            handlers: Mutex::new(Handlers {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
                high_water_mark: None,
                close: None,
            }),
            context: Mutex::new(None),
        });
        debug!(name = %conn.name, fd = conn.socket.fd(), "connection created");

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(move |when| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(when);
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
        if let Err(err) = conn.socket.set_keep_alive(true) {
            warn!(name = %conn.name, %err, "SO_KEEPALIVE failed");
        }
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    /// The input buffer. Loop thread only, and never from inside the
    /// message callback (which already holds it).
    pub fn input_buffer(&self) -> std::sync::MutexGuard<'_, Buffer> {
        self.loop_.assert_in_loop_thread();
        self.input_buffer.lock().unwrap()
    }

    /// The output buffer. Loop thread only.
    pub fn output_buffer(&self) -> std::sync::MutexGuard<'_, Buffer> {
        self.loop_.assert_in_loop_thread();
        self.output_buffer.lock().unwrap()
    }

    /// Attach arbitrary per-connection state, e.g. a protocol decoder.
    pub fn set_context(&self, context: Box<dyn Any + Send + Sync>) {
        *self.context.lock().unwrap() = Some(context);
    }

    /// Borrow the context for the duration of `f`.
    pub fn with_context<R>(&self, f: impl FnOnce(Option<&mut (dyn Any + Send + Sync)>) -> R) -> R {
        let mut guard = self.context.lock().unwrap();
        f(guard.as_deref_mut())
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.handlers.lock().unwrap().connection = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.handlers.lock().unwrap().message = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.handlers.lock().unwrap().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
        self.handlers.lock().unwrap().high_water_mark = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.handlers.lock().unwrap().close = Some(cb);
    }

    /// Send bytes. Never blocks: what the kernel will not take
    /// immediately is appended to the output buffer and flushed as the
    /// socket becomes writable.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.to_ptr();
            let owned = data.to_vec();
            self.loop_.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Send and drain a whole buffer, e.g. a response assembled in place.
    pub fn send_buffer(&self, buffer: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(buffer.peek());
            buffer.retrieve_all();
        } else {
            let conn = self.to_ptr();
            let owned = buffer.retrieve_all_as_bytes();
            self.loop_.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!(name = %self.name, "disconnected, dropping write");
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        // Try a direct write when nothing is queued ahead of us.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            let n = sockops::write(self.channel.fd(), data);
            if n >= 0 {
                nwrote = n as usize;
                remaining = data.len() - nwrote;
                if remaining == 0 {
                    self.queue_write_complete();
                }
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!(name = %self.name, %err, "write failed");
                    if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let buffered = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            // Report only the upward crossing, not every append above it.
            if buffered + remaining >= mark && buffered < mark {
                let cb = self.handlers.lock().unwrap().high_water_mark.clone();
                if let Some(cb) = cb {
                    let conn = self.to_ptr();
                    let size = buffered + remaining;
                    self.loop_.queue_in_loop(move || cb(&conn, size));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close the write side once the output buffer drains.
    /// Thread safe and idempotent.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.to_ptr();
            self.loop_.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!(name = %self.name, %err, "shutdown failed");
            }
        }
        // Otherwise handle_write finishes the drain and shuts down then.
    }

    /// Close immediately, discarding any unsent output. Thread safe and
    /// idempotent.
    pub fn force_close(&self) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.state.store(State::Disconnecting as u8, Ordering::Release);
            let conn = self.to_ptr();
            self.loop_.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Like [`force_close`](Self::force_close) after a grace period.
    pub fn force_close_with_delay(&self, delay: Duration) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.state.store(State::Disconnecting as u8, Ordering::Release);
            let weak = self.self_ref.clone();
            self.loop_.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    fn force_close_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.handle_close();
        }
    }

    /// Resume reading after [`stop_read`](Self::stop_read). Thread safe.
    pub fn start_read(&self) {
        let conn = self.to_ptr();
        self.loop_.run_in_loop(move || {
            if !conn.channel.is_reading() {
                conn.channel.enable_reading();
            }
        });
    }

    /// Stop reading from the socket, pushing back on the peer via the
    /// kernel receive buffer. Thread safe.
    pub fn stop_read(&self) {
        let conn = self.to_ptr();
        self.loop_.run_in_loop(move || {
            if conn.channel.is_reading() {
                conn.channel.disable_reading();
            }
        });
    }

    fn to_ptr(&self) -> TcpConnectionPtr {
        // The connection is always behind the Arc built in new().
        self.self_ref.upgrade().unwrap()
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn queue_write_complete(&self) {
        let cb = self.handlers.lock().unwrap().write_complete.clone();
        if let Some(cb) = cb {
            let conn = self.to_ptr();
            self.loop_.queue_in_loop(move || cb(&conn));
        }
    }

    /// Registration half of the handshake with the owner: runs on the
    /// loop thread once the owner has finished wiring callbacks.
    pub(crate) fn connect_established(&self) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        self.channel.tie(self.to_ptr() as Arc<dyn Any + Send + Sync>);
        self.channel.enable_reading();
        let cb = self.handlers.lock().unwrap().connection.clone();
        cb(&self.to_ptr());
    }

    /// Final teardown: unregister the channel. The last thing the owner
    /// does with a dying connection.
    pub(crate) fn connect_destroyed(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connected {
            // handle_close never ran (owner-driven teardown).
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            let cb = self.handlers.lock().unwrap().connection.clone();
            cb(&self.to_ptr());
        }
        // The close path and an owner teardown can each schedule this;
        // the second pass finds the channel already unregistered.
        if self.channel.index() != -1 {
            self.channel.remove();
        }
    }

    fn handle_read(&self, receive_time: Instant) {
        self.loop_.assert_in_loop_thread();
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let cb = self.handlers.lock().unwrap().message.clone();
                cb(&self.to_ptr(), &mut *input, receive_time);
                drop(input);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(input);
                error!(name = %self.name, %err, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(name = %self.name, "connection is down, no more writing");
            return;
        }
        let mut output = self.output_buffer.lock().unwrap();
        let n = sockops::write(self.channel.fd(), output.peek());
        if n > 0 {
            output.retrieve(n as usize);
            if output.readable_bytes() == 0 {
                self.channel.disable_writing();
                self.queue_write_complete();
                let disconnecting = self.state() == State::Disconnecting;
                drop(output);
                if disconnecting {
                    self.shutdown_in_loop();
                }
            }
            // Partial write: stay interested in POLLOUT.
        } else {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!(name = %self.name, %err, "flush failed");
            }
        }
    }

    fn handle_close(&self) {
        self.loop_.assert_in_loop_thread();
        trace!(name = %self.name, state = ?self.state(), "closing");
        assert!(matches!(self.state(), State::Connected | State::Disconnecting));
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        let (connection_cb, close_cb) = {
            let h = self.handlers.lock().unwrap();
            (h.connection.clone(), h.close.clone())
        };
        let ptr = self.to_ptr();
        connection_cb(&ptr);
        // The owner's close callback runs last; it may drop its
        // reference and schedule connect_destroyed.
        if let Some(cb) = close_cb {
            cb(&ptr);
        }
    }

    fn handle_error(&self) {
        let err = sockops::get_socket_error(self.channel.fd());
        error!(
            name = %self.name,
            err = %io::Error::from_raw_os_error(err),
            "connection error"
        );
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, state = ?self.state(), "connection destroyed");
    }
}
