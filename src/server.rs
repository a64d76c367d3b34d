//! TCP server: acceptor on the base loop, connections dealt out to a
//! pool of I/O loops.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::collections::HashMap;

use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, TcpConnectionPtr, WriteCompleteCallback,
    default_connection_callback, default_message_callback,
};
use crate::connection::TcpConnection;
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::sockops::{self, Socket};
use crate::thread_pool::{EventLoopThreadPool, ThreadInitCallback};

/// Whether additional servers may bind the same address via
/// `SO_REUSEPORT`, spreading accepts across processes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PortReuse {
    Disabled,
    Enabled,
}

/// A multi-loop TCP server.
///
/// Set callbacks, choose a pool size, then [`start`](TcpServer::start).
/// Dropping the server closes the listener and tears down every live
/// connection on its owning loop.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    loop_: LoopHandle,
    name: String,
    hostport: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
}

impl TcpServer {
    pub fn new(
        loop_: LoopHandle,
        listen_addr: &SocketAddr,
        name: impl Into<String>,
        port_reuse: PortReuse,
    ) -> Result<TcpServer, Error> {
        let acceptor =
            Acceptor::new(loop_.clone(), listen_addr, port_reuse == PortReuse::Enabled)?;
        let name = name.into();
        let inner = Arc::new(ServerInner {
            pool: Mutex::new(EventLoopThreadPool::new(loop_.clone(), name.clone())),
            loop_,
            hostport: listen_addr.to_string(),
            name,
            acceptor,
            connection_cb: Mutex::new(Arc::new(default_connection_callback)),
            message_cb: Mutex::new(Arc::new(default_message_callback)),
            write_complete_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.acceptor.set_new_connection_callback(Arc::new(move |fd, peer_addr| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::new_connection(&inner, fd, peer_addr);
            }
        }));
        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn hostport(&self) -> &str {
        &self.inner.hostport
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.inner.loop_
    }

    /// The bound address, with the kernel-chosen port when the listen
    /// address used port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.inner.acceptor.local_addr()?)
    }

    /// Number of I/O loops accepting connection work; 0 (the default)
    /// runs everything on the base loop. Call before `start`.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().unwrap().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_cb.lock().unwrap() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_cb.lock().unwrap() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.inner.thread_init_cb.lock().unwrap() = Some(cb);
    }

    /// Spawn the pool and begin accepting. Idempotent; thread safe.
    pub fn start(&self) -> Result<(), Error> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(name = %self.inner.name, addr = %self.inner.hostport, "server starting");
        let init = self.inner.thread_init_cb.lock().unwrap().clone();
        let inner = self.inner.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.loop_.run_in_loop(move || {
            let result = inner
                .pool
                .lock()
                .unwrap()
                .start(init)
                .and_then(|()| inner.acceptor.listen().map_err(Error::Io));
            let _ = tx.send(result);
        });
        rx.recv()
            .map_err(|_| Error::Io(std::io::Error::other("loop gone during start")))?
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections = std::mem::take(&mut *self.inner.connections.lock().unwrap());
        for (_, conn) in connections {
            let c = conn.clone();
            conn.loop_handle().run_in_loop(move || c.connect_destroyed());
        }
    }
}

impl ServerInner {
    fn new_connection(inner: &Arc<ServerInner>, fd: OwnedFd, peer_addr: SocketAddr) {
        inner.loop_.assert_in_loop_thread();
        let io_loop = inner.pool.lock().unwrap().get_next_loop();
        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{id}", inner.name, inner.hostport);
        info!(conn = %name, peer = %peer_addr, "new connection");

        let local_addr = match sockops::local_addr(fd.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!(%err, "getsockname on accepted socket failed");
                return;
            }
        };
        let conn = TcpConnection::new(
            io_loop.clone(),
            name.clone(),
            Socket::from_fd(fd),
            local_addr,
            peer_addr,
        );
        conn.set_connection_callback(inner.connection_cb.lock().unwrap().clone());
        conn.set_message_callback(inner.message_cb.lock().unwrap().clone());
        if let Some(cb) = inner.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(inner);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::remove_connection(&inner, conn);
            }
        }));

        inner.connections.lock().unwrap().insert(name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Runs on the connection's loop (from the close path); hops to the
    /// base loop to fix up the map, then back to destroy the channel.
    fn remove_connection(inner: &Arc<ServerInner>, conn: &TcpConnectionPtr) {
        let inner = inner.clone();
        let conn = conn.clone();
        let base = inner.loop_.clone();
        base.run_in_loop(move || {
            inner.loop_.assert_in_loop_thread();
            info!(name = %inner.name, conn = %conn.name(), "removing connection");
            inner.connections.lock().unwrap().remove(conn.name());
            let c = conn.clone();
            conn.loop_handle().queue_in_loop(move || c.connect_destroyed());
        });
    }
}
