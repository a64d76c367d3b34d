//! TCP client: one connector, at most one live connection, optional
//! automatic reconnect.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::callbacks::{
    ConnectionCallback, MessageCallback, TcpConnectionPtr, WriteCompleteCallback,
    default_connection_callback, default_message_callback,
};
use crate::connection::TcpConnection;
use crate::connector::Connector;
use crate::event_loop::LoopHandle;
use crate::sockops::{self, Socket};

/// Connects to one server, optionally retrying lost connections.
///
/// Dropping the client detaches the live connection: it keeps running
/// on its loop until the peer closes or the loop shuts down, but no
/// reconnect will follow.
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    loop_: LoopHandle,
    connector: Arc<Connector>,
    name: String,
    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    /// Reconnect after an established connection drops.
    retry: AtomicBool,
    /// User intent to be connected.
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnectionPtr>>,
}

impl TcpClient {
    pub fn new(
        loop_: LoopHandle,
        server_addr: SocketAddr,
        name: impl Into<String>,
    ) -> TcpClient {
        let connector = Connector::new(loop_.clone(), server_addr);
        let inner = Arc::new(ClientInner {
            loop_,
            connector,
            name: name.into(),
            connection_cb: Mutex::new(Arc::new(default_connection_callback)),
            message_cb: Mutex::new(Arc::new(default_message_callback)),
            write_complete_cb: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        inner.connector.set_new_connection_callback(Arc::new(move |fd| {
            match weak.upgrade() {
                Some(inner) => ClientInner::new_connection(&inner, fd),
                None => unsafe {
                    libc::close(fd);
                },
            }
        }));
        TcpClient { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.inner.loop_
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.connector.server_addr()
    }

    /// The live connection, if established.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.inner.connection.lock().unwrap().clone()
    }

    pub fn retry_enabled(&self) -> bool {
        self.inner.retry.load(Ordering::Acquire)
    }

    /// Reconnect automatically when an established connection goes down.
    pub fn enable_retry(&self) {
        self.inner.retry.store(true, Ordering::Release);
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

    /// Begin connecting (with the connector's backoff on failure).
    /// Thread safe.
    pub fn connect(&self) {
        info!(
            name = %self.inner.name,
            server = %self.inner.connector.server_addr(),
            "connecting"
        );
        self.inner.connect.store(true, Ordering::Release);
        self.inner.connector.start();
    }

    /// Shut down the established connection gracefully. Thread safe.
    pub fn disconnect(&self) {
        self.inner.connect.store(false, Ordering::Release);
        if let Some(conn) = self.inner.connection.lock().unwrap().clone() {
            conn.shutdown();
        }
    }

    /// Abort a pending connect attempt. Thread safe.
    pub fn stop(&self) {
        self.inner.connect.store(false, Ordering::Release);
        self.inner.connector.stop();
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        let conn = self.inner.connection.lock().unwrap().clone();
        match conn {
            Some(conn) => {
                // Orphan the connection: when it eventually closes, skip
                // the client bookkeeping (gone by then) and just destroy.
                let handle = conn.loop_handle().clone();
                let orphan = conn.clone();
                handle.run_in_loop(move || {
                    orphan.set_close_callback(Arc::new(|conn: &TcpConnectionPtr| {
                        let conn = conn.clone();
                        let handle = conn.loop_handle().clone();
                        handle.queue_in_loop(move || conn.connect_destroyed());
                    }));
                });
            }
            None => self.inner.connector.stop(),
        }
    }
}

impl ClientInner {
    fn new_connection(inner: &Arc<ClientInner>, fd: RawFd) {
        inner.loop_.assert_in_loop_thread();
        // Ownership of `fd` transfers to the socket immediately.
        let socket = unsafe { Socket::from_raw(fd) };
        let (local_addr, peer_addr) = match (sockops::local_addr(fd), sockops::peer_addr(fd)) {
            (Ok(local), Ok(peer)) => (local, peer),
            (Err(err), _) | (_, Err(err)) => {
                error!(%err, "address lookup on connected socket failed");
                return;
            }
        };
        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}:{peer_addr}#{id}", inner.name);

        let conn =
            TcpConnection::new(inner.loop_.clone(), name, socket, local_addr, peer_addr);
        conn.set_connection_callback(inner.connection_cb.lock().unwrap().clone());
        conn.set_message_callback(inner.message_cb.lock().unwrap().clone());
        if let Some(cb) = inner.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(inner);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(inner) = weak.upgrade() {
                ClientInner::remove_connection(&inner, conn);
            }
        }));

        *inner.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    /// Runs on the loop thread from the connection close path.
    fn remove_connection(inner: &Arc<ClientInner>, conn: &TcpConnectionPtr) {
        inner.loop_.assert_in_loop_thread();
        {
            let mut slot = inner.connection.lock().unwrap();
            debug_assert!(slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)));
            *slot = None;
        }
        let conn = conn.clone();
        inner.loop_.queue_in_loop(move || conn.connect_destroyed());

        if inner.retry.load(Ordering::Acquire) && inner.connect.load(Ordering::Acquire) {
            info!(
                name = %inner.name,
                server = %inner.connector.server_addr(),
                "reconnecting"
            );
            inner.connector.restart();
        }
    }
}
