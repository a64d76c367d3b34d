//! Non-blocking TCP networking built on the reactor pattern: one event
//! loop per thread, driven by epoll (or poll), with buffered
//! connections, timers and loop-per-thread worker pools.
//!
//! The building blocks:
//!
//! * [`EventLoop`] / [`LoopHandle`] — the per-thread reactor and its
//!   thread-safe handle. Cross-thread work enters through
//!   [`LoopHandle::run_in_loop`].
//! * [`TcpServer`] — accepts on one loop, serves connections on a pool.
//! * [`TcpClient`] — one outbound connection with capped-backoff
//!   reconnect.
//! * [`TcpConnection`] — an established connection; sends never block,
//!   overflow lands in a growable [`Buffer`].
//!
//! Minimal echo server:
//!
//! ```no_run
//! use axle::{EventLoop, PortReuse, TcpServer};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:7000".parse().unwrap();
//! let server = TcpServer::new(event_loop.handle(), &addr, "echo", PortReuse::Disabled).unwrap();
//! server.set_message_callback(std::sync::Arc::new(|conn, buffer, _when| {
//!     let data = buffer.retrieve_all_as_bytes();
//!     conn.send(&data);
//! }));
//! server.start().unwrap();
//! event_loop.run();
//! ```

mod acceptor;
mod backend;
mod buffer;
mod callbacks;
mod channel;
mod client;
mod connection;
mod connector;
mod error;
mod event_loop;
mod server;
mod sockops;
mod thread_pool;
mod timer;
mod timer_queue;

pub use buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    TimerCallback, WriteCompleteCallback,
};
pub use client::TcpClient;
pub use connection::TcpConnection;
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use server::{PortReuse, TcpServer};
pub use sockops::resolve;
pub use thread_pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use timer::TimerId;
