//! Shared callback aliases. All callbacks are `Arc`'d so the runtime can
//! clone them out of their slots before invocation, letting user code
//! re-wire handlers from inside a handler.

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;

pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Fired when a connection is established and again when it goes down;
/// check [`TcpConnection::connected`] to tell which.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired when bytes arrive; the callback owns consumption of the input
/// buffer and may leave a partial message for the next round.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;

/// Fired when the output buffer fully drains to the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired once per upward crossing of the output-buffer high water mark,
/// with the buffered size at the crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

pub(crate) fn default_connection_callback(conn: &TcpConnectionPtr) {
    trace!(
        local = %conn.local_addr(),
        peer = %conn.peer_addr(),
        up = conn.connected(),
        "connection state"
    );
}

pub(crate) fn default_message_callback(_conn: &TcpConnectionPtr, buffer: &mut Buffer, _when: Instant) {
    buffer.retrieve_all();
}
