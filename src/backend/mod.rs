//! Demultiplexer backends. Exactly one backend lives inside each loop
//! and is only ever driven from that loop's thread.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use crate::channel::Channel;

mod epoll;
mod poll;

pub(crate) use epoll::EpollBackend;
pub(crate) use poll::PollBackend;

/// One blocking wait over a set of registered channels.
///
/// `poll` fills `active` with the channels that have pending events
/// (their `revents` already stamped) and returns the wakeup timestamp.
/// The backend holds no strong references to channels; registration is
/// keyed by descriptor.
pub(crate) trait Backend: Send {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant;

    /// Register a new channel or refresh the interest mask of an
    /// existing one.
    fn update_channel(&mut self, channel: &Channel);

    /// Drop a channel whose interest mask is already empty.
    fn remove_channel(&mut self, channel: &Channel);
}

/// epoll by default; set `AXLE_USE_POLL` to force the portable poll(2)
/// backend.
pub(crate) fn new_default_backend() -> io::Result<Box<dyn Backend + Send>> {
    if std::env::var_os("AXLE_USE_POLL").is_some() {
        Ok(Box::new(PollBackend::new()))
    } else {
        Ok(Box::new(EpollBackend::new()?))
    }
}
