use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{error, trace};

use super::Backend;
use crate::channel::Channel;

/// poll(2) backend. Keeps a dense pollfd array; a channel's `index` is
/// its slot in that array. Channels with an empty interest mask stay in
/// the array with the fd negated (`-fd - 1`) so the kernel ignores the
/// slot without us reshuffling on every disable.
pub(crate) struct PollBackend {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl PollBackend {
    pub(crate) fn new() -> PollBackend {
        PollBackend { pollfds: Vec::new(), channels: HashMap::new() }
    }

    fn fill_active(&self, mut n: i32, active: &mut Vec<Arc<Channel>>) {
        for pfd in &self.pollfds {
            if n == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            n -= 1;
            // Parked slots (negative fd) never report events.
            let Some(channel) = self.channels.get(&pfd.fd).and_then(Weak::upgrade) else {
                continue;
            };
            channel.set_revents(pfd.revents as i32);
            active.push(channel);
        }
    }
}

impl Backend for PollBackend {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let n = unsafe {
            libc::poll(self.pollfds.as_mut_ptr(), self.pollfds.len() as libc::nfds_t, timeout_ms)
        };
        let now = Instant::now();
        if n > 0 {
            trace!(events = n, "poll returned");
            self.fill_active(n, active);
        } else if n == 0 {
            trace!("poll timed out");
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(%err, "poll failed");
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!(fd, events = channel.events(), "poll update");
        if channel.index() < 0 {
            // New registration.
            assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd,
                events: channel.events() as libc::c_short,
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            self.channels.insert(fd, channel.weak_ref());
        } else {
            assert!(self.channels.contains_key(&fd));
            let idx = channel.index() as usize;
            let pfd = &mut self.pollfds[idx];
            assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.events = channel.events() as libc::c_short;
            pfd.revents = 0;
            if channel.is_none_event() {
                // Park the slot so poll ignores it.
                pfd.fd = -fd - 1;
            } else {
                pfd.fd = fd;
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!(fd, "poll remove");
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let idx = channel.index() as usize;
        assert!(self.pollfds[idx].fd == -fd - 1);
        self.channels.remove(&fd);

        // Swap-remove: move the tail slot into the hole and repoint its
        // channel's index.
        let last = self.pollfds.len() - 1;
        if idx != last {
            let moved_fd = self.pollfds[last].fd;
            self.pollfds.swap(idx, last);
            let real_fd = if moved_fd < 0 { -moved_fd - 1 } else { moved_fd };
            if let Some(moved) = self.channels.get(&real_fd).and_then(Weak::upgrade) {
                moved.set_index(idx as i32);
            }
        }
        self.pollfds.pop();
        channel.set_index(-1);
    }
}
