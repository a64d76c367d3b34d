use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{error, trace};

use super::Backend;
use crate::channel::Channel;

// Channel `index` doubles as the epoll registration state.
const INDEX_NEW: i32 = -1;
const INDEX_ADDED: i32 = 1;
const INDEX_DELETED: i32 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// epoll(7) backend in level-triggered mode, so the dispatch contract
/// matches poll(2) exactly.
pub(crate) struct EpollBackend {
    epoll_fd: OwnedFd,
    /// Scratch list handed to epoll_wait; doubled when it comes back full.
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl EpollBackend {
    pub(crate) fn new() -> io::Result<EpollBackend> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollBackend {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    fn fill_active(&self, n: usize, active: &mut Vec<Arc<Channel>>) {
        for event in &self.events[..n] {
            let fd = event.u64 as RawFd;
            let Some(channel) = self.channels.get(&fd).and_then(Weak::upgrade) else {
                continue;
            };
            channel.set_revents(epoll_to_poll(event.events));
            active.push(channel);
        }
    }

    fn update(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: poll_to_epoll(channel.events()),
            u64: fd as u64,
        };
        trace!(fd, op = op_name(op), events = channel.events(), "epoll_ctl");
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!(fd, %err, "epoll_ctl del failed");
            } else {
                panic!("epoll_ctl {} failed for fd {fd}: {err}", op_name(op));
            }
        }
    }
}

impl Backend for EpollBackend {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = Instant::now();
        if n > 0 {
            trace!(events = n, "epoll returned");
            self.fill_active(n as usize, active);
            if n as usize == self.events.len() {
                // Came back full; there may be more pending. Grow so the
                // next wait can drain them in one call.
                self.events.resize(
                    self.events.len() * 2,
                    libc::epoll_event { events: 0, u64: 0 },
                );
            }
        } else if n == 0 {
            trace!("epoll timed out");
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(%err, "epoll_wait failed");
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        let index = channel.index();
        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.weak_ref());
            } else {
                // Re-enabling a channel that was detached but kept.
                assert!(self.channels.contains_key(&fd));
            }
            channel.set_index(INDEX_ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self.channels.contains_key(&fd));
            assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                self.update(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DELETED);
            } else {
                self.update(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!(fd, "epoll remove");
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let index = channel.index();
        assert!(index == INDEX_ADDED || index == INDEX_DELETED);
        self.channels.remove(&fd);
        if index == INDEX_ADDED {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }
}

fn poll_to_epoll(events: i32) -> u32 {
    let mut out = 0;
    if events & libc::POLLIN as i32 != 0 {
        out |= libc::EPOLLIN as u32;
    }
    if events & libc::POLLPRI as i32 != 0 {
        out |= libc::EPOLLPRI as u32;
    }
    if events & libc::POLLOUT as i32 != 0 {
        out |= libc::EPOLLOUT as u32;
    }
    out
}

fn epoll_to_poll(events: u32) -> i32 {
    let mut out = 0;
    for (ep, po) in [
        (libc::EPOLLIN, libc::POLLIN as i32),
        (libc::EPOLLPRI, libc::POLLPRI as i32),
        (libc::EPOLLOUT, libc::POLLOUT as i32),
        (libc::EPOLLHUP, libc::POLLHUP as i32),
        (libc::EPOLLRDHUP, libc::POLLRDHUP as i32),
        (libc::EPOLLERR, libc::POLLERR as i32),
    ] {
        if events & ep as u32 != 0 {
            out |= po;
        }
    }
    out
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        libc::EPOLL_CTL_DEL => "DEL",
        _ => "?",
    }
}
