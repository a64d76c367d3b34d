use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, warn};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sockops::Socket;

pub(crate) type NewConnectionCallback = Arc<dyn Fn(OwnedFd, SocketAddr) + Send + Sync>;

/// Owns the listening socket and hands accepted descriptors to the
/// server.
pub(crate) struct Acceptor {
    loop_: LoopHandle,
    /// `Some` until drop, where the socket moves into the deferred
    /// teardown task so the descriptor outlives its backend entry.
    listen_socket: Option<Socket>,
    channel: Arc<Channel>,
    new_connection: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
    /// Spare descriptor for the EMFILE dance: close it, accept the
    /// pending connection onto the freed slot, close that, reopen.
    idle_fd: Mutex<Option<OwnedFd>>,
}

impl Acceptor {
    pub(crate) fn new(
        loop_: LoopHandle,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_nonblocking(listen_addr)?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr)?;
        let channel = Channel::new(loop_.clone(), socket.fd());
        let acceptor = Arc::new(Acceptor {
            loop_,
            listen_socket: Some(socket),
            channel,
            new_connection: Mutex::new(None),
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(Some(open_idle_fd()?)),
        });
        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection.lock().unwrap() = Some(cb);
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        crate::sockops::local_addr(self.socket().fd())
    }

    /// Must run on the loop thread.
    pub(crate) fn listen(&self) -> io::Result<()> {
        self.loop_.assert_in_loop_thread();
        self.socket().listen(libc::SOMAXCONN)?;
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        Ok(())
    }

    fn socket(&self) -> &Socket {
        self.listen_socket.as_ref().unwrap()
    }

    fn handle_read(&self) {
        self.loop_.assert_in_loop_thread();
        match self.socket().accept() {
            Ok((fd, peer_addr)) => {
                let cb = self.new_connection.lock().unwrap().clone();
                match cb {
                    Some(cb) => cb(fd, peer_addr),
                    None => drop(fd),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) if err.raw_os_error() == Some(libc::EMFILE) => {
                warn!("fd table full, shedding one connection");
                self.shed_connection();
            }
            Err(err) => error!(%err, "accept failed"),
        }
    }

    /// Out of descriptors: free the reserve, accept-and-close the
    /// pending connection so it does not sit in the backlog retrying,
    /// then retake the reserve.
    fn shed_connection(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        drop(idle.take());

        let accepted = unsafe {
            libc::accept(self.socket().fd(), std::ptr::null_mut(), std::ptr::null_mut())
        };
        if accepted >= 0 {
            unsafe { libc::close(accepted) };
        }

        match open_idle_fd() {
            Ok(fd) => *idle = Some(fd),
            Err(err) => error!(%err, "could not reopen reserve fd"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.listening() {
            // The last owner may drop on any thread; channel teardown
            // must still happen on the loop thread, and the descriptor
            // must stay open until it is out of the backend.
            let channel = self.channel.clone();
            let socket = self.listen_socket.take();
            self.loop_.run_in_loop(move || {
                channel.disable_all();
                channel.remove();
                drop(socket);
            });
        }
    }
}

fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
