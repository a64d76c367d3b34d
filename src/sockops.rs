//! Socket plumbing: owned-fd wrapper plus the raw-fd helpers the
//! connector and connection paths need.

use std::io;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, SockRef, Type};

use crate::error::Error;

/// A stream socket that owns its descriptor and closes it on drop.
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Create a non-blocking, close-on-exec TCP socket for `addr`'s family.
    pub fn new_nonblocking(addr: &SocketAddr) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        // socket2 sets SOCK_CLOEXEC itself on unix.
        let sock = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;
        Ok(Socket { fd: OwnedFd::from(sock) })
    }

    /// Wrap an already-connected descriptor (e.g. from accept4).
    pub fn from_fd(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    /// Wrap a raw descriptor, taking ownership.
    ///
    /// # Safety
    /// `fd` must be open and not owned elsewhere.
    pub unsafe fn from_raw(fd: RawFd) -> Socket {
        Socket { fd: unsafe { OwnedFd::from_raw_fd(fd) } }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Release ownership of the descriptor without closing it.
    pub fn into_raw(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        SockRef::from(&self.fd).bind(&SockAddr::from(*addr))
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        SockRef::from(&self.fd).listen(backlog)
    }

    /// Accept one connection, non-blocking and close-on-exec.
    pub fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let addr = sockaddr_to_std(&storage, len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))?;
        Ok((owned, addr))
    }

    /// Half-close the write side; the peer sees EOF after our buffered
    /// bytes drain.
    pub fn shutdown_write(&self) -> io::Result<()> {
        SockRef::from(&self.fd).shutdown(std::net::Shutdown::Write)
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.fd).set_reuse_address(on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.fd).set_reuse_port(on)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.fd).set_nodelay(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.fd).set_keepalive(on)
    }
}

/// Non-blocking connect(2) on a raw descriptor; the caller classifies
/// the errno.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let sa = SockAddr::from(*addr);
    let ret = unsafe { libc::connect(fd, sa.as_ptr() as *const libc::sockaddr, sa.len()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Plain write(2); the connection path wants raw errno, not io traits.
pub fn write(fd: RawFd, data: &[u8]) -> isize {
    unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) }
}

/// Pending SO_ERROR on the socket, consumed by the query.
pub fn get_socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 { io::Error::last_os_error().raw_os_error().unwrap_or(0) } else { err }
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_std(&storage, len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_std(&storage, len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))
}

/// A non-blocking connect can transiently bind to its own ephemeral
/// port; local == peer means the attempt must be retried on a fresh
/// socket.
pub fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

/// Blocking, thread-safe hostname resolution. Not multiplexed; call it
/// off the loop thread if latency matters.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    let mut addrs = (host, port).to_socket_addrs().map_err(Error::Io)?;
    addrs
        .next()
        .ok_or_else(|| Error::InvalidAddress(format!("{host}:{port}")))
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    unsafe { SockAddr::new(*storage, len) }.as_socket()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addrs_round_trip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = std::net::TcpStream::connect(addr).unwrap();
        let fd = stream.as_raw_fd();
        assert_eq!(peer_addr(fd).unwrap(), addr);
        assert_eq!(local_addr(fd).unwrap(), stream.local_addr().unwrap());
        assert!(!is_self_connect(fd));
        assert_eq!(get_socket_error(fd), 0);
    }

    #[test]
    fn resolve_localhost() {
        let addr = resolve("localhost", 80).unwrap();
        assert_eq!(addr.port(), 80);
        assert!(addr.ip().is_loopback());
    }
}
