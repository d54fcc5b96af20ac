//! Thin safe wrappers over the raw syscalls the reactor drives.
//!
//! Everything here translates `errno` into `io::Error` and keeps the
//! WouldBlock conventions in one place so the event loop never touches
//! `libc` directly.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::SatieResult;

pub use libc::epoll_event;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLET: u32 = libc::EPOLLET as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;

// ---- Socket Operations ----

/// Create a non-blocking TCP listener with SO_REUSEADDR and, optionally,
/// a lingering close (SO_LINGER, 1s) on the listening socket.
pub fn create_listen_socket(host: &str, port: u16, opt_linger: bool) -> SatieResult<c_int> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|_| crate::error::SatieError::Addr(format!("{}:{}", host, port)))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if opt_linger {
            let linger = libc::linger {
                l_onoff: 1,
                l_linger: 1,
            };
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const c_void,
                mem::size_of_val(&linger) as socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }
        }

        // TCP_NODELAY on the listener is inherited by accepted sockets.
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        if let Err(e) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(e);
        }

        if libc::listen(fd, 4096) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> SatieResult<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
        }
        Ok(())
    }
}

/// The port a bound socket actually landed on (port 0 binds pick one).
pub fn local_port(fd: c_int) -> SatieResult<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(sockaddr_to_addr(&storage).port())
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> SocketAddr {
    match storage.ss_family as c_int {
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            )
        }
        _ => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))),
                u16::from_be(sin.sin_port),
            )
        }
    }
}

/// Accept one pending connection. `Ok(None)` when the accept queue is drained.
pub fn accept_connection(listen_fd: c_int) -> SatieResult<Option<(c_int, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some((fd, sockaddr_to_addr(&storage))))
        }
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll ----

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> SatieResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register a file descriptor. Callers compose the full flag set
    /// (EPOLLET / EPOLLONESHOT are per-registration policy, not hardwired).
    pub fn add(&self, fd: c_int, token: u64, events: u32) -> SatieResult<()> {
        let mut event = epoll_event { events, u64: token };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Re-arm or change interest. The call re-delivers a pending edge after
    /// an EPOLLONESHOT registration has fired.
    pub fn modify(&self, fd: c_int, token: u64, events: u32) -> SatieResult<()> {
        let mut event = epoll_event { events, u64: token };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> SatieResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Wait for readiness. `timeout_ms < 0` blocks indefinitely. EINTR is
    /// reported as zero events so the loop re-evaluates its deadline.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> SatieResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Non-blocking I/O ----

/// Scatter read into up to two buffers in one syscall.
/// `Ok(0)` is end-of-stream; WouldBlock surfaces as an error for the caller
/// to match on.
pub fn readv_fd(fd: c_int, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(2);
    for (i, buf) in bufs.iter_mut().take(iov_count).enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    unsafe {
        let res = libc::readv(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Vectored write of header + body segments in a single syscall.
/// WouldBlock is reported as `Ok(0)`: nothing went out, re-arm and retry.
pub fn writev_fd(fd: c_int, bufs: &[&[u8]]) -> io::Result<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }

    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);
    for (i, buf) in bufs.iter().take(iov_count).enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(0)
            } else {
                Err(err)
            }
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Reactor Wake Pipe ----

/// Create a Unix pipe with a non-blocking read end. Returns (read_fd, write_fd).
pub fn create_wake_pipe() -> SatieResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err.into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Post a connection id to the reactor (blocking 4-byte write; a pipe write
/// of this size is atomic).
pub fn send_token(pipe_write_fd: c_int, id: c_int) -> io::Result<()> {
    let bytes = id.to_ne_bytes();
    unsafe {
        let n = libc::write(pipe_write_fd, bytes.as_ptr() as *const c_void, 4);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Drain one connection id from the wake pipe. `None` when empty.
pub fn recv_token(pipe_read_fd: c_int) -> io::Result<Option<c_int>> {
    let mut buf = [0u8; 4];
    unsafe {
        let n = libc::read(pipe_read_fd, buf.as_mut_ptr() as *mut c_void, 4);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else if n == 4 {
            Ok(Some(c_int::from_ne_bytes(buf)))
        } else {
            Ok(None)
        }
    }
}

// ---- File Mapping ----

/// Map `len` bytes of an open file read-only. The caller owns the mapping
/// and must pair it with [`munmap_file`].
pub fn mmap_readonly(fd: c_int, len: usize) -> io::Result<*const u8> {
    unsafe {
        let ptr = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            fd,
            0,
        );
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *const u8)
        }
    }
}

pub fn munmap_file(ptr: *const u8, len: usize) {
    unsafe {
        libc::munmap(ptr as *mut c_void, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_ephemeral_port() {
        let fd = create_listen_socket("127.0.0.1", 0, false).unwrap();
        let port = local_port(fd).unwrap();
        assert!(port > 0);
        close_fd(fd);
    }

    #[test]
    fn wake_pipe_round_trips_tokens() {
        let (rx, tx) = create_wake_pipe().unwrap();
        assert_eq!(recv_token(rx).unwrap(), None);
        send_token(tx, 42).unwrap();
        send_token(tx, -1).unwrap();
        assert_eq!(recv_token(rx).unwrap(), Some(42));
        assert_eq!(recv_token(rx).unwrap(), Some(-1));
        assert_eq!(recv_token(rx).unwrap(), None);
        close_fd(rx);
        close_fd(tx);
    }

    #[test]
    fn writev_handles_two_segments() {
        let (rx, tx) = create_wake_pipe().unwrap();
        let n = writev_fd(tx, &[b"hel", b"lo"]).unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 8];
        let got = readv_fd(rx, &mut [&mut buf[..]]).unwrap();
        assert_eq!(&buf[..got], b"hello");
        close_fd(rx);
        close_fd(tx);
    }
}
