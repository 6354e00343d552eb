//! Socket options tokio's builders do not expose (unix only).

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Toggle IPV6_V6ONLY; clearing it makes an IPv6 socket dual-stack.
pub(crate) fn set_only_v6(fd: RawFd, only_v6: bool) -> io::Result<()> {
    set_opt(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_V6ONLY,
        only_v6 as libc::c_int,
    )
}

/// Enable SO_KEEPALIVE on a connected socket.
pub(crate) fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_opt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_KEEPALIVE,
        on as libc::c_int,
    )
}

/// Apply SO_RCVBUF / SO_SNDBUF hints; zero leaves the OS default in place.
pub(crate) fn set_buffer_hints(fd: RawFd, recv: usize, send: usize) -> io::Result<()> {
    if recv > 0 {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, recv as libc::c_int)?;
    }
    if send > 0 {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, send as libc::c_int)?;
    }
    Ok(())
}

/// Bind a non-blocking datagram socket with SO_REUSEADDR (and optionally
/// SO_REUSEPORT) set before the bind, so several group members can share a
/// multicast port.
pub(crate) fn bind_udp_reuse(
    addr: SocketAddr,
    reuse_port: bool,
) -> io::Result<std::net::UdpSocket> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // The std socket owns the fd from here on; early returns close it.
    let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };

    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    if reuse_port {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
    }

    let rc = match addr {
        SocketAddr::V4(a) => {
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from(*a.ip()).to_be(),
            };
            unsafe {
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(a) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            unsafe {
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_bind_with_reuse() {
        let first = bind_udp_reuse("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let port = first.local_addr().unwrap().port();

        // A second bind on the same port succeeds because both sockets carry
        // SO_REUSEADDR.
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let second = bind_udp_reuse(addr, false).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_keep_alive_on_listener() {
        use std::os::fd::AsRawFd;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        set_keep_alive(listener.as_raw_fd(), true).unwrap();
    }
}
