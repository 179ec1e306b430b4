//! Listening socket setup: create, setsockopt, bind, listen.
//!
//! Built on raw libc so the linger and reuse options are applied before
//! `bind`, which `std::net::TcpListener::bind` does not allow.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{ServerError, ServerResult};

/// Bind a listening TCP socket on `host:port`.
///
/// `linger` enables `SO_LINGER {on, 1s}` so pending data is sent before
/// close; accepted sockets inherit it, so `close(2)` on them may block for
/// up to a second. `reuse_addr` enables `SO_REUSEADDR`.
pub fn bind_listener(
    host: Ipv4Addr,
    port: u16,
    linger: bool,
    reuse_addr: bool,
) -> ServerResult<TcpListener> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(ServerError::Listen(io::Error::last_os_error()));
    }
    // SAFETY: fd was just returned by socket(); OwnedFd closes it on every error path.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    if linger {
        setsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_LINGER, &linger_opt(1))
            .map_err(|source| ServerError::SocketOption { option: "SO_LINGER", source })?;
    }
    if reuse_addr {
        let opt: libc::c_int = 1;
        setsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, &opt)
            .map_err(|source| ServerError::SocketOption { option: "SO_REUSEADDR", source })?;
    }

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from(host).to_be();
    addr.sin_port = port.to_be();

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(ServerError::Bind {
            port,
            source: io::Error::last_os_error(),
        });
    }

    if unsafe { libc::listen(fd.as_raw_fd(), libc::SOMAXCONN) } != 0 {
        return Err(ServerError::Listen(io::Error::last_os_error()));
    }

    Ok(TcpListener::from(fd))
}

/// `TCP_NODELAY` on an accepted connection
pub fn set_nodelay(stream: &TcpStream) -> io::Result<()> {
    let opt: libc::c_int = 1;
    setsockopt(stream.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, &opt)
}

/// `SO_LINGER {on, 0}`: the next close resets the connection instead of
/// waiting for unsent data, so it never blocks.
pub fn set_abortive_close(stream: &TcpStream) -> io::Result<()> {
    setsockopt(stream.as_raw_fd(), libc::SOL_SOCKET, libc::SO_LINGER, &linger_opt(0))
}

fn linger_opt(seconds: libc::c_int) -> libc::linger {
    libc::linger {
        l_onoff: 1,
        l_linger: seconds,
    }
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
