//! Thin wrappers over the stream-socket syscalls the pool is built on.
//!
//! Every function maps to a single syscall (plus error materialization) and
//! holds no state; ownership of descriptors stays with the caller.

use std::io;
use std::os::fd::RawFd;

/// Create a listening TCP socket bound to the wildcard address.
///
/// Sets `SO_REUSEADDR` before binding. The socket is returned in blocking
/// mode; callers that poll it must flip it with [`set_nonblocking`].
pub fn tcp_listener(port: u16, backlog: i32) -> io::Result<RawFd> {
    let sfd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if sfd < 0 {
        return Err(io::Error::last_os_error());
    }

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            sfd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        close(sfd);
        return Err(err);
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

    let rc = unsafe {
        libc::bind(
            sfd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        close(sfd);
        return Err(err);
    }

    let rc = unsafe { libc::listen(sfd, backlog) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        close(sfd);
        return Err(err);
    }

    Ok(sfd)
}

/// Accept one pending connection.
pub fn accept(sfd: RawFd) -> io::Result<RawFd> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let cfd = unsafe { libc::accept(sfd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
    if cfd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(cfd)
}

/// Switch a socket to non-blocking mode.
pub fn set_nonblocking(sfd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(sfd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(sfd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read from a socket into `buf`. Returns the number of bytes read; 0 means
/// the peer performed an orderly shutdown.
pub fn recv(sfd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(sfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Read one byte of out-of-band data. `Ok(None)` means there was nothing to
/// read despite the urgent mark.
pub fn recv_oob(sfd: RawFd) -> io::Result<Option<u8>> {
    let mut byte = 0u8;
    let n = unsafe { libc::recv(sfd, &mut byte as *mut _ as *mut libc::c_void, 1, libc::MSG_OOB) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(byte))
}

// Not exposed by the `libc` crate on Linux; value from asm-generic/sockios.h.
const SIOCATMARK: libc::c_ulong = 0x8905;

/// Whether the socket's read pointer is at the urgent-data mark.
pub fn at_mark(sfd: RawFd) -> io::Result<bool> {
    let mut mark: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(sfd, SIOCATMARK, &mut mark) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(mark != 0)
}

/// Write `buf` to a socket. Short writes are possible on non-blocking
/// sockets.
pub fn send(sfd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::send(sfd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Close a descriptor. Errors are ignored; there is no recovery path for a
/// failed close.
pub fn close(sfd: RawFd) {
    unsafe {
        libc::close(sfd);
    }
}
