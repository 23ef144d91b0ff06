//! Socket abstraction: uniform non-blocking transmit/receive primitives with
//! classified errors, plus the packetization knobs (`TCP_NODELAY`,
//! `TCP_CORK`, `MSG_MORE`) the send pipeline flips.

use crate::errors::SockError;
use socket2::{Domain, Protocol, SockAddr, Type};
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, trace};

/// Outcome of a kernel-assisted file transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileSend {
    /// Bytes moved from the file to the socket.
    Sent(usize),
    /// The kernel refused this transfer; the caller should fall back to a
    /// userspace read-and-send path.
    Fallback,
}

/// A connected, non-blocking stream socket.
///
/// Keeps shadow copies of `TCP_NODELAY` and `TCP_CORK` so the pipeline never
/// issues a `setsockopt` that would be a no-op.
#[derive(Debug)]
pub(crate) struct Socket {
    inner: socket2::Socket,
    nodelay_on: bool,
    cork_on: bool,
}

impl Socket {
    /// Wraps a freshly accepted socket and switches it to non-blocking mode.
    pub(crate) fn from_accepted(inner: socket2::Socket) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        Ok(Self {
            inner,
            nodelay_on: false,
            cork_on: false,
        })
    }

    #[inline(always)]
    pub(crate) fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub(crate) fn nodelay_on(&self) -> bool {
        self.nodelay_on
    }

    pub(crate) fn cork_on(&self) -> bool {
        self.cork_on
    }

    /// Receives into `buf`. An orderly peer shutdown reports
    /// [`SockError::RemoteDisconnected`].
    pub(crate) fn recv(&self, buf: &mut [u8]) -> Result<usize, SockError> {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let rc = unsafe { libc::recv(self.fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
        match rc {
            0 => Err(SockError::RemoteDisconnected),
            n if n > 0 => Ok(n as usize),
            _ => Err(SockError::last_os_error()),
        }
    }

    /// Sends a contiguous range. `more` asks the kernel to expect further
    /// data immediately (`MSG_MORE`), suppressing a premature small packet.
    pub(crate) fn send(&self, buf: &[u8], more: bool) -> Result<usize, SockError> {
        let mut flags = libc::MSG_NOSIGNAL;
        if more {
            flags |= libc::MSG_MORE;
        }

        // SAFETY: buf is valid for reads of buf.len() bytes.
        let rc = unsafe { libc::send(self.fd(), buf.as_ptr().cast(), buf.len(), flags) };
        if rc < 0 {
            return Err(SockError::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Gather-send of several ranges in one syscall.
    pub(crate) fn send_vectored(&self, bufs: &[IoSlice<'_>], more: bool) -> Result<usize, SockError> {
        let mut flags = libc::MSG_NOSIGNAL;
        if more {
            flags |= libc::MSG_MORE;
        }

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len().min(libc::UIO_MAXIOV as usize);

        // SAFETY: msg points at iovecs that outlive the call.
        let rc = unsafe { libc::sendmsg(self.fd(), &msg, flags) };
        if rc < 0 {
            return Err(SockError::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Kernel file-to-socket copy via `sendfile(2)`.
    ///
    /// Conditions the kernel cannot serve (unsupported file type, offset
    /// overflow) surface as [`FileSend::Fallback`] rather than an error, so
    /// the reply can downshift to the userspace copy path.
    pub(crate) fn send_from_file(
        &self,
        file_fd: RawFd,
        offset: u64,
        len: usize,
    ) -> Result<FileSend, SockError> {
        let mut off = offset as libc::off_t;
        // SAFETY: off is a valid out-parameter; fds are live.
        let rc = unsafe { libc::sendfile(self.fd(), file_fd, &mut off, len) };

        if rc > 0 {
            return Ok(FileSend::Sent(rc as usize));
        }
        if rc == 0 {
            // File shorter than announced; let the userspace path notice.
            return Ok(FileSend::Fallback);
        }

        match SockError::last_os_error() {
            SockError::Inval | SockError::OpNotSupp => Ok(FileSend::Fallback),
            err => Err(err),
        }
    }

    /// Sets `TCP_NODELAY`, skipping the syscall when the shadow matches.
    pub(crate) fn set_nodelay(&mut self, on: bool) -> Result<(), SockError> {
        if self.nodelay_on == on {
            return Ok(());
        }
        trace!(fd = self.fd(), on, "socket: nodelay");
        self.inner.set_tcp_nodelay(on).map_err(io_to_sock)?;
        self.nodelay_on = on;
        Ok(())
    }

    /// Sets `TCP_CORK`, skipping the syscall when the shadow matches.
    pub(crate) fn set_cork(&mut self, on: bool) -> Result<(), SockError> {
        if self.cork_on == on {
            return Ok(());
        }
        trace!(fd = self.fd(), on, "socket: cork");

        let value: libc::c_int = on as libc::c_int;
        // SAFETY: value points at a c_int for the duration of the call.
        let rc = unsafe {
            libc::setsockopt(
                self.fd(),
                libc::IPPROTO_TCP,
                libc::TCP_CORK,
                (&value as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(SockError::last_os_error());
        }
        self.cork_on = on;
        Ok(())
    }

    pub(crate) fn shutdown_both(&self) {
        let _ = self.inner.shutdown(std::net::Shutdown::Both);
    }

    /// Releases the underlying socket, e.g. for a protocol upgrade handoff.
    pub(crate) fn into_inner(self) -> socket2::Socket {
        self.inner
    }
}

#[inline]
fn io_to_sock(err: io::Error) -> SockError {
    SockError::from_errno(err.raw_os_error().unwrap_or(0))
}

/// Creates the listen socket the daemon accepts from: non-blocking,
/// `SO_REUSEADDR`, bound and listening.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<socket2::Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;

    debug!(%addr, "daemon: listening");
    Ok(socket)
}

/// Adopts a pre-bound listener supplied by the host application.
pub(crate) fn adopt_listener(listener: std::net::TcpListener) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::from(listener);
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Accepts one pending connection, or `None` when the backlog is empty.
pub(crate) fn accept_from(
    listener: &socket2::Socket,
) -> Result<Option<(socket2::Socket, SocketAddr)>, io::Error> {
    match listener.accept() {
        Ok((socket, addr)) => {
            let addr = addr
                .as_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-inet peer address"))?;
            Ok(Some((socket, addr)))
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(err) if err.raw_os_error() == Some(libc::EINTR) => Ok(None),
        Err(err) => Err(err),
    }
}
