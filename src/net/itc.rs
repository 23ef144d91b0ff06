//! Inter-thread wakeup channel.
//!
//! A single-byte signalling primitive used to unblock a poller from another
//! thread: an `eventfd` where available, a non-blocking pipe otherwise. The
//! reader end sits in every poll set; writers poke it after queueing work.

use std::io;
use std::os::fd::RawFd;
use tracing::warn;

#[derive(Debug)]
enum Backing {
    EventFd(RawFd),
    Pipe { rx: RawFd, tx: RawFd },
}

#[derive(Debug)]
pub(crate) struct Itc {
    backing: Backing,
}

impl Itc {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain fd creation, flags checked below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd >= 0 {
            return Ok(Self {
                backing: Backing::EventFd(fd),
            });
        }

        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds points at two writable ints.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            backing: Backing::Pipe {
                rx: fds[0],
                tx: fds[1],
            },
        })
    }

    /// Descriptor the poller watches for readability.
    pub(crate) fn read_fd(&self) -> RawFd {
        match self.backing {
            Backing::EventFd(fd) => fd,
            Backing::Pipe { rx, .. } => rx,
        }
    }

    /// Wakes the poller. Callable from any thread; a full pipe already
    /// guarantees a pending wakeup, so short writes are ignored.
    pub(crate) fn notify(&self) {
        let one = 1u64.to_ne_bytes();
        let (fd, buf): (RawFd, &[u8]) = match self.backing {
            Backing::EventFd(fd) => (fd, &one),
            Backing::Pipe { tx, .. } => (tx, b"!"),
        };

        // SAFETY: fd is owned by self, buf is valid for its length.
        let rc = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(?err, "itc: wakeup write failed");
            }
        }
    }

    /// Consumes all pending wakeup bytes.
    pub(crate) fn drain(&self) {
        let fd = self.read_fd();
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: fd is owned by self, buf is a valid destination.
            let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if rc <= 0 {
                break;
            }
            if (rc as usize) < buf.len() {
                break;
            }
        }
    }
}

impl Drop for Itc {
    fn drop(&mut self) {
        // SAFETY: descriptors were created by this struct and not shared.
        unsafe {
            match self.backing {
                Backing::EventFd(fd) => {
                    libc::close(fd);
                }
                Backing::Pipe { rx, tx } => {
                    libc::close(rx);
                    libc::close(tx);
                }
            }
        }
    }
}

// The channel is poked from arbitrary threads and drained by the owning
// poller; both operations are single syscalls on fixed descriptors.
unsafe impl Send for Itc {}
unsafe impl Sync for Itc {}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(fd: RawFd) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        rc == 1 && pfd.revents & libc::POLLIN != 0
    }

    #[test]
    fn notify_then_drain() {
        let itc = Itc::new().unwrap();
        assert!(!readable(itc.read_fd()));

        itc.notify();
        assert!(readable(itc.read_fd()));

        itc.drain();
        assert!(!readable(itc.read_fd()));
    }

    #[test]
    fn multiple_notifies_collapse() {
        let itc = Itc::new().unwrap();
        for _ in 0..100 {
            itc.notify();
        }

        itc.drain();
        assert!(!readable(itc.read_fd()));
    }

    #[test]
    fn cross_thread_notify() {
        let itc = std::sync::Arc::new(Itc::new().unwrap());
        let poker = itc.clone();

        let handle = std::thread::spawn(move || poker.notify());
        handle.join().unwrap();

        assert!(readable(itc.read_fd()));
    }
}
