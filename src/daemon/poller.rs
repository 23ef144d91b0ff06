//! Polling backends.
//!
//! One contract, three implementations: readiness-level `select(2)` and
//! `poll(2)` which rebuild their interest sets from the daemon's wait list
//! on every turn, and edge-triggered `epoll(7)` where descriptors are
//! registered once and readiness persists in the connection until a short
//! read or write proves it stale.

use crate::daemon::slots::ConnKey;
use crate::options::PollMode;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

const LISTENER_WORD: u64 = u64::MAX;
const ITC_WORD: u64 = u64::MAX - 1;

/// Identifies what a readiness event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token {
    Listener,
    Itc,
    Conn(ConnKey),
}

impl Token {
    const fn pack(self) -> u64 {
        match self {
            Token::Listener => LISTENER_WORD,
            Token::Itc => ITC_WORD,
            Token::Conn(key) => key.pack(),
        }
    }

    const fn unpack(word: u64) -> Self {
        match word {
            LISTENER_WORD => Token::Listener,
            ITC_WORD => Token::Itc,
            _ => Token::Conn(ConnKey::unpack(word)),
        }
    }
}

/// One entry of the wait set handed to level-triggered backends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Want {
    pub(crate) fd: RawFd,
    pub(crate) token: Token,
    pub(crate) recv: bool,
    pub(crate) send: bool,
}

/// One actionable descriptor reported by a wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ready {
    pub(crate) token: Token,
    pub(crate) recv: bool,
    pub(crate) send: bool,
    pub(crate) error: bool,
}

pub(crate) enum Poller {
    Select,
    Poll {
        scratch: Vec<libc::pollfd>,
        tokens: Vec<Token>,
    },
    Epoll {
        epfd: RawFd,
        events: Vec<libc::epoll_event>,
    },
}

impl Poller {
    pub(crate) fn new(mode: PollMode) -> io::Result<Self> {
        match mode {
            PollMode::Select => Ok(Poller::Select),
            PollMode::Poll => Ok(Poller::Poll {
                scratch: Vec::new(),
                tokens: Vec::new(),
            }),
            PollMode::Epoll => {
                // SAFETY: plain descriptor creation.
                let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
                if epfd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Poller::Epoll {
                    epfd,
                    events: vec![unsafe { std::mem::zeroed() }; 128],
                })
            }
        }
    }

    /// Whether this backend can watch the descriptor at all. `select`
    /// cannot reach descriptors at or above `FD_SETSIZE`.
    pub(crate) fn supports_fd(&self, fd: RawFd) -> bool {
        match self {
            Poller::Select => (fd as usize) < libc::FD_SETSIZE,
            _ => true,
        }
    }

    /// Registers a descriptor. Only epoll keeps per-descriptor state;
    /// connections register edge-triggered, the listener and the wakeup
    /// channel level-triggered.
    pub(crate) fn register(&mut self, fd: RawFd, token: Token, edge: bool) -> io::Result<()> {
        let Poller::Epoll { epfd, .. } = self else {
            return Ok(());
        };

        let mut flags = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        if edge {
            flags |= (libc::EPOLLOUT | libc::EPOLLET) as u32;
        }
        let mut event = libc::epoll_event {
            events: flags,
            u64: token.pack(),
        };

        // SAFETY: event outlives the call; epfd and fd are live.
        let rc = unsafe { libc::epoll_ctl(*epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) {
        if let Poller::Epoll { epfd, .. } = self {
            // SAFETY: a null event is allowed for EPOLL_CTL_DEL.
            unsafe {
                libc::epoll_ctl(*epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    /// Blocks until some descriptor is actionable or `timeout` passes.
    ///
    /// Level-triggered backends take their interest from `wants`; epoll
    /// ignores it and reports whatever edges fired.
    pub(crate) fn wait(
        &mut self,
        wants: &[Want],
        timeout: Option<Duration>,
        out: &mut Vec<Ready>,
    ) -> io::Result<()> {
        out.clear();
        match self {
            Poller::Select => wait_select(wants, timeout, out),
            Poller::Poll { scratch, tokens } => wait_poll(wants, timeout, scratch, tokens, out),
            Poller::Epoll { epfd, events } => wait_epoll(*epfd, events, timeout, out),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Poller::Epoll { epfd, .. } = self {
            // SAFETY: epfd was created by this poller.
            unsafe {
                libc::close(*epfd);
            }
        }
    }
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
        None => -1,
    }
}

fn wait_select(
    wants: &[Want],
    timeout: Option<Duration>,
    out: &mut Vec<Ready>,
) -> io::Result<()> {
    // SAFETY: fd_set is plain data; FD_ZERO initializes it.
    let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut except_set: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe {
        libc::FD_ZERO(&mut read_set);
        libc::FD_ZERO(&mut write_set);
        libc::FD_ZERO(&mut except_set);
    }

    let mut max_fd: RawFd = -1;
    for want in wants {
        debug_assert!((want.fd as usize) < libc::FD_SETSIZE);
        // SAFETY: fd bounds asserted against FD_SETSIZE at admission.
        unsafe {
            if want.recv {
                libc::FD_SET(want.fd, &mut read_set);
            }
            if want.send {
                libc::FD_SET(want.fd, &mut write_set);
            }
            libc::FD_SET(want.fd, &mut except_set);
        }
        max_fd = max_fd.max(want.fd);
    }

    let mut tv;
    let tv_ptr = match timeout {
        Some(t) => {
            tv = libc::timeval {
                tv_sec: t.as_secs() as libc::time_t,
                tv_usec: t.subsec_micros() as libc::suseconds_t,
            };
            &mut tv as *mut libc::timeval
        }
        None => std::ptr::null_mut(),
    };

    // SAFETY: the sets and timeval live across the call.
    let rc = unsafe {
        libc::select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            &mut except_set,
            tv_ptr,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(());
        }
        return Err(err);
    }

    for want in wants {
        // SAFETY: same sets as above.
        let (recv, send, error) = unsafe {
            (
                libc::FD_ISSET(want.fd, &read_set),
                libc::FD_ISSET(want.fd, &write_set),
                libc::FD_ISSET(want.fd, &except_set),
            )
        };
        if recv || send || error {
            out.push(Ready {
                token: want.token,
                recv,
                send,
                error,
            });
        }
    }
    Ok(())
}

fn wait_poll(
    wants: &[Want],
    timeout: Option<Duration>,
    scratch: &mut Vec<libc::pollfd>,
    tokens: &mut Vec<Token>,
    out: &mut Vec<Ready>,
) -> io::Result<()> {
    scratch.clear();
    tokens.clear();
    for want in wants {
        let mut events: libc::c_short = 0;
        if want.recv {
            events |= libc::POLLIN;
        }
        if want.send {
            events |= libc::POLLOUT;
        }
        scratch.push(libc::pollfd {
            fd: want.fd,
            events,
            revents: 0,
        });
        tokens.push(want.token);
    }

    // SAFETY: scratch is a contiguous pollfd array.
    let rc = unsafe { libc::poll(scratch.as_mut_ptr(), scratch.len() as libc::nfds_t, timeout_ms(timeout)) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(());
        }
        return Err(err);
    }

    for (pfd, token) in scratch.iter().zip(tokens.iter()) {
        if pfd.revents == 0 {
            continue;
        }
        out.push(Ready {
            token: *token,
            recv: pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0,
            send: pfd.revents & libc::POLLOUT != 0,
            error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        });
    }
    Ok(())
}

fn wait_epoll(
    epfd: RawFd,
    events: &mut [libc::epoll_event],
    timeout: Option<Duration>,
    out: &mut Vec<Ready>,
) -> io::Result<()> {
    // SAFETY: events is a contiguous, writable event array.
    let rc = unsafe {
        libc::epoll_wait(
            epfd,
            events.as_mut_ptr(),
            events.len() as libc::c_int,
            timeout_ms(timeout),
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(());
        }
        return Err(err);
    }

    for event in events.iter().take(rc as usize) {
        let bits = event.events;
        out.push(Ready {
            token: Token::unpack(event.u64),
            recv: bits & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0,
            send: bits & libc::EPOLLOUT as u32 != 0,
            error: bits & libc::EPOLLERR as u32 != 0,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (server, client)
    }

    fn all_modes() -> [PollMode; 3] {
        [PollMode::Select, PollMode::Poll, PollMode::Epoll]
    }

    fn conn_token() -> Token {
        Token::Conn(ConnKey { index: 5, gen: 9 })
    }

    #[test]
    fn token_packing() {
        for token in [Token::Listener, Token::Itc, conn_token()] {
            assert_eq!(Token::unpack(token.pack()), token);
        }
    }

    #[test]
    fn idle_socket_is_writable_not_readable() {
        for mode in all_modes() {
            let (server, _client) = stream_pair();
            let mut poller = Poller::new(mode).unwrap();
            let fd = server.as_raw_fd();
            poller.register(fd, conn_token(), true).unwrap();

            let wants = [Want {
                fd,
                token: conn_token(),
                recv: true,
                send: true,
            }];
            let mut ready = Vec::new();
            poller
                .wait(&wants, Some(Duration::from_millis(200)), &mut ready)
                .unwrap();

            assert_eq!(ready.len(), 1, "{mode:?}");
            assert!(ready[0].send, "{mode:?}");
            assert!(!ready[0].recv, "{mode:?}");
            assert_eq!(ready[0].token, conn_token(), "{mode:?}");
        }
    }

    #[test]
    fn incoming_bytes_raise_recv_readiness() {
        for mode in all_modes() {
            let (server, mut client) = stream_pair();
            let mut poller = Poller::new(mode).unwrap();
            let fd = server.as_raw_fd();
            poller.register(fd, conn_token(), true).unwrap();

            client.write_all(b"ping").unwrap();

            let wants = [Want {
                fd,
                token: conn_token(),
                recv: true,
                send: false,
            }];
            let mut ready = Vec::new();
            // Allow the loopback delivery to land.
            for _ in 0..50 {
                poller
                    .wait(&wants, Some(Duration::from_millis(100)), &mut ready)
                    .unwrap();
                if ready.iter().any(|r| r.recv) {
                    break;
                }
            }
            assert!(ready.iter().any(|r| r.recv), "{mode:?}");
        }
    }

    #[test]
    fn empty_wait_times_out() {
        for mode in [PollMode::Select, PollMode::Poll] {
            let mut poller = Poller::new(mode).unwrap();
            let mut ready = Vec::new();
            let start = std::time::Instant::now();
            poller
                .wait(&[], Some(Duration::from_millis(30)), &mut ready)
                .unwrap();
            assert!(ready.is_empty());
            assert!(start.elapsed() >= Duration::from_millis(20), "{mode:?}");
        }
    }

    #[test]
    fn select_rejects_large_descriptors() {
        let poller = Poller::new(PollMode::Select).unwrap();
        assert!(poller.supports_fd(10));
        assert!(!poller.supports_fd(libc::FD_SETSIZE as RawFd));

        let poller = Poller::new(PollMode::Epoll).unwrap();
        assert!(poller.supports_fd(libc::FD_SETSIZE as RawFd + 100));
    }
}
