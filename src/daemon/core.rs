//! The daemon: listen socket, connection set, pollers, threads.
//!
//! One [`Core`] is a complete event loop: poller, slot arena, timeout
//! lists, cleanup list and a wakeup channel. The threading models compose
//! cores differently — the external loop and the internal thread drive a
//! single core, the worker pool runs one accepting core plus `n` worker
//! cores with disjoint connection sets, and thread-per-connection skips
//! cores entirely in favor of one blocking loop per socket.

use crate::conn::connection::{Connection, TickContext};
use crate::conn::stage::{Readiness, Stage};
use crate::daemon::poller::{Poller, Ready, Token, Want};
use crate::daemon::slots::{ConnKey, ConnList, ConnectionId, ListId, SlotArena};
use crate::daemon::timeouts::{now_ms, TimeoutQueues};
use crate::errors::{ConnectionEvent, DaemonError, TerminationReason};
use crate::handler::{Handler, UpgradedIo};
use crate::io::transport::Transport;
use crate::net::ip_count::IpCounter;
use crate::net::itc::Itc;
use crate::net::socket::{self, Socket};
use crate::options::{DaemonOptions, PollMode, ThreadingModel};
use crossbeam::queue::SegQueue;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTEN_BACKLOG: i32 = 128;

/// Cross-thread mailbox of one core.
struct CoreHandle {
    itc: Itc,
    /// Packed keys of connections to resume.
    resume: SegQueue<u64>,
    /// Packed key plus timeout override in ms (`u64::MAX` clears it).
    retime: SegQueue<(u64, u64)>,
    /// Sockets handed over by the accepting core (worker pool).
    inbox: SegQueue<(socket2::Socket, SocketAddr)>,
}

impl CoreHandle {
    fn new() -> Result<Self, DaemonError> {
        Ok(Self {
            itc: Itc::new().map_err(DaemonError::Itc)?,
            resume: SegQueue::new(),
            retime: SegQueue::new(),
            inbox: SegQueue::new(),
        })
    }
}

/// State shared by every thread of one daemon.
struct Shared {
    options: DaemonOptions,
    handler: Arc<dyn Handler>,
    ip: IpCounter,
    shutting_down: AtomicBool,
    /// Live connections across all cores.
    active: AtomicUsize,
    suspended: AtomicUsize,
    cores: Vec<Arc<CoreHandle>>,
    /// Thread-per-connection registry: id → socket fd, for shutdown.
    tpc_fds: Mutex<HashMap<u64, RawFd>>,
    tpc_seq: AtomicU64,
}

impl Shared {
    fn notify_connection(&self, addr: SocketAddr, event: ConnectionEvent) {
        if let Some(notify) = &self.options.notify_connection {
            notify(addr, event);
        }
    }

    fn notify_completed(&self, addr: SocketAddr, reason: TerminationReason) {
        if let Some(notify) = &self.options.notify_completed {
            notify(addr, reason);
        }
    }

    fn wake_all(&self) {
        for core in &self.cores {
            core.itc.notify();
        }
    }
}

/// Final teardown shared by every threading model.
fn teardown(mut conn: Box<Connection>, shared: &Shared) {
    if let Some(reason) = conn.termination() {
        shared.notify_completed(conn.remote_addr, reason);
    }
    conn.transport.shutdown_session();
    conn.transport.sock.shutdown_both();
    conn.stage = Stage::Closed;

    if conn.ip_counted {
        shared.ip.release(conn.remote_addr.ip());
    }
    shared.active.fetch_sub(1, Ordering::Relaxed);
    shared.notify_connection(conn.remote_addr, ConnectionEvent::Closed);
}

/// Hands an upgraded connection's socket to the application.
fn perform_upgrade(conn: Box<Connection>, shared: &Shared) {
    let addr = conn.remote_addr;
    if conn.ip_counted {
        shared.ip.release(addr.ip());
    }
    let (sock, tls, extra_in) = conn.into_upgrade_parts();
    shared.active.fetch_sub(1, Ordering::Relaxed);

    debug!(peer = %addr, extra = extra_in.len(), "daemon: connection upgraded");
    shared.handler.upgraded(UpgradedIo {
        socket: sock.into_inner(),
        tls,
        extra_in,
    });
}

/// One event loop over one connection set.
struct Core {
    index: u32,
    shared: Arc<Shared>,
    handle: Arc<CoreHandle>,
    listener: Option<socket2::Socket>,
    /// Worker mailboxes; non-empty only on the accepting core of a pool.
    workers: Vec<Arc<CoreHandle>>,
    poller: Poller,
    arena: SlotArena,
    timeouts: TimeoutQueues,
    eready: ConnList,
    cleanup: ConnList,
    wants: Vec<Want>,
    ready: Vec<Ready>,
}

impl Core {
    fn new(
        index: u32,
        shared: Arc<Shared>,
        handle: Arc<CoreHandle>,
        listener: Option<socket2::Socket>,
        workers: Vec<Arc<CoreHandle>>,
    ) -> Result<Self, DaemonError> {
        let mut poller = Poller::new(shared.options.poll_mode).map_err(DaemonError::Poller)?;

        if let Some(listener) = &listener {
            poller
                .register(listener.as_raw_fd(), Token::Listener, false)
                .map_err(DaemonError::Poller)?;
        }
        poller
            .register(handle.itc.read_fd(), Token::Itc, false)
            .map_err(DaemonError::Poller)?;

        Ok(Self {
            index,
            shared,
            handle,
            listener,
            workers,
            poller,
            arena: SlotArena::new(),
            timeouts: TimeoutQueues::new(),
            eready: ConnList::new(ListId::Eready),
            cleanup: ConnList::new(ListId::Cleanup),
            wants: Vec::new(),
            ready: Vec::new(),
        })
    }

    fn edge_triggered(&self) -> bool {
        self.shared.options.poll_mode == PollMode::Epoll
    }

    /// One `collect → wait → dispatch` turn.
    fn turn(&mut self, max_wait: Option<Duration>) -> Result<(), std::io::Error> {
        self.drain_mailbox();

        self.wants.clear();
        if let Some(listener) = &self.listener {
            if !self.shared.shutting_down.load(Ordering::Relaxed) {
                self.wants.push(Want {
                    fd: listener.as_raw_fd(),
                    token: Token::Listener,
                    recv: true,
                    send: false,
                });
            }
        }
        self.wants.push(Want {
            fd: self.handle.itc.read_fd(),
            token: Token::Itc,
            recv: true,
            send: false,
        });
        for key in self.arena.keys() {
            let Some(conn) = self.arena.get(key) else { continue };
            let (recv, send) = conn.wanted();
            if recv || send {
                self.wants.push(Want {
                    fd: conn.transport.sock.fd(),
                    token: Token::Conn(key),
                    recv,
                    send,
                });
            }
        }

        let now = now_ms();
        let default_timeout = self.shared.options.connection_timeout;
        let mut timeout = self.timeouts.next_deadline(&self.arena, default_timeout, now);
        if let Some(cap) = max_wait {
            timeout = Some(timeout.map_or(cap, |t| t.min(cap)));
        }
        if !self.eready.is_empty() || !self.cleanup.is_empty() {
            timeout = Some(Duration::ZERO);
        }

        let wants = std::mem::take(&mut self.wants);
        let mut ready = std::mem::take(&mut self.ready);
        let result = self.poller.wait(&wants, timeout, &mut ready);
        self.wants = wants;
        self.ready = ready;
        result?;

        self.dispatch();
        self.sweep_timeouts();
        self.drain_cleanup();
        Ok(())
    }

    /// Applies resume/retime requests and adopted sockets queued by other
    /// threads.
    fn drain_mailbox(&mut self) {
        while let Some(packed) = self.handle.resume.pop() {
            let key = ConnKey::unpack(packed);
            let Some(conn) = self.arena.get_mut(key) else {
                continue;
            };
            if !conn.suspended {
                continue;
            }
            conn.suspended = false;
            conn.resuming = true;
            conn.set_last_activity_ms(now_ms());
            if !conn.ip_counted {
                // Reclaims the admission slot released at suspension; the
                // per-IP cap may transiently be exceeded here.
                conn.ip_counted = true;
                self.shared.ip.acquire(conn.remote_addr.ip());
            }
            self.shared.suspended.fetch_sub(1, Ordering::Relaxed);
            self.timeouts.enroll(&mut self.arena, key);
            if !self.eready.contains(&self.arena, key) {
                self.eready.push_front(&mut self.arena, key);
            }
            trace!(core = self.index, "daemon: connection resumed");
        }

        while let Some((packed, millis)) = self.handle.retime.pop() {
            let key = ConnKey::unpack(packed);
            if let Some(conn) = self.arena.get_mut(key) {
                let value = (millis != u64::MAX).then(|| Duration::from_millis(millis));
                conn.set_timeout_override(value);
                self.timeouts.re_enroll(&mut self.arena, key);
            }
        }

        while let Some((sock, addr)) = self.handle.inbox.pop() {
            self.install_connection(sock, addr);
        }
    }

    fn dispatch(&mut self) {
        let ready = std::mem::take(&mut self.ready);
        for event in &ready {
            match event.token {
                Token::Listener => self.accept_pending(),
                Token::Itc => self.handle.itc.drain(),
                Token::Conn(key) => {
                    let Some(conn) = self.arena.get_mut(key) else {
                        continue;
                    };
                    if event.recv {
                        conn.readiness.insert(Readiness::RECV_READY);
                    }
                    if event.send {
                        conn.readiness.insert(Readiness::SEND_READY);
                    }
                    if event.error {
                        conn.readiness.insert(Readiness::ERROR_READY);
                        conn.queue_close(TerminationReason::WithError);
                    }
                    if !self.eready.contains(&self.arena, key) {
                        self.eready.push_front(&mut self.arena, key);
                    }
                }
            }
        }
        self.ready = ready;

        // Tick everything actionable, retaining edge-triggered connections
        // that still have buffered readiness.
        let mut pending = Vec::with_capacity(self.eready.len());
        while let Some(key) = self.eready.pop_front(&mut self.arena) {
            pending.push(key);
        }

        for key in pending {
            let id = ConnectionId {
                core: self.index,
                key,
            };
            let ctx = TickContext {
                handler: &self.shared.handler,
                options: &self.shared.options,
                id,
            };
            let Some(conn) = self.arena.get_mut(key) else {
                continue;
            };
            conn.tick(&ctx);
            self.post_tick(key);
        }
    }

    fn post_tick(&mut self, key: ConnKey) {
        let (stage, suspended, closing, actionable) = match self.arena.get(key) {
            Some(conn) => (
                conn.stage,
                conn.suspended,
                conn.is_closing(),
                conn.has_actionable_readiness(),
            ),
            None => return,
        };

        if stage == Stage::Upgrading {
            self.timeouts.remove(&mut self.arena, key);
            self.eready.unlink(&mut self.arena, key);
            if let Some(mut conn) = self.arena.remove(key) {
                conn.stage = Stage::Upgraded;
                self.poller.deregister(conn.transport.sock.fd());
                perform_upgrade(conn, &self.shared);
            }
            return;
        }

        if suspended {
            // A suspended connection leaves the admission accounting along
            // with the poll set; the IP table tracks the non-suspended set.
            if let Some(conn) = self.arena.get_mut(key) {
                if conn.ip_counted {
                    conn.ip_counted = false;
                    self.shared.ip.release(conn.remote_addr.ip());
                }
            }
            self.shared.suspended.fetch_add(1, Ordering::Relaxed);
            self.timeouts.remove(&mut self.arena, key);
            self.eready.unlink(&mut self.arena, key);
            return;
        }

        if closing {
            self.timeouts.remove(&mut self.arena, key);
            self.eready.unlink(&mut self.arena, key);
            if !self.cleanup.contains(&self.arena, key) {
                self.cleanup.push_front(&mut self.arena, key);
            }
            return;
        }

        self.timeouts.touch(&mut self.arena, key);

        if self.edge_triggered() && actionable && !self.eready.contains(&self.arena, key) {
            self.eready.push_front(&mut self.arena, key);
        }
    }

    fn accept_pending(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };

        loop {
            if self.shared.shutting_down.load(Ordering::Relaxed) {
                break;
            }
            match socket::accept_from(&listener) {
                Ok(Some((sock, addr))) => self.admit(sock, addr),
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "daemon: accept failed");
                    break;
                }
            }
        }

        self.listener = Some(listener);
    }

    /// Admission control, then local install or worker handoff.
    fn admit(&mut self, sock: socket2::Socket, addr: SocketAddr) {
        let options = &self.shared.options;

        if let Some(policy) = &options.accept_policy {
            if !policy(addr) {
                debug!(peer = %addr, "daemon: rejected by accept policy");
                return;
            }
        }
        if !self.poller.supports_fd(sock.as_raw_fd()) {
            warn!(peer = %addr, fd = sock.as_raw_fd(), "daemon: descriptor too large for select");
            return;
        }
        if self.shared.active.load(Ordering::Relaxed) >= options.connection_limit {
            warn!(peer = %addr, "daemon: connection limit reached");
            return;
        }
        if !self
            .shared
            .ip
            .try_acquire(addr.ip(), options.per_ip_connection_limit)
        {
            debug!(peer = %addr, "daemon: per-IP limit reached");
            return;
        }

        self.shared.active.fetch_add(1, Ordering::Relaxed);
        self.shared.notify_connection(addr, ConnectionEvent::Started);

        if self.workers.is_empty() {
            self.install_connection(sock, addr);
        } else {
            // Modulo distribution over the worker pool, indexed by the
            // descriptor.
            let slot = sock.as_raw_fd() as usize % self.workers.len();
            self.workers[slot].inbox.push((sock, addr));
            self.workers[slot].itc.notify();
        }
    }

    fn install_connection(&mut self, sock: socket2::Socket, addr: SocketAddr) {
        let release = |shared: &Shared| {
            shared.ip.release(addr.ip());
            shared.active.fetch_sub(1, Ordering::Relaxed);
            shared.notify_connection(addr, ConnectionEvent::Closed);
        };

        let sock = match Socket::from_accepted(sock) {
            Ok(sock) => sock,
            Err(err) => {
                warn!(peer = %addr, %err, "daemon: failed to adopt socket");
                release(&self.shared);
                return;
            }
        };

        let transport = match &self.shared.options.tls {
            Some(tls) => match tls.acceptor.accept(sock.fd()) {
                Ok(session) => Transport::tls(sock, session),
                Err(err) => {
                    debug!(peer = %addr, %err, "daemon: TLS session setup failed");
                    release(&self.shared);
                    return;
                }
            },
            None => Transport::plain(sock),
        };

        let conn = Connection::new(
            transport,
            addr,
            self.shared.options.connection_memory_limit,
        );
        let fd = conn.transport.sock.fd();
        let key = self.arena.insert(conn);

        if let Err(err) = self.poller.register(fd, Token::Conn(key), true) {
            warn!(peer = %addr, %err, "daemon: poller registration failed");
            if let Some(conn) = self.arena.remove(key) {
                drop(conn);
            }
            release(&self.shared);
            return;
        }

        self.timeouts.enroll(&mut self.arena, key);
        // First tick drives the TLS handshake or an already-buffered
        // request.
        self.eready.push_front(&mut self.arena, key);
        trace!(core = self.index, peer = %addr, "daemon: connection admitted");
    }

    fn sweep_timeouts(&mut self) {
        let now = now_ms();
        let default_timeout = self.shared.options.connection_timeout;
        let expired = self.timeouts.sweep(&self.arena, default_timeout, now);

        for key in expired {
            if let Some(conn) = self.arena.get_mut(key) {
                debug!(peer = %conn.remote_addr, "daemon: connection timed out");
                conn.queue_close(TerminationReason::TimedOut);
            }
            self.timeouts.remove(&mut self.arena, key);
            self.eready.unlink(&mut self.arena, key);
            if !self.cleanup.contains(&self.arena, key) {
                self.cleanup.push_front(&mut self.arena, key);
            }
        }
    }

    fn drain_cleanup(&mut self) {
        while let Some(key) = self.cleanup.pop_front(&mut self.arena) {
            self.timeouts.remove(&mut self.arena, key);
            self.eready.unlink(&mut self.arena, key);
            if let Some(conn) = self.arena.remove(key) {
                self.poller.deregister(conn.transport.sock.fd());
                teardown(conn, &self.shared);
            }
        }
    }

    /// Runs until shutdown, then tears down the connection set.
    fn run_loop(&mut self) {
        while !self.shared.shutting_down.load(Ordering::Relaxed) {
            if let Err(err) = self.turn(None) {
                error!(core = self.index, %err, "daemon: event loop failed");
                break;
            }
        }
        self.shutdown_connections();
    }

    fn shutdown_connections(&mut self) {
        for key in self.arena.keys() {
            if let Some(conn) = self.arena.get_mut(key) {
                if conn.suspended {
                    // Contract is resume-before-stop; drop it regardless.
                    warn!(peer = %conn.remote_addr, "daemon: dropping suspended connection at shutdown");
                    self.shared.suspended.fetch_sub(1, Ordering::Relaxed);
                }
                conn.queue_close(TerminationReason::DaemonShutdown);
            }
            self.timeouts.remove(&mut self.arena, key);
            self.eready.unlink(&mut self.arena, key);
            if !self.cleanup.contains(&self.arena, key) {
                self.cleanup.push_front(&mut self.arena, key);
            }
        }
        self.drain_cleanup();
    }
}

// THREAD-PER-CONNECTION

/// Readiness of a single descriptor, via one blocking `poll(2)`.
fn poll_single(fd: RawFd, recv: bool, send: bool, timeout: Option<Duration>) -> (bool, bool, bool) {
    let mut events: libc::c_short = 0;
    if recv {
        events |= libc::POLLIN;
    }
    if send {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as libc::c_int);

    // SAFETY: one valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
    if rc <= 0 {
        return (false, false, false);
    }
    (
        pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0,
        pfd.revents & libc::POLLOUT != 0,
        pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
    )
}

/// Drives one connection on its own thread until it dies or upgrades.
fn run_single_connection(shared: Arc<Shared>, mut conn: Box<Connection>, tpc_id: u64) {
    let ctx_id = ConnectionId {
        core: u32::MAX,
        key: ConnKey {
            index: tpc_id as u32,
            gen: (tpc_id >> 32) as u32,
        },
    };

    loop {
        if shared.shutting_down.load(Ordering::Relaxed) {
            conn.queue_close(TerminationReason::DaemonShutdown);
        }

        if conn.is_closing() {
            break;
        }
        if conn.stage == Stage::Upgrading {
            conn.stage = Stage::Upgraded;
            shared.tpc_fds.lock().expect("tpc registry poisoned").remove(&tpc_id);
            perform_upgrade(conn, &shared);
            return;
        }
        if conn.suspended {
            // A dedicated thread has no poller to disappear from; treat the
            // request as failed rather than block the thread forever.
            warn!(peer = %conn.remote_addr, "daemon: suspend is not available per-connection-thread");
            conn.queue_close(TerminationReason::WithError);
            break;
        }

        let timeout = conn
            .timeout_override()
            .unwrap_or(shared.options.connection_timeout);
        let wait = if timeout.is_zero() {
            None
        } else {
            let elapsed = now_ms().saturating_sub(conn.last_activity_ms());
            let left = (timeout.as_millis() as u64).saturating_sub(elapsed);
            if left == 0 {
                conn.queue_close(TerminationReason::TimedOut);
                break;
            }
            Some(Duration::from_millis(left))
        };

        let (want_recv, want_send) = conn.wanted();
        let (recv, send, err) =
            poll_single(conn.transport.sock.fd(), want_recv, want_send, wait);
        if recv {
            conn.readiness.insert(Readiness::RECV_READY);
        }
        if send {
            conn.readiness.insert(Readiness::SEND_READY);
        }
        if err {
            conn.readiness.insert(Readiness::ERROR_READY);
            conn.queue_close(TerminationReason::WithError);
        }

        let ctx = TickContext {
            handler: &shared.handler,
            options: &shared.options,
            id: ctx_id,
        };
        conn.tick(&ctx);
    }

    shared.tpc_fds.lock().expect("tpc registry poisoned").remove(&tpc_id);
    teardown(conn, &shared);
}

/// Accept loop for the thread-per-connection model.
fn run_tpc_acceptor(shared: Arc<Shared>, listener: socket2::Socket, handle: Arc<CoreHandle>) {
    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    while !shared.shutting_down.load(Ordering::Relaxed) {
        let (readable, _, _) = poll_single(
            listener.as_raw_fd(),
            true,
            false,
            Some(Duration::from_millis(200)),
        );
        handle.itc.drain();
        if !readable {
            continue;
        }

        loop {
            match socket::accept_from(&listener) {
                Ok(Some((sock, addr))) => {
                    let options = &shared.options;
                    if let Some(policy) = &options.accept_policy {
                        if !policy(addr) {
                            continue;
                        }
                    }
                    if shared.active.load(Ordering::Relaxed) >= options.connection_limit {
                        warn!(peer = %addr, "daemon: connection limit reached");
                        continue;
                    }
                    if !shared
                        .ip
                        .try_acquire(addr.ip(), options.per_ip_connection_limit)
                    {
                        debug!(peer = %addr, "daemon: per-IP limit reached");
                        continue;
                    }

                    let sock = match Socket::from_accepted(sock) {
                        Ok(sock) => sock,
                        Err(_) => {
                            shared.ip.release(addr.ip());
                            continue;
                        }
                    };
                    let transport = match &options.tls {
                        Some(tls) => match tls.acceptor.accept(sock.fd()) {
                            Ok(session) => Transport::tls(sock, session),
                            Err(_) => {
                                shared.ip.release(addr.ip());
                                continue;
                            }
                        },
                        None => Transport::plain(sock),
                    };

                    shared.active.fetch_add(1, Ordering::Relaxed);
                    shared.notify_connection(addr, ConnectionEvent::Started);

                    let conn =
                        Connection::new(transport, addr, options.connection_memory_limit);
                    let tpc_id = shared.tpc_seq.fetch_add(1, Ordering::Relaxed);
                    shared
                        .tpc_fds
                        .lock()
                        .expect("tpc registry poisoned")
                        .insert(tpc_id, conn.transport.sock.fd());

                    let thread_shared = shared.clone();
                    let mut builder = std::thread::Builder::new()
                        .name(format!("hearth-conn-{tpc_id}"));
                    if let Some(stack) = options.thread_stack_size {
                        builder = builder.stack_size(stack);
                    }
                    match builder
                        .spawn(move || run_single_connection(thread_shared, conn, tpc_id))
                    {
                        Ok(thread) => threads.push(thread),
                        Err(err) => {
                            error!(%err, "daemon: failed to spawn connection thread");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "daemon: accept failed");
                    break;
                }
            }
        }
    }

    // Kick every connection thread off its blocking poll, then join.
    for fd in shared.tpc_fds.lock().expect("tpc registry poisoned").values() {
        // SAFETY: shutting down a live fd owned by a connection thread.
        unsafe {
            libc::shutdown(*fd, libc::SHUT_RDWR);
        }
    }
    for thread in threads {
        let _ = thread.join();
    }
}

// PUBLIC SURFACE

enum Runtime {
    External(Box<Core>),
    Threads(Vec<JoinHandle<()>>),
}

/// An HTTP daemon.
///
/// Built through [`Daemon::builder`]; once started it accepts connections
/// on its listen socket and drives each request through the registered
/// [`Handler`].
///
/// # Examples
/// ```no_run
/// use hearth::{Daemon, Handler, HandlerAction, Request, Response, StatusCode, ThreadingModel};
///
/// struct Hello;
/// impl Handler for Hello {
///     fn respond(&self, _: &Request<'_>) -> HandlerAction {
///         HandlerAction::Respond(Response::bytes(StatusCode::Ok, "hello"))
///     }
/// }
///
/// let mut daemon = Daemon::builder()
///     .bind("127.0.0.1:8080".parse().unwrap())
///     .threading(ThreadingModel::InternalThread)
///     .handler(Hello)
///     .start()
///     .unwrap();
/// // ... serve ...
/// daemon.stop().unwrap();
/// ```
pub struct Daemon {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    runtime: Option<Runtime>,
}

impl Daemon {
    pub fn builder() -> DaemonBuilder {
        DaemonBuilder {
            options: DaemonOptions::default(),
            handler: None,
        }
    }

    /// Address of the listen socket, with the bound port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drives one `collect → wait → dispatch` cycle. Only valid with
    /// [`ThreadingModel::ExternalLoop`].
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<(), DaemonError> {
        match &mut self.runtime {
            Some(Runtime::External(core)) => core.turn(max_wait).map_err(DaemonError::Poller),
            _ => Err(DaemonError::NotExternal),
        }
    }

    /// Returns a suspended connection to its event loop. Callable from any
    /// thread; the owning poller is woken through its wakeup channel.
    pub fn resume(&self, id: ConnectionId) {
        let Some(core) = self.shared.cores.get(id.core as usize) else {
            return;
        };
        core.resume.push(id.key.pack());
        core.itc.notify();
    }

    /// Overrides (or, with `None`, clears) one connection's idle timeout.
    pub fn set_connection_timeout(&self, id: ConnectionId, timeout: Option<Duration>) {
        let Some(core) = self.shared.cores.get(id.core as usize) else {
            return;
        };
        let millis = timeout.map_or(u64::MAX, |t| t.as_millis() as u64);
        core.retime.push((id.key.pack(), millis));
        core.itc.notify();
    }

    /// Count of currently suspended connections.
    pub fn suspended_connections(&self) -> usize {
        self.shared.suspended.load(Ordering::Relaxed)
    }

    /// Coordinated shutdown: refuse while connections are suspended, then
    /// wake every poller, join the threads and tear down the connection
    /// sets.
    pub fn stop(&mut self) -> Result<(), DaemonError> {
        if self.shared.suspended.load(Ordering::Relaxed) != 0 {
            return Err(DaemonError::SuspendedConnections);
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        info!(addr = %self.local_addr, "daemon: shutting down");
        self.shared.shutting_down.store(true, Ordering::Relaxed);
        self.shared.wake_all();

        match runtime {
            Runtime::External(mut core) => core.shutdown_connections(),
            Runtime::Threads(threads) => {
                for thread in threads {
                    let _ = thread.join();
                }
            }
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Fluent configuration for [`Daemon`].
pub struct DaemonBuilder {
    options: DaemonOptions,
    handler: Option<Arc<dyn Handler>>,
}

impl DaemonBuilder {
    /// Sets the request handler.
    ///
    /// **This is a required component.**
    pub fn handler<H: Handler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Replaces the whole options struct.
    pub fn options(mut self, options: DaemonOptions) -> Self {
        self.options = options;
        self
    }

    /// Bind address for the listen socket.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.options.sock_addr = addr;
        self
    }

    /// Adopts a pre-bound listener instead of binding.
    pub fn listener(mut self, listener: std::net::TcpListener) -> Self {
        self.options.listen_socket = Some(Arc::new(listener));
        self
    }

    pub fn poll_mode(mut self, mode: PollMode) -> Self {
        self.options.poll_mode = mode;
        self
    }

    pub fn threading(mut self, threading: ThreadingModel) -> Self {
        self.options.threading = threading;
        self
    }

    pub fn connection_limit(mut self, limit: usize) -> Self {
        self.options.connection_limit = limit;
        self
    }

    pub fn per_ip_connection_limit(mut self, limit: usize) -> Self {
        self.options.per_ip_connection_limit = limit;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.options.connection_timeout = timeout;
        self
    }

    pub fn connection_memory_limit(mut self, limit: usize) -> Self {
        self.options.connection_memory_limit = limit;
        self
    }

    pub fn accept_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.options.accept_policy = Some(Arc::new(policy));
        self
    }

    pub fn notify_connection<F>(mut self, notify: F) -> Self
    where
        F: Fn(SocketAddr, ConnectionEvent) + Send + Sync + 'static,
    {
        self.options.notify_connection = Some(Arc::new(notify));
        self
    }

    pub fn notify_completed<F>(mut self, notify: F) -> Self
    where
        F: Fn(SocketAddr, TerminationReason) + Send + Sync + 'static,
    {
        self.options.notify_completed = Some(Arc::new(notify));
        self
    }

    pub fn tls(mut self, tls: crate::options::TlsOptions) -> Self {
        self.options.tls = Some(tls);
        self
    }

    /// Binds (or adopts) the listen socket and launches the configured
    /// threading model.
    pub fn start(self) -> Result<Daemon, DaemonError> {
        let handler = self.handler.ok_or(DaemonError::NoHandler)?;
        let options = self.options;

        let listener = match &options.listen_socket {
            Some(listener) => {
                let cloned = listener.try_clone().map_err(DaemonError::Listen)?;
                socket::adopt_listener(cloned).map_err(DaemonError::Listen)?
            }
            None => {
                socket::bind_listener(options.sock_addr, LISTEN_BACKLOG)
                    .map_err(DaemonError::Listen)?
            }
        };
        let local_addr = listener
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(options.sock_addr);

        let core_count = match options.threading {
            ThreadingModel::ThreadPool(workers) => workers.max(1) + 1,
            _ => 1,
        };
        let mut handles = Vec::with_capacity(core_count);
        for _ in 0..core_count {
            handles.push(Arc::new(CoreHandle::new()?));
        }

        let shared = Arc::new(Shared {
            options,
            handler,
            ip: IpCounter::new(),
            shutting_down: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            suspended: AtomicUsize::new(0),
            cores: handles.clone(),
            tpc_fds: Mutex::new(HashMap::new()),
            tpc_seq: AtomicU64::new(0),
        });

        let stack_size = shared.options.thread_stack_size;
        let spawn = |name: String, f: Box<dyn FnOnce() + Send>| -> Result<JoinHandle<()>, DaemonError> {
            let mut builder = std::thread::Builder::new().name(name);
            if let Some(stack) = stack_size {
                builder = builder.stack_size(stack);
            }
            builder.spawn(f).map_err(DaemonError::Spawn)
        };

        let runtime = match shared.options.threading {
            ThreadingModel::ExternalLoop => {
                let core = Core::new(0, shared.clone(), handles[0].clone(), Some(listener), Vec::new())?;
                Runtime::External(Box::new(core))
            }
            ThreadingModel::InternalThread => {
                let mut core =
                    Core::new(0, shared.clone(), handles[0].clone(), Some(listener), Vec::new())?;
                let thread = spawn(
                    "hearth-daemon".into(),
                    Box::new(move || core.run_loop()),
                )?;
                Runtime::Threads(vec![thread])
            }
            ThreadingModel::ThreadPool(workers) => {
                let workers = workers.max(1);
                let mut threads = Vec::with_capacity(workers + 1);

                // Worker cores own the connections; core 1..=n.
                for index in 0..workers {
                    let mut core = Core::new(
                        (index + 1) as u32,
                        shared.clone(),
                        handles[index + 1].clone(),
                        None,
                        Vec::new(),
                    )?;
                    threads.push(spawn(
                        format!("hearth-worker-{index}"),
                        Box::new(move || core.run_loop()),
                    )?);
                }

                // The accepting core distributes by descriptor modulo.
                let worker_handles = handles[1..].to_vec();
                let mut core = Core::new(
                    0,
                    shared.clone(),
                    handles[0].clone(),
                    Some(listener),
                    worker_handles,
                )?;
                threads.push(spawn(
                    "hearth-accept".into(),
                    Box::new(move || core.run_loop()),
                )?);

                Runtime::Threads(threads)
            }
            ThreadingModel::ThreadPerConnection => {
                let acceptor_shared = shared.clone();
                let handle = handles[0].clone();
                let thread = spawn(
                    "hearth-accept".into(),
                    Box::new(move || run_tpc_acceptor(acceptor_shared, listener, handle)),
                )?;
                Runtime::Threads(vec![thread])
            }
        };

        info!(addr = %local_addr, threading = ?shared.options.threading, "daemon: started");
        Ok(Daemon {
            shared,
            local_addr,
            runtime: Some(runtime),
        })
    }
}
