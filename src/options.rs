//! Daemon configuration.
//!
//! All knobs live in [`DaemonOptions`], a plain struct with conservative
//! defaults; [`Daemon::builder`](crate::Daemon::builder) wraps it in a
//! fluent API. Limits are enforced at admission and parse time, so a
//! misbehaving client costs at most one connection's arena.

use crate::errors::{ConnectionEvent, TerminationReason};
use crate::tls::{TlsAcceptor, TlsCredentials};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::sync::Arc;
use std::time::Duration;

/// Polling backend driving a daemon's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// `select(2)`; descriptors at or above `FD_SETSIZE` are rejected at
    /// admission.
    Select,
    /// `poll(2)`, one entry per connection.
    Poll,
    /// Edge-triggered `epoll(7)`; readiness persists per connection until a
    /// short read or write proves it stale.
    Epoll,
}

/// Who drives the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingModel {
    /// The host application calls [`Daemon::run_once`](crate::Daemon::run_once).
    ExternalLoop,
    /// One internal thread runs the loop until shutdown.
    InternalThread,
    /// `n` worker sub-daemons share the listen socket; each owns a disjoint
    /// connection set and its own poller.
    ThreadPool(usize),
    /// One thread per accepted connection, each blocking on its own socket.
    ThreadPerConnection,
}

/// Admission decision callback, consulted with each client address.
pub type AcceptPolicy = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;
/// Connection lifecycle notification.
pub type ConnectionNotify = Arc<dyn Fn(SocketAddr, ConnectionEvent) + Send + Sync>;
/// Request completion notification.
pub type CompletionNotify = Arc<dyn Fn(SocketAddr, TerminationReason) + Send + Sync>;

/// TLS configuration: credentials plus the acceptor that builds sessions.
#[derive(Clone)]
pub struct TlsOptions {
    pub credentials: TlsCredentials,
    pub acceptor: Arc<dyn TlsAcceptor>,
}

/// Everything a daemon can be told at start time.
#[derive(Clone)]
pub struct DaemonOptions {
    /// Arena size per connection (default: 32 KiB). Bounds the request
    /// line, the header block and all reply scratch space.
    pub connection_memory_limit: usize,

    /// Maximum simultaneous connections (default: `FD_SETSIZE - 4`).
    pub connection_limit: usize,

    /// Maximum simultaneous connections per client IP (default: 0,
    /// unlimited).
    pub per_ip_connection_limit: usize,

    /// Idle timeout; `Duration::ZERO` disables it (default).
    pub connection_timeout: Duration,

    /// Upper bound for one request line, query included (default: 8 KiB).
    pub max_uri_length: usize,

    /// Polling backend (default: [`PollMode::Epoll`]).
    pub poll_mode: PollMode,

    /// Threading model (default: [`ThreadingModel::ExternalLoop`]).
    pub threading: ThreadingModel,

    /// Stack size for every thread the daemon spawns; `None` uses the
    /// platform default.
    pub thread_stack_size: Option<usize>,

    /// Address to bind when no listener is supplied
    /// (default: `0.0.0.0:0`, an ephemeral port).
    pub sock_addr: SocketAddr,

    /// Pre-bound listener to adopt instead of binding `sock_addr`.
    pub listen_socket: Option<Arc<TcpListener>>,

    /// Accept/reject connections by address before counting them.
    pub accept_policy: Option<AcceptPolicy>,

    /// Observes connection starts and closures.
    pub notify_connection: Option<ConnectionNotify>,

    /// Observes request completion with its termination reason.
    pub notify_completed: Option<CompletionNotify>,

    /// Enables the TLS overlay.
    pub tls: Option<TlsOptions>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            connection_memory_limit: 32 * 1024,
            connection_limit: libc::FD_SETSIZE - 4,
            per_ip_connection_limit: 0,
            connection_timeout: Duration::ZERO,
            max_uri_length: 8 * 1024,
            poll_mode: PollMode::Epoll,
            threading: ThreadingModel::ExternalLoop,
            thread_stack_size: None,
            sock_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            listen_socket: None,
            accept_policy: None,
            notify_connection: None,
            notify_completed: None,
            tls: None,
        }
    }
}

impl std::fmt::Debug for DaemonOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonOptions")
            .field("connection_memory_limit", &self.connection_memory_limit)
            .field("connection_limit", &self.connection_limit)
            .field("per_ip_connection_limit", &self.per_ip_connection_limit)
            .field("connection_timeout", &self.connection_timeout)
            .field("max_uri_length", &self.max_uri_length)
            .field("poll_mode", &self.poll_mode)
            .field("threading", &self.threading)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
