//! hearth - Embeddable, callback-driven HTTP/1.x server core
//!
//! A small server library built around three pieces: a per-connection
//! protocol state machine, a daemon event loop that multiplexes many
//! connections over one listen socket, and a send/receive pipeline that
//! adapts to plain TCP or a TLS overlay and knows when to let the kernel
//! batch packets.
//!
//! # Features
//!
//! - **Callback-driven** - register a [`Handler`]; the core drives every
//!   request from byte-level parsing through response delivery.
//! - **Selectable polling backend** - readiness-level `select`/`poll` or
//!   edge-triggered `epoll`, behind one contract.
//! - **Four threading models** - external loop, one internal thread, a
//!   worker pool sharing the listen socket, or a thread per connection.
//! - **Bounded per-connection memory** - every connection parses and
//!   replies out of one fixed arena, rewound between keep-alive requests.
//! - **HTTP/1.1 plumbing included** - keep-alive and pipelining, chunked
//!   transfer in both directions with trailers, `Expect: 100-continue`,
//!   HEAD, protocol upgrade, sendfile replies with a userspace fallback.
//!
//! # Quick Start
//!
//! ```no_run
//! use hearth::{Daemon, Handler, HandlerAction, Request, Response, StatusCode, ThreadingModel};
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     fn respond(&self, _: &Request<'_>) -> HandlerAction {
//!         HandlerAction::Respond(Response::bytes(StatusCode::Ok, "Hello world!"))
//!     }
//! }
//!
//! fn main() {
//!     let mut daemon = Daemon::builder()
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .threading(ThreadingModel::InternalThread)
//!         .handler(Hello)
//!         .start()
//!         .expect("daemon start");
//!
//!     std::thread::park();
//!     daemon.stop().unwrap();
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod parser;
    pub(crate) mod percent;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod conn {
    pub(crate) mod connection;
    pub(crate) mod stage;
}
pub(crate) mod daemon {
    pub(crate) mod core;
    pub(crate) mod poller;
    pub(crate) mod slots;
    pub(crate) mod timeouts;
}
pub(crate) mod io {
    pub(crate) mod send;
    pub(crate) mod transport;
}
pub(crate) mod net {
    pub(crate) mod ip_count;
    pub(crate) mod itc;
    pub(crate) mod socket;
}
pub(crate) mod errors;
pub(crate) mod handler;
pub mod options;
pub(crate) mod pool;
pub mod tls;

pub use crate::{
    daemon::{
        core::{Daemon, DaemonBuilder},
        slots::ConnectionId,
    },
    errors::{ConnectionEvent, DaemonError, SockError, TerminationReason},
    handler::{BodyDecision, Handler, HandlerAction, UpgradedIo},
    http::{
        request::Request,
        response::{BodyGenerator, Chunk, Response, ResponseBuilder},
        types::{Method, StatusCode, Version},
    },
    options::{DaemonOptions, PollMode, ThreadingModel, TlsOptions},
    tls::{HandshakeStatus, TlsAcceptor, TlsCredentials, TlsSession},
};
