//! The callback surface a host application implements.

use crate::http::request::Request;
use crate::http::response::Response;
use crate::tls::TlsSession;
use std::sync::Arc;

/// Verdict on an announced request body, consulted before any body byte is
/// read. For `Expect: 100-continue` requests this decides whether the
/// interim `100 Continue` is sent at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyDecision {
    Accept,
    /// Reject the body; the client receives `417 Expectation Failed` and
    /// the connection closes.
    Refuse,
}

/// What the handler wants done once a request is fully received.
pub enum HandlerAction {
    /// Send this response.
    Respond(Arc<Response>),
    /// Park the connection. It disappears from the event loop and its
    /// timeout stops accruing until [`Daemon::resume`](crate::Daemon::resume)
    /// is called with the request's [`id`](Request::id), after which
    /// [`Handler::respond`] runs again.
    Suspend,
}

/// A socket released from HTTP processing after a `101 Switching
/// Protocols` response.
pub struct UpgradedIo {
    /// The raw connected socket, still in non-blocking mode.
    pub socket: socket2::Socket,
    /// The TLS session when the daemon terminated TLS for this connection.
    pub tls: Option<Box<dyn TlsSession>>,
    /// Bytes the client sent past the upgrade request; delivered exactly
    /// once, since the parser will never see them.
    pub extra_in: Vec<u8>,
}

/// Request handler registered with a daemon.
///
/// One round-trip invokes, in order: [`expect_body`](Self::expect_body)
/// (only when a body is announced), [`body_chunk`](Self::body_chunk) zero or
/// more times, then [`respond`](Self::respond). Callbacks run on the thread
/// driving the connection; a single connection never sees two callbacks
/// concurrently.
///
/// # Examples
/// ```
/// use hearth::{Handler, HandlerAction, Request, Response, StatusCode};
///
/// struct Hello;
///
/// impl Handler for Hello {
///     fn respond(&self, req: &Request<'_>) -> HandlerAction {
///         if req.path() == b"/hello" {
///             HandlerAction::Respond(Response::bytes(StatusCode::Ok, "hi"))
///         } else {
///             HandlerAction::Respond(Response::empty(StatusCode::NotFound))
///         }
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Decides whether an announced request body will be accepted.
    fn expect_body(&self, request: &Request<'_>) -> BodyDecision {
        let _ = request;
        BodyDecision::Accept
    }

    /// Receives one slice of the request body. Fixed-length bodies arrive
    /// in receive-buffer-sized pieces, chunked bodies per decoded chunk.
    fn body_chunk(&self, request: &Request<'_>, chunk: &[u8]) {
        let _ = (request, chunk);
    }

    /// Produces the response for a fully received request.
    fn respond(&self, request: &Request<'_>) -> HandlerAction;

    /// Takes ownership of a connection after a negotiated protocol upgrade.
    /// The default drops the socket, closing it.
    fn upgraded(&self, io: UpgradedIo) {
        drop(io);
    }
}
