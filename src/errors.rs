//! Error taxonomy shared by the socket layer, the connection state machine
//! and the daemon.

use crate::http::types::Version;
use std::io;
use thiserror::Error;

/// Classified socket-level error.
///
/// Every transmit and receive primitive in the crate reports failures through
/// this enum, whether the bytes travel over a plain TCP socket or a TLS
/// session. Only [`Again`](SockError::Again) and [`Intr`](SockError::Intr)
/// are recoverable; everything else tears the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SockError {
    /// The operation would block; retry on the next readiness event.
    #[error("operation would block")]
    Again,
    /// Interrupted by a signal; retry immediately.
    #[error("interrupted by signal")]
    Intr,
    /// Allocation failure, either in userspace or in the kernel.
    #[error("out of memory")]
    NoMem,
    /// The peer performed an orderly shutdown.
    #[error("remote side closed the connection")]
    RemoteDisconnected,
    /// RST received.
    #[error("connection reset by peer")]
    ConnReset,
    /// Keep-alive or ACK timeout reported by the kernel.
    #[error("connection broken")]
    ConnBroken,
    #[error("socket is not connected")]
    NotConn,
    #[error("broken pipe")]
    Pipe,
    /// Failure inside the TLS session.
    #[error("TLS failure")]
    Tls,
    #[error("bad file descriptor")]
    BadFd,
    #[error("invalid argument")]
    Inval,
    #[error("operation not supported")]
    OpNotSupp,
    #[error("descriptor is not a socket")]
    NotSock,
    /// Anything the classifier does not recognize.
    #[error("socket error")]
    Other,
    /// An internal invariant was violated.
    #[error("internal error")]
    Internal,
}

impl SockError {
    /// Maps a raw `errno` value onto the taxonomy.
    pub(crate) fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EAGAIN => Self::Again,
            libc::EINTR => Self::Intr,
            libc::ENOMEM => Self::NoMem,
            libc::ECONNRESET => Self::ConnReset,
            libc::ETIMEDOUT => Self::ConnBroken,
            libc::ENOTCONN => Self::NotConn,
            libc::EPIPE => Self::Pipe,
            libc::EBADF => Self::BadFd,
            libc::EINVAL => Self::Inval,
            libc::EOPNOTSUPP => Self::OpNotSupp,
            libc::ENOTSOCK => Self::NotSock,
            _ => Self::Other,
        }
    }

    /// Reads `errno` for the calling thread and classifies it.
    pub(crate) fn last_os_error() -> Self {
        Self::from_errno(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// `true` when the error cannot be recovered by waiting for readiness.
    pub const fn is_hard(self) -> bool {
        !matches!(self, Self::Again | Self::Intr)
    }
}

/// Why a request could not be parsed or admitted.
///
/// Each variant corresponds to a minimal HTTP rejection sent before the
/// connection closes (when the write path is still usable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum RequestError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("request line too long")]
    UriTooLong,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("malformed header line")]
    BadHeader,
    #[error("obsolete header folding")]
    FoldedHeader,
    #[error("missing Host header")]
    MissingHost,
    #[error("duplicate Host header")]
    DuplicateHost,
    #[error("header block exceeds connection memory")]
    HeadersTooLarge,
    #[error("invalid Content-Length")]
    BadContentLength,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("malformed chunked encoding")]
    BadChunk,
    #[error("malformed percent escape")]
    BadPercentEscape,
    #[error("expectation refused by handler")]
    ExpectationFailed,
    #[error("reply construction failed")]
    ReplyFailed,
}

macro_rules! rejection_lines {
    ($($name:ident => $status:expr;)*) => {
        /// Canned status-line-only rejection, ready to transmit.
        pub(crate) const fn as_http(&self, version: Version) -> &'static [u8] {
            match (self, version) { $(
                (Self::$name, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status, "\r\n",
                    "Connection: close\r\n",
                    "Content-Length: 0\r\n\r\n",
                ),
                (Self::$name, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status, "\r\n",
                    "Connection: close\r\n",
                    "Content-Length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl RequestError {
    rejection_lines! {
        BadRequestLine => "400 Bad Request";
        UriTooLong => "414 URI Too Long";
        UnsupportedVersion => "505 HTTP Version Not Supported";
        BadHeader => "400 Bad Request";
        FoldedHeader => "400 Bad Request";
        MissingHost => "400 Bad Request";
        DuplicateHost => "400 Bad Request";
        HeadersTooLarge => "431 Request Header Fields Too Large";
        BadContentLength => "400 Bad Request";
        BodyTooLarge => "413 Payload Too Large";
        BadChunk => "400 Bad Request";
        BadPercentEscape => "400 Bad Request";
        ExpectationFailed => "417 Expectation Failed";
        ReplyFailed => "500 Internal Server Error";
    }
}

/// Outcome reported to `notify_completed` when a connection finishes
/// handling (or fails to handle) a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The response was fully delivered.
    CompletedOk,
    /// Parsing or reply construction failed.
    WithError,
    /// The idle timeout expired.
    TimedOut,
    /// The daemon is shutting down.
    DaemonShutdown,
    /// A receive-side socket error.
    ReadError,
    /// A transmit-side socket error.
    WriteError,
    /// The client disconnected mid-request.
    ClientAbort,
}

/// Lifecycle event reported to `notify_connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection was admitted.
    Started,
    /// The connection was destroyed.
    Closed,
}

/// Failures configuring or driving a daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to set up the listen socket")]
    Listen(#[source] io::Error),
    #[error("failed to create the polling backend")]
    Poller(#[source] io::Error),
    #[error("failed to create the wakeup channel")]
    Itc(#[source] io::Error),
    #[error("failed to spawn a daemon thread")]
    Spawn(#[source] io::Error),
    #[error("operation requires the external-loop threading model")]
    NotExternal,
    #[error("daemon cannot stop while connections are suspended")]
    SuspendedConnections,
    #[error("no request handler was configured")]
    NoHandler,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        #[rustfmt::skip]
        let cases = [
            (libc::EAGAIN,     SockError::Again),
            (libc::EINTR,      SockError::Intr),
            (libc::ENOMEM,     SockError::NoMem),
            (libc::ECONNRESET, SockError::ConnReset),
            (libc::ETIMEDOUT,  SockError::ConnBroken),
            (libc::ENOTCONN,   SockError::NotConn),
            (libc::EPIPE,      SockError::Pipe),
            (libc::EBADF,      SockError::BadFd),
            (libc::EINVAL,     SockError::Inval),
            (libc::EOPNOTSUPP, SockError::OpNotSupp),
            (libc::ENOTSOCK,   SockError::NotSock),
            (libc::EIO,        SockError::Other),
        ];

        for (errno, expected) in cases {
            assert_eq!(SockError::from_errno(errno), expected);
        }
    }

    #[test]
    fn hardness() {
        assert!(!SockError::Again.is_hard());
        assert!(!SockError::Intr.is_hard());
        assert!(SockError::ConnReset.is_hard());
        assert!(SockError::Tls.is_hard());
        assert!(SockError::Internal.is_hard());
    }

    #[test]
    fn rejection_bytes() {
        let http = RequestError::UriTooLong.as_http(Version::Http11);
        assert!(http.starts_with(b"HTTP/1.1 414 URI Too Long\r\n"));
        assert!(http.ends_with(b"Content-Length: 0\r\n\r\n"));

        let http = RequestError::HeadersTooLarge.as_http(Version::Http10);
        assert!(http.starts_with(b"HTTP/1.0 431 "));
    }
}
