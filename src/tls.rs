//! Abstract TLS overlay.
//!
//! The crate does not bind a TLS library; the host supplies an acceptor that
//! wraps each admitted socket in a session speaking this interface. The
//! I/O pipeline treats a session as the transmit/receive primitive and the
//! daemon drives its handshake through the ordinary readiness machinery.

use crate::errors::SockError;
use std::os::fd::RawFd;

/// Progress report from [`TlsSession::handshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The session is established.
    Complete,
    /// More handshake bytes must arrive from the peer.
    RecvMoreNeeded,
    /// Handshake bytes are queued and the socket must become writable.
    SendMoreNeeded,
    /// A read was interrupted; retry without waiting for readiness.
    RecvInterrupted,
    /// A write was interrupted; retry without waiting for readiness.
    SendInterrupted,
    /// The handshake failed; the connection is unusable.
    Failed,
}

/// One TLS session bound to an accepted socket.
///
/// `recv` and `send` carry application bytes and report the same error
/// taxonomy as the plain socket layer. Record buffering is the session's
/// business: after a successful `recv` the caller asks
/// [`has_buffered_in`](TlsSession::has_buffered_in) whether plaintext
/// remains that the OS will never signal readiness for again.
pub trait TlsSession: Send {
    fn handshake(&mut self) -> HandshakeStatus;

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SockError>;

    fn send(&mut self, buf: &[u8]) -> Result<usize, SockError>;

    /// Decrypted bytes already held inside the session.
    fn has_buffered_in(&self) -> bool;

    /// Sends the close-notify alert.
    fn shutdown(&mut self) -> Result<(), SockError>;
}

/// Builds a [`TlsSession`] for every admitted socket of a TLS daemon.
pub trait TlsAcceptor: Send + Sync + 'static {
    fn accept(&self, fd: RawFd) -> Result<Box<dyn TlsSession>, SockError>;
}

/// PEM material and priorities handed to the acceptor.
#[derive(Debug, Clone, Default)]
pub struct TlsCredentials {
    /// Server private key, PEM.
    pub key_pem: Vec<u8>,
    /// Server certificate chain, PEM.
    pub cert_pem: Vec<u8>,
    /// Optional client-certificate trust anchors, PEM.
    pub trust_pem: Option<Vec<u8>>,
    /// Cipher-suite priority string in the backend's native syntax.
    pub priorities: Option<String>,
}
