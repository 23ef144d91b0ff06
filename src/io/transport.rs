//! The per-connection transmission endpoint: a plain socket or a socket
//! overlaid with a TLS session, behind one dispatch point.

use crate::errors::SockError;
use crate::net::socket::Socket;
use crate::tls::{HandshakeStatus, TlsSession};
use tracing::debug;

/// Handshake progress as seen by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeProgress {
    Done,
    WantRecv,
    WantSend,
    Failed,
}

pub(crate) struct Transport {
    pub(crate) sock: Socket,
    tls: Option<TlsOverlay>,
}

struct TlsOverlay {
    session: Box<dyn TlsSession>,
    established: bool,
}

impl Transport {
    pub(crate) fn plain(sock: Socket) -> Self {
        Self { sock, tls: None }
    }

    pub(crate) fn tls(sock: Socket, session: Box<dyn TlsSession>) -> Self {
        Self {
            sock,
            tls: Some(TlsOverlay {
                session,
                established: false,
            }),
        }
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// `true` once application data may flow (always, for plain sockets).
    pub(crate) fn established(&self) -> bool {
        self.tls.as_ref().map_or(true, |t| t.established)
    }

    /// Advances the TLS handshake, retrying interrupted steps inline.
    pub(crate) fn drive_handshake(&mut self) -> HandshakeProgress {
        let Some(tls) = self.tls.as_mut() else {
            return HandshakeProgress::Done;
        };
        if tls.established {
            return HandshakeProgress::Done;
        }

        loop {
            match tls.session.handshake() {
                HandshakeStatus::Complete => {
                    tls.established = true;
                    return HandshakeProgress::Done;
                }
                HandshakeStatus::RecvMoreNeeded => return HandshakeProgress::WantRecv,
                HandshakeStatus::SendMoreNeeded => return HandshakeProgress::WantSend,
                HandshakeStatus::RecvInterrupted | HandshakeStatus::SendInterrupted => continue,
                HandshakeStatus::Failed => {
                    debug!(fd = self.sock.fd(), "tls: handshake failed");
                    return HandshakeProgress::Failed;
                }
            }
        }
    }

    /// Plaintext already decrypted inside the TLS session. Such bytes never
    /// show up in OS readiness again, so the scheduler must treat the
    /// connection as receive-ready on its own.
    pub(crate) fn has_buffered_in(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.session.has_buffered_in())
    }

    /// Sends the TLS close alert, if any.
    pub(crate) fn shutdown_session(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            if tls.established {
                let _ = tls.session.shutdown();
            }
        }
    }

    /// Tears the transport apart for a protocol-upgrade handoff.
    pub(crate) fn into_parts(self) -> (Socket, Option<Box<dyn TlsSession>>) {
        (self.sock, self.tls.map(|t| t.session))
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut Box<dyn TlsSession>> {
        self.tls.as_mut().map(|t| &mut t.session)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("fd", &self.sock.fd())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Transport {
    /// Receives application bytes into `buf`.
    pub(crate) fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        match self.tls.as_mut() {
            Some(tls) => tls.session.recv(buf),
            None => self.sock.recv(buf),
        }
    }
}

pub(crate) use crate::net::socket::FileSend;
