//! Transmit pipeline.
//!
//! Three primitives sit between the state machine and the socket: a plain
//! buffer send, a combined header+body gather send, and the sendfile fast
//! path. Around each transmit the pipeline decides whether the kernel should
//! batch (`TCP_CORK`/`MSG_MORE`) or flush (`TCP_NODELAY`), keeping shadow
//! state so no redundant `setsockopt` is ever issued. TLS bypasses the
//! packetization logic entirely: records are the unit of transmission.

use crate::errors::SockError;
use crate::io::transport::{FileSend, Transport};
use std::io::IoSlice;
use std::os::fd::RawFd;

/// Header sizes in this window pack nicely with a typical path MTU; corking
/// such a header while the body is prepared avoids a split packet.
const CORK_SWEET_SPOT: std::ops::RangeInclusive<usize> = 1024..=1220;

/// Caller's intent for one transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendHint {
    /// Flush to the network immediately.
    PushData,
    /// Batching is fine; more data follows shortly.
    PreferBuffer,
    /// Header transmit: cork only when the size sits in the MTU sweet spot.
    HeaderCork,
}

impl Transport {
    /// Sends a contiguous range, returning how many bytes the kernel took.
    ///
    /// `last` marks the final transmit of the reply; once it completes the
    /// pipeline uncorks so everything buffered reaches the wire.
    pub(crate) fn send_buffer(
        &mut self,
        buf: &[u8],
        hint: SendHint,
        last: bool,
    ) -> Result<usize, SockError> {
        if self.is_tls() {
            let session = self.session_mut().ok_or(SockError::Internal)?;
            return session.send(buf);
        }

        let want_cork = want_cork(hint, buf.len());
        self.prepare_packetization(want_cork)?;

        let sent = self.sock.send(buf, want_cork && !last)?;
        if last && sent == buf.len() {
            self.flush_packetization()?;
        }
        Ok(sent)
    }

    /// Attempts one atomic transmit of `header` followed by `body`.
    ///
    /// The return value counts bytes across the concatenation; a result not
    /// exceeding `header.len()` means no body byte was taken. The two parts
    /// are never split across separate transmits here — without a gather
    /// primitive the body is simply left for the next call.
    pub(crate) fn send_header_and_body(
        &mut self,
        header: &[u8],
        body: &[u8],
        last: bool,
    ) -> Result<usize, SockError> {
        if self.is_tls() {
            // One record per call; the caller continues with the body.
            let session = self.session_mut().ok_or(SockError::Internal)?;
            return session.send(header);
        }
        if body.is_empty() {
            return self.send_buffer(header, SendHint::HeaderCork, last);
        }

        let total = header.len() + body.len();
        let want_cork = !last || want_cork(SendHint::HeaderCork, total);
        self.prepare_packetization(want_cork)?;

        let parts = [IoSlice::new(header), IoSlice::new(body)];
        let sent = self.sock.send_vectored(&parts, want_cork && !last)?;
        if last && sent == total {
            self.flush_packetization()?;
        }
        Ok(sent)
    }

    /// Gather-send over a reply's segment list.
    pub(crate) fn send_segments(
        &mut self,
        slices: &[IoSlice<'_>],
        last: bool,
    ) -> Result<usize, SockError> {
        if self.is_tls() {
            // One record at a time; the caller resumes from its position.
            let first = slices.first().ok_or(SockError::Internal)?;
            let session = self.session_mut().ok_or(SockError::Internal)?;
            return session.send(first);
        }

        let want_cork = !last;
        self.prepare_packetization(want_cork)?;
        let sent = self.sock.send_vectored(slices, want_cork)?;
        if last {
            let total: usize = slices.iter().map(|s| s.len()).sum();
            if sent == total {
                self.flush_packetization()?;
            }
        }
        Ok(sent)
    }

    /// Kernel-assisted file transmit. [`FileSend::Fallback`] asks the caller
    /// to downshift to the userspace copy path.
    pub(crate) fn send_from_file(
        &mut self,
        file_fd: RawFd,
        offset: u64,
        len: usize,
        last: bool,
    ) -> Result<FileSend, SockError> {
        if self.is_tls() {
            // Records must be encrypted in userspace.
            return Ok(FileSend::Fallback);
        }

        let outcome = self.sock.send_from_file(file_fd, offset, len)?;
        if last {
            if let FileSend::Sent(n) = outcome {
                if n == len {
                    self.flush_packetization()?;
                }
            }
        }
        Ok(outcome)
    }

    /// Aligns the socket options with the decision for this transmit.
    fn prepare_packetization(&mut self, want_cork: bool) -> Result<(), SockError> {
        if want_cork {
            self.sock.set_cork(true)
        } else {
            if self.sock.cork_on() {
                self.sock.set_cork(false)?;
            }
            self.sock.set_nodelay(true)
        }
    }

    /// After the final transmit of a reply: uncork so the kernel pushes any
    /// coalesced remainder.
    fn flush_packetization(&mut self) -> Result<(), SockError> {
        if self.sock.cork_on() {
            self.sock.set_cork(false)?;
        }
        Ok(())
    }
}

fn want_cork(hint: SendHint, len: usize) -> bool {
    match hint {
        SendHint::PushData => false,
        SendHint::PreferBuffer => true,
        SendHint::HeaderCork => CORK_SWEET_SPOT.contains(&len),
    }
}
