//! The parsed request a handler sees.
//!
//! Parsing is zero-copy: every component is a span into the connection's
//! read buffer, resolved against that buffer only while a handler callback
//! is running. Nothing here survives the connection's arena reset.

use crate::daemon::slots::ConnectionId;
use crate::http::types::{Method, Version};
use std::net::SocketAddr;

/// Half-open byte range into the connection read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub(crate) start: usize,
    pub(crate) end: usize,
}

impl Span {
    pub(crate) const EMPTY: Span = Span { start: 0, end: 0 };

    pub(crate) const fn len(&self) -> usize {
        self.end - self.start
    }

    pub(crate) fn of<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }
}

/// One header field (or trailer field, after a chunked body).
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeaderField {
    pub(crate) name: Span,
    pub(crate) value: Span,
    pub(crate) footer: bool,
}

/// Everything the parser extracted from the current request.
#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub(crate) method: Method,
    pub(crate) method_raw: Span,
    /// Percent-decoded in place; may be shorter than the wire form.
    pub(crate) path: Span,
    /// Raw query string, without the `?`.
    pub(crate) query: Option<Span>,
    pub(crate) version: Version,
    pub(crate) headers: Vec<HeaderField>,

    pub(crate) content_length: Option<u64>,
    pub(crate) chunked: bool,
    pub(crate) expects_continue: bool,
    pub(crate) wants_upgrade: bool,
    pub(crate) host_count: u32,
    pub(crate) connection_close: bool,
    pub(crate) connection_keep_alive: bool,
}

impl ParsedRequest {
    pub(crate) fn new() -> Self {
        Self {
            method: Method::Get,
            method_raw: Span::EMPTY,
            path: Span::EMPTY,
            query: None,
            version: Version::Http11,
            headers: Vec::with_capacity(16),
            content_length: None,
            chunked: false,
            expects_continue: false,
            wants_upgrade: false,
            host_count: 0,
            connection_close: false,
            connection_keep_alive: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.method_raw = Span::EMPTY;
        self.path = Span::EMPTY;
        self.query = None;
        self.version = Version::Http11;
        self.headers.clear();
        self.content_length = None;
        self.chunked = false;
        self.expects_continue = false;
        self.wants_upgrade = false;
        self.host_count = 0;
        self.connection_close = false;
        self.connection_keep_alive = false;
    }

    /// Whether a message body follows the header block.
    pub(crate) fn has_body(&self) -> bool {
        self.chunked || self.content_length.is_some_and(|n| n > 0)
    }

    pub(crate) fn lookup<'a>(&self, buf: &'a [u8], name: &[u8], footer: bool) -> Option<&'a [u8]> {
        self.headers
            .iter()
            .find(|h| h.footer == footer && h.name.of(buf).eq_ignore_ascii_case(name))
            .map(|h| h.value.of(buf))
    }
}

/// A fully framed (or, for body callbacks, partially received) HTTP request.
///
/// Handed to [`Handler`](crate::Handler) callbacks by reference; all byte
/// slices point into the connection's receive buffer and are valid only for
/// the duration of the callback.
pub struct Request<'a> {
    pub(crate) buf: &'a [u8],
    pub(crate) inner: &'a ParsedRequest,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) id: ConnectionId,
}

impl<'a> Request<'a> {
    /// The request method.
    #[inline(always)]
    pub fn method(&self) -> Method {
        self.inner.method
    }

    /// Raw method token, useful when [`method`](Self::method) reports
    /// [`Method::Other`].
    #[inline(always)]
    pub fn method_raw(&self) -> &'a [u8] {
        self.inner.method_raw.of(self.buf)
    }

    /// Percent-decoded request path.
    #[inline(always)]
    pub fn path(&self) -> &'a [u8] {
        self.inner.path.of(self.buf)
    }

    /// Raw query string without the leading `?`, if one was present.
    #[inline(always)]
    pub fn query(&self) -> Option<&'a [u8]> {
        self.inner.query.map(|s| s.of(self.buf))
    }

    /// Protocol version from the request line.
    #[inline(always)]
    pub fn version(&self) -> Version {
        self.inner.version
    }

    /// First header value with the given name, matched case-insensitively.
    #[inline]
    pub fn header(&self, name: &[u8]) -> Option<&'a [u8]> {
        self.inner.lookup(self.buf, name, false)
    }

    /// Every value carried by headers with the given name, in wire order.
    pub fn header_values(&self, name: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + '_ {
        let buf = self.buf;
        self.inner
            .headers
            .iter()
            .filter(move |h| !h.footer && h.name.of(buf).eq_ignore_ascii_case(name))
            .map(move |h| h.value.of(buf))
    }

    /// Iterates all header fields as `(name, value)` pairs.
    pub fn headers(&self) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + '_ {
        let buf = self.buf;
        self.inner
            .headers
            .iter()
            .filter(|h| !h.footer)
            .map(move |h| (h.name.of(buf), h.value.of(buf)))
    }

    /// First trailer value with the given name (chunked requests only).
    #[inline]
    pub fn trailer(&self, name: &[u8]) -> Option<&'a [u8]> {
        self.inner.lookup(self.buf, name, true)
    }

    /// Declared `Content-Length`, when the body is not chunked.
    #[inline(always)]
    pub fn content_length(&self) -> Option<u64> {
        self.inner.content_length
    }

    /// Whether the request body uses chunked transfer encoding.
    #[inline(always)]
    pub fn is_chunked(&self) -> bool {
        self.inner.chunked
    }

    /// Whether the client asked for a protocol upgrade.
    #[inline(always)]
    pub fn upgrade_requested(&self) -> bool {
        self.inner.wants_upgrade
    }

    /// The client's address.
    #[inline(always)]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Stable identifier for this connection, usable with
    /// [`Daemon::resume`](crate::Daemon::resume) after a handler suspends.
    #[inline(always)]
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl std::fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method())
            .field("path", &String::from_utf8_lossy(self.path()))
            .field("version", &self.version())
            .field("headers", &self.inner.headers.len())
            .field("remote", &self.remote_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::slots::ConnectionId;

    fn request_over(buf: &[u8], inner: &ParsedRequest) -> (SocketAddr, ConnectionId) {
        let _ = (buf, inner);
        ("127.0.0.1:1".parse().unwrap(), ConnectionId::test_value())
    }

    #[test]
    fn multi_value_lookup_preserves_order() {
        let buf = b"Accept: text/html\r\nAccept: text/plain\r\nHost: x\r\n";
        let mut inner = ParsedRequest::new();
        inner.headers.push(HeaderField {
            name: Span { start: 0, end: 6 },
            value: Span { start: 8, end: 17 },
            footer: false,
        });
        inner.headers.push(HeaderField {
            name: Span { start: 19, end: 25 },
            value: Span { start: 27, end: 37 },
            footer: false,
        });
        inner.headers.push(HeaderField {
            name: Span { start: 39, end: 43 },
            value: Span { start: 45, end: 46 },
            footer: false,
        });

        let (remote_addr, id) = request_over(buf, &inner);
        let req = Request {
            buf,
            inner: &inner,
            remote_addr,
            id,
        };

        assert_eq!(req.header(b"accept"), Some(&b"text/html"[..]));
        let all: Vec<_> = req.header_values(b"ACCEPT").collect();
        assert_eq!(all, vec![&b"text/html"[..], &b"text/plain"[..]]);
        assert_eq!(req.header(b"host"), Some(&b"x"[..]));
        assert_eq!(req.header(b"missing"), None);
    }

    #[test]
    fn trailers_are_separate_from_headers() {
        let buf = b"X-Sum: abc\r\n";
        let mut inner = ParsedRequest::new();
        inner.headers.push(HeaderField {
            name: Span { start: 0, end: 5 },
            value: Span { start: 7, end: 10 },
            footer: true,
        });

        let (remote_addr, id) = request_over(buf, &inner);
        let req = Request {
            buf,
            inner: &inner,
            remote_addr,
            id,
        };

        assert_eq!(req.header(b"x-sum"), None);
        assert_eq!(req.trailer(b"x-sum"), Some(&b"abc"[..]));
        assert_eq!(req.headers().count(), 0);
    }

    #[test]
    fn body_presence() {
        let mut inner = ParsedRequest::new();
        assert!(!inner.has_body());

        inner.content_length = Some(0);
        assert!(!inner.has_body());

        inner.content_length = Some(4);
        assert!(inner.has_body());

        inner.content_length = None;
        inner.chunked = true;
        assert!(inner.has_body());
    }
}
