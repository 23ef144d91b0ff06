//! Responses and the header-block serializer.
//!
//! A [`Response`] is an immutable description of what to send: status,
//! headers, a body location, and per-response behavior flags. Handlers
//! return them behind an `Arc`; a response marked reusable may be returned
//! for any number of requests concurrently. Serialization into a
//! connection's write buffer happens in two passes over the same part list,
//! one to size the block and one to copy it.

use crate::errors::TerminationReason;
use crate::http::types::{format_decimal, StatusCode, Version};
use bitflags::bitflags;
use std::fs::File;
use std::sync::Arc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ResponseFlags: u16 {
        /// May be returned for many requests; never consumed.
        const REUSABLE           = 1 << 0;
        /// Suppress the body even for methods that normally carry one.
        const HEAD_ONLY          = 1 << 1;
        /// Chunk the body even when its length is known.
        const FORCE_CHUNKED      = 1 << 2;
        /// Close the connection after this response.
        const CONN_CLOSE         = 1 << 3;
        /// Strict HTTP/1.0 compatibility: forces close, disables chunking.
        const HTTP10_STRICT      = 1 << 4;
        /// Downgrade the status-line version to HTTP/1.0.
        const HTTP10_SERVER      = 1 << 5;
        /// Suppress the automatic `Content-Length` header.
        const RAW_CONTENT_LENGTH = 1 << 6;
    }
}

/// One step of a dynamically produced body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// `n` bytes were written into the provided buffer.
    Data(usize),
    /// Nothing available yet; ask again later.
    Again,
    /// The body is complete.
    End,
}

/// Callback producing body bytes at a given absolute position.
pub type BodyGenerator = Box<dyn Fn(u64, &mut [u8]) -> Chunk + Send + Sync>;

/// Where the response body lives.
pub(crate) enum ReplyBody {
    Empty,
    /// A contiguous buffer owned by the response.
    Bytes(Arc<[u8]>),
    /// Produced incrementally into the connection buffer.
    Generator {
        /// Total length when known; `None` forces chunked framing on 1.1.
        hint: Option<u64>,
        produce: BodyGenerator,
    },
    /// A list of buffers transmitted with gather writes.
    Segments(Vec<Arc<[u8]>>),
    /// Served from disk through the sendfile fast path.
    File {
        file: Arc<File>,
        offset: u64,
        len: u64,
    },
}

impl ReplyBody {
    /// Declared body length, when it can be known up front.
    pub(crate) fn len_hint(&self) -> Option<u64> {
        match self {
            ReplyBody::Empty => Some(0),
            ReplyBody::Bytes(b) => Some(b.len() as u64),
            ReplyBody::Generator { hint, .. } => *hint,
            ReplyBody::Segments(segs) => Some(segs.iter().map(|s| s.len() as u64).sum()),
            ReplyBody::File { len, .. } => Some(*len),
        }
    }
}

type TerminationCallback = Arc<dyn Fn(TerminationReason) + Send + Sync>;

/// An HTTP response, built once and handed back from a request handler.
///
/// # Examples
/// ```
/// use hearth::{Response, StatusCode};
///
/// let resp = Response::builder(StatusCode::Ok)
///     .header("Content-Type", "text/plain")
///     .body_bytes("Hello world!")
///     .build();
/// assert_eq!(resp.status(), StatusCode::Ok);
/// ```
pub struct Response {
    status: StatusCode,
    headers: Vec<(Box<[u8]>, Box<[u8]>)>,
    footers: Vec<(Box<[u8]>, Box<[u8]>)>,
    pub(crate) body: ReplyBody,
    pub(crate) flags: ResponseFlags,
    pub(crate) termination: Option<TerminationCallback>,
}

impl Response {
    /// Starts building a response with the given status.
    pub fn builder(status: StatusCode) -> ResponseBuilder {
        ResponseBuilder {
            response: Response {
                status,
                headers: Vec::new(),
                footers: Vec::new(),
                body: ReplyBody::Empty,
                flags: ResponseFlags::empty(),
                termination: None,
            },
        }
    }

    /// A body-less response.
    pub fn empty(status: StatusCode) -> Arc<Self> {
        Self::builder(status).build()
    }

    /// A response around a copied byte buffer.
    pub fn bytes<B: AsRef<[u8]>>(status: StatusCode, body: B) -> Arc<Self> {
        Self::builder(status).body_bytes(body).build()
    }

    /// The configured status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub(crate) fn has_header(&self, name: &[u8]) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

}

/// Fluent constructor for [`Response`].
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    /// Appends a header. Framing headers (`Content-Length`,
    /// `Transfer-Encoding`, `Connection`, `Date`) are emitted automatically
    /// and should not be added here.
    pub fn header<N: AsRef<[u8]>, V: AsRef<[u8]>>(mut self, name: N, value: V) -> Self {
        self.response.headers.push((
            name.as_ref().to_vec().into_boxed_slice(),
            value.as_ref().to_vec().into_boxed_slice(),
        ));
        self
    }

    /// Appends a trailer sent after a chunked body.
    pub fn footer<N: AsRef<[u8]>, V: AsRef<[u8]>>(mut self, name: N, value: V) -> Self {
        self.response.footers.push((
            name.as_ref().to_vec().into_boxed_slice(),
            value.as_ref().to_vec().into_boxed_slice(),
        ));
        self
    }

    /// Body from a copied buffer.
    pub fn body_bytes<B: AsRef<[u8]>>(mut self, body: B) -> Self {
        self.response.body = ReplyBody::Bytes(Arc::from(body.as_ref()));
        self
    }

    /// Body from a shared buffer, without copying.
    pub fn body_shared(mut self, body: Arc<[u8]>) -> Self {
        self.response.body = ReplyBody::Bytes(body);
        self
    }

    /// Body produced on demand by `produce(position, buffer)`.
    ///
    /// With a `total_len` of `None` the reply uses chunked framing on
    /// HTTP/1.1 and close-delimited framing on HTTP/1.0.
    pub fn body_generator<F>(mut self, total_len: Option<u64>, produce: F) -> Self
    where
        F: Fn(u64, &mut [u8]) -> Chunk + Send + Sync + 'static,
    {
        self.response.body = ReplyBody::Generator {
            hint: total_len,
            produce: Box::new(produce),
        };
        self
    }

    /// Body from a list of buffers, transmitted with gather writes.
    pub fn body_segments(mut self, segments: Vec<Arc<[u8]>>) -> Self {
        self.response.body = ReplyBody::Segments(segments);
        self
    }

    /// Body served from an open file via the kernel sendfile path.
    pub fn body_file(mut self, file: File, offset: u64, len: u64) -> Self {
        self.response.body = ReplyBody::File {
            file: Arc::new(file),
            offset,
            len,
        };
        self
    }

    /// Marks the response shareable across requests.
    pub fn reusable(mut self) -> Self {
        self.response.flags.insert(ResponseFlags::REUSABLE);
        self
    }

    /// Suppresses the body while keeping the body-derived headers.
    pub fn head_only(mut self) -> Self {
        self.response.flags.insert(ResponseFlags::HEAD_ONLY);
        self
    }

    /// Forces chunked framing even when the body length is known.
    pub fn chunked(mut self) -> Self {
        self.response.flags.insert(ResponseFlags::FORCE_CHUNKED);
        self
    }

    /// Closes the connection after this response.
    pub fn close_connection(mut self) -> Self {
        self.response.flags.insert(ResponseFlags::CONN_CLOSE);
        self
    }

    /// Strict HTTP/1.0 compatibility: implies a close and never chunks.
    pub fn http_1_0_compatible_strict(mut self) -> Self {
        self.response
            .flags
            .insert(ResponseFlags::HTTP10_STRICT | ResponseFlags::CONN_CLOSE);
        self
    }

    /// Downgrades the status-line version to HTTP/1.0.
    pub fn http_1_0_server(mut self) -> Self {
        self.response.flags.insert(ResponseFlags::HTTP10_SERVER);
        self
    }

    /// Disables the automatic `Content-Length` header.
    pub fn raw_content_length(mut self) -> Self {
        self.response.flags.insert(ResponseFlags::RAW_CONTENT_LENGTH);
        self
    }

    /// Called with the termination reason once the response's delivery ends.
    pub fn termination_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(TerminationReason) + Send + Sync + 'static,
    {
        self.response.termination = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Arc<Response> {
        Arc::new(self.response)
    }
}

// SERIALIZATION

/// Framing resolved by the connection for one reply.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeaderPlan<'a> {
    /// Version written on the status line.
    pub(crate) version: Version,
    /// Emit `Transfer-Encoding: chunked`.
    pub(crate) chunked: bool,
    /// Emit `Content-Length` with this value.
    pub(crate) content_length: Option<u64>,
    /// Emit `Connection` with this value.
    pub(crate) connection: Option<&'a [u8]>,
    /// IMF-fixdate to emit unless the response already carries one.
    pub(crate) date: &'a [u8],
}

impl Response {
    fn for_each_part<'s, F: FnMut(&[u8])>(&'s self, plan: &HeaderPlan<'_>, mut emit: F) {
        emit(self.status.status_line(plan.version));

        for (name, value) in &self.headers {
            emit(name);
            emit(b": ");
            emit(value);
            emit(b"\r\n");
        }

        if let Some(len) = plan.content_length {
            let mut digits = [0u8; 20];
            emit(b"Content-Length: ");
            emit(format_decimal(len, &mut digits));
            emit(b"\r\n");
        }
        if plan.chunked {
            emit(b"Transfer-Encoding: chunked\r\n");
        }
        if let Some(connection) = plan.connection {
            emit(b"Connection: ");
            emit(connection);
            emit(b"\r\n");
        }
        if !plan.date.is_empty() && !self.has_header(b"date") {
            emit(b"Date: ");
            emit(plan.date);
            emit(b"\r\n");
        }

        emit(b"\r\n");
    }

    /// Exact byte size of the serialized header block.
    pub(crate) fn block_size(&self, plan: &HeaderPlan<'_>) -> usize {
        let mut size = 0;
        self.for_each_part(plan, |part| size += part.len());
        size
    }

    /// Writes the header block into `out`, returning the bytes written.
    /// `out` must be at least [`block_size`](Self::block_size) long.
    pub(crate) fn write_block(&self, plan: &HeaderPlan<'_>, out: &mut [u8]) -> usize {
        let mut pos = 0;
        self.for_each_part(plan, |part| {
            out[pos..pos + part.len()].copy_from_slice(part);
            pos += part.len();
        });
        pos
    }

    /// Size of the trailer block closing a chunked reply (after the
    /// zero-size chunk): footers, then a blank line.
    pub(crate) fn footer_block_size(&self) -> usize {
        let mut size = 2;
        for (name, value) in &self.footers {
            size += name.len() + 2 + value.len() + 2;
        }
        size
    }

    pub(crate) fn write_footer_block(&self, out: &mut [u8]) -> usize {
        let mut pos = 0;
        for (name, value) in &self.footers {
            for part in [name.as_ref(), b": ", value.as_ref(), b"\r\n"] {
                out[pos..pos + part.len()].copy_from_slice(part);
                pos += part.len();
            }
        }
        out[pos..pos + 2].copy_from_slice(b"\r\n");
        pos + 2
    }
}

/// Formats the current instant as an RFC 7231 IMF-fixdate.
pub(crate) fn imf_fixdate_now(buf: &mut [u8; 29]) -> usize {
    let formatted = chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    debug_assert_eq!(formatted.len(), 29);
    buf.copy_from_slice(formatted.as_bytes());
    29
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("flags", &self.flags)
            .finish()
    }
}
