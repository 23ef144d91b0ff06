//! The per-connection protocol state machine.
//!
//! Every readiness event buys a connection one tick: a receive pass that
//! pulls bytes into the arena-backed read buffer, a processing pass that
//! walks the stage graph as far as the buffered bytes and the write path
//! allow, and a transmit pass that drains whatever the stages produced.
//! Idle accounting (timeouts, cleanup) belongs to the daemon core.

use crate::conn::stage::{KeepAlive, Readiness, Stage};
use crate::daemon::slots::{ConnectionId, Links, ListId, LIST_COUNT};
use crate::daemon::timeouts::now_ms;
use crate::errors::{RequestError, SockError, TerminationReason};
use crate::handler::{BodyDecision, Handler, HandlerAction};
use crate::http::parser::{self, ChunkDecoder, ChunkStep, HeaderLine};
use crate::http::request::{HeaderField, ParsedRequest, Request};
use crate::http::response::{
    imf_fixdate_now, Chunk, HeaderPlan, ReplyBody, Response, ResponseFlags,
};
use crate::http::types::{format_hex, Method, StatusCode, Version};
use crate::io::send::SendHint;
use crate::io::transport::{FileSend, HandshakeProgress, Transport};
use crate::options::DaemonOptions;
use crate::pool::{MemoryPool, PoolRange};
use crate::tls::TlsSession;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const CONTINUE_100: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

const READ_BUFFER_INITIAL: usize = 2 * 1024;
const READ_BUFFER_STEP: usize = 2 * 1024;
/// Smallest workable arena; options below this are clamped up.
const MIN_MEMORY_LIMIT: usize = 4 * 1024;

/// Reserved prefix of the chunk scratch buffer: up to 8 hex digits plus
/// CRLF, written right-aligned against the payload.
const CHUNK_PREFIX: usize = 10;
const CHUNK_SUFFIX: usize = 2;
const CHUNK_PAYLOAD_MAX: usize = 8 * 1024;

/// Per-tick environment supplied by the daemon core.
pub(crate) struct TickContext<'a> {
    pub(crate) handler: &'a Arc<dyn Handler>,
    pub(crate) options: &'a DaemonOptions,
    pub(crate) id: ConnectionId,
}

/// Where the bytes of the current reply body come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentLocation {
    /// Directly out of the response's own buffer.
    ResponseBuffer,
    /// Staged through the connection's scratch buffer.
    ConnBuffer,
    /// Gather-sent from the response's segment list.
    Segments,
    /// sendfile from the response's file.
    File,
}

struct ReplyState {
    response: Arc<Response>,
    location: ContentLocation,
    /// Body bytes handed to the transport (or staged, for the
    /// connection-buffer path).
    body_pos: u64,
    total: Option<u64>,
    chunked: bool,
    send_body: bool,
    /// The body source reported `End`.
    source_done: bool,
}

pub(crate) struct Connection {
    pub(crate) transport: Transport,
    pub(crate) remote_addr: SocketAddr,

    pool: MemoryPool,
    read_buf: PoolRange,
    /// Parsed up to here, relative to the read buffer.
    read_offset: usize,
    /// Filled up to here.
    read_append: usize,
    /// Offset where the current request's body bytes begin.
    body_region: usize,

    write_buf: Option<PoolRange>,
    write_send: usize,
    /// Scratch for generator output and chunk framing.
    chunk_buf: Option<PoolRange>,
    chunk_frame_start: usize,
    chunk_frame_end: usize,
    conn_body_filled: usize,
    conn_body_sent: usize,

    pub(crate) stage: Stage,
    keep_alive: KeepAlive,
    request: ParsedRequest,
    chunk_decoder: ChunkDecoder,
    body_remaining: u64,
    continue_offset: usize,
    reply: Option<ReplyState>,

    pub(crate) readiness: Readiness,
    tls_has_data_in: bool,
    handshake_want: Option<HandshakeProgress>,

    last_activity: u64,
    timeout_override: Option<Duration>,
    pub(crate) suspended: bool,
    pub(crate) resuming: bool,
    /// Whether this connection currently occupies its per-IP admission
    /// slot. Suspended connections give the slot up and reclaim it on
    /// resume, so the IP table always mirrors the non-suspended set.
    pub(crate) ip_counted: bool,

    ever_received: bool,
    termination: Option<TerminationReason>,

    links: [Links; LIST_COUNT],
}

impl Connection {
    pub(crate) fn new(
        transport: Transport,
        remote_addr: SocketAddr,
        memory_limit: usize,
    ) -> Box<Self> {
        let mut pool = MemoryPool::new(memory_limit.max(MIN_MEMORY_LIMIT));
        let read_buf = pool
            .allocate(READ_BUFFER_INITIAL)
            .expect("arena smaller than the initial read buffer");

        Box::new(Self {
            transport,
            remote_addr,
            pool,
            read_buf,
            read_offset: 0,
            read_append: 0,
            body_region: 0,
            write_buf: None,
            write_send: 0,
            chunk_buf: None,
            chunk_frame_start: 0,
            chunk_frame_end: 0,
            conn_body_filled: 0,
            conn_body_sent: 0,
            stage: Stage::Init,
            keep_alive: KeepAlive::MayReuse,
            request: ParsedRequest::new(),
            chunk_decoder: ChunkDecoder::new(),
            body_remaining: 0,
            continue_offset: 0,
            reply: None,
            readiness: Readiness::empty(),
            tls_has_data_in: false,
            handshake_want: None,
            last_activity: now_ms(),
            timeout_override: None,
            suspended: false,
            resuming: false,
            ip_counted: true,
            ever_received: false,
            termination: None,
            links: [Links::default(); LIST_COUNT],
        })
    }

    // Bookkeeping accessors used by the daemon core.

    pub(crate) fn links(&self, id: ListId) -> &Links {
        &self.links[id as usize]
    }

    pub(crate) fn links_mut(&mut self, id: ListId) -> &mut Links {
        &mut self.links[id as usize]
    }

    pub(crate) fn last_activity_ms(&self) -> u64 {
        self.last_activity
    }

    pub(crate) fn set_last_activity_ms(&mut self, value: u64) {
        self.last_activity = value;
    }

    pub(crate) fn timeout_override(&self) -> Option<Duration> {
        self.timeout_override
    }

    pub(crate) fn set_timeout_override(&mut self, value: Option<Duration>) {
        self.timeout_override = value;
    }

    pub(crate) fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub(crate) fn set_termination(&mut self, reason: TerminationReason) {
        self.termination = Some(reason);
    }

    /// Whether a request ever started; a peer that connects and leaves
    /// without sending a byte is torn down without notifications or logs.
    pub(crate) fn request_started(&self) -> bool {
        self.ever_received
    }

    /// Event interest for the level-triggered pollers.
    pub(crate) fn wanted(&self) -> (bool, bool) {
        if self.suspended || self.is_closing() {
            return (false, false);
        }
        match self.handshake_want {
            Some(HandshakeProgress::WantRecv) => return (true, false),
            Some(HandshakeProgress::WantSend) => return (false, true),
            _ => {}
        }

        let recv = self.stage.consumes_input();
        let send = self.stage.is_sending_reply() || self.stage == Stage::ContinueSending;
        (recv, send)
    }

    /// Whether cached readiness alone lets the next tick make progress,
    /// keeping the connection on the edge-triggered ready list.
    pub(crate) fn has_actionable_readiness(&self) -> bool {
        let (want_recv, want_send) = self.wanted();
        let recv = want_recv
            && (self.readiness.contains(Readiness::RECV_READY) || self.tls_has_data_in);
        let send = want_send && self.readiness.contains(Readiness::SEND_READY);
        recv || send || self.resuming
    }

    pub(crate) fn is_closing(&self) -> bool {
        matches!(self.stage, Stage::PreClosing | Stage::Closed)
    }

    /// Marks the connection for teardown with the given reason.
    pub(crate) fn queue_close(&mut self, reason: TerminationReason) {
        if self.is_closing() {
            return;
        }
        self.termination = Some(reason);
        self.stage = Stage::PreClosing;
    }

    /// Releases the socket (and any TLS session) for an upgrade handoff,
    /// together with bytes already buffered past the request.
    pub(crate) fn into_upgrade_parts(
        mut self: Box<Self>,
    ) -> (
        crate::net::socket::Socket,
        Option<Box<dyn TlsSession>>,
        Vec<u8>,
    ) {
        let extra =
            self.pool.slice(self.read_buf)[self.read_offset..self.read_append].to_vec();
        self.stage = Stage::UpgradedCleaning;
        let (sock, tls) = self.transport.into_parts();
        (sock, tls, extra)
    }

    // TICK

    pub(crate) fn tick(&mut self, ctx: &TickContext<'_>) {
        if self.suspended || self.is_closing() {
            return;
        }

        if !self.transport.established() {
            match self.transport.drive_handshake() {
                HandshakeProgress::Done => {
                    self.handshake_want = None;
                    if self.stage == Stage::Init {
                        self.stage = Stage::ReqLineReceiving;
                    }
                }
                progress @ (HandshakeProgress::WantRecv | HandshakeProgress::WantSend) => {
                    self.handshake_want = Some(progress);
                    return;
                }
                HandshakeProgress::Failed => {
                    self.readiness.insert(Readiness::ERROR_READY);
                    self.queue_close(TerminationReason::WithError);
                    return;
                }
            }
        }

        self.handle_recv();
        self.process(ctx);
        self.handle_send();
        self.process(ctx);
    }

    // RECEIVE PASS

    fn handle_recv(&mut self) {
        if self.is_closing() || self.suspended {
            return;
        }
        if !self.stage.consumes_input() {
            return;
        }
        if !(self.readiness.contains(Readiness::RECV_READY) || self.tls_has_data_in) {
            return;
        }

        if self.read_append == self.read_buf.len && !self.grow_read_buffer() {
            // No room; the processing pass decides which limit tripped.
            return;
        }

        let window_start = self.read_buf.offset + self.read_append;
        let window_len = self.read_buf.len - self.read_append;

        match self
            .transport
            .recv(self.pool.window_mut(window_start, window_len))
        {
            Ok(n) => {
                self.read_append += n;
                self.ever_received = true;
                self.last_activity = now_ms();
                if n < window_len {
                    self.readiness.remove(Readiness::RECV_READY);
                }
                self.tls_has_data_in = self.transport.has_buffered_in();
            }
            Err(SockError::Again) => {
                self.readiness.remove(Readiness::RECV_READY);
                self.tls_has_data_in = false;
            }
            Err(SockError::Intr) => {}
            Err(SockError::RemoteDisconnected) => {
                if self.ever_received {
                    debug!(peer = %self.remote_addr, "connection: client closed mid-request");
                }
                self.queue_close(TerminationReason::ClientAbort);
            }
            Err(err) => {
                debug!(peer = %self.remote_addr, %err, "connection: receive failed");
                self.readiness.insert(Readiness::ERROR_READY);
                self.queue_close(TerminationReason::ReadError);
            }
        }
    }

    fn grow_read_buffer(&mut self) -> bool {
        match self
            .pool
            .reallocate_last(self.read_buf, self.read_buf.len + READ_BUFFER_STEP)
        {
            Ok(range) => {
                self.read_buf = range;
                true
            }
            Err(_) => false,
        }
    }

    /// Reclaims consumed body space so long bodies stream through a
    /// bounded buffer. Only safe once every buffered byte was consumed.
    fn rewind_body_window(&mut self) {
        if self.read_offset == self.read_append && self.read_offset > self.body_region {
            self.read_offset = self.body_region;
            self.read_append = self.body_region;
        }
    }

    /// Slides a partial body frame down to the body region when the
    /// buffer filled up behind it.
    fn compact_body_window(&mut self) -> bool {
        if self.read_offset == self.body_region {
            return false;
        }
        let len = self.read_append - self.read_offset;
        self.pool.move_bytes(
            self.read_buf.offset + self.read_offset,
            len,
            self.read_buf.offset + self.body_region,
        );
        self.read_offset = self.body_region;
        self.read_append = self.body_region + len;
        true
    }

    // PROCESSING PASS

    fn process(&mut self, ctx: &TickContext<'_>) {
        loop {
            match self.stage {
                Stage::Init => {
                    if !self.transport.established() {
                        break;
                    }
                    self.stage = Stage::ReqLineReceiving;
                }

                Stage::ReqLineReceiving => {
                    if !self.advance_request_line(ctx) {
                        break;
                    }
                }
                Stage::ReqLineReceived => self.stage = Stage::HeadersReceiving,
                Stage::HeadersReceiving => {
                    if !self.advance_header_block(false) {
                        break;
                    }
                }
                Stage::HeadersReceived => {
                    let result =
                        parser::process_headers(self.pool.slice(self.read_buf), &mut self.request);
                    match result {
                        Ok(()) => self.stage = Stage::HeadersProcessed,
                        Err(err) => self.fail_request(err),
                    }
                }
                Stage::HeadersProcessed => self.advance_headers_processed(ctx),

                Stage::ContinueSending => {
                    if self.continue_offset < CONTINUE_100.len() {
                        break;
                    }
                    self.continue_offset = 0;
                    self.stage = Stage::BodyReceiving;
                }

                Stage::BodyReceiving => {
                    if !self.advance_body(ctx) {
                        break;
                    }
                }
                Stage::BodyReceived => {
                    self.stage = if self.request.chunked {
                        Stage::FootersReceiving
                    } else {
                        Stage::FullReqReceived
                    };
                }
                Stage::FootersReceiving => {
                    if !self.advance_header_block(true) {
                        break;
                    }
                }
                Stage::FootersReceived => self.stage = Stage::FullReqReceived,
                Stage::FullReqReceived => self.stage = Stage::ReqRecvFinished,

                Stage::ReqRecvFinished => {
                    let action = {
                        let view = self.request_view(ctx);
                        ctx.handler.respond(&view)
                    };
                    match action {
                        HandlerAction::Respond(response) => {
                            self.resuming = false;
                            match self.install_reply(response) {
                                Ok(()) => self.stage = Stage::StartReply,
                                Err(err) => self.fail_request(err),
                            }
                        }
                        HandlerAction::Suspend => {
                            trace!(peer = %self.remote_addr, "connection: suspended by handler");
                            self.suspended = true;
                            break;
                        }
                    }
                }

                Stage::StartReply => {
                    self.stage = if self.keep_alive == KeepAlive::MustUpgrade {
                        Stage::UpgradeHeadersSending
                    } else {
                        Stage::HeadersSending
                    };
                }

                Stage::HeadersSending => {
                    if !self.write_buffer_drained() {
                        break;
                    }
                    self.release_write_buffer();
                    match &self.reply {
                        None => self.stage = Stage::FullReplySent,
                        Some(reply) => {
                            // The combined header+body transmit may already
                            // have moved body bytes.
                            if reply.send_body && !reply.chunked && reply.body_pos > 0 {
                                self.stage = if Some(reply.body_pos) == reply.total {
                                    Stage::FullReplySent
                                } else {
                                    Stage::UnchunkedBodyReady
                                };
                            } else {
                                self.stage = Stage::HeadersSent;
                            }
                        }
                    }
                }
                Stage::HeadersSent => {
                    let reply = self.reply.as_ref().expect("reply state in send phase");
                    self.stage = if !reply.send_body {
                        Stage::FullReplySent
                    } else if reply.chunked {
                        Stage::ChunkedBodyUnready
                    } else {
                        Stage::UnchunkedBodyUnready
                    };
                }

                Stage::UnchunkedBodyUnready => {
                    if !self.prepare_unchunked_body() {
                        break;
                    }
                }
                Stage::UnchunkedBodyReady => {
                    if !self.finish_unchunked_segment() {
                        break;
                    }
                }

                Stage::ChunkedBodyUnready => {
                    if !self.prepare_chunk_frame() {
                        break;
                    }
                }
                Stage::ChunkedBodyReady => {
                    if self.chunk_frame_start < self.chunk_frame_end {
                        break;
                    }
                    self.stage = Stage::ChunkedBodyUnready;
                }
                Stage::ChunkedBodySent => {
                    if !self.write_buffer_drained() {
                        break;
                    }
                    self.release_write_buffer();
                    if self.stage_footer_block() {
                        self.stage = Stage::FootersSending;
                    }
                }
                Stage::FootersSending => {
                    if !self.write_buffer_drained() {
                        break;
                    }
                    self.release_write_buffer();
                    self.stage = Stage::FullReplySent;
                }

                Stage::FullReplySent => {
                    self.finish_request(ctx);
                    if self.stage != Stage::Init {
                        break;
                    }
                }

                Stage::UpgradeHeadersSending => {
                    if !self.write_buffer_drained() {
                        break;
                    }
                    self.release_write_buffer();
                    // The daemon core performs the handoff.
                    self.stage = Stage::Upgrading;
                    break;
                }

                Stage::Upgrading
                | Stage::Upgraded
                | Stage::UpgradedCleaning
                | Stage::PreClosing
                | Stage::Closed => break,
            }
        }
    }

    fn request_view<'a>(&'a self, ctx: &TickContext<'_>) -> Request<'a> {
        Request {
            buf: self.pool.slice(self.read_buf),
            inner: &self.request,
            remote_addr: self.remote_addr,
            id: ctx.id,
        }
    }

    fn advance_headers_processed(&mut self, ctx: &TickContext<'_>) {
        self.keep_alive = self.decide_keep_alive();
        self.body_region = self.read_offset;

        if !self.request.has_body() {
            self.stage = Stage::FullReqReceived;
            return;
        }

        let decision = {
            let view = self.request_view(ctx);
            ctx.handler.expect_body(&view)
        };
        match decision {
            BodyDecision::Accept => {
                self.body_remaining = self.request.content_length.unwrap_or(0);
                if self.request.expects_continue {
                    self.continue_offset = 0;
                    self.stage = Stage::ContinueSending;
                } else {
                    self.stage = Stage::BodyReceiving;
                }
            }
            BodyDecision::Refuse => {
                let err = if self.request.expects_continue {
                    RequestError::ExpectationFailed
                } else {
                    RequestError::BodyTooLarge
                };
                self.fail_request(err);
            }
        }
    }

    /// Request line: locate, bound, parse. Returns false when blocked.
    fn advance_request_line(&mut self, ctx: &TickContext<'_>) -> bool {
        let max_line = ctx.options.max_uri_length;

        let line = parser::find_line(
            self.pool.slice(self.read_buf),
            self.read_offset,
            self.read_append,
        );
        let line = match line {
            Err(()) => {
                self.fail_request(RequestError::BadRequestLine);
                return true;
            }
            Ok(Some(line)) => line,
            Ok(None) => {
                if self.read_append - self.read_offset > max_line {
                    self.fail_request(RequestError::UriTooLong);
                    return true;
                }
                if self.read_append == self.read_buf.len && !self.grow_read_buffer() {
                    self.fail_request(RequestError::UriTooLong);
                    return true;
                }
                return false;
            }
        };

        if line.end - line.start > max_line {
            self.fail_request(RequestError::UriTooLong);
            return true;
        }

        let result = parser::parse_request_line(
            self.pool.slice_mut(self.read_buf),
            line,
            &mut self.request,
        );
        match result {
            Ok(()) => {
                self.read_offset = line.next;
                self.stage = Stage::ReqLineReceived;
            }
            Err(err) => self.fail_request(err),
        }
        true
    }

    /// Header or trailer block line loop. Returns false when blocked.
    fn advance_header_block(&mut self, footer: bool) -> bool {
        loop {
            let line = parser::find_line(
                self.pool.slice(self.read_buf),
                self.read_offset,
                self.read_append,
            );
            let line = match line {
                Err(()) => {
                    self.fail_request(RequestError::BadHeader);
                    return true;
                }
                Ok(Some(line)) => line,
                Ok(None) => {
                    if self.read_append == self.read_buf.len {
                        if footer && self.compact_body_window() {
                            continue;
                        }
                        if !self.grow_read_buffer() {
                            self.fail_request(RequestError::HeadersTooLarge);
                            return true;
                        }
                    }
                    return false;
                }
            };

            let parsed = parser::parse_header_line(self.pool.slice(self.read_buf), line);
            match parsed {
                Ok(HeaderLine::Blank) => {
                    self.read_offset = line.next;
                    self.stage = if footer {
                        Stage::FootersReceived
                    } else {
                        Stage::HeadersReceived
                    };
                    return true;
                }
                Ok(HeaderLine::Field { name, value }) => {
                    self.read_offset = line.next;
                    self.request
                        .headers
                        .push(HeaderField { name, value, footer });
                }
                Err(err) => {
                    self.fail_request(err);
                    return true;
                }
            }
        }
    }

    /// Body bytes: deliver to the handler, fixed-length or chunked.
    /// Returns false when blocked on input.
    fn advance_body(&mut self, ctx: &TickContext<'_>) -> bool {
        if self.request.chunked {
            loop {
                let step = {
                    let buf = self.pool.slice(self.read_buf);
                    self.chunk_decoder
                        .step(buf, &mut self.read_offset, self.read_append)
                };
                match step {
                    Ok(ChunkStep::Data { start, len }) => {
                        {
                            let view = self.request_view(ctx);
                            let chunk = &self.pool.slice(self.read_buf)[start..start + len];
                            ctx.handler.body_chunk(&view, chunk);
                        }
                        self.last_activity = now_ms();
                    }
                    Ok(ChunkStep::NeedMore) => {
                        self.rewind_body_window();
                        if self.read_append == self.read_buf.len
                            && !self.grow_read_buffer()
                            && !self.compact_body_window()
                        {
                            self.fail_request(RequestError::BadChunk);
                            return true;
                        }
                        return false;
                    }
                    Ok(ChunkStep::Finished) => {
                        self.stage = Stage::BodyReceived;
                        return true;
                    }
                    Err(err) => {
                        self.fail_request(err);
                        return true;
                    }
                }
            }
        } else {
            while self.body_remaining > 0 {
                let avail = self.read_append - self.read_offset;
                if avail == 0 {
                    self.rewind_body_window();
                    return false;
                }
                let take = (avail as u64).min(self.body_remaining) as usize;
                let start = self.read_offset;
                {
                    let view = self.request_view(ctx);
                    let chunk = &self.pool.slice(self.read_buf)[start..start + take];
                    ctx.handler.body_chunk(&view, chunk);
                }
                self.read_offset += take;
                self.body_remaining -= take as u64;
                self.last_activity = now_ms();
                self.rewind_body_window();
            }
            self.stage = Stage::BodyReceived;
            true
        }
    }

    fn decide_keep_alive(&self) -> KeepAlive {
        if self.request.connection_close {
            return KeepAlive::MustClose;
        }
        match self.request.version {
            Version::Http11 => KeepAlive::MayReuse,
            Version::Http10 => {
                if self.request.connection_keep_alive {
                    KeepAlive::MayReuse
                } else {
                    KeepAlive::MustClose
                }
            }
        }
    }

    // REPLY CONSTRUCTION

    fn install_reply(&mut self, response: Arc<Response>) -> Result<(), RequestError> {
        let flags = response.flags;
        let status = response.status();

        if flags.contains(ResponseFlags::CONN_CLOSE) {
            self.keep_alive = KeepAlive::MustClose;
        }

        let upgrading = status == StatusCode::SwitchingProtocols && self.request.wants_upgrade;
        if upgrading {
            self.keep_alive = KeepAlive::MustUpgrade;
        }

        let version = if flags.contains(ResponseFlags::HTTP10_SERVER) {
            Version::Http10
        } else {
            self.request.version
        };

        let head_request = self.request.method == Method::Head;
        let send_body = !head_request
            && !status.is_bodyless()
            && !flags.contains(ResponseFlags::HEAD_ONLY)
            && !upgrading;

        let total = response.body.len_hint();
        let chunking_allowed =
            version == Version::Http11 && !flags.contains(ResponseFlags::HTTP10_STRICT);
        let mut chunked = false;
        if send_body {
            if total.is_none() {
                if chunking_allowed {
                    chunked = true;
                } else {
                    // Close-delimited body for HTTP/1.0 peers.
                    self.keep_alive = KeepAlive::MustClose;
                }
            } else if flags.contains(ResponseFlags::FORCE_CHUNKED) && chunking_allowed {
                chunked = true;
            }
        }

        let content_length = if flags.contains(ResponseFlags::RAW_CONTENT_LENGTH)
            || chunked
            || upgrading
            || status.is_bodyless()
        {
            None
        } else {
            // HEAD and head-only replies still announce the body size.
            total
        };

        // An HTTP/1.0 keep-alive without a length has no framing.
        if self.keep_alive == KeepAlive::MayReuse
            && version == Version::Http10
            && content_length.is_none()
        {
            self.keep_alive = KeepAlive::MustClose;
        }

        let connection: Option<&[u8]> = if upgrading {
            if response.has_header(b"connection") {
                None
            } else {
                Some(b"Upgrade")
            }
        } else {
            match (self.keep_alive, self.request.version) {
                (KeepAlive::MustClose, _) => Some(b"close"),
                (KeepAlive::MayReuse, Version::Http10) => Some(b"Keep-Alive"),
                _ => None,
            }
        };

        let mut date = [0u8; 29];
        imf_fixdate_now(&mut date);
        let plan = HeaderPlan {
            version,
            chunked,
            content_length,
            connection,
            date: &date,
        };

        let size = response.block_size(&plan);
        let range = self
            .pool
            .allocate_back(size)
            .map_err(|_| RequestError::ReplyFailed)?;
        response.write_block(&plan, self.pool.slice_mut(range));
        self.write_buf = Some(range);
        self.write_send = 0;

        let location = if chunked {
            ContentLocation::ConnBuffer
        } else {
            match &response.body {
                ReplyBody::Empty | ReplyBody::Bytes(_) => ContentLocation::ResponseBuffer,
                ReplyBody::Generator { .. } => ContentLocation::ConnBuffer,
                ReplyBody::Segments(_) => ContentLocation::Segments,
                ReplyBody::File { .. } => ContentLocation::File,
            }
        };

        self.reply = Some(ReplyState {
            response,
            location,
            body_pos: 0,
            total,
            chunked,
            send_body,
            source_done: false,
        });
        Ok(())
    }

    /// Serializes a canned rejection and routes the connection into the
    /// reply-sending stages with a forced close.
    fn fail_request(&mut self, err: RequestError) {
        debug!(peer = %self.remote_addr, %err, "connection: rejecting request");

        let bytes = err.as_http(self.request.version);

        // The arena may be exhausted by the very condition being reported;
        // rewind it, sacrificing request state that is no longer needed.
        self.pool.reset();
        self.request.reset();
        self.read_buf = self
            .pool
            .allocate(READ_BUFFER_INITIAL)
            .expect("arena smaller than the initial read buffer");
        self.read_offset = 0;
        self.read_append = 0;
        self.body_region = 0;
        self.chunk_buf = None;
        self.reply = None;

        let Ok(range) = self.pool.allocate_back(bytes.len()) else {
            self.queue_close(TerminationReason::WithError);
            return;
        };
        self.pool.slice_mut(range).copy_from_slice(bytes);
        self.write_buf = Some(range);
        self.write_send = 0;

        self.keep_alive = KeepAlive::MustClose;
        self.termination = Some(TerminationReason::WithError);
        self.stage = Stage::HeadersSending;
    }

    fn write_buffer_drained(&self) -> bool {
        match self.write_buf {
            Some(range) => self.write_send >= range.len,
            None => true,
        }
    }

    fn release_write_buffer(&mut self) {
        self.write_buf = None;
        self.write_send = 0;
    }

    /// Pulls body bytes from the response source into `dest`, at the
    /// reply's current body position.
    fn produce_body(reply: &ReplyState, dest: &mut [u8]) -> Result<Chunk, SockError> {
        match &reply.response.body {
            ReplyBody::Empty => Ok(Chunk::End),
            ReplyBody::Bytes(bytes) => {
                let pos = reply.body_pos as usize;
                if pos >= bytes.len() {
                    return Ok(Chunk::End);
                }
                let take = dest.len().min(bytes.len() - pos);
                dest[..take].copy_from_slice(&bytes[pos..pos + take]);
                Ok(Chunk::Data(take))
            }
            ReplyBody::Generator { produce, .. } => Ok(produce(reply.body_pos, dest)),
            ReplyBody::Segments(segments) => {
                let mut skip = reply.body_pos as usize;
                let mut written = 0;
                for segment in segments {
                    if skip >= segment.len() {
                        skip -= segment.len();
                        continue;
                    }
                    let take = (segment.len() - skip).min(dest.len() - written);
                    dest[written..written + take].copy_from_slice(&segment[skip..skip + take]);
                    written += take;
                    skip = 0;
                    if written == dest.len() {
                        break;
                    }
                }
                if written == 0 {
                    Ok(Chunk::End)
                } else {
                    Ok(Chunk::Data(written))
                }
            }
            ReplyBody::File { file, offset, len } => {
                use std::os::unix::fs::FileExt;

                if reply.body_pos >= *len {
                    return Ok(Chunk::End);
                }
                let take = dest.len().min((*len - reply.body_pos) as usize);
                match file.read_at(&mut dest[..take], offset + reply.body_pos) {
                    Ok(0) => Ok(Chunk::End),
                    Ok(n) => Ok(Chunk::Data(n)),
                    Err(err) => {
                        warn!(%err, "connection: reply file read failed");
                        Err(SockError::Other)
                    }
                }
            }
        }
    }

    fn ensure_chunk_buffer(&mut self) -> Result<PoolRange, SockError> {
        if let Some(range) = self.chunk_buf {
            return Ok(range);
        }
        let payload = CHUNK_PAYLOAD_MAX
            .min(self.pool.remaining().saturating_sub(64) / 2)
            .max(256);
        let range = self
            .pool
            .allocate_back(CHUNK_PREFIX + payload + CHUNK_SUFFIX)
            .map_err(|_| SockError::NoMem)?;
        self.chunk_buf = Some(range);
        Ok(range)
    }

    /// Stages the next body piece for an unchunked reply. Returns false
    /// when nothing could be staged yet.
    fn prepare_unchunked_body(&mut self) -> bool {
        {
            let reply = self.reply.as_ref().expect("reply state in body phase");
            if Some(reply.body_pos) == reply.total || reply.source_done {
                self.stage = Stage::FullReplySent;
                return true;
            }
            match reply.location {
                ContentLocation::ResponseBuffer
                | ContentLocation::Segments
                | ContentLocation::File => {
                    // The source is always ready; transmission tracks position.
                    self.stage = Stage::UnchunkedBodyReady;
                    return true;
                }
                ContentLocation::ConnBuffer => {}
            }
        }

        let range = match self.ensure_chunk_buffer() {
            Ok(range) => range,
            Err(_) => {
                self.queue_close(TerminationReason::WriteError);
                return true;
            }
        };

        let outcome = Self::produce_body(
            self.reply.as_ref().expect("reply state in body phase"),
            self.pool.slice_mut(range),
        );
        match outcome {
            Ok(Chunk::Data(0)) | Ok(Chunk::Again) => false,
            Ok(Chunk::Data(n)) => {
                self.reply.as_mut().expect("checked above").body_pos += n as u64;
                self.conn_body_filled = n;
                self.conn_body_sent = 0;
                self.stage = Stage::UnchunkedBodyReady;
                true
            }
            Ok(Chunk::End) => {
                let reply = self.reply.as_mut().expect("checked above");
                reply.source_done = true;
                if reply.total.is_some_and(|t| reply.body_pos < t) {
                    debug!(peer = %self.remote_addr, "connection: reply source ended early");
                    self.queue_close(TerminationReason::WriteError);
                } else {
                    self.stage = Stage::FullReplySent;
                }
                true
            }
            Err(_) => {
                self.queue_close(TerminationReason::WriteError);
                true
            }
        }
    }

    /// Advances past a fully transmitted unchunked segment. Returns false
    /// while transmission is still in flight.
    fn finish_unchunked_segment(&mut self) -> bool {
        let reply = self.reply.as_ref().expect("reply state in body phase");

        match reply.location {
            ContentLocation::ConnBuffer => {
                if self.conn_body_sent < self.conn_body_filled {
                    return false;
                }
                self.stage = Stage::UnchunkedBodyUnready;
                true
            }
            _ => {
                if Some(reply.body_pos) == reply.total {
                    self.stage = Stage::FullReplySent;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Frames the next chunk of a chunked reply in the scratch buffer.
    /// Returns false when the source has nothing yet.
    fn prepare_chunk_frame(&mut self) -> bool {
        let range = match self.ensure_chunk_buffer() {
            Ok(range) => range,
            Err(_) => {
                self.queue_close(TerminationReason::WriteError);
                return true;
            }
        };
        let payload_cap = range.len - CHUNK_PREFIX - CHUNK_SUFFIX;

        let outcome = {
            let reply = self.reply.as_ref().expect("reply state in body phase");
            let scratch = self.pool.slice_mut(range);
            Self::produce_body(reply, &mut scratch[CHUNK_PREFIX..CHUNK_PREFIX + payload_cap])
        };

        match outcome {
            Ok(Chunk::Data(0)) | Ok(Chunk::Again) => false,
            Ok(Chunk::Data(n)) => {
                self.reply.as_mut().expect("checked above").body_pos += n as u64;

                let buf = self.pool.slice_mut(range);
                buf[CHUNK_PREFIX + n] = b'\r';
                buf[CHUNK_PREFIX + n + 1] = b'\n';

                let mut hex = [0u8; 16];
                let digits = format_hex(n as u64, &mut hex);
                let start = CHUNK_PREFIX - digits.len() - 2;
                buf[start..start + digits.len()].copy_from_slice(digits);
                buf[CHUNK_PREFIX - 2] = b'\r';
                buf[CHUNK_PREFIX - 1] = b'\n';

                self.chunk_frame_start = start;
                self.chunk_frame_end = CHUNK_PREFIX + n + CHUNK_SUFFIX;
                self.stage = Stage::ChunkedBodyReady;
                true
            }
            Ok(Chunk::End) => {
                self.reply.as_mut().expect("checked above").source_done = true;
                // The zero-size chunk goes out, then the trailer block.
                match self.pool.allocate_back(3) {
                    Ok(last) => {
                        self.pool.slice_mut(last).copy_from_slice(b"0\r\n");
                        self.write_buf = Some(last);
                        self.write_send = 0;
                        self.stage = Stage::ChunkedBodySent;
                    }
                    Err(_) => self.queue_close(TerminationReason::WriteError),
                }
                true
            }
            Err(_) => {
                self.queue_close(TerminationReason::WriteError);
                true
            }
        }
    }

    /// Serializes trailers plus the final blank line.
    fn stage_footer_block(&mut self) -> bool {
        let response = self
            .reply
            .as_ref()
            .expect("reply state in footer phase")
            .response
            .clone();
        let size = response.footer_block_size();
        match self.pool.allocate_back(size) {
            Ok(range) => {
                response.write_footer_block(self.pool.slice_mut(range));
                self.write_buf = Some(range);
                self.write_send = 0;
                true
            }
            Err(_) => {
                self.queue_close(TerminationReason::WriteError);
                false
            }
        }
    }

    /// One request/response round-trip is complete.
    fn finish_request(&mut self, ctx: &TickContext<'_>) {
        let reason = self
            .termination
            .take()
            .unwrap_or(TerminationReason::CompletedOk);

        if let Some(reply) = &self.reply {
            if let Some(callback) = &reply.response.termination {
                callback(reason);
            }
        }
        if let Some(notify) = &ctx.options.notify_completed {
            notify(self.remote_addr, reason);
        }

        // Whatever the kernel still holds corked belongs on the wire now.
        let _ = self.transport.sock.set_cork(false);

        match self.keep_alive {
            KeepAlive::MayReuse => {
                trace!(peer = %self.remote_addr, "connection: keep-alive reuse");
                self.reset_for_next_request();
            }
            _ => self.stage = Stage::PreClosing,
        }
    }

    /// Rewinds the arena and carries pipelined bytes into the next request.
    fn reset_for_next_request(&mut self) {
        let leftover_len = self.read_append - self.read_offset;
        let leftover_src = self.read_buf.offset + self.read_offset;

        self.pool.reset();
        self.read_buf = self
            .pool
            .allocate(READ_BUFFER_INITIAL.max(leftover_len))
            .expect("arena smaller than the initial read buffer");
        debug_assert!(self.read_buf.offset <= leftover_src);
        if leftover_len > 0 {
            self.pool
                .move_bytes(leftover_src, leftover_len, self.read_buf.offset);
        }

        self.read_offset = 0;
        self.read_append = leftover_len;
        self.body_region = 0;
        self.write_buf = None;
        self.write_send = 0;
        self.chunk_buf = None;
        self.chunk_frame_start = 0;
        self.chunk_frame_end = 0;
        self.conn_body_filled = 0;
        self.conn_body_sent = 0;
        self.request.reset();
        self.chunk_decoder.reset();
        self.body_remaining = 0;
        self.continue_offset = 0;
        self.reply = None;
        self.keep_alive = KeepAlive::MayReuse;
        self.termination = None;
        self.stage = Stage::Init;
    }

    // TRANSMIT PASS

    fn handle_send(&mut self) {
        if self.is_closing() || self.suspended {
            return;
        }
        if !self.readiness.contains(Readiness::SEND_READY) {
            return;
        }
        if !self.stage.produces_output() {
            return;
        }

        let result = match self.stage {
            Stage::ContinueSending => self.send_continue(),
            Stage::HeadersSending | Stage::UpgradeHeadersSending => self.send_header_block(),
            Stage::ChunkedBodySent | Stage::FootersSending => {
                self.send_write_buffer(self.stage == Stage::FootersSending)
            }
            Stage::UnchunkedBodyReady => self.send_unchunked_body(),
            Stage::ChunkedBodyReady => self.send_chunk_frame(),
            _ => Ok(()),
        };

        if let Err(err) = result {
            self.on_send_error(err);
        }
    }

    fn on_send_error(&mut self, err: SockError) {
        match err {
            SockError::Again => {
                self.readiness.remove(Readiness::SEND_READY);
            }
            SockError::Intr => {}
            hard => {
                debug!(peer = %self.remote_addr, err = %hard, "connection: transmit failed");
                self.readiness.insert(Readiness::ERROR_READY);
                let reason = match hard {
                    SockError::Pipe | SockError::ConnReset => TerminationReason::ClientAbort,
                    _ => TerminationReason::WriteError,
                };
                self.queue_close(reason);
            }
        }
    }

    fn send_continue(&mut self) -> Result<(), SockError> {
        let remaining = &CONTINUE_100[self.continue_offset..];
        if remaining.is_empty() {
            return Ok(());
        }
        let n = self
            .transport
            .send_buffer(remaining, SendHint::PushData, false)?;
        self.continue_offset += n;
        self.last_activity = now_ms();
        Ok(())
    }

    /// Header-block transmit, combining the body into the same syscall
    /// when it lives in the response buffer.
    fn send_header_block(&mut self) -> Result<(), SockError> {
        let Some(range) = self.write_buf else {
            return Ok(());
        };
        let header_remaining = range.len - self.write_send;
        if header_remaining == 0 {
            return Ok(());
        }
        let header_offset = range.offset + self.write_send;

        let combine = match (&self.reply, self.stage) {
            (Some(reply), Stage::HeadersSending) => {
                reply.send_body
                    && !reply.chunked
                    && reply.location == ContentLocation::ResponseBuffer
            }
            _ => false,
        };

        if combine {
            let (body, body_pos) = {
                let reply = self.reply.as_ref().expect("checked above");
                let bytes: Arc<[u8]> = match &reply.response.body {
                    ReplyBody::Bytes(bytes) => bytes.clone(),
                    _ => Arc::from(&[][..]),
                };
                (bytes, reply.body_pos as usize)
            };

            let n = self.transport.send_header_and_body(
                self.pool.window(header_offset, header_remaining),
                &body[body_pos..],
                true,
            )?;

            let header_taken = n.min(header_remaining);
            self.write_send += header_taken;
            let body_taken = n - header_taken;
            if body_taken > 0 {
                self.reply.as_mut().expect("checked above").body_pos += body_taken as u64;
            }
        } else {
            let last = match (&self.reply, self.stage) {
                (None, _) => true,
                (Some(_), Stage::UpgradeHeadersSending) => true,
                (Some(reply), _) => !reply.send_body,
            };
            let n = self.transport.send_buffer(
                self.pool.window(header_offset, header_remaining),
                SendHint::HeaderCork,
                last,
            )?;
            self.write_send += n;
        }
        self.last_activity = now_ms();
        Ok(())
    }

    /// Drains the generic write buffer (the zero-chunk, trailer blocks).
    fn send_write_buffer(&mut self, last: bool) -> Result<(), SockError> {
        let Some(range) = self.write_buf else {
            return Ok(());
        };
        let remaining = range.len - self.write_send;
        if remaining == 0 {
            return Ok(());
        }

        let hint = if last {
            SendHint::PushData
        } else {
            SendHint::PreferBuffer
        };
        let n = self.transport.send_buffer(
            self.pool.window(range.offset + self.write_send, remaining),
            hint,
            last,
        )?;
        self.write_send += n;
        self.last_activity = now_ms();
        Ok(())
    }

    fn send_unchunked_body(&mut self) -> Result<(), SockError> {
        let location = self
            .reply
            .as_ref()
            .expect("reply state in body phase")
            .location;

        match location {
            ContentLocation::ResponseBuffer => {
                let (bytes, pos) = {
                    let reply = self.reply.as_ref().expect("checked above");
                    let bytes: Arc<[u8]> = match &reply.response.body {
                        ReplyBody::Bytes(bytes) => bytes.clone(),
                        ReplyBody::Empty => Arc::from(&[][..]),
                        _ => return Err(SockError::Internal),
                    };
                    (bytes, reply.body_pos as usize)
                };
                if pos >= bytes.len() {
                    return Ok(());
                }
                let n = self
                    .transport
                    .send_buffer(&bytes[pos..], SendHint::PushData, true)?;
                self.reply.as_mut().expect("checked above").body_pos += n as u64;
            }
            ContentLocation::Segments => {
                let (segments, pos) = {
                    let reply = self.reply.as_ref().expect("checked above");
                    let segments: Vec<Arc<[u8]>> = match &reply.response.body {
                        ReplyBody::Segments(segments) => segments.clone(),
                        _ => return Err(SockError::Internal),
                    };
                    (segments, reply.body_pos as usize)
                };

                let mut skip = pos;
                let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(segments.len());
                for segment in &segments {
                    if skip >= segment.len() {
                        skip -= segment.len();
                        continue;
                    }
                    slices.push(IoSlice::new(&segment[skip..]));
                    skip = 0;
                    if slices.len() == 32 {
                        break;
                    }
                }
                if slices.is_empty() {
                    return Ok(());
                }
                let n = self.transport.send_segments(&slices, true)?;
                self.reply.as_mut().expect("checked above").body_pos += n as u64;
            }
            ContentLocation::File => {
                let (fd, offset, len, pos) = {
                    let reply = self.reply.as_ref().expect("checked above");
                    match &reply.response.body {
                        ReplyBody::File { file, offset, len } => {
                            (file.as_raw_fd(), *offset, *len, reply.body_pos)
                        }
                        _ => return Err(SockError::Internal),
                    }
                };
                let remaining = (len - pos) as usize;
                if remaining == 0 {
                    return Ok(());
                }
                match self
                    .transport
                    .send_from_file(fd, offset + pos, remaining, true)?
                {
                    FileSend::Sent(n) => {
                        self.reply.as_mut().expect("checked above").body_pos += n as u64;
                    }
                    FileSend::Fallback => {
                        trace!(peer = %self.remote_addr, "connection: sendfile fell back to copy");
                        self.reply.as_mut().expect("checked above").location =
                            ContentLocation::ConnBuffer;
                        self.stage = Stage::UnchunkedBodyUnready;
                    }
                }
            }
            ContentLocation::ConnBuffer => {
                let range = self.chunk_buf.expect("scratch buffer in body phase");
                let remaining = self.conn_body_filled - self.conn_body_sent;
                if remaining == 0 {
                    return Ok(());
                }
                let (hint, last) = {
                    let reply = self.reply.as_ref().expect("checked above");
                    let last = reply.total == Some(reply.body_pos) || reply.source_done;
                    if last {
                        (SendHint::PushData, true)
                    } else {
                        (SendHint::PreferBuffer, false)
                    }
                };
                let n = self.transport.send_buffer(
                    self.pool
                        .window(range.offset + self.conn_body_sent, remaining),
                    hint,
                    last,
                )?;
                self.conn_body_sent += n;
            }
        }
        self.last_activity = now_ms();
        Ok(())
    }

    fn send_chunk_frame(&mut self) -> Result<(), SockError> {
        let range = self.chunk_buf.expect("scratch buffer in chunked phase");
        let remaining = self.chunk_frame_end - self.chunk_frame_start;
        if remaining == 0 {
            return Ok(());
        }

        let n = self.transport.send_buffer(
            self.pool
                .window(range.offset + self.chunk_frame_start, remaining),
            SendHint::PreferBuffer,
            false,
        )?;
        self.chunk_frame_start += n;
        self.last_activity = now_ms();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Box<Self> {
        let sock = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        let sock = crate::net::socket::Socket::from_accepted(sock).unwrap();
        Connection::new(
            Transport::plain(sock),
            "127.0.0.1:0".parse().unwrap(),
            32 * 1024,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::Socket;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    struct Fixture {
        conn: Box<Connection>,
        peer: TcpStream,
        handler: Arc<dyn Handler>,
        options: DaemonOptions,
    }

    impl Fixture {
        fn new(handler: impl Handler) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
            let (accepted, addr) = listener.accept().unwrap();
            let sock = Socket::from_accepted(socket2::Socket::from(accepted)).unwrap();
            let conn = Connection::new(Transport::plain(sock), addr, 32 * 1024);

            Self {
                conn,
                peer,
                handler: Arc::new(handler),
                options: DaemonOptions::default(),
            }
        }

        /// One tick with full (level-style) readiness.
        fn tick(&mut self) {
            let ctx = TickContext {
                handler: &self.handler,
                options: &self.options,
                id: ConnectionId::test_value(),
            };
            self.conn
                .readiness
                .insert(Readiness::RECV_READY | Readiness::SEND_READY);
            self.conn.tick(&ctx);
        }

        fn send(&mut self, bytes: &[u8]) {
            self.peer.write_all(bytes).unwrap();
        }

        /// Ticks until `deadline` while collecting whatever the server sent.
        fn collect_response(&mut self, until_closed: bool) -> Vec<u8> {
            let mut out = Vec::new();
            let deadline = Instant::now() + Duration::from_secs(3);
            let mut buf = [0u8; 4096];

            while Instant::now() < deadline {
                self.tick();
                match self.peer.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buf[..n]);
                        if !until_closed && !out.is_empty() {
                            // Drain a little longer for trailing pieces.
                            for _ in 0..5 {
                                self.tick();
                                match self.peer.read(&mut buf) {
                                    Ok(0) => return out,
                                    Ok(n) => out.extend_from_slice(&buf[..n]),
                                    Err(_) => {}
                                }
                            }
                            return out;
                        }
                    }
                    Err(_) => {
                        if self.conn.is_closing() {
                            break;
                        }
                    }
                }
            }
            out
        }
    }

    struct StaticHandler;

    impl Handler for StaticHandler {
        fn respond(&self, req: &Request<'_>) -> HandlerAction {
            if req.path() == b"/hello" {
                HandlerAction::Respond(Response::bytes(StatusCode::Ok, "hi"))
            } else {
                HandlerAction::Respond(Response::empty(StatusCode::NotFound))
            }
        }
    }

    fn response_text(fixture: &mut Fixture) -> String {
        String::from_utf8(fixture.collect_response(false)).unwrap()
    }

    #[test]
    fn simple_get_round_trip() {
        let mut fixture = Fixture::new(StaticHandler);
        fixture.send(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");

        let text = response_text(&mut fixture);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("Content-Length: 2\r\n"), "{text}");
        assert!(text.contains("Date: "), "{text}");
        assert!(text.ends_with("\r\n\r\nhi"), "{text}");
        assert!(!text.contains("Connection:"), "{text}");

        // Keep-alive: the connection is back at the start of a request.
        assert_eq!(fixture.conn.stage, Stage::ReqLineReceiving);
        assert!(!fixture.conn.is_closing());
    }

    #[test]
    fn not_found_and_reuse() {
        let mut fixture = Fixture::new(StaticHandler);
        fixture.send(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
        let text = response_text(&mut fixture);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{text}");

        fixture.send(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        let text = response_text(&mut fixture);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    }

    #[test]
    fn pipelined_requests_answered_in_order() {
        let mut fixture = Fixture::new(StaticHandler);
        fixture.send(
            b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\nGET /missing HTTP/1.1\r\nHost: x\r\n\r\n",
        );

        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            fixture.tick();
            if let Ok(n) = fixture.peer.read(&mut buf) {
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            let text = String::from_utf8_lossy(&out);
            if text.contains("404") {
                break;
            }
        }

        let text = String::from_utf8_lossy(&out);
        let first = text.find("200 OK").expect("first response");
        let second = text.find("404 Not Found").expect("second response");
        assert!(first < second, "{text}");
    }

    #[test]
    fn connection_close_honored() {
        let mut fixture = Fixture::new(StaticHandler);
        fixture.send(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");

        let text = String::from_utf8(fixture.collect_response(true)).unwrap();
        assert!(text.contains("Connection: close\r\n"), "{text}");
        assert!(fixture.conn.is_closing());
    }

    #[test]
    fn http10_needs_explicit_keep_alive() {
        let mut fixture = Fixture::new(StaticHandler);
        fixture.send(b"GET /hello HTTP/1.0\r\n\r\n");
        let text = String::from_utf8(fixture.collect_response(true)).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "{text}");
        assert!(text.contains("Connection: close\r\n"), "{text}");
        assert!(fixture.conn.is_closing());

        let mut fixture = Fixture::new(StaticHandler);
        fixture.send(b"GET /hello HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        let text = response_text(&mut fixture);
        assert!(text.contains("Connection: Keep-Alive\r\n"), "{text}");
        assert!(text.contains("Content-Length: 2\r\n"), "{text}");
        assert!(!fixture.conn.is_closing());
    }

    #[test]
    fn head_suppresses_body_keeps_length() {
        let mut fixture = Fixture::new(StaticHandler);
        fixture.send(b"HEAD /hello HTTP/1.1\r\nHost: x\r\n\r\n");

        let text = response_text(&mut fixture);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("Content-Length: 2\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\n"), "{text}");
    }

    #[test]
    fn bodyless_status_skips_body_stages() {
        struct NoContent;
        impl Handler for NoContent {
            fn respond(&self, _: &Request<'_>) -> HandlerAction {
                HandlerAction::Respond(Response::bytes(StatusCode::NoContent, "ignored"))
            }
        }

        let mut fixture = Fixture::new(NoContent);
        fixture.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let text = response_text(&mut fixture);
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"), "{text}");
        assert!(!text.contains("Content-Length"), "{text}");
        assert!(text.ends_with("\r\n\r\n"), "{text}");
    }

    #[test]
    fn chunked_response_framing() {
        struct Chunky;
        impl Handler for Chunky {
            fn respond(&self, _: &Request<'_>) -> HandlerAction {
                HandlerAction::Respond(
                    Response::builder(StatusCode::Ok)
                        .body_generator(None, |pos, dest| match pos {
                            0 => {
                                dest[..2].copy_from_slice(b"ab");
                                Chunk::Data(2)
                            }
                            2 => {
                                dest[..3].copy_from_slice(b"cde");
                                Chunk::Data(3)
                            }
                            _ => Chunk::End,
                        })
                        .build(),
                )
            }
        }

        let mut fixture = Fixture::new(Chunky);
        fixture.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            fixture.tick();
            if let Ok(n) = fixture.peer.read(&mut buf) {
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            if out.ends_with(b"0\r\n\r\n") {
                break;
            }
        }

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"), "{text}");
        let body_start = text.find("\r\n\r\n").unwrap() + 4;
        assert_eq!(&text[body_start..], "2\r\nab\r\n3\r\ncde\r\n0\r\n\r\n");
    }

    #[test]
    fn fixed_length_body_delivered_in_pieces() {
        use std::sync::Mutex;

        struct Collect(Arc<Mutex<Vec<u8>>>);
        impl Handler for Collect {
            fn body_chunk(&self, _: &Request<'_>, chunk: &[u8]) {
                self.0.lock().unwrap().extend_from_slice(chunk);
            }
            fn respond(&self, req: &Request<'_>) -> HandlerAction {
                assert_eq!(req.content_length(), Some(11));
                HandlerAction::Respond(Response::empty(StatusCode::Created))
            }
        }

        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut fixture = Fixture::new(Collect(sink.clone()));
        fixture.send(b"POST /in HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello");
        fixture.tick();
        fixture.send(b" world");

        let text = response_text(&mut fixture);
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"), "{text}");
        assert_eq!(sink.lock().unwrap().as_slice(), b"hello world");
    }

    #[test]
    fn chunked_request_with_trailers() {
        use std::sync::Mutex;

        struct Collect(Arc<Mutex<Vec<u8>>>);
        impl Handler for Collect {
            fn body_chunk(&self, _: &Request<'_>, chunk: &[u8]) {
                self.0.lock().unwrap().extend_from_slice(chunk);
            }
            fn respond(&self, req: &Request<'_>) -> HandlerAction {
                assert!(req.is_chunked());
                assert_eq!(req.trailer(b"x-sum"), Some(&b"ok"[..]));
                HandlerAction::Respond(Response::empty(StatusCode::Ok))
            }
        }

        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut fixture = Fixture::new(Collect(sink.clone()));
        fixture.send(
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\nX-Sum: ok\r\n\r\n",
        );

        let text = response_text(&mut fixture);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert_eq!(sink.lock().unwrap().as_slice(), b"hello world");
    }

    #[test]
    fn expect_continue_accepted() {
        struct Accepting;
        impl Handler for Accepting {
            fn respond(&self, _: &Request<'_>) -> HandlerAction {
                HandlerAction::Respond(Response::empty(StatusCode::Ok))
            }
        }

        let mut fixture = Fixture::new(Accepting);
        fixture.send(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
        );

        // First the interim response must arrive on its own.
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && !out.ends_with(b"100 Continue\r\n\r\n") {
            fixture.tick();
            if let Ok(n) = fixture.peer.read(&mut buf) {
                out.extend_from_slice(&buf[..n]);
            }
        }
        assert_eq!(out, b"HTTP/1.1 100 Continue\r\n\r\n");

        fixture.send(b"data");
        let text = response_text(&mut fixture);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    }

    #[test]
    fn expect_continue_refused_gets_417() {
        struct Refusing;
        impl Handler for Refusing {
            fn expect_body(&self, _: &Request<'_>) -> BodyDecision {
                BodyDecision::Refuse
            }
            fn respond(&self, _: &Request<'_>) -> HandlerAction {
                unreachable!("refused body must not reach respond");
            }
        }

        let mut fixture = Fixture::new(Refusing);
        fixture.send(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
        );

        let text = String::from_utf8(fixture.collect_response(true)).unwrap();
        assert!(!text.contains("100 Continue"), "{text}");
        assert!(text.starts_with("HTTP/1.1 417 Expectation Failed\r\n"), "{text}");
        assert!(fixture.conn.is_closing());
    }

    #[test]
    fn malformed_request_line_gets_400() {
        let mut fixture = Fixture::new(StaticHandler);
        fixture.send(b"BAD-LINE\r\n");

        let text = String::from_utf8(fixture.collect_response(true)).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
        assert!(fixture.conn.is_closing());
        assert_eq!(fixture.conn.termination(), None); // consumed by completion
    }

    #[test]
    fn oversized_request_line_gets_414() {
        let mut fixture = Fixture::new(StaticHandler);
        fixture.options.max_uri_length = 64;

        let long = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "q".repeat(100));
        fixture.send(long.as_bytes());

        let text = String::from_utf8(fixture.collect_response(true)).unwrap();
        assert!(text.starts_with("HTTP/1.1 414 URI Too Long\r\n"), "{text}");
    }

    #[test]
    fn request_line_boundary_is_inclusive() {
        // A request line exactly at the limit passes.
        let mut fixture = Fixture::new(StaticHandler);
        fixture.options.max_uri_length = 32;

        let path_len = 32 - "GET  HTTP/1.1".len();
        let line = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "a".repeat(path_len - 1));
        fixture.send(line.as_bytes());

        let text = response_text(&mut fixture);
        assert!(text.starts_with("HTTP/1.1 404"), "{text}");
    }

    #[test]
    fn segments_body_concatenates() {
        struct Segmented;
        impl Handler for Segmented {
            fn respond(&self, _: &Request<'_>) -> HandlerAction {
                HandlerAction::Respond(
                    Response::builder(StatusCode::Ok)
                        .body_segments(vec![
                            Arc::from(&b"seg-one|"[..]),
                            Arc::from(&b"seg-two"[..]),
                        ])
                        .build(),
                )
            }
        }

        let mut fixture = Fixture::new(Segmented);
        fixture.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

        let text = response_text(&mut fixture);
        assert!(text.contains("Content-Length: 15\r\n"), "{text}");
        assert!(text.ends_with("seg-one|seg-two"), "{text}");
    }

    #[test]
    fn file_body_via_sendfile() {
        use std::io::Seek;

        struct FromFile;
        impl Handler for FromFile {
            fn respond(&self, _: &Request<'_>) -> HandlerAction {
                let dir = std::env::temp_dir();
                let path = dir.join(format!("hearth-conn-file-{}", std::process::id()));
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .read(true)
                    .write(true)
                    .open(&path)
                    .unwrap();
                let _ = std::fs::remove_file(&path);
                file.write_all(b"file-contents").unwrap();
                file.rewind().unwrap();

                HandlerAction::Respond(
                    Response::builder(StatusCode::Ok)
                        .body_file(file, 0, 13)
                        .build(),
                )
            }
        }

        let mut fixture = Fixture::new(FromFile);
        fixture.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

        let text = response_text(&mut fixture);
        assert!(text.contains("Content-Length: 13\r\n"), "{text}");
        assert!(text.ends_with("file-contents"), "{text}");
    }

    #[test]
    fn upgrade_negotiation_reaches_handoff() {
        struct Upgrader;
        impl Handler for Upgrader {
            fn respond(&self, req: &Request<'_>) -> HandlerAction {
                assert!(req.upgrade_requested());
                HandlerAction::Respond(
                    Response::builder(StatusCode::SwitchingProtocols)
                        .header("Upgrade", "X")
                        .build(),
                )
            }
        }

        let mut fixture = Fixture::new(Upgrader);
        fixture.send(b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: X\r\nConnection: Upgrade\r\n\r\nping");

        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && fixture.conn.stage != Stage::Upgrading {
            fixture.tick();
            if let Ok(n) = fixture.peer.read(&mut buf) {
                out.extend_from_slice(&buf[..n]);
            }
        }

        let text = String::from_utf8(out).unwrap();
        assert!(
            text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
            "{text}"
        );
        assert!(text.contains("Upgrade: X\r\n"), "{text}");
        assert!(text.contains("Connection: Upgrade\r\n"), "{text}");
        assert_eq!(fixture.conn.stage, Stage::Upgrading);

        let (_sock, tls, extra) = fixture.conn.into_upgrade_parts();
        assert!(tls.is_none());
        assert_eq!(extra, b"ping");
    }

    #[test]
    fn suspend_and_resume_round_trip() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Suspender(AtomicBool);
        impl Handler for Suspender {
            fn respond(&self, _: &Request<'_>) -> HandlerAction {
                if self.0.swap(true, Ordering::SeqCst) {
                    HandlerAction::Respond(Response::bytes(StatusCode::Ok, "late"))
                } else {
                    HandlerAction::Suspend
                }
            }
        }

        let mut fixture = Fixture::new(Suspender(AtomicBool::new(false)));
        fixture.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

        for _ in 0..20 {
            fixture.tick();
            if fixture.conn.suspended {
                break;
            }
        }
        assert!(fixture.conn.suspended);
        assert_eq!(fixture.conn.stage, Stage::ReqRecvFinished);

        fixture.conn.suspended = false;
        fixture.conn.resuming = true;
        let text = response_text(&mut fixture);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.ends_with("late"), "{text}");
    }

    #[test]
    fn memory_returns_to_base_after_round_trip() {
        let mut fixture = Fixture::new(StaticHandler);

        fixture.send(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        let _ = response_text(&mut fixture);
        let remaining_first = fixture.conn.pool.remaining();

        fixture.send(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        let _ = response_text(&mut fixture);
        let remaining_second = fixture.conn.pool.remaining();

        assert_eq!(remaining_first, remaining_second);
    }
}
