//! Strict HTTP/1.x request parsing over the connection read buffer.
//!
//! The parser never copies: it hands back spans into the buffer it was
//! given. Lines must be `\r\n`-terminated, obsolete header folding is
//! rejected, and the chunked decoder is a nested state machine the body
//! stage drives one step at a time.

use crate::errors::RequestError;
use crate::http::percent;
use crate::http::request::{HeaderField, ParsedRequest, Span};
use crate::http::types::{self, Method, Version};
use memchr::memchr;

/// A complete line located in the buffer. `start..end` excludes the CRLF;
/// `next` is the first offset past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Line {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) next: usize,
}

/// Locates the next CRLF-terminated line in `buf[from..to]`.
///
/// A bare LF is malformed. `Ok(None)` means the terminator has not arrived
/// yet.
pub(crate) fn find_line(buf: &[u8], from: usize, to: usize) -> Result<Option<Line>, ()> {
    match memchr(b'\n', &buf[from..to]) {
        Some(pos) => {
            let lf = from + pos;
            if lf == from || buf[lf - 1] != b'\r' {
                return Err(());
            }
            Ok(Some(Line {
                start: from,
                end: lf - 1,
                next: lf + 1,
            }))
        }
        None => Ok(None),
    }
}

/// Parses `METHOD SP TARGET SP HTTP/MAJOR.MINOR`, percent-decoding the path
/// component in place.
pub(crate) fn parse_request_line(
    buf: &mut [u8],
    line: Line,
    req: &mut ParsedRequest,
) -> Result<(), RequestError> {
    let bytes = &buf[line.start..line.end];

    let sp1 = memchr(b' ', bytes).ok_or(RequestError::BadRequestLine)?;
    let rest = &bytes[sp1 + 1..];
    let sp2 = memchr(b' ', rest).ok_or(RequestError::BadRequestLine)?;

    let method = Span {
        start: line.start,
        end: line.start + sp1,
    };
    let target = Span {
        start: method.end + 1,
        end: method.end + 1 + sp2,
    };
    let version = Span {
        start: target.end + 1,
        end: line.end,
    };

    if !types::is_token(method.of(buf)) {
        return Err(RequestError::BadRequestLine);
    }
    req.method = Method::from_bytes(method.of(buf));
    req.method_raw = method;

    req.version = match Version::from_bytes(version.of(buf)) {
        Some(v) => v,
        None if version.of(buf).starts_with(b"HTTP/") => {
            return Err(RequestError::UnsupportedVersion)
        }
        None => return Err(RequestError::BadRequestLine),
    };

    parse_target(buf, target, req)?;
    Ok(())
}

/// Splits the target into path and query and validates its form.
///
/// Accepted forms: origin (`/path...`) and absolute
/// (`http://authority/path...`). The path is decoded in place, so its span
/// may shrink relative to the wire bytes.
fn parse_target(buf: &mut [u8], target: Span, req: &mut ParsedRequest) -> Result<(), RequestError> {
    if target.len() == 0 {
        return Err(RequestError::BadRequestLine);
    }

    let bytes = target.of(buf);
    let path_start = if bytes[0] == b'/' {
        target.start
    } else {
        // absolute-form: scheme "://" authority [ "/" ... ]
        let scheme_ok = bytes.len() > 7
            && (bytes[..7].eq_ignore_ascii_case(b"http://")
                || (bytes.len() > 8 && bytes[..8].eq_ignore_ascii_case(b"https://")));
        if !scheme_ok {
            return Err(RequestError::BadRequestLine);
        }
        let authority_start = if bytes[4] == b's' || bytes[4] == b'S' {
            8
        } else {
            7
        };
        match memchr(b'/', &bytes[authority_start..]) {
            Some(pos) => target.start + authority_start + pos,
            // Authority only: an empty path.
            None => target.end,
        }
    };

    let query_split = memchr(b'?', &buf[path_start..target.end]);
    let (path_end, query) = match query_split {
        Some(pos) => {
            let q_start = path_start + pos + 1;
            (
                path_start + pos,
                Some(Span {
                    start: q_start,
                    end: target.end,
                }),
            )
        }
        None => (target.end, None),
    };

    let decoded_len = percent::decode_in_place(&mut buf[path_start..path_end])
        .map_err(|_| RequestError::BadPercentEscape)?;

    req.path = Span {
        start: path_start,
        end: path_start + decoded_len,
    };
    req.query = query;
    Ok(())
}

/// Outcome of one header (or trailer) line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderLine {
    /// The blank line ending the block.
    Blank,
    Field { name: Span, value: Span },
}

pub(crate) fn parse_header_line(buf: &[u8], line: Line) -> Result<HeaderLine, RequestError> {
    if line.start == line.end {
        return Ok(HeaderLine::Blank);
    }

    let bytes = &buf[line.start..line.end];
    if bytes[0] == b' ' || bytes[0] == b'\t' {
        return Err(RequestError::FoldedHeader);
    }

    let colon = memchr(b':', bytes).ok_or(RequestError::BadHeader)?;
    let name = Span {
        start: line.start,
        end: line.start + colon,
    };
    if !types::is_token(name.of(buf)) {
        return Err(RequestError::BadHeader);
    }

    let raw_value = &bytes[colon + 1..];
    let trimmed = types::trim_ows(raw_value);
    if !types::is_field_value(trimmed) {
        return Err(RequestError::BadHeader);
    }

    // Re-anchor the trimmed value inside the buffer.
    let offset = trimmed.as_ptr() as usize - bytes.as_ptr() as usize;
    let value = Span {
        start: line.start + offset,
        end: line.start + offset + trimmed.len(),
    };

    Ok(HeaderLine::Field { name, value })
}

/// Validates the assembled header block and extracts the fields that steer
/// framing and connection lifetime.
pub(crate) fn process_headers(buf: &[u8], req: &mut ParsedRequest) -> Result<(), RequestError> {
    let mut content_length: Option<u64> = None;
    let mut has_upgrade_header = false;
    let mut connection_upgrade = false;

    for field in req.headers.iter().filter(|h| !h.footer) {
        let name = field.name.of(buf);
        let value = field.value.of(buf);

        if name.eq_ignore_ascii_case(b"host") {
            req.host_count += 1;
        } else if name.eq_ignore_ascii_case(b"content-length") {
            let parsed = types::parse_decimal(value).ok_or(RequestError::BadContentLength)?;
            match content_length {
                Some(prev) if prev != parsed => return Err(RequestError::BadContentLength),
                _ => content_length = Some(parsed),
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if !token_list_contains(value, b"chunked") {
                // Only the chunked coding is implemented.
                return Err(RequestError::BadChunk);
            }
            req.chunked = true;
        } else if name.eq_ignore_ascii_case(b"connection") {
            if token_list_contains(value, b"close") {
                req.connection_close = true;
            }
            if token_list_contains(value, b"keep-alive") {
                req.connection_keep_alive = true;
            }
            if token_list_contains(value, b"upgrade") {
                connection_upgrade = true;
            }
        } else if name.eq_ignore_ascii_case(b"expect") {
            if !value.eq_ignore_ascii_case(b"100-continue") {
                return Err(RequestError::ExpectationFailed);
            }
            req.expects_continue = true;
        } else if name.eq_ignore_ascii_case(b"upgrade") {
            has_upgrade_header = true;
        }
    }

    if req.host_count > 1 {
        return Err(RequestError::DuplicateHost);
    }
    if req.version == Version::Http11 && req.host_count == 0 {
        return Err(RequestError::MissingHost);
    }

    // A message with both framings is a smuggling vector.
    if req.chunked && content_length.is_some() {
        return Err(RequestError::BadContentLength);
    }
    req.content_length = content_length;
    req.wants_upgrade = has_upgrade_header && connection_upgrade;

    Ok(())
}

/// Case-insensitive membership test over a comma-separated token list.
fn token_list_contains(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| types::trim_ows(part).eq_ignore_ascii_case(token))
}

// CHUNKED DECODING

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    /// Expecting `chunk-size [;extensions] CRLF`.
    SizeLine,
    Data { remaining: u64 },
    /// Expecting the CRLF that closes a data chunk.
    DataEnd,
    /// Zero-size chunk consumed; the trailer section follows.
    Done,
}

/// One step of progress through a chunked body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkStep {
    NeedMore,
    /// Decoded payload bytes at `buf[start..start + len]`.
    Data { start: usize, len: usize },
    /// The terminating zero-size chunk was consumed.
    Finished,
}

/// Decoder nested inside the body-receiving stage.
#[derive(Debug)]
pub(crate) struct ChunkDecoder {
    phase: ChunkPhase,
}

/// Size line cap: 16 hex digits plus generous room for ignored extensions.
const MAX_CHUNK_LINE: usize = 16 + 256;

impl ChunkDecoder {
    pub(crate) fn new() -> Self {
        Self {
            phase: ChunkPhase::SizeLine,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.phase = ChunkPhase::SizeLine;
    }

    /// Consumes framing from `buf[*offset..end]`, advancing `offset` past
    /// everything it interpreted.
    pub(crate) fn step(
        &mut self,
        buf: &[u8],
        offset: &mut usize,
        end: usize,
    ) -> Result<ChunkStep, RequestError> {
        match self.phase {
            ChunkPhase::SizeLine => {
                let line = match find_line(buf, *offset, end) {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        if end - *offset > MAX_CHUNK_LINE {
                            return Err(RequestError::BadChunk);
                        }
                        return Ok(ChunkStep::NeedMore);
                    }
                    Err(()) => return Err(RequestError::BadChunk),
                };

                let bytes = &buf[line.start..line.end];
                let size_field = match memchr(b';', bytes) {
                    // Extensions are ignored.
                    Some(pos) => &bytes[..pos],
                    None => bytes,
                };
                let size =
                    types::parse_hex(types::trim_ows(size_field)).ok_or(RequestError::BadChunk)?;

                *offset = line.next;
                if size == 0 {
                    self.phase = ChunkPhase::Done;
                    Ok(ChunkStep::Finished)
                } else {
                    self.phase = ChunkPhase::Data { remaining: size };
                    self.step(buf, offset, end)
                }
            }
            ChunkPhase::Data { remaining } => {
                let avail = end - *offset;
                if avail == 0 {
                    return Ok(ChunkStep::NeedMore);
                }

                let take = (avail as u64).min(remaining) as usize;
                let start = *offset;
                *offset += take;

                let left = remaining - take as u64;
                self.phase = if left == 0 {
                    ChunkPhase::DataEnd
                } else {
                    ChunkPhase::Data { remaining: left }
                };
                Ok(ChunkStep::Data { start, len: take })
            }
            ChunkPhase::DataEnd => {
                if end - *offset < 2 {
                    return Ok(ChunkStep::NeedMore);
                }
                if &buf[*offset..*offset + 2] != b"\r\n" {
                    return Err(RequestError::BadChunk);
                }
                *offset += 2;
                self.phase = ChunkPhase::SizeLine;
                self.step(buf, offset, end)
            }
            ChunkPhase::Done => Ok(ChunkStep::Finished),
        }
    }
}
