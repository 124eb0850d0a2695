use bytes::Bytes;

use crate::error::ParseError;
use crate::headers::HeaderMap;
use crate::lstr::LStr;
use crate::method::Method;
use crate::pool::Reset;
use crate::request::{BodyType, Request, RequestAux};

const MAX_METHOD: usize = 24;
const MAX_VERSION: usize = 10;
const MAX_NAME: usize = 200;
const MAX_PATH: usize = 8 * 1024;
const MAX_VALUE: usize = 16 * 1024;

/// Secure-header prefix: fields whose name starts with this are routed to
/// the trusted table and hidden from untrusted downstream consumers.
const SECURE_PREFIX: &[u8] = b"!~";

/// Verdict of one [`HeaderParserState::feed`] call.
#[derive(Debug)]
pub(crate) enum HeadOutcome {
    /// More bytes needed.
    Incomplete,
    /// Head complete; request fields and body mode are filled in.
    Done,
    Failed(ParseError),
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Method,
    Path,
    Version,
    ReqlineLf,
    FieldFirst,
    Name,
    ValueLead,
    Value,
    ValueLf,
    EndLf,
}

/// Incremental request-head tokenizer.
///
/// Spans are copied into the request arena as they arrive, so a token that
/// crosses a socket read boundary simply becomes another fragment of its
/// scattered string. The scratch buffers below are why states are pooled:
/// they keep their capacity across requests.
pub(crate) struct HeaderParserState {
    phase: Phase,
    /// method / version token accumulation
    scratch: Vec<u8>,
    /// current field name, lowercased
    name: Vec<u8>,
    /// current field value fragments
    value: LStr,
    value_len: usize,
    /// whitespace run not yet known to be interior or trailing
    pending_ws: Vec<u8>,
    path_len: usize,
}

impl Default for HeaderParserState {
    fn default() -> Self {
        Self {
            phase: Phase::Method,
            scratch: Vec::with_capacity(MAX_METHOD),
            name: Vec::with_capacity(64),
            value: LStr::new(),
            value_len: 0,
            pending_ws: Vec::new(),
            path_len: 0,
        }
    }
}

impl Reset for HeaderParserState {
    fn reset(&mut self) {
        self.phase = Phase::Method;
        self.scratch.clear();
        self.name.clear();
        self.value = LStr::new();
        self.value_len = 0;
        self.pending_ws.clear();
        self.path_len = 0;
    }
}

fn is_name_byte(b: u8) -> bool {
    // token chars: visible ASCII minus separators we care about
    b > b' ' && b < 0x7f && b != b':'
}

/// Field-precision access to the request arena, so the borrow does not
/// cover the other request fields the parser writes to.
macro_rules! pool {
    ($req:ident) => {
        match $req.pool.as_mut() {
            Some(pool) => pool,
            None => unreachable!("request arena missing during header parse"),
        }
    };
}

impl HeaderParserState {
    /// Feed a span of head bytes. Returns how many octets were consumed
    /// and whether the head is complete; on `Done`, unconsumed octets
    /// belong to the body (or to a pipelined request).
    pub(crate) fn feed(&mut self, req: &mut Request, buf: &Bytes) -> (usize, HeadOutcome) {
        let mut pos = 0;

        macro_rules! fail {
            ($err:expr) => {{
                let err = $err;
                req.aux = RequestAux::ParseError(err);
                return (pos, HeadOutcome::Failed(err));
            }};
        }

        while pos < buf.len() {
            match self.phase {
                Phase::Method => {
                    let span = &buf[pos..];
                    let end = span.iter().position(|&b| b == b' ');
                    let taken = end.unwrap_or(span.len());
                    if self.scratch.len() + taken > MAX_METHOD {
                        fail!(ParseError::UnknownMethod);
                    }
                    self.scratch.extend_from_slice(&span[..taken]);
                    pos += taken;
                    if end.is_some() {
                        match Method::from_bytes(&self.scratch) {
                            Some(method) => req.method = method,
                            None => fail!(ParseError::UnknownMethod),
                        }
                        self.scratch.clear();
                        pos += 1;
                        self.phase = Phase::Path;
                    }
                }
                Phase::Path => {
                    let span = &buf[pos..];
                    let end = span
                        .iter()
                        .position(|&b| b == b' ' || b == b'\r' || b == b'\n');
                    let taken = end.unwrap_or(span.len());
                    if self.path_len + taken > MAX_PATH {
                        fail!(ParseError::InvalidRequestLine);
                    }
                    if taken > 0 {
                        let part = pool!(req).alloc(&span[..taken]);
                        req.path.push(part);
                        self.path_len += taken;
                    }
                    pos += taken;
                    match end.map(|i| span[i]) {
                        Some(b' ') => {
                            if self.path_len == 0 {
                                fail!(ParseError::InvalidRequestLine);
                            }
                            pos += 1;
                            self.phase = Phase::Version;
                        }
                        Some(_) => fail!(ParseError::InvalidRequestLine),
                        None => {}
                    }
                }
                Phase::Version => {
                    let span = &buf[pos..];
                    let end = span.iter().position(|&b| b == b'\r' || b == b'\n');
                    let taken = end.unwrap_or(span.len());
                    if self.scratch.len() + taken > MAX_VERSION {
                        fail!(ParseError::InvalidRequestLine);
                    }
                    self.scratch.extend_from_slice(&span[..taken]);
                    pos += taken;
                    if let Some(i) = end {
                        match parse_version(&self.scratch) {
                            Ok((major, minor)) => {
                                req.http_major = major;
                                req.http_minor = minor;
                            }
                            Err(err) => fail!(err),
                        }
                        self.scratch.clear();
                        pos += 1;
                        self.phase = if span[i] == b'\r' {
                            Phase::ReqlineLf
                        } else {
                            Phase::FieldFirst
                        };
                    }
                }
                Phase::ReqlineLf => {
                    if buf[pos] != b'\n' {
                        fail!(ParseError::InvalidRequestLine);
                    }
                    pos += 1;
                    self.phase = Phase::FieldFirst;
                }
                Phase::FieldFirst => match buf[pos] {
                    b'\r' => {
                        pos += 1;
                        self.phase = Phase::EndLf;
                    }
                    b'\n' => {
                        pos += 1;
                        return self.finalize(req, pos);
                    }
                    b if is_name_byte(b) => self.phase = Phase::Name,
                    _ => fail!(ParseError::InvalidHeader),
                },
                Phase::Name => {
                    let span = &buf[pos..];
                    let end = span.iter().position(|&b| !is_name_byte(b));
                    let taken = end.unwrap_or(span.len());
                    if self.name.len() + taken > MAX_NAME {
                        fail!(ParseError::InvalidHeader);
                    }
                    self.name
                        .extend(span[..taken].iter().map(u8::to_ascii_lowercase));
                    pos += taken;
                    match end.map(|i| span[i]) {
                        Some(b':') => {
                            if self.name.is_empty() {
                                fail!(ParseError::InvalidHeader);
                            }
                            pos += 1;
                            self.phase = Phase::ValueLead;
                        }
                        Some(_) => fail!(ParseError::InvalidHeader),
                        None => {}
                    }
                }
                Phase::ValueLead => match buf[pos] {
                    b' ' | b'\t' => pos += 1,
                    _ => self.phase = Phase::Value,
                },
                Phase::Value => {
                    let span = &buf[pos..];
                    let end = span.iter().position(|&b| b == b'\r' || b == b'\n');
                    let taken = end.unwrap_or(span.len());
                    if self.value_len + taken > MAX_VALUE {
                        fail!(ParseError::InvalidHeader);
                    }
                    if taken > 0
                        && let Err(err) = self.push_value_span(req, &span[..taken])
                    {
                        fail!(err);
                    }
                    pos += taken;
                    if let Some(i) = end {
                        if let Err(err) = self.commit_field(req) {
                            fail!(err);
                        }
                        pos += 1;
                        self.phase = if span[i] == b'\r' {
                            Phase::ValueLf
                        } else {
                            Phase::FieldFirst
                        };
                    }
                }
                Phase::ValueLf => {
                    if buf[pos] != b'\n' {
                        fail!(ParseError::InvalidHeader);
                    }
                    pos += 1;
                    self.phase = Phase::FieldFirst;
                }
                Phase::EndLf => {
                    if buf[pos] != b'\n' {
                        fail!(ParseError::InvalidHeader);
                    }
                    pos += 1;
                    return self.finalize(req, pos);
                }
            }
        }

        (pos, HeadOutcome::Incomplete)
    }

    /// Append value bytes, deferring a trailing whitespace run so it can be
    /// dropped if the line ends right after it.
    fn push_value_span(&mut self, req: &mut Request, span: &[u8]) -> Result<(), ParseError> {
        let interior_end = span
            .iter()
            .rposition(|&b| b != b' ' && b != b'\t')
            .map_or(0, |i| i + 1);

        if interior_end > 0 {
            if !self.pending_ws.is_empty() {
                let ws = pool!(req).alloc(&self.pending_ws);
                self.value.push(ws);
                self.value_len += self.pending_ws.len();
                self.pending_ws.clear();
            }
            let part = pool!(req).alloc(&span[..interior_end]);
            self.value.push(part);
            self.value_len += interior_end;
        }
        self.pending_ws.extend_from_slice(&span[interior_end..]);
        Ok(())
    }

    fn commit_field(&mut self, req: &mut Request) -> Result<(), ParseError> {
        self.pending_ws.clear();
        self.value_len = 0;
        let value = std::mem::take(&mut self.value);

        let (table, name_bytes): (&mut HeaderMap, &[u8]) =
            if self.name.starts_with(SECURE_PREFIX) {
                (&mut req.secure_headers, &self.name[SECURE_PREFIX.len()..])
            } else {
                (&mut req.headers, &self.name)
            };
        if name_bytes.is_empty() {
            return Err(ParseError::InvalidHeader);
        }
        let name = LStr::from_bytes(pool!(req).alloc(name_bytes));
        self.name.clear();

        if !table.append(name, value) {
            return Err(ParseError::TooManyHeaders);
        }
        Ok(())
    }

    /// End of head: decide body mode and keep-alive.
    fn finalize(&mut self, req: &mut Request, consumed: usize) -> (usize, HeadOutcome) {
        macro_rules! fail {
            ($err:expr) => {{
                let err = $err;
                req.aux = RequestAux::ParseError(err);
                return (consumed, HeadOutcome::Failed(err));
            }};
        }

        req.want_keep_alive = req.http_minor >= 1;
        if let Some(conn) = req.headers.get(b"connection") {
            let conn = conn.flatten();
            if contains_token(&conn, b"close") {
                req.want_keep_alive = false;
            } else if contains_token(&conn, b"keep-alive") {
                req.want_keep_alive = true;
            }
        }

        let mut content_lengths = req.headers.get_all(b"content-length");
        let content_length = content_lengths.next();
        if content_lengths.next().is_some() {
            fail!(ParseError::InvalidContentLength);
        }
        let chunked = {
            let mut encodings = req.headers.get_all(b"transfer-encoding").peekable();
            if encodings.peek().is_some() {
                if !encodings.all(|e| e.eq_ignore_case(b"chunked")) {
                    fail!(ParseError::InvalidTransferEncoding);
                }
                true
            } else {
                false
            }
        };

        if chunked {
            if content_length.is_some() {
                fail!(ParseError::InvalidTransferEncoding);
            }
            req.body_type = BodyType::Chunked;
            req.aux = RequestAux::Chunked { end_chunk_reached: false };
        } else if let Some(value) = content_length {
            let Some(length) = parse_decimal(&value.flatten()) else {
                fail!(ParseError::InvalidContentLength);
            };
            if length == 0 {
                req.body_type = BodyType::None;
                req.aux = RequestAux::None;
            } else {
                req.body_type = BodyType::ContentLength;
                req.aux = RequestAux::ContentLength { length };
            }
        } else if req.headers.contains_key(b"upgrade") || req.method == Method::CONNECT {
            req.body_type = BodyType::Upgrade;
            req.aux = RequestAux::None;
        } else {
            req.body_type = BodyType::None;
            req.aux = RequestAux::None;
        }

        (consumed, HeadOutcome::Done)
    }
}

fn parse_version(token: &[u8]) -> Result<(u8, u8), ParseError> {
    let Some(rest) = token.strip_prefix(b"HTTP/") else {
        return Err(ParseError::InvalidRequestLine);
    };
    match rest {
        b"1.1" => Ok((1, 1)),
        b"1.0" => Ok((1, 0)),
        [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit() => {
            Err(ParseError::VersionNotSupported)
        }
        _ => Err(ParseError::InvalidRequestLine),
    }
}

fn parse_decimal(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || digits.len() > 19 {
        return None;
    }
    let mut value = 0u64;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value * 10 + u64::from(b - b'0');
    }
    Some(value)
}

/// Case-insensitive search for `token` in a comma-separated list.
fn contains_token(list: &[u8], token: &[u8]) -> bool {
    list.split(|&b| b == b',')
        .any(|part| part.trim_ascii().eq_ignore_ascii_case(token))
}
