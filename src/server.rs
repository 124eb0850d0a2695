use std::cell::Cell;
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use crate::arena::RequestArena;
use crate::client::Client;
use crate::config::Config;
use crate::date::httpdate_now;
use crate::error::{BodyError, ParseError};
use crate::freelist::Freelist;
use crate::handler::HttpHandler;
use crate::log::{debug, trace};
use crate::lstr::LStr;
use crate::method::Method;
use crate::parse::{
    ChunkOutcome, ChunkedBodyParser, HeadOutcome, HeaderStatePool, ParserState,
    new_header_state_pool,
};
use crate::rc::{RequestCell, RequestRef};
use crate::request::{BodyType, HttpState, Request, RequestAux};
use crate::rt::LoopHandle;
use crate::status;

/// Response body written when a consumer ends a request without ever
/// beginning a response.
pub const DEFAULT_INTERNAL_SERVER_ERROR_RESPONSE: &[u8] =
    b"<html><body><h1>500 Internal Server Error</h1>\
      An internal error occurred while handling the request.</body></html>\n";

/// The HTTP connection server core.
///
/// Owns the request freelist and the header-parser-state pool; drives each
/// client's requests through their lifecycle and calls into the plugged-in
/// [`HttpHandler`]. All methods run on the event-loop thread.
pub struct HttpServer {
    handler: Rc<dyn HttpHandler>,
    event_loop: LoopHandle,
    freelist: Freelist,
    parser_pool: Rc<HeaderStatePool>,
    total_requests_accepted: Cell<u64>,
    next_client_number: Cell<u64>,
}

impl HttpServer {
    pub fn new(event_loop: LoopHandle, handler: impl HttpHandler) -> Rc<Self> {
        Self::with_config(event_loop, handler, Config::default())
    }

    pub fn with_config(
        event_loop: LoopHandle,
        handler: impl HttpHandler,
        config: Config,
    ) -> Rc<Self> {
        Rc::new(Self {
            handler: Rc::new(handler),
            event_loop,
            freelist: Freelist::new(config.request_freelist_limit),
            parser_pool: new_header_state_pool(),
            total_requests_accepted: Cell::new(0),
            next_client_number: Cell::new(0),
        })
    }

    /// Apply configuration. Unrecognized keys were already dropped when the
    /// [`Config`] was deserialized.
    pub fn configure(&self, config: &Config) {
        self.freelist.set_limit(config.request_freelist_limit);
    }

    /// The effective configuration.
    pub fn config(&self) -> Config {
        Config {
            request_freelist_limit: self.freelist.limit(),
        }
    }

    pub fn event_loop(&self) -> &LoopHandle {
        &self.event_loop
    }

    pub fn total_requests_accepted(&self) -> u64 {
        self.total_requests_accepted.get()
    }

    pub fn free_request_count(&self) -> usize {
        self.freelist.len()
    }

    /// Run a consumer hook with the hook-depth guard held.
    fn hook<R>(&self, client: &Client, f: impl FnOnce(&dyn HttpHandler) -> R) -> R {
        client.enter_hook();
        let result = f(self.handler.as_ref());
        client.leave_hook();
        result
    }

    // ===== Connection plumbing =====

    /// Bind a new client object and start its first request.
    pub(crate) fn on_client_accepted(self: &Rc<Self>) -> Rc<Client> {
        let number = self.next_client_number.get() + 1;
        self.next_client_number.set(number);
        let client = Client::new(number, self.clone());
        trace!("[Client {number}] connection accepted");
        self.handle_next_request(&client);
        client
    }

    fn handle_next_request(self: &Rc<Self>, client: &Rc<Client>) {
        debug_assert!(client.current_request().is_none());
        client.input.start();
        client.output.reinitialize();

        let cell = self.checkout_request_object(client);
        client.set_current_request(cell);
        // SAFETY: loop thread; the request was just bound, nothing else
        // references its state
        let req = unsafe { cell.as_ref().state_mut() };
        req.client = Some(client.clone());
        self.reinitialize_request(client, req);
        client.wake();
    }

    fn checkout_request_object(self: &Rc<Self>, client: &Rc<Client>) -> NonNull<RequestCell> {
        if let Some(cell) = self.freelist.checkout() {
            trace!(
                "[Client {}] checking out request object from freelist ({} left)",
                client.number(),
                self.freelist.len()
            );
            return cell;
        }
        trace!("[Client {}] creating new request object", client.number());
        let cell = RequestCell::allocate();
        // SAFETY: sole owner of the fresh cell
        let req = unsafe { cell.as_ref().state_mut() };
        self.hook(client, |h| h.on_request_object_created(client, req));
        cell
    }

    /// Initiate connection teardown. Upper layers use this to enforce
    /// deadlines; the driver runs the actual cleanup.
    pub fn disconnect(&self, client: &Rc<Client>) {
        if client.is_disconnecting() {
            return;
        }
        trace!("[Client {}] disconnecting", client.number());
        client.set_disconnecting();
        client.input.stop();
        client.wake();
    }

    /// Driver: the socket is going away. Finalizes a bound request even if
    /// `end_request` was never called.
    pub(crate) fn on_client_disconnecting(&self, client: &Rc<Client>) {
        trace!("[Client {}] connection closed", client.number());
        let Some(cell) = client.current_request() else {
            return;
        };
        {
            // SAFETY: driver context on the loop thread, no other
            // reference to this request's state is live
            let req = unsafe { cell.as_ref().state_mut() };
            self.deinitialize_and_park(client, cell, req);
            if req.http_state == HttpState::FlushingOutput {
                // flush abandoned
                req.http_state = HttpState::WaitingForReferences;
            }
            req.pool = None;
            client.clear_current_request();
        }
        self.unref_request(cell);
    }

    // ===== Request lifecycle =====

    fn reinitialize_request(&self, client: &Rc<Client>, req: &mut Request) {
        req.http_state = HttpState::ParsingHeaders;
        req.http_major = 1;
        req.http_minor = 0;
        req.method = Method::GET;
        req.path = LStr::new();
        req.want_keep_alive = false;
        req.response_begun = false;
        req.body_type = BodyType::None;
        req.aux = RequestAux::None;
        req.body_already_read = 0;
        req.headers.clear();
        req.secure_headers.clear();
        req.pool = Some(RequestArena::new());
        req.parser = ParserState::Headers(self.parser_pool.checkout());
        req.body_channel.reinitialize();
        self.hook(client, |h| h.reinitialize_request(client, req));
    }

    /// Core per-request teardown. Idempotent: runs from both `end_request`
    /// and disconnect cleanup.
    fn deinitialize_request(&self, client: &Rc<Client>, req: &mut Request) {
        req.parser = ParserState::None; // pooled header state returns
        req.path = LStr::new();
        req.headers.clear();
        req.secure_headers.clear();
        req.body_channel.deinitialize();
        req.pool = None;
        self.hook(client, |h| h.deinitialize_request(client, req));
    }

    fn deinitialize_and_park(
        &self,
        client: &Rc<Client>,
        cell: NonNull<RequestCell>,
        req: &mut Request,
    ) {
        if req.ended() {
            return;
        }
        self.deinitialize_request(client, req);
        req.http_state = HttpState::WaitingForReferences;
        client.push_ended(cell);
    }

    /// Driver: output has fully drained (or failed, which counts the
    /// same). Finishes a request parked in `FlushingOutput`; on keep-alive
    /// the next request starts immediately, otherwise the connection goes
    /// down. Returns whether anything happened.
    pub(crate) fn on_client_output_flushed(self: &Rc<Self>, client: &Rc<Client>) -> bool {
        if !client.output.end_acked() {
            return false;
        }
        let Some(cell) = client.current_request() else {
            return false;
        };
        let keep_alive;
        {
            // SAFETY: driver context on the loop thread
            let req = unsafe { cell.as_ref().state_mut() };
            if req.http_state != HttpState::FlushingOutput {
                return false;
            }
            req.http_state = HttpState::WaitingForReferences;
            keep_alive = req.can_keep_alive() && !client.output.write_errored();
            // destroy the arena; bytes still queued downstream keep their
            // own chunks alive
            req.pool = None;
            client.clear_current_request();
        }
        self.unref_request(cell);

        if keep_alive && !client.is_disconnecting() {
            self.handle_next_request(client);
        } else {
            self.disconnect(client);
        }
        true
    }

    // ===== Refcounting =====

    /// Take an extra reference for handing to a worker thread.
    pub fn ref_request(&self, req: &Request) -> RequestRef {
        let cell = req.cell.expect("request has no backing cell");
        RequestRef::acquire(cell, self.event_loop.clone())
    }

    fn unref_request(&self, cell: NonNull<RequestCell>) {
        drop(RequestRef::adopt(cell, self.event_loop.clone()));
    }

    /// Zero-refcount tail: back to the freelist, or destroyed when the
    /// freelist is at its limit.
    pub(crate) fn recycle_request(&self, cell: NonNull<RequestCell>) {
        if self.freelist.push(cell) {
            trace!("request object added to freelist ({} entries)", self.freelist.len());
        } else {
            trace!("request object destroyed; freelist is full ({})", self.freelist.len());
            // SAFETY: the caller is the zero-refcount handler; no
            // references remain
            unsafe { RequestCell::destroy(cell) };
        }
    }

    // ===== Body ingest =====

    /// Driver: inbound socket bytes (or EOF / read error as an empty
    /// buffer). Returns the number of octets consumed; the driver re-feeds
    /// the rest later.
    pub(crate) fn on_client_data_received(
        self: &Rc<Self>,
        client: &Rc<Client>,
        buffer: Bytes,
        errcode: i32,
    ) -> usize {
        let cell = client
            .current_request()
            .expect("client data received with no bound request");
        // SAFETY: driver context on the loop thread
        let req = unsafe { cell.as_ref().state_mut() };
        match req.http_state {
            HttpState::ParsingHeaders => {
                self.process_when_parsing_headers(client, req, buffer)
            }
            HttpState::ParsingBody => {
                self.process_when_parsing_body(client, req, buffer, errcode)
            }
            HttpState::ParsingChunkedBody => {
                self.process_when_parsing_chunked_body(client, req, buffer)
            }
            HttpState::Upgraded => self.process_when_upgraded(client, req, buffer, errcode),
            state => unreachable!("invalid request HTTP state {}", state.name()),
        }
    }

    fn process_when_parsing_headers(
        self: &Rc<Self>,
        client: &Rc<Client>,
        req: &mut Request,
        buffer: Bytes,
    ) -> usize {
        if buffer.is_empty() {
            // EOF or error before the head completed
            self.disconnect(client);
            return 0;
        }

        let mut parser = req.parser.take();
        let (consumed, outcome) = match &mut parser {
            ParserState::Headers(state) => state.feed(req, &buffer),
            _ => unreachable!("headers state without a header parser"),
        };

        match outcome {
            HeadOutcome::Incomplete => {
                req.parser = parser;
                return consumed;
            }
            HeadOutcome::Failed(err) => {
                drop(parser);
                debug!("[Client {}] request parse error: {err}", client.number());
                // leave the error state behind so the error response body
                // is permitted to write; `aux` still carries the error
                req.http_state = HttpState::Complete;
                if err == ParseError::VersionNotSupported {
                    self.end_with_error_response(client, req, 505, err.description());
                } else {
                    self.end_as_bad_request(client, req, err.description());
                }
                return consumed;
            }
            HeadOutcome::Done => {}
        }
        drop(parser); // header parser state returns to the pool

        trace!("[Client {}] new request received", client.number());
        match req.body_type {
            BodyType::None => {
                req.http_state = HttpState::Complete;
                client.input.stop();
                self.begin_request(client, req);
            }
            BodyType::ContentLength => {
                trace!("[Client {}] expecting a request body", client.number());
                req.http_state = HttpState::ParsingBody;
                self.begin_request(client, req);
            }
            BodyType::Chunked => {
                trace!("[Client {}] expecting a chunked request body", client.number());
                req.http_state = HttpState::ParsingChunkedBody;
                req.parser = ParserState::Chunked(ChunkedBodyParser::new());
                self.begin_request(client, req);
            }
            BodyType::Upgrade => {
                if self.hook(client, |h| h.supports_upgrade(client, req)) {
                    trace!("[Client {}] expecting connection upgrade", client.number());
                    req.http_state = HttpState::Upgraded;
                    self.begin_request(client, req);
                } else {
                    req.http_state = HttpState::Complete;
                    self.end_as_bad_request(
                        client,
                        req,
                        ParseError::UpgradeRefused.description(),
                    );
                }
            }
        }
        consumed
    }

    fn begin_request(self: &Rc<Self>, client: &Rc<Client>, req: &mut Request) {
        self.total_requests_accepted
            .set(self.total_requests_accepted.get() + 1);
        self.hook(client, |h| h.on_request_begin(self, client, req));
    }

    fn process_when_parsing_body(
        self: &Rc<Self>,
        client: &Rc<Client>,
        req: &mut Request,
        buffer: Bytes,
        errcode: i32,
    ) -> usize {
        if !buffer.is_empty() {
            let RequestAux::ContentLength { length } = req.aux else {
                unreachable!("content-length body without a declared length");
            };
            let max_remaining = length.saturating_sub(req.body_already_read);
            let taken = (buffer.len() as u64).min(max_remaining) as usize;
            req.body_already_read += taken as u64;
            trace!(
                "[Client {}] request body: {} of {} bytes read",
                client.number(),
                req.body_already_read,
                length
            );
            req.body_channel.feed(buffer.slice(..taken));
            self.after_body_feed(client, req);
            taken
        } else if errcode == 0 {
            if req.body_fully_read() {
                trace!("[Client {}] client sent EOF", client.number());
                req.body_channel.feed_eof();
            } else {
                debug!(
                    "[Client {}] client sent EOF before finishing request body: \
                     {} bytes read, {:?} expected",
                    client.number(),
                    req.body_already_read,
                    req.content_length()
                );
                req.body_channel.feed_error(BodyError::UnexpectedEof);
            }
            self.pump_body(client, req);
            0
        } else {
            req.body_channel
                .feed_error(BodyError::Io(io::Error::from_raw_os_error(errcode)));
            self.pump_body(client, req);
            0
        }
    }

    fn process_when_parsing_chunked_body(
        self: &Rc<Self>,
        client: &Rc<Client>,
        req: &mut Request,
        buffer: Bytes,
    ) -> usize {
        if buffer.is_empty() {
            let mut parser = req.parser.take();
            if let ParserState::Chunked(p) = &mut parser {
                p.feed_unexpected_eof(&mut req.body_channel);
            }
            self.pump_body(client, req);
            return 0;
        }

        // raw frame octets, not decoded payload
        req.body_already_read += buffer.len() as u64;
        let mut parser = req.parser.take();
        let (consumed, outcome) = match &mut parser {
            ParserState::Chunked(p) => p.feed(&buffer, &mut req.body_channel),
            _ => unreachable!("chunked body without a chunked parser"),
        };
        match outcome {
            ChunkOutcome::Incomplete => {
                req.parser = parser;
                self.after_body_feed(client, req);
            }
            ChunkOutcome::Done => {
                trace!("[Client {}] end chunk reached", client.number());
                req.aux = RequestAux::Chunked { end_chunk_reached: true };
                client.input.stop();
                req.body_channel.feed_eof();
                self.pump_body(client, req);
            }
            ChunkOutcome::Failed => {
                // the framing error frame is already on the body channel
                client.input.stop();
                self.pump_body(client, req);
            }
        }
        consumed
    }

    fn process_when_upgraded(
        self: &Rc<Self>,
        client: &Rc<Client>,
        req: &mut Request,
        buffer: Bytes,
        errcode: i32,
    ) -> usize {
        if !buffer.is_empty() {
            req.body_already_read += buffer.len() as u64;
            req.body_channel.feed(buffer.clone());
            self.after_body_feed(client, req);
            buffer.len()
        } else if errcode == 0 {
            req.body_channel.feed_eof();
            self.pump_body(client, req);
            0
        } else {
            req.body_channel
                .feed_error(BodyError::Io(io::Error::from_raw_os_error(errcode)));
            self.pump_body(client, req);
            0
        }
    }

    /// Post-feed policy shared by all body modes: deliver, then either
    /// stop input at the watermark or re-check for completion.
    fn after_body_feed(self: &Rc<Self>, client: &Rc<Client>, req: &mut Request) {
        if req.ended() {
            return;
        }
        self.pump_body(client, req);
        if req.ended() {
            return;
        }
        if req.body_channel.passed_threshold() {
            client.input.stop();
            req.body_channel.arm_flushed_edge();
        } else {
            self.request_body_consumed(client, req);
        }
    }

    fn request_body_consumed(self: &Rc<Self>, client: &Rc<Client>, req: &mut Request) {
        if req.http_state == HttpState::ParsingBody
            && req.body_fully_read()
            && !req.body_channel.eof_fed()
        {
            client.input.stop();
            req.body_channel.feed_eof();
            self.pump_body(client, req);
        }
    }

    /// Deliver buffered body frames to the consumer, honoring a consumer
    /// pause, and take the buffers-flushed edge when the queue drains.
    fn pump_body(self: &Rc<Self>, client: &Rc<Client>, req: &mut Request) {
        loop {
            if req.ended() || client.is_disconnecting() {
                break;
            }
            let Some(frame) = req.body_channel.pop() else { break };
            self.hook(client, |h| h.on_request_body(self, client, req, frame));
        }
        if req.body_channel.take_flushed_edge() {
            client.input.start();
            client.wake();
            if !req.ended() {
                self.request_body_consumed(client, req);
            }
        }
    }

    /// Consumer: resume a paused body channel and deliver what buffered up.
    pub fn resume_request_body(self: &Rc<Self>, client: &Rc<Client>, req: &mut Request) {
        req.body_channel.start();
        self.pump_body(client, req);
    }

    // ===== Response emitter =====

    /// Enqueue raw response bytes, in call order.
    pub fn write_response(&self, client: &Client, req: &mut Request, data: Bytes) {
        req.response_begun = true;
        client.output.feed(data);
        client.wake();
    }

    /// Synthesize and enqueue a complete response.
    ///
    /// The status line is followed by a gateway-style `Status:` duplicate;
    /// `Content-Type`, `Date`, `Connection`, and `Content-Length` are
    /// emitted exactly once, defaulted when the caller did not supply
    /// them. The body is omitted for HEAD requests.
    pub fn write_simple_response(
        &self,
        client: &Client,
        req: &mut Request,
        code: u16,
        headers: &[(&str, &str)],
        body: &[u8],
    ) {
        let fallback;
        let status = match status::code_and_reason(code) {
            Some(status) => status,
            None => {
                fallback = format!("{code} Unknown Reason-Phrase");
                fallback.as_str()
            }
        };
        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| *v)
        };

        let mut head = BytesMut::with_capacity(
            256 + headers.iter().map(|(n, v)| n.len() + v.len() + 4).sum::<usize>(),
        );
        let mut ints = itoa::Buffer::new();

        head.extend_from_slice(b"HTTP/");
        head.extend_from_slice(ints.format(req.http_major).as_bytes());
        head.extend_from_slice(b".");
        head.extend_from_slice(ints.format(req.http_minor).as_bytes());
        head.extend_from_slice(b" ");
        head.extend_from_slice(status.as_bytes());
        head.extend_from_slice(b"\r\nStatus: ");
        head.extend_from_slice(status.as_bytes());
        head.extend_from_slice(b"\r\nContent-Type: ");
        head.extend_from_slice(
            lookup("content-type")
                .unwrap_or("text/html; charset=UTF-8")
                .as_bytes(),
        );
        head.extend_from_slice(b"\r\nDate: ");
        match lookup("date") {
            Some(date) => head.extend_from_slice(date.as_bytes()),
            None => head.extend_from_slice(&httpdate_now()),
        }
        head.extend_from_slice(b"\r\nConnection: ");
        match lookup("connection") {
            Some(value) => {
                head.extend_from_slice(value.as_bytes());
                if !value.eq_ignore_ascii_case("keep-alive") {
                    req.want_keep_alive = false;
                }
            }
            None => {
                if req.can_keep_alive() {
                    head.extend_from_slice(b"keep-alive");
                } else {
                    head.extend_from_slice(b"close");
                }
            }
        }
        head.extend_from_slice(b"\r\nContent-Length: ");
        match lookup("content-length") {
            Some(value) => head.extend_from_slice(value.as_bytes()),
            None => head.extend_from_slice(ints.format(body.len()).as_bytes()),
        }
        head.extend_from_slice(b"\r\n");

        for (name, value) in headers {
            if ["content-type", "date", "connection", "content-length"]
                .iter()
                .any(|known| name.eq_ignore_ascii_case(known))
            {
                continue;
            }
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        self.write_response(client, req, head.freeze());
        if !req.ended() && req.method != Method::HEAD && !body.is_empty() {
            self.write_response(client, req, Bytes::copy_from_slice(body));
        }
    }

    /// Finish the response side of the current request. Idempotent; the
    /// second call is a no-op and returns `false`.
    ///
    /// If no response was begun, a default 500 is emitted first. The
    /// request's arena is detached and kept alive until the output channel
    /// drains, so queued response bytes never dangle.
    pub fn end_request(self: &Rc<Self>, client: &Rc<Client>, req: &mut Request) -> bool {
        if req.ended() {
            return false;
        }
        trace!("[Client {}] ending request", client.number());

        if !req.response_begun {
            self.write_simple_response(client, req, 500, &[], DEFAULT_INTERNAL_SERVER_ERROR_RESPONSE);
        }

        // deinitialize with the arena detached: bytes queued on the output
        // channel may live in it
        let pool = req.pool.take();
        let cell = req.cell.expect("request has no backing cell");
        self.deinitialize_and_park(client, cell, req);
        req.pool = pool;

        client.input.stop();
        if !client.output.ended() {
            client.output.feed_end();
        }
        req.http_state = HttpState::FlushingOutput;
        client.wake();
        true
    }

    /// Respond with `code`, `Connection: close`, and no-store cache
    /// directives, then end the request.
    pub fn end_with_error_response(
        self: &Rc<Self>,
        client: &Rc<Client>,
        req: &mut Request,
        code: u16,
        body: &str,
    ) {
        let headers = [
            ("Connection", "close"),
            ("Cache-Control", "no-cache, no-store, must-revalidate"),
        ];
        self.write_simple_response(client, req, code, &headers, body.as_bytes());
        self.end_request(client, req);
    }

    pub fn end_as_bad_request(self: &Rc<Self>, client: &Rc<Client>, req: &mut Request, body: &str) {
        self.end_with_error_response(client, req, 400, body);
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("free_request_count", &self.freelist.len())
            .field("total_requests_accepted", &self.total_requests_accepted.get())
            .finish_non_exhaustive()
    }
}
