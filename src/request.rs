use std::ptr::NonNull;
use std::rc::Rc;

use crate::arena::RequestArena;
use crate::channel::BodyChannel;
use crate::client::Client;
use crate::error::ParseError;
use crate::headers::HeaderMap;
use crate::lstr::LStr;
use crate::method::Method;
use crate::parse::ParserState;
use crate::rc::RequestCell;

/// Where a request is in its lifecycle.
///
/// ```text
/// InFreelist -> ParsingHeaders -> { Complete | ParsingBody
///     | ParsingChunkedBody | Upgraded | Error }
///     -> FlushingOutput -> WaitingForReferences -> InFreelist
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpState {
    ParsingHeaders,
    ParsingBody,
    ParsingChunkedBody,
    Upgraded,
    Complete,
    FlushingOutput,
    WaitingForReferences,
    InFreelist,
    Error,
}

impl HttpState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ParsingHeaders => "PARSING_HEADERS",
            Self::ParsingBody => "PARSING_BODY",
            Self::ParsingChunkedBody => "PARSING_CHUNKED_BODY",
            Self::Upgraded => "UPGRADED",
            Self::Complete => "COMPLETE",
            Self::FlushingOutput => "FLUSHING_OUTPUT",
            Self::WaitingForReferences => "WAITING_FOR_REFERENCES",
            Self::InFreelist => "IN_FREELIST",
            Self::Error => "ERROR",
        }
    }
}

/// How the request's body is framed on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BodyType {
    #[default]
    None,
    ContentLength,
    Chunked,
    Upgrade,
}

impl BodyType {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "NO_BODY",
            Self::ContentLength => "CONTENT_LENGTH",
            Self::Chunked => "CHUNKED",
            Self::Upgrade => "UPGRADE",
        }
    }
}

/// Body-mode and error details that travel with the state.
#[derive(Clone, Copy, Debug, Default)]
pub enum RequestAux {
    #[default]
    None,
    ContentLength {
        length: u64,
    },
    Chunked {
        end_chunk_reached: bool,
    },
    ParseError(ParseError),
}

/// One in-flight HTTP request.
///
/// Owned by its client while current, then by whoever still holds a
/// [`RequestRef`] until the reference count reaches zero and the object
/// goes back to the freelist.
///
/// [`RequestRef`]: crate::rc::RequestRef
pub struct Request {
    pub(crate) http_state: HttpState,
    pub http_major: u8,
    pub http_minor: u8,
    pub method: Method,
    pub path: LStr,
    pub headers: HeaderMap,
    /// Fields that must not reach untrusted downstream consumers
    /// (`!~`-prefixed on the wire).
    pub secure_headers: HeaderMap,
    pub(crate) body_type: BodyType,
    pub(crate) aux: RequestAux,
    pub(crate) body_already_read: u64,
    pub(crate) want_keep_alive: bool,
    pub(crate) response_begun: bool,
    pub(crate) pool: Option<RequestArena>,
    pub(crate) body_channel: BodyChannel,
    pub(crate) parser: ParserState,
    pub(crate) client: Option<Rc<Client>>,
    /// Back-pointer to the refcounted cell this request lives in.
    pub(crate) cell: Option<NonNull<RequestCell>>,
}

impl Request {
    pub(crate) fn new() -> Self {
        Self {
            http_state: HttpState::InFreelist,
            http_major: 1,
            http_minor: 0,
            method: Method::GET,
            path: LStr::new(),
            headers: HeaderMap::new(),
            secure_headers: HeaderMap::new(),
            body_type: BodyType::None,
            aux: RequestAux::None,
            body_already_read: 0,
            want_keep_alive: false,
            response_begun: false,
            pool: None,
            body_channel: BodyChannel::new(),
            parser: ParserState::None,
            client: None,
            cell: None,
        }
    }

    /// Pause body delivery; frames buffer up (and eventually stop socket
    /// input at the watermark) until
    /// [`HttpServer::resume_request_body`] is called.
    ///
    /// [`HttpServer::resume_request_body`]: crate::server::HttpServer::resume_request_body
    pub fn pause_body(&mut self) {
        self.body_channel.stop();
    }

    #[inline]
    pub fn http_state(&self) -> HttpState {
        self.http_state
    }

    #[inline]
    pub fn body_type(&self) -> BodyType {
        self.body_type
    }

    /// Octets of body ingested so far (raw frame bytes for chunked).
    #[inline]
    pub fn body_already_read(&self) -> u64 {
        self.body_already_read
    }

    #[inline]
    pub fn want_keep_alive(&self) -> bool {
        self.want_keep_alive
    }

    #[inline]
    pub fn response_begun(&self) -> bool {
        self.response_begun
    }

    /// Declared `Content-Length`, when the body is length-framed.
    pub fn content_length(&self) -> Option<u64> {
        match self.aux {
            RequestAux::ContentLength { length } => Some(length),
            _ => None,
        }
    }

    /// Whether the terminating chunk of a chunked body has been seen.
    pub fn end_chunk_reached(&self) -> bool {
        matches!(self.aux, RequestAux::Chunked { end_chunk_reached: true })
    }

    pub fn parse_error(&self) -> Option<ParseError> {
        match self.aux {
            RequestAux::ParseError(err) => Some(err),
            _ => None,
        }
    }

    /// Headers are parsed and the body mode is decided.
    pub fn begun(&self) -> bool {
        !matches!(self.http_state, HttpState::ParsingHeaders | HttpState::InFreelist)
    }

    /// The request is past the point of accepting input or output.
    pub fn ended(&self) -> bool {
        matches!(
            self.http_state,
            HttpState::FlushingOutput | HttpState::WaitingForReferences | HttpState::InFreelist
        )
    }

    /// Whether the wire-framed body has been ingested to completion.
    pub fn body_fully_read(&self) -> bool {
        match self.body_type {
            BodyType::None => true,
            BodyType::ContentLength => match self.aux {
                RequestAux::ContentLength { length } => self.body_already_read >= length,
                _ => false,
            },
            BodyType::Chunked => self.end_chunk_reached(),
            // an upgraded stream has no framing to finish
            BodyType::Upgrade => false,
        }
    }

    /// Whether the connection may be reused after this request.
    pub fn can_keep_alive(&self) -> bool {
        self.want_keep_alive && self.body_fully_read()
    }
}
