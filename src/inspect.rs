//! State snapshots for admin queries.
//!
//! Each snapshot serializes to the flat key set the admin surface expects;
//! fields that only exist once headers are parsed are omitted before then.

use serde::Serialize;

use crate::client::Client;
use crate::request::{BodyType, HttpState, Request};
use crate::server::HttpServer;

#[derive(Debug, Serialize)]
pub struct ServerState {
    pub free_request_count: usize,
    pub total_requests_accepted: u64,
}

#[derive(Debug, Serialize)]
pub struct ClientState {
    pub number: u64,
    pub ended_request_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_request: Option<RequestState>,
}

#[derive(Debug, Serialize)]
pub struct RequestState {
    pub refcount: u32,
    pub http_state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_major: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_minor: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub want_keep_alive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body_fully_read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body_already_read: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_begun: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_chunk_reached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl HttpServer {
    pub fn inspect_state(&self) -> ServerState {
        ServerState {
            free_request_count: self.free_request_count(),
            total_requests_accepted: self.total_requests_accepted(),
        }
    }

    /// Snapshot one client.
    ///
    /// # Panics
    ///
    /// Panics when called from within a request hook of this client (the
    /// hook already holds the current request exclusively; use
    /// [`inspect_request_state`] with the request it was given).
    ///
    /// [`inspect_request_state`]: HttpServer::inspect_request_state
    pub fn inspect_client_state(&self, client: &Client) -> ClientState {
        assert!(
            !client.in_hook(),
            "client inspected from within one of its own request hooks"
        );
        let current_request = client.current_request().map(|cell| {
            // SAFETY: loop thread, and the hook guard above rules out a
            // live exclusive borrow
            let req = unsafe { cell.as_ref().state() };
            self.inspect_request_state(req)
        });
        ClientState {
            number: client.number(),
            ended_request_count: client.ended_request_count(),
            current_request,
        }
    }

    /// Snapshot one request. Requests on the freelist must not be
    /// inspected (asserted).
    pub fn inspect_request_state(&self, req: &Request) -> RequestState {
        assert_ne!(
            req.http_state(),
            HttpState::InFreelist,
            "inspected a request on the freelist"
        );
        let begun = req.begun();
        let parse_error = req.parse_error().map(|err| err.name());
        RequestState {
            refcount: req
                .cell
                .map_or(1, |cell| unsafe { cell.as_ref() }.refcount()),
            http_state: req.http_state().name(),
            http_major: begun.then_some(req.http_major),
            http_minor: begun.then_some(req.http_minor),
            method: begun.then(|| req.method.as_str()),
            want_keep_alive: begun.then_some(req.want_keep_alive()),
            request_body_type: begun.then(|| req.body_type().name()),
            request_body_fully_read: begun.then(|| req.body_fully_read()),
            request_body_already_read: begun.then_some(req.body_already_read()),
            response_begun: begun.then_some(req.response_begun()),
            content_length: if begun && parse_error.is_none() {
                req.content_length()
            } else {
                None
            },
            end_chunk_reached: (begun
                && parse_error.is_none()
                && req.body_type() == BodyType::Chunked)
                .then(|| req.end_chunk_reached()),
            parse_error,
            path: begun.then(|| req.path.to_string_lossy()),
            host: if begun {
                req.headers.get(b"host").map(|h| h.to_string_lossy())
            } else {
                None
            },
        }
    }
}
