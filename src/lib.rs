//! HTTP/1.x connection server core.
//!
//! `stoa` owns accepted client sockets, drives each connection through its
//! HTTP lifecycle, and delivers fully parsed requests, with streamed or
//! buffered bodies, to a plugged-in [`HttpHandler`], then writes the
//! handler's responses back. It is the hot path of a dispatcher fronting
//! long-running application workers.
//!
//! Everything runs cooperatively on one event-loop thread. Requests are
//! recycled through a bounded freelist; header-parser states come from a
//! per-server pool; per-request allocations live in a bump arena whose
//! spans stay valid as long as anything downstream still references them.
//! Workers on other threads keep requests alive through atomically
//! refcounted [`RequestRef`] handles and post their work back to the loop.
//!
//! ```no_run
//! use std::rc::Rc;
//! use stoa::{HttpHandler, HttpServer, Client, Request};
//!
//! struct Hello;
//!
//! impl HttpHandler for Hello {
//!     fn on_request_begin(&self, server: &Rc<HttpServer>, client: &Rc<Client>, req: &mut Request) {
//!         server.write_simple_response(client, req, 200, &[], b"hello");
//!         server.end_request(client, req);
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> std::io::Result<()> {
//!     let event_loop = stoa::EventLoop::new();
//!     let server = HttpServer::new(event_loop.handle(), Hello);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     tokio::task::LocalSet::new()
//!         .run_until(async move {
//!             tokio::task::spawn_local(event_loop.run());
//!             stoa::rt::serve(server, listener).await;
//!             Ok(())
//!         })
//!         .await
//! }
//! ```

mod log;

pub mod arena;
pub mod channel;
pub mod client;
pub mod config;
pub mod date;
pub mod error;
pub mod handler;
pub mod headers;
pub mod inspect;
pub mod lstr;
pub mod method;
pub mod rc;
pub mod request;
pub mod rt;
pub mod server;
pub mod status;

mod freelist;
mod parse;
mod pool;

// ===== Reexports =====

pub use channel::BodyFrame;
pub use client::Client;
pub use config::Config;
pub use error::{BodyError, ParseError};
pub use handler::HttpHandler;
pub use headers::HeaderMap;
pub use lstr::LStr;
pub use method::Method;
pub use rc::RequestRef;
pub use request::{BodyType, HttpState, Request};
pub use rt::{EventLoop, LoopHandle};
pub use server::HttpServer;
