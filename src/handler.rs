use std::rc::Rc;

use crate::channel::BodyFrame;
use crate::client::Client;
use crate::request::Request;
use crate::server::HttpServer;

/// The capability surface a consumer plugs into the server core.
///
/// Hooks run on the loop thread with exclusive access to the request. A
/// hook that wants to finish work elsewhere takes a [`RequestRef`] and
/// posts closures back to the loop; it must not block.
///
/// [`RequestRef`]: crate::rc::RequestRef
pub trait HttpHandler: 'static {
    /// A brand-new request object was allocated (not fired for freelist
    /// checkouts). Wire up per-request consumer state here.
    fn on_request_object_created(&self, client: &Rc<Client>, req: &mut Request) {
        let _ = (client, req);
    }

    /// Headers are parsed and the body mode is decided. Fired exactly once
    /// per request.
    fn on_request_begin(&self, server: &Rc<HttpServer>, client: &Rc<Client>, req: &mut Request);

    /// A body frame is ready. The default treats any error or end-of-body
    /// as "consumer is done with this connection" and disconnects.
    fn on_request_body(
        &self,
        server: &Rc<HttpServer>,
        client: &Rc<Client>,
        req: &mut Request,
        frame: BodyFrame,
    ) {
        let _ = req;
        match frame {
            BodyFrame::Data(_) => {}
            BodyFrame::Eof | BodyFrame::Error(_) => server.disconnect(client),
        }
    }

    /// Whether a connection upgrade is acceptable for this request.
    /// Refusing (the default) turns the request into a 400.
    fn supports_upgrade(&self, client: &Rc<Client>, req: &mut Request) -> bool {
        let _ = (client, req);
        false
    }

    /// Reset consumer per-request state for a request about to be parsed.
    fn reinitialize_request(&self, client: &Rc<Client>, req: &mut Request) {
        let _ = (client, req);
    }

    /// Tear down consumer per-request state. Called from both
    /// `end_request` and disconnect cleanup, so it MUST be idempotent.
    fn deinitialize_request(&self, client: &Rc<Client>, req: &mut Request) {
        let _ = (client, req);
    }
}
