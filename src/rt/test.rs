use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::task::LocalSet;

use super::{EventLoop, drive};
use crate::channel::BodyFrame;
use crate::client::Client;
use crate::handler::HttpHandler;
use crate::request::Request;
use crate::server::HttpServer;

/// Responds `200 ok` from `on_request_begin`.
struct Immediate;

impl HttpHandler for Immediate {
    fn on_request_begin(&self, server: &Rc<HttpServer>, client: &Rc<Client>, req: &mut Request) {
        server.write_simple_response(client, req, 200, &[], b"ok");
        server.end_request(client, req);
    }
}

/// Collects the body, then echoes its length.
struct EchoLength {
    received: Cell<usize>,
}

impl HttpHandler for EchoLength {
    fn on_request_begin(&self, _: &Rc<HttpServer>, _: &Rc<Client>, _: &mut Request) {}

    fn on_request_body(
        &self,
        server: &Rc<HttpServer>,
        client: &Rc<Client>,
        req: &mut Request,
        frame: BodyFrame,
    ) {
        match frame {
            BodyFrame::Data(data) => self.received.set(self.received.get() + data.len()),
            BodyFrame::Eof => {
                let body = format!("got {}", self.received.get());
                server.write_simple_response(client, req, 200, &[], body.as_bytes());
                server.end_request(client, req);
            }
            BodyFrame::Error(_) => server.disconnect(client),
        }
    }
}

/// Hands the request to a worker thread; the response comes back through
/// the loop-task queue.
struct WorkerThread;

impl HttpHandler for WorkerThread {
    fn on_request_begin(&self, server: &Rc<HttpServer>, _client: &Rc<Client>, req: &mut Request) {
        let held = server.ref_request(req);
        let event_loop = server.event_loop().clone();
        std::thread::spawn(move || {
            event_loop.run_later(move || {
                held.visit(|server, client, req| {
                    server.write_simple_response(client, req, 200, &[], b"from the worker");
                    server.end_request(client, req);
                });
            });
        });
    }
}

async fn read_response(peer: &mut DuplexStream, ends_with: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        let mut chunk = [0u8; 4096];
        loop {
            let n = peer.read(&mut chunk).await.expect("peer read failed");
            assert_ne!(n, 0, "server closed before the full response arrived");
            out.extend_from_slice(&chunk[..n]);
            if out.ends_with(ends_with) {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for response");
    out
}

fn run_with_server<H, F>(handler: H, body: impl FnOnce(Rc<HttpServer>, DuplexStream) -> F)
where
    H: HttpHandler,
    F: Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        let event_loop = EventLoop::new();
        let server = HttpServer::new(event_loop.handle(), handler);
        tokio::task::spawn_local(event_loop.run());
        let (server_io, peer) = duplex(64 * 1024);
        let driver = tokio::task::spawn_local(drive(server.clone(), server_io));
        body(server.clone(), peer).await;
        driver.await.expect("driver panicked");
    });
}

#[test]
fn test_e2e_keep_alive_roundtrips() {
    run_with_server(Immediate, |server, mut peer| async move {
        for _ in 0..2 {
            peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            let response = read_response(&mut peer, b"\r\n\r\nok").await;
            let text = str::from_utf8(&response).unwrap();
            assert!(text.starts_with("HTTP/1.1 200 OK\r\nStatus: 200 OK\r\n"));
            assert!(text.contains("Connection: keep-alive\r\n"));
        }
        assert_eq!(server.total_requests_accepted(), 2);
        drop(peer); // EOF ends the connection
    });
}

#[test]
fn test_e2e_pipelined_requests() {
    run_with_server(Immediate, |_server, mut peer| async move {
        peer.write_all(
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await
        .unwrap();
        let mut responses = Vec::new();
        responses.extend(read_response(&mut peer, b"\r\n\r\nok").await);
        responses.extend(read_response(&mut peer, b"\r\n\r\nok").await);
        let text = str::from_utf8(&responses).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        drop(peer);
    });
}

#[test]
fn test_e2e_post_body() {
    run_with_server(EchoLength { received: Cell::new(0) }, |_server, mut peer| async move {
        peer.write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        let response = read_response(&mut peer, b"\r\n\r\ngot 5").await;
        assert!(str::from_utf8(&response).unwrap().starts_with("HTTP/1.1 200 OK\r\n"));
        drop(peer);
    });
}

#[test]
fn test_e2e_response_from_worker_thread() {
    run_with_server(WorkerThread, |_server, mut peer| async move {
        peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let response = read_response(&mut peer, b"\r\n\r\nfrom the worker").await;
        assert!(str::from_utf8(&response).unwrap().starts_with("HTTP/1.1 200 OK\r\n"));
        drop(peer);
    });
}

#[test]
fn test_e2e_bad_request_closes_connection() {
    run_with_server(Immediate, |_server, mut peer| async move {
        peer.write_all(b"NOTAVERB / XYZ\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut chunk = [0u8; 4096];
            loop {
                // read to EOF: the server closes after the 400 drains
                let n = peer.read(&mut chunk).await.expect("peer read failed");
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .expect("timed out waiting for close");
        let text = str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.0 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    });
}
