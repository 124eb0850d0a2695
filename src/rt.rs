//! Reactor adapter.
//!
//! The server core is IO-free; this module connects it to sockets on a
//! current-thread tokio runtime. Everything runs on one thread, the loop
//! thread; the only cross-thread entry point is [`LoopHandle::run_later`],
//! which posts a closure to be run there.

use std::rc::Rc;
use std::thread::{self, ThreadId};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::log::{error, trace};
use crate::server::HttpServer;

const READ_CHUNK: usize = 16 * 1024;

/// Fallback errno for read failures the OS gave no code for (EIO).
const FALLBACK_ERRCODE: i32 = 5;

type Task = Box<dyn FnOnce() + Send>;

/// The loop-thread task queue.
///
/// Create it on the thread that will run the reactor, keep [`run`] alive
/// as a task on that thread, and hand [`handle`] clones to anything that
/// needs to post work back.
///
/// [`run`]: EventLoop::run
/// [`handle`]: EventLoop::handle
pub struct EventLoop {
    handle: LoopHandle,
    rx: mpsc::UnboundedReceiver<Task>,
}

impl EventLoop {
    /// Must be called on the loop thread.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: LoopHandle {
                thread: thread::current().id(),
                tx,
            },
            rx,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run posted closures until every handle is gone.
    pub async fn run(mut self) {
        while let Some(task) = self.rx.recv().await {
            task();
        }
    }

    /// Drain whatever is queued right now without waiting. Useful in
    /// tests and manual drivers.
    pub fn run_pending(&mut self) {
        while let Ok(task) = self.rx.try_recv() {
            task();
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap cloneable handle to the loop thread.
#[derive(Clone)]
pub struct LoopHandle {
    thread: ThreadId,
    tx: mpsc::UnboundedSender<Task>,
}

impl LoopHandle {
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Post a closure to run on the loop thread.
    ///
    /// If the loop is already gone the closure is leaked rather than run
    /// or dropped: a closure may hold the last reference to a request,
    /// and dropping it off-loop would have nowhere left to finalize.
    pub fn run_later(&self, f: impl FnOnce() + Send + 'static) {
        if let Err(undelivered) = self.tx.send(Box::new(f)) {
            std::mem::forget(undelivered.0);
        }
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").field("thread", &self.thread).finish()
    }
}

/// Accept connections forever, driving each on its own local task.
///
/// Must run inside a `LocalSet` on the loop thread.
pub async fn serve(server: Rc<HttpServer>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::task::spawn_local(drive(server.clone(), stream));
            }
            Err(err) => {
                error!("accept error: {err}");
            }
        }
    }
}

/// Drive one connection through its lifecycle: move bytes between the
/// socket and the client's channels, and report the edges into the core.
pub async fn drive<IO>(server: Rc<HttpServer>, io: IO)
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (mut rd, mut wr) = tokio::io::split(io);
    let client = server.on_client_accepted();
    let mut read_buf = BytesMut::with_capacity(READ_CHUNK);
    let mut pending = Bytes::new();
    let mut eof_seen = false;

    loop {
        if client.is_disconnecting() {
            break;
        }

        // Outbound first: response frames reach the socket in call order.
        if let Some(frame) = client.output.pop() {
            if let Err(err) = wr.write_all(&frame).await {
                trace!("[Client {}] write error: {err}", client.number());
                client.output.set_write_error();
                server.disconnect(&client);
            }
            continue;
        }
        if client.output.ended() && !client.output.end_acked() {
            client.output.ack_end();
            server.on_client_output_flushed(&client);
            continue;
        }
        if client.output.end_acked() && server.on_client_output_flushed(&client) {
            continue;
        }

        if client.input.is_started() {
            if !pending.is_empty() {
                let consumed = server.on_client_data_received(&client, pending.clone(), 0);
                pending.advance(consumed);
                if consumed > 0 || !client.input.is_started() || client.is_disconnecting() {
                    continue;
                }
                // nothing consumed and input still wants data: wait for a
                // state change rather than spinning
                client.wait_wake().await;
                continue;
            }
            if !eof_seen {
                read_buf.reserve(READ_CHUNK);
                tokio::select! {
                    result = rd.read_buf(&mut read_buf) => match result {
                        Ok(0) => {
                            eof_seen = true;
                            server.on_client_data_received(&client, Bytes::new(), 0);
                        }
                        Ok(_) => {
                            pending = read_buf.split().freeze();
                        }
                        Err(err) => {
                            eof_seen = true;
                            let errcode = err.raw_os_error().unwrap_or(FALLBACK_ERRCODE);
                            server.on_client_data_received(&client, Bytes::new(), errcode);
                        }
                    },
                    _ = client.wait_wake() => {}
                }
                continue;
            }
        }

        client.wait_wake().await;
    }

    server.on_client_disconnecting(&client);
    let _ = wr.shutdown().await;
}

#[cfg(test)]
mod test;
