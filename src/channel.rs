//! The buffered-channel surfaces the core drives.
//!
//! These are passive state machines: the connection driver in [`rt`] moves
//! bytes between them and the socket and reports the edges (drained,
//! flushed, errored) back into the server core. Disk spill is out of scope;
//! buffering is in memory only.
//!
//! [`rt`]: crate::rt

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::BodyError;

/// Default body-channel watermark. Past this many buffered octets the
/// producer side must stop reading the socket until the consumer catches
/// up.
pub const DEFAULT_BODY_THRESHOLD: usize = 128 * 1024;

// ===== InputGate =====

/// Start/stop switch for socket reads on one client.
///
/// The driver only reads (and only re-feeds leftover bytes) while the gate
/// is started.
#[derive(Debug, Default)]
pub struct InputGate {
    started: Cell<bool>,
}

impl InputGate {
    pub fn start(&self) {
        self.started.set(true);
    }

    pub fn stop(&self) {
        self.started.set(false);
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.get()
    }
}

// ===== OutputChannel =====

/// Ordered outbound byte queue with an end marker.
///
/// `feed` preserves call order; `feed_end` marks the response stream
/// complete. The driver pops frames, writes them to the socket, and calls
/// [`ack_end`] once everything up to and including the end marker has been
/// flushed. A write error is latched as "end acknowledged" so the request
/// lifecycle can finish and the connection close without leaking.
///
/// [`ack_end`]: OutputChannel::ack_end
#[derive(Debug, Default)]
pub struct OutputChannel {
    queue: RefCell<VecDeque<Bytes>>,
    ended: Cell<bool>,
    end_acked: Cell<bool>,
    errored: Cell<bool>,
}

impl OutputChannel {
    /// Enqueue response bytes. Frames fed after the end marker are
    /// discarded.
    pub fn feed(&self, data: Bytes) {
        if self.ended.get() || self.errored.get() || data.is_empty() {
            return;
        }
        self.queue.borrow_mut().push_back(data);
    }

    /// Mark the response stream complete.
    pub fn feed_end(&self) {
        self.ended.set(true);
    }

    /// Whether the end marker has been fed.
    pub fn ended(&self) -> bool {
        self.ended.get()
    }

    /// Whether everything, end marker included, has reached the socket
    /// (or the socket failed, which counts the same for lifecycle
    /// purposes).
    pub fn end_acked(&self) -> bool {
        self.end_acked.get()
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.borrow().is_empty()
    }

    /// Next frame to write.
    pub fn pop(&self) -> Option<Bytes> {
        self.queue.borrow_mut().pop_front()
    }

    /// Put back the unwritten tail of a partially written frame.
    pub fn unpop(&self, rest: Bytes) {
        if !rest.is_empty() {
            self.queue.borrow_mut().push_front(rest);
        }
    }

    /// Driver: the queue is flushed and the end marker was fed.
    pub fn ack_end(&self) {
        debug_assert!(self.ended.get());
        self.end_acked.set(true);
    }

    /// Driver: the socket write failed. Pending frames are dropped and the
    /// end is treated as acknowledged.
    pub fn set_write_error(&self) {
        self.errored.set(true);
        self.queue.borrow_mut().clear();
        self.ended.set(true);
        self.end_acked.set(true);
    }

    pub fn write_errored(&self) -> bool {
        self.errored.get()
    }

    /// Reset for the next request on a kept-alive connection.
    pub fn reinitialize(&self) {
        debug_assert!(!self.has_pending());
        self.ended.set(false);
        self.end_acked.set(false);
    }
}

// ===== BodyChannel =====

/// One inbound body frame.
#[derive(Debug)]
pub enum BodyFrame {
    Data(Bytes),
    /// Clean end of the body (empty frame in the wire protocol's terms).
    Eof,
    Error(BodyError),
}

/// Downstream-facing body sink with a byte watermark.
///
/// The ingest side feeds frames; the consumer drains them through the
/// server's pump, and may [`stop`] delivery to take backpressure. Once the
/// buffered level passes the watermark the server stops socket input and
/// arms the buffers-flushed edge; [`take_flushed_edge`] reports when the
/// queue has fully drained so input can resume.
///
/// [`stop`]: BodyChannel::stop
/// [`take_flushed_edge`]: BodyChannel::take_flushed_edge
#[derive(Debug)]
pub struct BodyChannel {
    queue: VecDeque<BodyFrame>,
    buffered: usize,
    threshold: usize,
    stopped: bool,
    flush_armed: bool,
    eof_fed: bool,
}

impl BodyChannel {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_BODY_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            buffered: 0,
            threshold,
            stopped: false,
            flush_armed: false,
            eof_fed: false,
        }
    }

    pub fn feed(&mut self, data: Bytes) {
        self.buffered += data.len();
        self.queue.push_back(BodyFrame::Data(data));
    }

    /// Signal clean end of body. Subsequent calls are no-ops.
    pub fn feed_eof(&mut self) {
        if !self.eof_fed {
            self.eof_fed = true;
            self.queue.push_back(BodyFrame::Eof);
        }
    }

    pub fn eof_fed(&self) -> bool {
        self.eof_fed
    }

    pub fn feed_error(&mut self, err: BodyError) {
        self.queue.push_back(BodyFrame::Error(err));
    }

    /// Whether the buffered level is past the watermark.
    pub fn passed_threshold(&self) -> bool {
        self.buffered >= self.threshold
    }

    /// Consumer pauses delivery; buffered frames accumulate.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Consumer resumes delivery.
    pub fn start(&mut self) {
        self.stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Next frame for the consumer, unless delivery is paused.
    pub fn pop(&mut self) -> Option<BodyFrame> {
        if self.stopped {
            return None;
        }
        let frame = self.queue.pop_front()?;
        if let BodyFrame::Data(data) = &frame {
            self.buffered -= data.len();
        }
        Some(frame)
    }

    /// Arm the buffers-flushed edge after a threshold crossing.
    pub fn arm_flushed_edge(&mut self) {
        self.flush_armed = true;
    }

    /// Consume the buffers-flushed edge: `true` exactly once, when the
    /// edge was armed and the queue has drained.
    pub fn take_flushed_edge(&mut self) -> bool {
        if self.flush_armed && self.queue.is_empty() {
            self.flush_armed = false;
            true
        } else {
            false
        }
    }

    /// Reset for the next request.
    pub fn reinitialize(&mut self) {
        self.queue.clear();
        self.buffered = 0;
        self.stopped = false;
        self.flush_armed = false;
        self.eof_fed = false;
    }

    /// Tear down at request deinitialization; drops anything undelivered.
    pub fn deinitialize(&mut self) {
        self.reinitialize();
    }
}

impl Default for BodyChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{BodyChannel, BodyFrame, OutputChannel};
    use bytes::Bytes;

    #[test]
    fn test_output_order_and_ack() {
        let out = OutputChannel::default();
        out.feed(Bytes::from_static(b"a"));
        out.feed(Bytes::from_static(b"b"));
        out.feed_end();
        assert!(out.ended());
        assert!(!out.end_acked());

        assert_eq!(out.pop().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(out.pop().unwrap(), Bytes::from_static(b"b"));
        assert!(out.pop().is_none());
        out.ack_end();
        assert!(out.end_acked());
    }

    #[test]
    fn test_output_discards_after_end() {
        let out = OutputChannel::default();
        out.feed_end();
        out.feed(Bytes::from_static(b"late"));
        assert!(!out.has_pending());
    }

    #[test]
    fn test_output_write_error_acks_end() {
        let out = OutputChannel::default();
        out.feed(Bytes::from_static(b"pending"));
        out.set_write_error();
        assert!(out.end_acked());
        assert!(!out.has_pending());
    }

    #[test]
    fn test_body_threshold_and_flush_edge() {
        let mut chan = BodyChannel::with_threshold(4);
        chan.feed(Bytes::from_static(b"abcdef"));
        assert!(chan.passed_threshold());
        chan.arm_flushed_edge();
        assert!(!chan.take_flushed_edge());

        match chan.pop() {
            Some(BodyFrame::Data(d)) => assert_eq!(&d[..], b"abcdef"),
            other => panic!("expected data frame, got {other:?}"),
        }
        assert!(!chan.passed_threshold());
        assert!(chan.take_flushed_edge());
        // the edge reports once
        assert!(!chan.take_flushed_edge());
    }

    #[test]
    fn test_body_stop_pauses_delivery() {
        let mut chan = BodyChannel::new();
        chan.feed(Bytes::from_static(b"x"));
        chan.stop();
        assert!(chan.pop().is_none());
        chan.start();
        assert!(matches!(chan.pop(), Some(BodyFrame::Data(_))));
    }
}
