//! Atomic request refcounting with a loop-thread hop.
//!
//! A request's storage is a heap [`RequestCell`]: the atomic count next to
//! the state itself. All state access goes through the cell pointer on the
//! loop thread; off-loop holders of a [`RequestRef`] may only clone it or
//! drop it. A drop that observes the count reach zero off-loop restores
//! one reference and posts the final drop onto the loop, so the
//! zero-refcount handler, which touches the freelist and client
//! bookkeeping, runs exclusively on the loop thread, without locks.
//!
//! The hop is safe because the server outlives every client that still has
//! referenced requests: each request holds its client alive, and each
//! client holds the server alive.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::client::Client;
use crate::request::{HttpState, Request};
use crate::rt::LoopHandle;
use crate::server::HttpServer;

pub(crate) struct RequestCell {
    refcount: AtomicU32,
    state: UnsafeCell<Request>,
}

impl RequestCell {
    /// Heap-allocate a fresh request with one reference.
    pub(crate) fn allocate() -> NonNull<RequestCell> {
        let cell = Box::new(RequestCell {
            refcount: AtomicU32::new(1),
            state: UnsafeCell::new(Request::new()),
        });
        let ptr = NonNull::from(Box::leak(cell));
        // SAFETY: sole owner; the back-pointer lets the request find its
        // cell for refcounting and recycling
        unsafe {
            (*ptr.as_ref().state.get()).cell = Some(ptr);
        }
        ptr
    }

    /// Exclusive access to the request state.
    ///
    /// # Safety
    ///
    /// Loop thread only, and no other reference to the state may be live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn state_mut(&self) -> &mut Request {
        unsafe { &mut *self.state.get() }
    }

    /// Shared access to the request state.
    ///
    /// # Safety
    ///
    /// Loop thread only, and no exclusive reference may be live.
    pub(crate) unsafe fn state(&self) -> &Request {
        unsafe { &*self.state.get() }
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Free the cell.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`allocate`] and no reference of any kind
    /// to it may remain.
    ///
    /// [`allocate`]: RequestCell::allocate
    pub(crate) unsafe fn destroy(ptr: NonNull<RequestCell>) {
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }

    pub(crate) fn store_refcount_relaxed(&self, value: u32) {
        self.refcount.store(value, Ordering::Relaxed);
    }
}

/// Owning handle to a request, valid on any thread.
///
/// Off the loop thread the only permitted operations are [`clone`],
/// [`refcount`], and dropping; everything that reads or mutates the
/// request goes through [`visit`], which runs on the loop thread.
///
/// [`clone`]: Clone::clone
/// [`refcount`]: RequestRef::refcount
/// [`visit`]: RequestRef::visit
pub struct RequestRef {
    cell: NonNull<RequestCell>,
    event_loop: LoopHandle,
}

// SAFETY: cross-thread use is restricted to the atomic refcount; state
// access asserts the loop thread
unsafe impl Send for RequestRef {}
unsafe impl Sync for RequestRef {}

impl RequestRef {
    /// Take over an already-counted reference.
    pub(crate) fn adopt(cell: NonNull<RequestCell>, event_loop: LoopHandle) -> Self {
        Self { cell, event_loop }
    }

    /// Add a new reference.
    pub(crate) fn acquire(cell: NonNull<RequestCell>, event_loop: LoopHandle) -> Self {
        unsafe { cell.as_ref() }.refcount.fetch_add(1, Ordering::Relaxed);
        Self { cell, event_loop }
    }

    /// Current reference count. Diagnostic only; stale by the time the
    /// caller looks at it.
    pub fn refcount(&self) -> u32 {
        unsafe { self.cell.as_ref() }.refcount()
    }

    /// Run `f` against the request on the loop thread.
    ///
    /// Returns `None` once the request has been detached from its client.
    /// Must be called on the loop thread (post a closure holding the ref
    /// with [`LoopHandle::run_later`] to get there) and not from inside a
    /// request hook.
    ///
    /// # Panics
    ///
    /// Panics off the loop thread, or when called from within a hook of
    /// the owning client.
    pub fn visit<R>(&self, f: impl FnOnce(&Rc<HttpServer>, &Rc<Client>, &mut Request) -> R) -> Option<R> {
        assert!(
            self.event_loop.is_loop_thread(),
            "RequestRef::visit called off the event-loop thread"
        );
        // SAFETY: loop thread; hooks are excluded by the assert below, so
        // no other reference to this request's state is live
        let req = unsafe { self.cell.as_ref().state_mut() };
        let client = req.client.clone()?;
        assert!(
            !client.in_hook(),
            "RequestRef::visit called from within a request hook"
        );
        let server = client.server().clone();
        Some(f(&server, &client, req))
    }
}

impl Clone for RequestRef {
    fn clone(&self) -> Self {
        unsafe { self.cell.as_ref() }.refcount.fetch_add(1, Ordering::Relaxed);
        Self {
            cell: self.cell,
            event_loop: self.event_loop.clone(),
        }
    }
}

impl Drop for RequestRef {
    fn drop(&mut self) {
        let old = unsafe { self.cell.as_ref() }.refcount.fetch_sub(1, Ordering::Release);
        debug_assert!(old >= 1);
        if old != 1 {
            return;
        }
        fence(Ordering::Acquire);

        if self.event_loop.is_loop_thread() {
            // SAFETY: count reached zero, so this is the only handle; we
            // are on the loop thread
            unsafe { request_reached_zero(self.cell) }
        } else {
            // Sole owner now. Hand the final reference to the loop: the
            // posted closure drops it there, which re-enters this path on
            // the right thread.
            unsafe { self.cell.as_ref() }.store_refcount_relaxed(1);
            let replacement = RequestRef::adopt(self.cell, self.event_loop.clone());
            self.event_loop.run_later(move || drop(replacement));
        }
    }
}

impl std::fmt::Debug for RequestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRef")
            .field("refcount", &self.refcount())
            .finish_non_exhaustive()
    }
}

/// Zero-refcount handler. Unlinks the request from its client's ended
/// list, recycles or destroys it, then drops the client reference it held.
///
/// # Safety
///
/// Loop thread only; the count must have reached zero (no live handles).
unsafe fn request_reached_zero(cell: NonNull<RequestCell>) {
    let client = {
        // SAFETY: per contract, no other reference to the state is live
        let req = unsafe { cell.as_ref().state_mut() };
        assert_eq!(
            req.http_state,
            HttpState::WaitingForReferences,
            "request dropped to zero references in state {}",
            req.http_state.name()
        );
        req.client
            .take()
            .expect("request reached zero references with no client")
    };
    crate::log::trace!(
        "[Client {}] request object reached a reference count of 0",
        client.number()
    );
    client.unlink_ended(cell);
    client.server().recycle_request(cell);
    drop(client);
}
