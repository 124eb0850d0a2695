use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use tokio::sync::Notify;

use crate::channel::{InputGate, OutputChannel};
use crate::rc::RequestCell;
use crate::server::HttpServer;

/// One accepted connection.
///
/// Clients live on the loop thread and are shared by `Rc`: the connection
/// driver holds one handle, and every request bound to the client holds
/// another until its own reference count reaches zero. The `Rc` count is
/// the client refcount.
pub struct Client {
    number: u64,
    server: Rc<HttpServer>,
    pub(crate) input: InputGate,
    pub(crate) output: OutputChannel,
    current: Cell<Option<NonNull<RequestCell>>>,
    /// Requests whose socket lifetime ended but which are still referenced.
    ended: RefCell<Vec<NonNull<RequestCell>>>,
    ended_count: Cell<u32>,
    disconnecting: Cell<bool>,
    waker: Notify,
    /// Depth of request hooks currently on the stack. Guards against
    /// inspecting a request that a hook holds exclusively.
    hook_depth: Cell<u32>,
}

impl Client {
    pub(crate) fn new(number: u64, server: Rc<HttpServer>) -> Rc<Self> {
        Rc::new(Self {
            number,
            server,
            input: InputGate::default(),
            output: OutputChannel::default(),
            current: Cell::new(None),
            ended: RefCell::new(Vec::new()),
            ended_count: Cell::new(0),
            disconnecting: Cell::new(false),
            waker: Notify::new(),
            hook_depth: Cell::new(0),
        })
    }

    /// Monotonically increasing connection number, for log correlation.
    #[inline]
    pub fn number(&self) -> u64 {
        self.number
    }

    pub(crate) fn server(&self) -> &Rc<HttpServer> {
        &self.server
    }

    pub(crate) fn current_request(&self) -> Option<NonNull<RequestCell>> {
        self.current.get()
    }

    pub(crate) fn set_current_request(&self, cell: NonNull<RequestCell>) {
        debug_assert!(self.current.get().is_none());
        self.current.set(Some(cell));
    }

    pub(crate) fn clear_current_request(&self) {
        self.current.set(None);
    }

    /// Number of ended-but-still-referenced requests.
    pub fn ended_request_count(&self) -> u32 {
        self.ended_count.get()
    }

    pub(crate) fn push_ended(&self, cell: NonNull<RequestCell>) {
        self.ended.borrow_mut().push(cell);
        self.ended_count.set(self.ended_count.get() + 1);
    }

    /// Unlink a request from the ended list. The request must be on it.
    pub(crate) fn unlink_ended(&self, cell: NonNull<RequestCell>) {
        let mut ended = self.ended.borrow_mut();
        let index = ended
            .iter()
            .position(|&c| c == cell)
            .expect("request not on its client's ended list");
        ended.swap_remove(index);
        self.ended_count.set(self.ended_count.get() - 1);
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.get()
    }

    pub(crate) fn set_disconnecting(&self) {
        self.disconnecting.set(true);
    }

    /// Nudge the connection driver to re-examine channel state.
    pub(crate) fn wake(&self) {
        self.waker.notify_one();
    }

    pub(crate) async fn wait_wake(&self) {
        self.waker.notified().await;
    }

    pub(crate) fn enter_hook(&self) {
        self.hook_depth.set(self.hook_depth.get() + 1);
    }

    pub(crate) fn leave_hook(&self) {
        self.hook_depth.set(self.hook_depth.get() - 1);
    }

    pub(crate) fn in_hook(&self) -> bool {
        self.hook_depth.get() > 0
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("number", &self.number)
            .field("ended_request_count", &self.ended_count.get())
            .field("disconnecting", &self.disconnecting.get())
            .finish_non_exhaustive()
    }
}
