use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::rc::RequestCell;
use crate::request::HttpState;

/// Bounded LIFO of recycled request objects.
///
/// Loop thread only. A request on the freelist has `refcount == 1`, no
/// client, no arena, and state `InFreelist` (all set before insertion),
/// and sits on exactly this one list.
pub(crate) struct Freelist {
    slots: RefCell<Vec<NonNull<RequestCell>>>,
    limit: Cell<usize>,
}

impl Freelist {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            limit: Cell::new(limit),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit.get()
    }

    pub(crate) fn set_limit(&self, limit: usize) {
        self.limit.set(limit);
    }

    /// Pop the most recently recycled request, if any.
    pub(crate) fn checkout(&self) -> Option<NonNull<RequestCell>> {
        let cell = self.slots.borrow_mut().pop()?;
        // SAFETY: freelist entries are unreferenced; loop thread
        let req = unsafe { cell.as_ref().state_mut() };
        debug_assert_eq!(req.http_state, HttpState::InFreelist);
        Some(cell)
    }

    /// Recycle a request. Returns `false` when the list is at its limit,
    /// in which case the caller destroys the request instead.
    pub(crate) fn push(&self, cell: NonNull<RequestCell>) -> bool {
        let mut slots = self.slots.borrow_mut();
        if slots.len() >= self.limit.get() {
            return false;
        }
        {
            // SAFETY: caller passes the last reference; loop thread
            let req = unsafe { cell.as_ref().state_mut() };
            debug_assert!(req.client.is_none());
            debug_assert!(req.pool.is_none());
            req.http_state = HttpState::InFreelist;
        }
        unsafe { cell.as_ref() }.store_refcount_relaxed(1);
        slots.push(cell);
        true
    }
}

impl Drop for Freelist {
    fn drop(&mut self) {
        for cell in self.slots.get_mut().drain(..) {
            // SAFETY: freelist entries are unreferenced
            unsafe { RequestCell::destroy(cell) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Freelist;
    use crate::rc::RequestCell;
    use crate::request::HttpState;

    fn recyclable() -> std::ptr::NonNull<RequestCell> {
        let cell = RequestCell::allocate();
        unsafe { cell.as_ref().state_mut() }.http_state = HttpState::WaitingForReferences;
        cell
    }

    #[test]
    fn test_lifo_and_state() {
        let list = Freelist::new(4);
        let a = recyclable();
        let b = recyclable();
        assert!(list.push(a));
        assert!(list.push(b));
        assert_eq!(list.len(), 2);

        let out = list.checkout().unwrap();
        assert_eq!(out, b);
        assert_eq!(unsafe { out.as_ref().state() }.http_state, HttpState::InFreelist);
        assert_eq!(unsafe { out.as_ref() }.refcount(), 1);

        unsafe { RequestCell::destroy(out) };
        // `a` is destroyed by the freelist's own drop
    }

    #[test]
    fn test_limit_rejects() {
        let list = Freelist::new(1);
        let a = recyclable();
        let b = recyclable();
        assert!(list.push(a));
        assert!(!list.push(b));
        unsafe { RequestCell::destroy(b) };
    }

    #[test]
    fn test_empty_checkout() {
        let list = Freelist::new(4);
        assert!(list.checkout().is_none());
    }
}
