use std::cell::RefCell;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

/// A pooled value clears itself before going back on the shelf.
pub(crate) trait Reset {
    fn reset(&mut self);
}

/// Loop-thread object pool for large short-lived states.
///
/// Holds `initial` prebuilt values and retains at most `high_water` of the
/// values returned to it; the rest are dropped.
pub(crate) struct ObjectPool<T: Default + Reset> {
    shelf: RefCell<Vec<Box<T>>>,
    high_water: usize,
}

impl<T: Default + Reset> ObjectPool<T> {
    pub(crate) fn new(initial: usize, high_water: usize) -> Rc<Self> {
        let mut shelf = Vec::with_capacity(initial);
        shelf.resize_with(initial, Box::default);
        Rc::new(Self {
            shelf: RefCell::new(shelf),
            high_water,
        })
    }

    /// Take a value off the shelf, or build a fresh one.
    pub(crate) fn checkout(self: &Rc<Self>) -> Pooled<T> {
        let value = self.shelf.borrow_mut().pop().unwrap_or_default();
        Pooled {
            value: ManuallyDrop::new(value),
            pool: Rc::clone(self),
        }
    }

    pub(crate) fn shelved(&self) -> usize {
        self.shelf.borrow().len()
    }

    fn restore(&self, mut value: Box<T>) {
        let mut shelf = self.shelf.borrow_mut();
        if shelf.len() < self.high_water {
            value.reset();
            shelf.push(value);
        }
    }
}

/// Owning handle to a pooled value; returns it to the pool on drop.
pub(crate) struct Pooled<T: Default + Reset> {
    value: ManuallyDrop<Box<T>>,
    pool: Rc<ObjectPool<T>>,
}

impl<T: Default + Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Default + Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Default + Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        // SAFETY: value is taken exactly once, here
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        self.pool.restore(value);
    }
}
