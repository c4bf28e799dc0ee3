use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Bag generation of a node that is not linked into any bag.
pub(crate) const UNMANAGED: i64 = -1;

/// A cache entry wrapping one value.
///
/// A node is linked into exactly one age bag at a time and is retained
/// strongly only by that bag's chain; indexes hold weak references to it.
/// The `bag` generation may run ahead of the chain the node physically sits
/// in: touches advance the generation without relinking, and the sweep of
/// the older bag performs the physical catch-up later.
pub(crate) struct Node<T> {
    value: RwLock<Option<Arc<T>>>,
    next: Mutex<Option<Arc<Node<T>>>>,
    bag: AtomicI64,
}

impl<T> Node<T> {
    pub(crate) fn new(value: Arc<T>) -> Self {
        Self {
            value: RwLock::new(Some(value)),
            next: Mutex::new(None),
            bag: AtomicI64::new(UNMANAGED),
        }
    }

    /// Clone of the value, or `None` once the node is logically removed.
    pub(crate) fn value(&self) -> Option<Arc<T>> {
        self.value.read().clone()
    }

    pub(crate) fn has_value(&self) -> bool {
        self.value.read().is_some()
    }

    /// Write access to the value slot, used by removal to tombstone the node.
    pub(crate) fn value_mut(&self) -> RwLockWriteGuard<'_, Option<Arc<T>>> {
        self.value.write()
    }

    pub(crate) fn bag_generation(&self) -> i64 {
        self.bag.load(Ordering::Acquire)
    }

    pub(crate) fn set_bag_generation(&self, generation: i64) {
        self.bag.store(generation, Ordering::Release);
    }

    pub(crate) fn next(&self) -> Option<Arc<Node<T>>> {
        self.next.lock().clone()
    }

    /// Detach and return the chain successor. Only called under the
    /// lifespan manager's mutex.
    pub(crate) fn take_next(&self) -> Option<Arc<Node<T>>> {
        self.next.lock().take()
    }

    pub(crate) fn set_next(&self, next: Option<Arc<Node<T>>>) {
        *self.next.lock() = next;
    }
}
