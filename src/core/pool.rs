//! Index-addressed pool of client handles.
//!
//! A slot's index is the durable identity of a client. Churn swaps the handle
//! stored in a slot; every reader loads the slot at the time of use instead
//! of holding on to a handle across a possible swap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

struct Slot<C> {
    handle: RwLock<Arc<C>>,
    leased: AtomicBool,
}

pub struct Pool<C> {
    slots: Arc<Vec<Slot<C>>>,
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<C> Pool<C> {
    pub fn new(clients: impl IntoIterator<Item = C>) -> Self {
        let slots = clients
            .into_iter()
            .map(|client| Slot {
                handle: RwLock::new(Arc::new(client)),
                leased: AtomicBool::new(false),
            })
            .collect();
        Self {
            slots: Arc::new(slots),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Handle currently bound to `index`.
    ///
    /// # Panics
    /// If `index` is out of range.
    pub fn current(&self, index: usize) -> Arc<C> {
        Arc::clone(&self.slots[index].handle.read())
    }

    /// Binds a new handle to `index` and returns the previous one.
    pub fn replace(&self, index: usize, client: C) -> Arc<C> {
        let mut handle = self.slots[index].handle.write();
        std::mem::replace(&mut *handle, Arc::new(client))
    }

    /// Exclusive write lease on `index`, or `None` while another lease is live.
    pub fn lease(&self, index: usize) -> Option<SlotLease<C>> {
        self.slots[index]
            .leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotLease {
                pool: self.clone(),
                index,
            })
    }
}

/// Released on drop.
pub struct SlotLease<C> {
    pool: Pool<C>,
    index: usize,
}

impl<C> SlotLease<C> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Arc<C> {
        self.pool.current(self.index)
    }

    pub fn replace(&self, client: C) -> Arc<C> {
        self.pool.replace(self.index, client)
    }
}

impl<C> Drop for SlotLease<C> {
    fn drop(&mut self) {
        self.pool.slots[self.index]
            .leased
            .store(false, Ordering::Release);
    }
}
