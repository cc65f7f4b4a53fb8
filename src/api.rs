//! Collaborator-facing traits and helpers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::object::ObjectId;
use crate::statistics::CollectionCycle;

/// Supplies the current root references (stack locals, static fields) at the
/// start of every collection cycle.
///
/// Must be callable at any time and return a momentarily-consistent snapshot.
/// The collector never mutates the provider's source: when an object a root
/// points at is relocated, readers follow the forwarding table via
/// [`Heap::resolve`](crate::heap::Heap::resolve) instead.
pub trait RootProvider: Send + Sync {
    fn current_roots(&self) -> Vec<ObjectId>;
}

/// Receives a summary after every collection cycle. Purely informational; no
/// feedback into collector decisions.
pub trait CycleSink: Send + Sync {
    fn on_cycle(&self, cycle: &CollectionCycle);
}

/// A shareable, mutable root set for embedders without their own stack
/// scanning. Clones observe the same underlying list.
#[derive(Clone, Default)]
pub struct RootList {
    inner: Arc<Mutex<Vec<ObjectId>>>,
}

impl RootList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: ObjectId) {
        self.inner.lock().push(id);
    }

    /// Removes every occurrence of `id`.
    pub fn remove(&self, id: ObjectId) {
        self.inner.lock().retain(|&root| root != id);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl RootProvider for RootList {
    fn current_roots(&self) -> Vec<ObjectId> {
        self.inner.lock().clone()
    }
}
