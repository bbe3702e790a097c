//! Per-connection registry of live entities.

use super::{ObjectCore, ResultsCore};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// A strong reference to one tracked entity, produced by `snapshot`.
pub(crate) enum Entity {
    Object(Rc<ObjectCore>),
    Results(Rc<ResultsCore>),
}

enum WeakEntity {
    Object(Weak<ObjectCore>),
    Results(Weak<ResultsCore>),
}

impl WeakEntity {
    fn upgrade(&self) -> Option<Entity> {
        match self {
            WeakEntity::Object(w) => w.upgrade().map(Entity::Object),
            WeakEntity::Results(w) => w.upgrade().map(Entity::Results),
        }
    }

    fn is(&self, other: &WeakEntity) -> bool {
        match (self, other) {
            (WeakEntity::Object(a), WeakEntity::Object(b)) => a.ptr_eq(b),
            (WeakEntity::Results(a), WeakEntity::Results(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Weak-tracking table of the entities with at least one registered
/// listener. Entries hold no ownership: an entity whose last external
/// handle is dropped is pruned silently and never fires again. Iteration
/// order is registration order.
#[derive(Default)]
pub(crate) struct LiveEntityRegistry {
    entries: RefCell<Vec<WeakEntity>>,
}

impl LiveEntityRegistry {
    pub(crate) fn register_object(&self, core: &Rc<ObjectCore>) {
        self.register(WeakEntity::Object(Rc::downgrade(core)));
    }

    pub(crate) fn register_results(&self, core: &Rc<ResultsCore>) {
        self.register(WeakEntity::Results(Rc::downgrade(core)));
    }

    fn register(&self, entry: WeakEntity) {
        let mut entries = self.entries.borrow_mut();
        if !entries.iter().any(|e| e.is(&entry)) {
            entries.push(entry);
        }
    }

    pub(crate) fn unregister_object(&self, core: &Rc<ObjectCore>) {
        let target = WeakEntity::Object(Rc::downgrade(core));
        self.entries.borrow_mut().retain(|e| !e.is(&target));
    }

    pub(crate) fn unregister_results(&self, core: &Rc<ResultsCore>) {
        let target = WeakEntity::Results(Rc::downgrade(core));
        self.entries.borrow_mut().retain(|e| !e.is(&target));
    }

    /// Stable copy of the live entries for one dispatch pass. Dead entries
    /// are pruned as a side effect; register/unregister calls made by
    /// listener callbacks during the pass cannot disturb the iteration.
    pub(crate) fn snapshot(&self) -> Vec<Entity> {
        let mut live = Vec::new();
        self.entries.borrow_mut().retain(|entry| match entry.upgrade() {
            Some(entity) => {
                live.push(entity);
                true
            }
            None => false,
        });
        live
    }

    pub(crate) fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}
