//! Live entities: weakly-tracked handles that observe store changes.

pub(crate) mod registry;

mod object;
mod results;

pub use object::LiveObject;
pub use results::LiveResults;

pub(crate) use object::ObjectCore;
pub(crate) use results::ResultsCore;

use crate::types::ListenerToken;
use std::cell::RefCell;

struct ListenerSlot {
    token: ListenerToken,
    /// Checked out (None) while the callback runs, so a callback that
    /// mutates the set never races its own invocation.
    callback: Option<Box<dyn FnMut()>>,
}

/// An ordered set of change callbacks keyed by token.
///
/// Invocation order is registration order. Callbacks may re-enter the set:
/// listeners added during delivery fire on the next delivery, listeners
/// removed during delivery (including a callback removing itself) stop
/// firing immediately.
#[derive(Default)]
pub(crate) struct ListenerSet {
    slots: RefCell<Vec<ListenerSlot>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, token: ListenerToken, callback: Box<dyn FnMut()>) {
        self.slots.borrow_mut().push(ListenerSlot {
            token,
            callback: Some(callback),
        });
    }

    pub(crate) fn remove(&self, token: ListenerToken) -> bool {
        let mut slots = self.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|s| s.token != token);
        slots.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.slots.borrow_mut().clear();
    }

    /// Invoke every callback registered at the start of the delivery.
    pub(crate) fn notify_all(&self) {
        let tokens: Vec<ListenerToken> =
            self.slots.borrow().iter().map(|s| s.token).collect();

        for token in tokens {
            let callback = {
                let mut slots = self.slots.borrow_mut();
                match slots.iter_mut().find(|s| s.token == token) {
                    Some(slot) => slot.callback.take(),
                    None => None, // removed by an earlier callback
                }
            };
            let Some(mut callback) = callback else { continue };
            callback();
            // Restore unless the callback removed itself.
            let mut slots = self.slots.borrow_mut();
            if let Some(slot) = slots.iter_mut().find(|s| s.token == token) {
                slot.callback = Some(callback);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_registration_order() {
        let set = ListenerSet::default();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            set.add(ListenerToken(i), Box::new(move || order.borrow_mut().push(i)));
        }
        set.notify_all();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_remove_by_token() {
        let set = ListenerSet::default();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        set.add(ListenerToken(1), Box::new(move || c.set(c.get() + 1)));

        assert!(set.remove(ListenerToken(1)));
        assert!(!set.remove(ListenerToken(1)));
        set.notify_all();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_listener_added_during_delivery_waits() {
        let set = Rc::new(ListenerSet::default());
        let count = Rc::new(Cell::new(0));

        let inner_count = count.clone();
        let set2 = set.clone();
        set.add(
            ListenerToken(1),
            Box::new(move || {
                let c = inner_count.clone();
                set2.add(ListenerToken(2), Box::new(move || c.set(c.get() + 1)));
            }),
        );

        set.notify_all();
        assert_eq!(count.get(), 0);
        set.notify_all();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_listener_removing_itself() {
        let set = Rc::new(ListenerSet::default());
        let count = Rc::new(Cell::new(0));

        let c = count.clone();
        let set2 = set.clone();
        set.add(
            ListenerToken(1),
            Box::new(move || {
                c.set(c.get() + 1);
                set2.remove(ListenerToken(1));
            }),
        );

        set.notify_all();
        set.notify_all();
        assert_eq!(count.get(), 1);
        assert!(set.is_empty());
    }
}
