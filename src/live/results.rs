//! Live query result handles.

use super::{ListenerSet, LiveObject};
use crate::connection::ConnInner;
use crate::error::{Result, StoreError};
use crate::query::Query;
use crate::types::{ListenerToken, ObjectId, Version};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

pub(crate) struct ResultsState {
    pub(crate) valid: bool,
    pub(crate) loaded: bool,
    pub(crate) last_version: Version,
    /// Row ids as last observed by the dispatcher; used only for change
    /// detection. Reads always re-evaluate.
    pub(crate) rows: Vec<ObjectId>,
}

pub(crate) struct ResultsCore {
    pub(crate) conn: Weak<ConnInner>,
    pub(crate) query: Query,
    pub(crate) state: RefCell<ResultsState>,
    pub(crate) listeners: ListenerSet,
}

/// The live result set of a query, pinned to its connection's snapshot.
///
/// Results auto-update: `len`, `ids` and `get` re-evaluate against the
/// connection's current read view. A result set derived from a child list
/// becomes permanently invalid when the parent object is deleted; it then
/// reports length 0. Cloning shares the underlying handle.
#[derive(Clone)]
pub struct LiveResults {
    pub(crate) core: Rc<ResultsCore>,
}

impl LiveResults {
    pub(crate) fn loaded(
        conn: &Rc<ConnInner>,
        query: Query,
        valid: bool,
        rows: Vec<ObjectId>,
        version: Version,
    ) -> Self {
        Self {
            core: Rc::new(ResultsCore {
                conn: Rc::downgrade(conn),
                query,
                state: RefCell::new(ResultsState {
                    valid,
                    loaded: true,
                    last_version: version,
                    rows,
                }),
                listeners: ListenerSet::default(),
            }),
        }
    }

    pub(crate) fn pending(conn: &Rc<ConnInner>, query: Query, version: Version) -> Self {
        Self {
            core: Rc::new(ResultsCore {
                conn: Rc::downgrade(conn),
                query,
                state: RefCell::new(ResultsState {
                    valid: true,
                    loaded: false,
                    last_version: version,
                    rows: Vec::new(),
                }),
                listeners: ListenerSet::default(),
            }),
        }
    }

    pub fn query(&self) -> &Query {
        &self.core.query
    }

    /// Whether the result set has been materialized. Synchronous queries
    /// are always loaded; async queries start unloaded and load when the
    /// background evaluation is delivered.
    pub fn is_loaded(&self) -> bool {
        self.core.state.borrow().loaded
    }

    /// A loaded result set whose source still exists. False while an async
    /// query is pending, and permanently false once a child-list parent
    /// has been deleted.
    pub fn is_valid(&self) -> bool {
        {
            let st = self.core.state.borrow();
            if !st.loaded || !st.valid {
                return false;
            }
        }
        match self.evaluate() {
            Some(outcome) => outcome.source_valid,
            None => false,
        }
    }

    /// Number of matching rows at the connection's current version.
    /// Unloaded or invalidated results report 0.
    pub fn len(&self) -> usize {
        self.current_rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matching row ids at the connection's current version.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.current_rows()
    }

    /// Resolve the row at `index` into a live object handle.
    pub fn get(&self, index: usize) -> Option<LiveObject> {
        let id = self.current_rows().into_iter().nth(index)?;
        let conn = self.conn().ok()?;
        let (table, data) = conn.read_object(id)?;
        Some(LiveObject::attached(
            &conn,
            table,
            id,
            Some(data),
            conn.current_version(),
        ))
    }

    /// Register a change callback. Fires once per dispatch pass in which
    /// the result set (membership, order, or size) changed or the source
    /// was invalidated, and once when a pending async query loads.
    pub fn add_change_listener(&self, callback: impl FnMut() + 'static) -> Result<ListenerToken> {
        let conn = self.conn()?;
        conn.ensure_event_queue("entity listeners require an event queue")?;
        {
            let st = self.core.state.borrow();
            if st.loaded && !st.valid {
                return Err(StoreError::StaleEntity);
            }
        }
        // Baseline against the committed snapshot on first registration so
        // the listener only observes changes made after it. Later
        // registrations must not re-baseline: that would swallow a change
        // other listeners on this entity are still owed.
        if self.core.listeners.is_empty() {
            let mut st = self.core.state.borrow_mut();
            if st.loaded && st.valid {
                let outcome = conn.committed_eval(&self.core.query);
                st.rows = outcome.rows;
                st.last_version = conn.current_version();
            }
        }
        let token = conn.alloc_token();
        self.core.listeners.add(token, Box::new(callback));
        conn.registry.register_results(&self.core);
        Ok(token)
    }

    /// Remove a listener by token. The entity leaves the registry when its
    /// last listener is removed.
    pub fn remove_change_listener(&self, token: ListenerToken) -> bool {
        let removed = self.core.listeners.remove(token);
        if removed && self.core.listeners.is_empty() {
            if let Some(conn) = self.core.conn.upgrade() {
                conn.registry.unregister_results(&self.core);
            }
        }
        removed
    }

    fn conn(&self) -> Result<Rc<ConnInner>> {
        self.core
            .conn
            .upgrade()
            .filter(|c| !c.is_closed())
            .ok_or(StoreError::ConnectionClosed)
    }

    fn evaluate(&self) -> Option<crate::engine::EvalOutcome> {
        let conn = self.core.conn.upgrade().filter(|c| !c.is_closed())?;
        Some(conn.eval_current(&self.core.query))
    }

    fn current_rows(&self) -> Vec<ObjectId> {
        {
            let st = self.core.state.borrow();
            if !st.loaded || !st.valid {
                return Vec::new();
            }
        }
        match self.evaluate() {
            Some(outcome) if outcome.source_valid => outcome.rows,
            _ => Vec::new(),
        }
    }
}
