//! Live object handles.

use super::ListenerSet;
use crate::connection::ConnInner;
use crate::error::{Result, StoreError};
use crate::query::Query;
use crate::types::{FieldValue, ListenerToken, ObjectData, ObjectId, Version};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

pub(crate) struct ObjectState {
    /// Table and row this handle points at. Unset while an async
    /// find-first is still pending.
    pub(crate) ident: Option<(String, ObjectId)>,
    pub(crate) valid: bool,
    pub(crate) loaded: bool,
    pub(crate) last_version: Version,
    /// Row contents as last observed by the dispatcher; used only for
    /// change detection. Reads always resolve fresh.
    pub(crate) cached: Option<Arc<ObjectData>>,
}

pub(crate) struct ObjectCore {
    pub(crate) conn: Weak<ConnInner>,
    /// The originating query, kept for async find-first re-evaluation.
    pub(crate) query: Option<Query>,
    pub(crate) state: RefCell<ObjectState>,
    pub(crate) listeners: ListenerSet,
}

/// A live reference to one row of the store, pinned to its connection's
/// snapshot.
///
/// Handles auto-update: reads always reflect the connection's current
/// version. A handle becomes permanently invalid when its backing row is
/// deleted; from then on reads return `None` and `is_valid` is false.
/// Cloning shares the underlying handle.
#[derive(Clone)]
pub struct LiveObject {
    pub(crate) core: Rc<ObjectCore>,
}

impl LiveObject {
    pub(crate) fn attached(
        conn: &Rc<ConnInner>,
        table: String,
        id: ObjectId,
        cached: Option<Arc<ObjectData>>,
        version: Version,
    ) -> Self {
        Self {
            core: Rc::new(ObjectCore {
                conn: Rc::downgrade(conn),
                query: None,
                state: RefCell::new(ObjectState {
                    ident: Some((table, id)),
                    valid: true,
                    loaded: true,
                    last_version: version,
                    cached,
                }),
                listeners: ListenerSet::default(),
            }),
        }
    }

    pub(crate) fn pending(conn: &Rc<ConnInner>, query: Query, version: Version) -> Self {
        Self {
            core: Rc::new(ObjectCore {
                conn: Rc::downgrade(conn),
                query: Some(query),
                state: RefCell::new(ObjectState {
                    ident: None,
                    valid: true,
                    loaded: false,
                    last_version: version,
                    cached: None,
                }),
                listeners: ListenerSet::default(),
            }),
        }
    }

    /// Row identity, once known. `None` while an async find-first is
    /// pending or when it completed without a match.
    pub fn id(&self) -> Option<ObjectId> {
        self.core.state.borrow().ident.as_ref().map(|(_, id)| *id)
    }

    pub fn table(&self) -> Option<String> {
        self.core
            .state
            .borrow()
            .ident
            .as_ref()
            .map(|(table, _)| table.clone())
    }

    /// Whether the backing data has arrived. Synchronously obtained
    /// objects are always loaded; async find-first starts unloaded.
    pub fn is_loaded(&self) -> bool {
        self.core.state.borrow().loaded
    }

    /// A loaded handle whose row still exists in the connection's current
    /// read view. Pending handles are not yet valid.
    pub fn is_valid(&self) -> bool {
        {
            let st = self.core.state.borrow();
            if !st.loaded || !st.valid {
                return false;
            }
        }
        self.resolve().is_some()
    }

    /// Read one field at the connection's current version. Returns `None`
    /// for unloaded or invalidated handles and for missing fields.
    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.resolve()?.get(field).cloned()
    }

    /// Set one field. Requires an active write transaction on the owning
    /// connection.
    pub fn set(&self, field: impl Into<String>, value: impl Into<FieldValue>) -> Result<()> {
        let (conn, table, id) = self.for_write()?;
        conn.write_set(&table, id, field.into(), value.into())
    }

    /// Append a child to a link-list field. Requires an active write
    /// transaction.
    pub fn list_push(&self, field: impl Into<String>, child: &LiveObject) -> Result<()> {
        let (conn, table, id) = self.for_write()?;
        let child_id = child.id().ok_or(StoreError::StaleEntity)?;
        conn.write_list_push(&table, id, field.into(), child_id)
    }

    /// Delete the backing row. Requires an active write transaction. The
    /// handle turns invalid when the deletion commits (or immediately, as
    /// seen by reads through the working copy).
    pub fn delete(&self) -> Result<()> {
        let (conn, table, id) = self.for_write()?;
        conn.write_delete(&table, id)
    }

    /// Query the child list held in a link-list field of this object.
    pub fn child_list(&self, field: impl Into<String>) -> Option<Query> {
        let st = self.core.state.borrow();
        let (table, id) = st.ident.as_ref()?;
        Some(Query::child_list(table.clone(), *id, field))
    }

    /// Register a change callback. Fires once per dispatch pass in which
    /// the observed row changed or was deleted, and once when a pending
    /// async find-first loads.
    pub fn add_change_listener(&self, callback: impl FnMut() + 'static) -> Result<ListenerToken> {
        let conn = self.conn()?;
        conn.ensure_event_queue("entity listeners require an event queue")?;
        {
            let st = self.core.state.borrow();
            if st.loaded && !st.valid {
                return Err(StoreError::StaleEntity);
            }
        }
        // Baseline the cache on first registration so the listener only
        // observes changes made after it. Later registrations must not
        // re-baseline: that would swallow a change other listeners on
        // this entity are still owed.
        if self.core.listeners.is_empty() {
            self.sync_baseline(&conn);
        }
        let token = conn.alloc_token();
        self.core.listeners.add(token, Box::new(callback));
        conn.registry.register_object(&self.core);
        Ok(token)
    }

    /// Remove a listener by token. The entity leaves the registry when its
    /// last listener is removed.
    pub fn remove_change_listener(&self, token: ListenerToken) -> bool {
        let removed = self.core.listeners.remove(token);
        if removed && self.core.listeners.is_empty() {
            if let Some(conn) = self.core.conn.upgrade() {
                conn.registry.unregister_object(&self.core);
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

    fn for_write(&self) -> Result<(Rc<ConnInner>, String, ObjectId)> {
        let conn = self.conn()?;
        let st = self.core.state.borrow();
        if !st.loaded || !st.valid {
            return Err(StoreError::StaleEntity);
        }
        let (table, id) = st.ident.clone().ok_or(StoreError::StaleEntity)?;
        drop(st);
        Ok((conn, table, id))
    }

    fn resolve(&self) -> Option<Arc<ObjectData>> {
        let (table, id) = {
            let st = self.core.state.borrow();
            if !st.loaded || !st.valid {
                return None;
            }
            st.ident.clone()?
        };
        let conn = self.core.conn.upgrade().filter(|c| !c.is_closed())?;
        conn.read_row(&table, id)
    }

    fn sync_baseline(&self, conn: &Rc<ConnInner>) {
        let mut st = self.core.state.borrow_mut();
        if !st.loaded || !st.valid {
            return;
        }
        if let Some((table, id)) = st.ident.clone() {
            // Baseline against the committed snapshot: uncommitted edits of
            // an open write transaction still count as changes at commit.
            st.cached = conn.committed_row(&table, id);
            st.last_version = conn.current_version();
        }
    }
}
