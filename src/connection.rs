//! Connections: thread-confined handles to a shared store.
//!
//! A connection is the composition root of the engine. It owns its pinned
//! version, its registry of live entities, its store-level listeners, and
//! (unless opened detached) the event queue wakes and async results are
//! delivered through. Connections and live handles are `Rc`-based and
//! therefore `!Send`: the owning-thread contract is enforced by the
//! compiler, and listener callbacks never need synchronization.

use crate::engine::scheduler::AsyncJob;
use crate::engine::{
    self, AsyncTicket, ConnectionId, EngineEvent, EvalOutcome, SharedStore, Tables,
};
use crate::error::{Result, StoreError};
use crate::live::registry::LiveEntityRegistry;
use crate::live::{ListenerSet, LiveObject, LiveResults, ObjectCore, ResultsCore};
use crate::query::Query;
use crate::types::{FieldValue, ListenerToken, ObjectData, ObjectId, StoreConfig, Version};
use crate::version::VersionState;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{ArcMutexGuard, RawMutex};
use std::cell::{Cell, RefCell};
use std::collections::btree_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// The event queue modeling the owning thread's message loop: a
/// single-consumer channel. Wakes and async completions are posted on the
/// sender (from any thread) and drained by the owning thread in FIFO
/// order.
pub(crate) struct EventQueue {
    pub(crate) sender: Sender<EngineEvent>,
    receiver: Receiver<EngineEvent>,
}

/// An open write transaction: the cross-connection write guard plus a
/// copy-on-write working set based on the latest snapshot.
struct WriteState {
    _guard: ArcMutexGuard<RawMutex, ()>,
    working: Tables,
    dirty: bool,
}

/// Where an async completion lands once the owning thread processes it.
pub(crate) enum PendingTarget {
    Object(Weak<ObjectCore>),
    Results(Weak<ResultsCore>),
}

pub(crate) struct ConnInner {
    pub(crate) id: ConnectionId,
    pub(crate) store: Arc<SharedStore>,
    pub(crate) version: VersionState,
    pub(crate) registry: LiveEntityRegistry,
    pub(crate) store_listeners: ListenerSet,
    queue: Option<EventQueue>,
    next_token: Cell<u64>,
    next_ticket: Cell<u64>,
    pub(crate) pending_async: RefCell<HashMap<AsyncTicket, PendingTarget>>,
    write: RefCell<Option<WriteState>>,
    pub(crate) in_dispatch: Cell<bool>,
    pub(crate) closed: Cell<bool>,
}

/// A thread-confined handle to a shared store.
///
/// Connections opened with the same [`StoreConfig::path`] share one store;
/// a commit on any of them wakes all the others. Dropping the connection
/// closes it.
pub struct Connection {
    inner: Rc<ConnInner>,
}

impl Connection {
    /// Open a connection with an event queue. The owning thread receives
    /// commit wakes and async query completions by pumping
    /// [`Connection::pump_events`] / [`Connection::drain_events`].
    pub fn open(config: &StoreConfig) -> Result<Connection> {
        Self::open_inner(config, true)
    }

    /// Open a connection without an event queue. Such a connection can
    /// read and write, but it can never receive pushed notifications:
    /// registering any listener, refreshing, or submitting an async query
    /// fails with [`StoreError::NoEventQueue`].
    pub fn open_detached(config: &StoreConfig) -> Result<Connection> {
        Self::open_inner(config, false)
    }

    fn open_inner(config: &StoreConfig, with_queue: bool) -> Result<Connection> {
        let store = SharedStore::open_at(config);
        let id = store.alloc_connection_id();
        let queue = with_queue.then(|| {
            let (sender, receiver) = unbounded();
            store.broadcaster.register(id, sender.clone());
            EventQueue { sender, receiver }
        });
        let version = store.data.pin_latest();
        debug!(
            conn = id.0,
            version = version.0,
            event_queue = with_queue,
            path = %store.path().display(),
            "connection opened"
        );
        Ok(Connection {
            inner: Rc::new(ConnInner {
                id,
                store,
                version: VersionState::new(version),
                registry: LiveEntityRegistry::default(),
                store_listeners: ListenerSet::default(),
                queue,
                next_token: Cell::new(1),
                next_ticket: Cell::new(1),
                pending_async: RefCell::new(HashMap::new()),
                write: RefCell::new(None),
                in_dispatch: Cell::new(false),
                closed: Cell::new(false),
            }),
        })
    }

    /// The path identifying the shared store.
    pub fn path(&self) -> &Path {
        self.inner.store.path()
    }

    /// The version this connection is currently pinned to.
    pub fn version(&self) -> Version {
        self.inner.version.current()
    }

    pub fn has_event_queue(&self) -> bool {
        self.inner.queue.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Register a store-level listener, fired once per dispatch pass that
    /// advances the version, before any entity listener.
    pub fn add_change_listener(&self, callback: impl FnMut() + 'static) -> Result<ListenerToken> {
        self.inner.ensure_open()?;
        self.inner
            .ensure_event_queue("store listeners require an event queue")?;
        let token = self.inner.alloc_token();
        self.inner.store_listeners.add(token, Box::new(callback));
        Ok(token)
    }

    pub fn remove_change_listener(&self, token: ListenerToken) -> bool {
        self.inner.store_listeners.remove(token)
    }

    // --- Write transactions ---

    /// Begin a write transaction. Blocks until this connection holds the
    /// store's write lock; the working set is based on the latest version.
    pub fn begin_write(&self) -> Result<()> {
        self.inner.begin_write()
    }

    /// Commit the active write transaction. An empty transaction mints no
    /// version and notifies nobody. Otherwise the new version is
    /// broadcast to every other connection, and this connection runs its
    /// own dispatch pass synchronously (or self-wakes when the commit was
    /// issued from inside a listener callback).
    pub fn commit_write(&self) -> Result<Version> {
        self.inner.commit_write()
    }

    /// Discard the active write transaction.
    pub fn cancel_write(&self) -> Result<()> {
        self.inner.cancel_write()
    }

    /// Create a row in `table`. Requires an active write transaction.
    pub fn create_object(&self, table: impl Into<String>) -> Result<LiveObject> {
        self.inner.create_object(table.into())
    }

    // --- Queries ---

    /// Evaluate a query synchronously at the current version.
    pub fn find(&self, query: Query) -> Result<LiveResults> {
        self.inner.find(query)
    }

    /// Submit a query for background evaluation. The returned handle is
    /// unloaded until the completion is delivered through the event
    /// queue; listeners may be registered on it before data arrives and
    /// fire once when it loads.
    pub fn find_async(&self, query: Query) -> Result<LiveResults> {
        self.inner.find_async(query)
    }

    /// Synchronously find the first matching row.
    pub fn find_first(&self, query: Query) -> Result<Option<LiveObject>> {
        self.inner.find_first(query)
    }

    /// Background variant of [`Connection::find_first`]. The returned
    /// handle loads when the completion is delivered; if no row matched
    /// it loads as invalid and still fires its listeners once.
    pub fn find_first_async(&self, query: Query) -> Result<LiveObject> {
        self.inner.find_first_async(query)
    }

    // --- Notification delivery ---

    /// Synchronously advance to the latest version and deliver
    /// notifications, ahead of any queued wakes (which then become
    /// no-ops). Returns false when already current.
    pub fn refresh(&self) -> Result<bool> {
        self.inner.refresh()
    }

    /// Block for up to `timeout` for one queued event, process it and any
    /// further queued events, and return whether anything was processed.
    pub fn pump_events(&self, timeout: Duration) -> Result<bool> {
        self.inner.pump_events(timeout)
    }

    /// Process every currently queued event without blocking. Returns the
    /// number of events processed.
    pub fn drain_events(&self) -> Result<usize> {
        self.inner.drain_queue()
    }

    /// Close the connection: cancel any open write, detach from the
    /// broadcaster, drop all listeners and pending async queries.
    /// Idempotent; Drop closes best-effort.
    pub fn close(&self) {
        self.inner.close_internal();
    }
}

impl ConnInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.get() {
            Err(StoreError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn ensure_event_queue(&self, context: &'static str) -> Result<&EventQueue> {
        self.queue.as_ref().ok_or(StoreError::NoEventQueue(context))
    }

    pub(crate) fn alloc_token(&self) -> ListenerToken {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        ListenerToken(token)
    }

    fn alloc_ticket(&self) -> AsyncTicket {
        let ticket = self.next_ticket.get();
        self.next_ticket.set(ticket + 1);
        AsyncTicket(ticket)
    }

    pub(crate) fn current_version(&self) -> Version {
        self.version.current()
    }

    pub(crate) fn self_wake(&self, version: Version) {
        if let Some(queue) = &self.queue {
            let _ = queue.sender.send(EngineEvent::Wake { version });
        }
    }

    // --- Read views ---

    /// Read one row through the current view: the working copy during a
    /// write transaction, the pinned snapshot otherwise.
    pub(crate) fn read_row(&self, table: &str, id: ObjectId) -> Option<Arc<ObjectData>> {
        if self.closed.get() {
            return None;
        }
        if let Some(ws) = self.write.borrow().as_ref() {
            return ws.working.get(table).and_then(|rows| rows.get(&id)).cloned();
        }
        self.store.data.row_at(table, id, self.version.current())
    }

    /// Read one row from the pinned committed snapshot, ignoring any open
    /// write transaction. Used to baseline change detection.
    pub(crate) fn committed_row(&self, table: &str, id: ObjectId) -> Option<Arc<ObjectData>> {
        self.store.data.row_at(table, id, self.version.current())
    }

    pub(crate) fn read_object(&self, id: ObjectId) -> Option<(String, Arc<ObjectData>)> {
        if self.closed.get() {
            return None;
        }
        if let Some(ws) = self.write.borrow().as_ref() {
            return engine::object_in(&ws.working, id)
                .map(|(table, data)| (table.to_string(), data.clone()));
        }
        self.store.data.object_at(id, self.version.current())
    }

    pub(crate) fn eval_current(&self, query: &Query) -> EvalOutcome {
        if let Some(ws) = self.write.borrow().as_ref() {
            return engine::evaluate_in(&ws.working, query);
        }
        self.store.data.evaluate(query, self.version.current())
    }

    pub(crate) fn committed_eval(&self, query: &Query) -> EvalOutcome {
        self.store.data.evaluate(query, self.version.current())
    }

    // --- Write transactions ---

    fn begin_write(&self) -> Result<()> {
        self.ensure_open()?;
        if self.write.borrow().is_some() {
            return Err(StoreError::WriteInProgress);
        }
        let guard = self.store.acquire_write();
        let (_, base) = self.store.data.latest_snapshot();
        *self.write.borrow_mut() = Some(WriteState {
            _guard: guard,
            working: (*base).clone(),
            dirty: false,
        });
        Ok(())
    }

    fn commit_write(&self) -> Result<Version> {
        self.ensure_open()?;
        let state = self
            .write
            .borrow_mut()
            .take()
            .ok_or(StoreError::NoActiveWrite)?;
        if !state.dirty {
            trace!(conn = self.id.0, "empty write transaction skipped");
            return Ok(self.version.current());
        }

        let WriteState {
            _guard, working, ..
        } = state;
        let version = self.store.data.publish(working);
        debug!(conn = self.id.0, version = version.0, "commit");
        self.store.broadcaster.broadcast(self.id, version);
        drop(_guard);

        // Own commit is a version-advance event. Inside a dispatch pass it
        // must not recurse; a self-wake defers it to the next pump.
        if self.in_dispatch.get() {
            self.self_wake(version);
        } else {
            self.dispatch_advance(version);
        }
        Ok(version)
    }

    fn cancel_write(&self) -> Result<()> {
        self.ensure_open()?;
        self.write
            .borrow_mut()
            .take()
            .map(drop)
            .ok_or(StoreError::NoActiveWrite)
    }

    fn create_object(self: &Rc<Self>, table: String) -> Result<LiveObject> {
        self.ensure_open()?;
        let id = {
            let mut write = self.write.borrow_mut();
            let ws = write.as_mut().ok_or(StoreError::NoActiveWrite)?;
            let id = self.store.alloc_object_id();
            ws.working
                .entry(table.clone())
                .or_default()
                .insert(id, Arc::new(ObjectData::default()));
            ws.dirty = true;
            id
        };
        Ok(LiveObject::attached(
            self,
            table,
            id,
            None,
            self.version.current(),
        ))
    }

    pub(crate) fn write_set(
        &self,
        table: &str,
        id: ObjectId,
        field: String,
        value: FieldValue,
    ) -> Result<()> {
        self.with_working_row(table, id, |row| {
            row.fields.insert(field, value);
            Ok(())
        })
    }

    pub(crate) fn write_list_push(
        &self,
        table: &str,
        id: ObjectId,
        field: String,
        child: ObjectId,
    ) -> Result<()> {
        self.with_working_row(table, id, |row| match row.fields.entry(field) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                FieldValue::LinkList(ids) => {
                    ids.push(child);
                    Ok(())
                }
                _ => Err(StoreError::InvalidOperation(format!(
                    "field {:?} is not a link list",
                    occupied.key()
                ))),
            },
            Entry::Vacant(vacant) => {
                vacant.insert(FieldValue::LinkList(vec![child]));
                Ok(())
            }
        })
    }

    pub(crate) fn write_delete(&self, table: &str, id: ObjectId) -> Result<()> {
        self.ensure_open()?;
        let mut write = self.write.borrow_mut();
        let ws = write.as_mut().ok_or(StoreError::NoActiveWrite)?;
        let removed = ws
            .working
            .get_mut(table)
            .and_then(|rows| rows.remove(&id))
            .is_some();
        if !removed {
            return Err(StoreError::StaleEntity);
        }
        ws.dirty = true;
        Ok(())
    }

    fn with_working_row(
        &self,
        table: &str,
        id: ObjectId,
        mutate: impl FnOnce(&mut ObjectData) -> Result<()>,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut write = self.write.borrow_mut();
        let ws = write.as_mut().ok_or(StoreError::NoActiveWrite)?;
        let row = ws
            .working
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or(StoreError::StaleEntity)?;
        mutate(Arc::make_mut(row))?;
        ws.dirty = true;
        Ok(())
    }

    // --- Queries ---

    fn find(self: &Rc<Self>, query: Query) -> Result<LiveResults> {
        self.ensure_open()?;
        let outcome = self.eval_current(&query);
        Ok(LiveResults::loaded(
            self,
            query,
            outcome.source_valid,
            outcome.rows,
            self.version.current(),
        ))
    }

    fn find_first(self: &Rc<Self>, query: Query) -> Result<Option<LiveObject>> {
        self.ensure_open()?;
        let outcome = self.eval_current(&query);
        let Some(id) = outcome.rows.first().copied() else {
            return Ok(None);
        };
        Ok(self.read_object(id).map(|(table, data)| {
            LiveObject::attached(self, table, id, Some(data), self.version.current())
        }))
    }

    fn find_async(self: &Rc<Self>, query: Query) -> Result<LiveResults> {
        self.ensure_open()?;
        let reply = self
            .ensure_event_queue("async queries require an event queue")?
            .sender
            .clone();
        let results = LiveResults::pending(self, query.clone(), self.version.current());
        let ticket = self.alloc_ticket();
        self.pending_async
            .borrow_mut()
            .insert(ticket, PendingTarget::Results(Rc::downgrade(&results.core)));
        trace!(conn = self.id.0, ticket = ticket.0, "async query submitted");
        self.store.submit_async(AsyncJob {
            query,
            ticket,
            reply,
            data: self.store.data.clone(),
        });
        Ok(results)
    }

    fn find_first_async(self: &Rc<Self>, query: Query) -> Result<LiveObject> {
        self.ensure_open()?;
        let reply = self
            .ensure_event_queue("async queries require an event queue")?
            .sender
            .clone();
        let object = LiveObject::pending(self, query.clone(), self.version.current());
        let ticket = self.alloc_ticket();
        self.pending_async
            .borrow_mut()
            .insert(ticket, PendingTarget::Object(Rc::downgrade(&object.core)));
        trace!(conn = self.id.0, ticket = ticket.0, "async find-first submitted");
        self.store.submit_async(AsyncJob {
            query,
            ticket,
            reply,
            data: self.store.data.clone(),
        });
        Ok(object)
    }

    // --- Notification delivery ---

    fn refresh(&self) -> Result<bool> {
        self.ensure_open()?;
        self.ensure_event_queue("refresh requires an event queue")?;
        if self.write.borrow().is_some() {
            return Err(StoreError::InvalidOperation(
                "cannot refresh inside a write transaction".into(),
            ));
        }
        if self.in_dispatch.get() {
            return Err(StoreError::InvalidOperation(
                "cannot refresh during notification delivery".into(),
            ));
        }
        let latest = self.store.data.latest_version();
        if VersionState::is_noop(self.version.current(), latest) {
            return Ok(false);
        }
        self.dispatch_advance(latest);
        Ok(true)
    }

    fn pump_events(&self, timeout: Duration) -> Result<bool> {
        self.ensure_open()?;
        let queue = self.ensure_event_queue("event processing requires an event queue")?;
        match queue.receiver.recv_timeout(timeout) {
            Ok(event) => {
                self.process_event(event);
                if !self.closed.get() {
                    self.drain_queue()?;
                }
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Ok(false),
        }
    }

    pub(crate) fn drain_queue(&self) -> Result<usize> {
        self.ensure_open()?;
        let queue = self.ensure_event_queue("event processing requires an event queue")?;
        let mut processed = 0;
        while let Ok(event) = queue.receiver.try_recv() {
            self.process_event(event);
            processed += 1;
            if self.closed.get() {
                break;
            }
        }
        Ok(processed)
    }

    pub(crate) fn close_internal(&self) {
        if self.closed.replace(true) {
            return;
        }
        debug!(conn = self.id.0, "connection closed");
        if self.write.borrow_mut().take().is_some() {
            trace!(conn = self.id.0, "open write transaction cancelled on close");
        }
        self.store.broadcaster.unregister(self.id);
        self.pending_async.borrow_mut().clear();
        self.registry.clear();
        self.store_listeners.clear();
        self.store.data.unpin(self.version.current());
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        self.close_internal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;

    fn test_config(name: &str) -> StoreConfig {
        StoreConfig::at(format!("./conn-tests-{name}"))
    }

    #[test]
    fn test_write_transaction_state_errors() {
        let conn = Connection::open(&test_config("write-state")).unwrap();

        assert!(matches!(conn.commit_write(), Err(StoreError::NoActiveWrite)));
        assert!(matches!(conn.cancel_write(), Err(StoreError::NoActiveWrite)));
        assert!(matches!(
            conn.create_object("Dog"),
            Err(StoreError::NoActiveWrite)
        ));

        conn.begin_write().unwrap();
        assert!(matches!(conn.begin_write(), Err(StoreError::WriteInProgress)));
        conn.cancel_write().unwrap();
    }

    #[test]
    fn test_cancelled_write_leaves_no_trace() {
        let conn = Connection::open(&test_config("cancel")).unwrap();

        conn.begin_write().unwrap();
        conn.create_object("Dog").unwrap();
        conn.cancel_write().unwrap();

        assert_eq!(conn.version(), Version(0));
        assert_eq!(conn.find(Query::table("Dog")).unwrap().len(), 0);
    }

    #[test]
    fn test_commit_advances_version() {
        let conn = Connection::open(&test_config("advance")).unwrap();
        assert_eq!(conn.version(), Version(0));

        conn.begin_write().unwrap();
        conn.create_object("Dog").unwrap();
        let committed = conn.commit_write().unwrap();

        assert_eq!(committed, Version(1));
        assert_eq!(conn.version(), Version(1));
    }

    #[test]
    fn test_refresh_inside_write_is_rejected() {
        let conn = Connection::open(&test_config("refresh-write")).unwrap();
        conn.begin_write().unwrap();
        assert!(matches!(
            conn.refresh(),
            Err(StoreError::InvalidOperation(_))
        ));
        conn.cancel_write().unwrap();
    }

    #[test]
    fn test_late_connection_opens_at_latest_version() {
        let config = test_config("late-open");
        let first = Connection::open(&config).unwrap();
        first.begin_write().unwrap();
        first.create_object("Dog").unwrap();
        first.commit_write().unwrap();

        let second = Connection::open(&config).unwrap();
        assert_eq!(second.version(), Version(1));
        assert_eq!(second.find(Query::table("Dog")).unwrap().len(), 1);
    }

    #[test]
    fn test_find_first_resolves_row() {
        let conn = Connection::open(&test_config("find-first")).unwrap();

        assert!(conn.find_first(Query::table("Dog")).unwrap().is_none());

        conn.begin_write().unwrap();
        let created = conn.create_object("Dog").unwrap();
        created.set("name", "Akamaru").unwrap();
        conn.commit_write().unwrap();

        let found = conn.find_first(Query::table("Dog")).unwrap().unwrap();
        assert_eq!(found.id(), created.id());
        assert_eq!(found.table().as_deref(), Some("Dog"));
        assert_eq!(found.get("name").unwrap().as_str(), Some("Akamaru"));
    }
}
