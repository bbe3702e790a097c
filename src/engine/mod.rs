//! Reference storage engine.
//!
//! A process-shared, in-memory, multi-version table store keyed by path.
//! Connections opened with the same path share one `SharedStore`; a
//! process-wide map hands out the shared instance, created on first open
//! and torn down when the last connection closes.
//!
//! The engine keeps every snapshot that some connection is still pinned
//! to. Commits publish a new snapshot built from a copy-on-write clone of
//! the previous one; rows are shared between snapshots via `Arc` and only
//! cloned when a write touches them.

pub(crate) mod broadcast;
pub(crate) mod scheduler;

use crate::query::{Query, QuerySource};
use crate::types::{ObjectData, ObjectId, StoreConfig, Version};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use broadcast::CommitBroadcaster;
use scheduler::{AsyncJob, AsyncQueryScheduler};

/// All tables of one snapshot. Row maps are ordered so table scans are
/// deterministic.
pub(crate) type Tables = HashMap<String, BTreeMap<ObjectId, Arc<ObjectData>>>;

/// Identity of one open connection, used to skip self-delivery.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct ConnectionId(pub(crate) u64);

/// Identity of one submitted async query, per connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct AsyncTicket(pub(crate) u64);

/// Messages delivered to a connection's event queue.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    /// A commit happened somewhere; the receiver should advance to the
    /// latest version. Carries the version minted by the triggering commit
    /// for tracing; dispatch always targets the latest version at
    /// processing time.
    Wake { version: Version },

    /// A background query finished evaluating.
    QueryLoaded {
        ticket: AsyncTicket,
        version: Version,
        outcome: EvalOutcome,
    },
}

/// Result of evaluating a query at one version.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EvalOutcome {
    pub(crate) rows: Vec<ObjectId>,
    /// False when the query's source row (a child list's parent) no longer
    /// exists at the evaluated version.
    pub(crate) source_valid: bool,
}

impl EvalOutcome {
    fn invalid() -> Self {
        Self {
            rows: Vec::new(),
            source_valid: false,
        }
    }
}

struct VersionHistory {
    snapshots: BTreeMap<u64, Arc<Tables>>,
    latest: u64,
}

/// The versioned data of one store, shared by all its connections and by
/// async query workers.
pub(crate) struct CoreData {
    state: RwLock<VersionHistory>,
    /// Version -> count of connections pinned there. Snapshots below the
    /// lowest pin are pruned on commit.
    pins: Mutex<BTreeMap<u64, usize>>,
}

impl CoreData {
    fn new() -> Self {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(0, Arc::new(Tables::new()));
        Self {
            state: RwLock::new(VersionHistory {
                snapshots,
                latest: 0,
            }),
            pins: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn latest_version(&self) -> Version {
        Version(self.state.read().latest)
    }

    pub(crate) fn latest_snapshot(&self) -> (Version, Arc<Tables>) {
        let state = self.state.read();
        let tables = state
            .snapshots
            .get(&state.latest)
            .expect("latest snapshot must exist")
            .clone();
        (Version(state.latest), tables)
    }

    pub(crate) fn snapshot_at(&self, version: Version) -> Option<Arc<Tables>> {
        self.state.read().snapshots.get(&version.0).cloned()
    }

    /// Publish a new snapshot. Caller must hold the store's write mutex.
    pub(crate) fn publish(&self, tables: Tables) -> Version {
        let mut state = self.state.write();
        state.latest += 1;
        let version = Version(state.latest);
        state.snapshots.insert(version.0, Arc::new(tables));

        // Drop snapshots nothing is pinned to any more.
        let floor = {
            let pins = self.pins.lock();
            pins.keys().next().copied().unwrap_or(state.latest)
        };
        let floor = floor.min(state.latest);
        state.snapshots.retain(|v, _| *v >= floor);

        trace!(version = version.0, "published snapshot");
        version
    }

    pub(crate) fn pin(&self, version: Version) {
        *self.pins.lock().entry(version.0).or_insert(0) += 1;
    }

    /// Pin the latest version atomically with reading it, so a concurrent
    /// commit cannot prune the snapshot in between.
    pub(crate) fn pin_latest(&self) -> Version {
        let state = self.state.read();
        let version = Version(state.latest);
        self.pin(version);
        version
    }

    pub(crate) fn unpin(&self, version: Version) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&version.0) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&version.0);
            }
        }
    }

    pub(crate) fn repin(&self, old: Version, new: Version) {
        if old == new {
            return;
        }
        let mut pins = self.pins.lock();
        *pins.entry(new.0).or_insert(0) += 1;
        if let Some(count) = pins.get_mut(&old.0) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&old.0);
            }
        }
    }

    pub(crate) fn row_at(
        &self,
        table: &str,
        id: ObjectId,
        version: Version,
    ) -> Option<Arc<ObjectData>> {
        let tables = self.snapshot_at(version)?;
        tables.get(table)?.get(&id).cloned()
    }

    /// Resolve a row by id alone. Ids are unique across tables, so this is
    /// a scan over the (typically few) tables of the snapshot.
    pub(crate) fn object_at(
        &self,
        id: ObjectId,
        version: Version,
    ) -> Option<(String, Arc<ObjectData>)> {
        let tables = self.snapshot_at(version)?;
        object_in(&tables, id).map(|(table, data)| (table.to_string(), data.clone()))
    }

    pub(crate) fn evaluate(&self, query: &Query, version: Version) -> EvalOutcome {
        match self.snapshot_at(version) {
            Some(tables) => evaluate_in(&tables, query),
            None => {
                debug_assert!(false, "evaluated against a pruned version {version}");
                EvalOutcome::invalid()
            }
        }
    }
}

/// Resolve a row by id within one snapshot.
pub(crate) fn object_in(tables: &Tables, id: ObjectId) -> Option<(&str, &Arc<ObjectData>)> {
    for (name, rows) in tables {
        if let Some(data) = rows.get(&id) {
            return Some((name.as_str(), data));
        }
    }
    None
}

/// Evaluate a query against one snapshot (committed or working copy).
pub(crate) fn evaluate_in(tables: &Tables, query: &Query) -> EvalOutcome {
    let matches = |data: &ObjectData| match &query.predicate {
        Some(p) => p.matches(data),
        None => true,
    };

    match &query.source {
        QuerySource::Table(name) => {
            let rows = tables
                .get(name)
                .map(|rows| {
                    rows.iter()
                        .filter(|(_, data)| matches(data))
                        .map(|(id, _)| *id)
                        .collect()
                })
                .unwrap_or_default();
            EvalOutcome {
                rows,
                source_valid: true,
            }
        }
        QuerySource::ChildList {
            parent_table,
            parent,
            field,
        } => {
            let parent_row = tables.get(parent_table).and_then(|rows| rows.get(parent));
            let Some(parent_row) = parent_row else {
                return EvalOutcome::invalid();
            };
            let linked = parent_row
                .get(field)
                .and_then(|v| v.as_link_list())
                .unwrap_or(&[]);
            let rows = linked
                .iter()
                .filter(|id| matches!(object_in(tables, **id), Some((_, data)) if matches(data)))
                .copied()
                .collect();
            EvalOutcome {
                rows,
                source_valid: true,
            }
        }
    }
}

/// One store shared by every connection opened at the same path.
pub(crate) struct SharedStore {
    path: PathBuf,
    pub(crate) data: Arc<CoreData>,
    pub(crate) broadcaster: CommitBroadcaster,
    scheduler: AsyncQueryScheduler,
    /// Serializes writers across connections for the duration of a write
    /// transaction; the guard is held by the writing connection between
    /// `begin_write` and commit/cancel.
    write_mutex: Arc<Mutex<()>>,
    next_object_id: AtomicU64,
    next_connection_id: AtomicU64,
}

/// Open stores in this process, init-on-first-open / teardown-on-last-close.
static OPEN_STORES: Mutex<BTreeMap<PathBuf, Weak<SharedStore>>> = Mutex::new(BTreeMap::new());

impl SharedStore {
    /// Get or create the shared store for a path.
    pub(crate) fn open_at(config: &StoreConfig) -> Arc<SharedStore> {
        let mut stores = OPEN_STORES.lock();
        if let Some(existing) = stores.get(&config.path).and_then(Weak::upgrade) {
            return existing;
        }

        debug!(path = %config.path.display(), "opening store");
        let store = Arc::new(SharedStore {
            path: config.path.clone(),
            data: Arc::new(CoreData::new()),
            broadcaster: CommitBroadcaster::new(),
            scheduler: AsyncQueryScheduler::new(config.worker_threads.max(1)),
            write_mutex: Arc::new(Mutex::new(())),
            next_object_id: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
        });
        stores.insert(config.path.clone(), Arc::downgrade(&store));
        store
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn acquire_write(&self) -> ArcMutexGuard<RawMutex, ()> {
        self.write_mutex.lock_arc()
    }

    pub(crate) fn alloc_object_id(&self) -> ObjectId {
        ObjectId(self.next_object_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn alloc_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn submit_async(&self, job: AsyncJob) {
        self.scheduler.submit(job);
    }
}

impl Drop for SharedStore {
    fn drop(&mut self) {
        // Last connection closed; remove the dead map entry unless a new
        // store was already opened at the same path.
        let mut stores = OPEN_STORES.lock();
        if let Some(entry) = stores.get(&self.path) {
            if entry.strong_count() == 0 {
                stores.remove(&self.path);
                debug!(path = %self.path.display(), "store torn down");
            }
        }
    }
}
