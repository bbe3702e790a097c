//! Notification dispatch.
//!
//! One dispatch pass delivers the consequences of one version advance (or
//! one async completion) to a connection's listeners. Passes always run
//! on the connection's owning thread.
//!
//! Ordering rules per pass: store-level listeners first, in registration
//! order; then each registered entity, in registration order, with its
//! listeners in registration order. An entity fires iff its observable
//! value changed between the connection's previous and new version, or it
//! transitioned to invalid; invalidation fires exactly once, after which
//! the entity leaves the registry. Queued wakes that arrive after the
//! connection already caught up (coalesced commits, or a refresh) are
//! no-ops.

use crate::connection::{ConnInner, PendingTarget};
use crate::engine::{AsyncTicket, EngineEvent, EvalOutcome};
use crate::live::registry::Entity;
use crate::live::{ObjectCore, ResultsCore};
use crate::types::Version;
use crate::version::VersionState;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

impl ConnInner {
    pub(crate) fn process_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Wake { version } => {
                // Dispatch targets the latest version at processing time;
                // wakes for versions already observed coalesce to no-ops.
                let latest = self.store.data.latest_version();
                trace!(
                    conn = self.id.0,
                    wake = version.0,
                    latest = latest.0,
                    "processing wake"
                );
                self.dispatch_advance(latest);
            }
            EngineEvent::QueryLoaded {
                ticket,
                version,
                outcome,
            } => self.deliver_async(ticket, version, outcome),
        }
    }

    /// Run one dispatch pass advancing the connection from its current
    /// version to `new`. No-op advances are skipped entirely.
    pub(crate) fn dispatch_advance(&self, new: Version) {
        let old = self.version.current();
        if VersionState::is_noop(old, new) {
            trace!(conn = self.id.0, version = new.0, "no-op advance");
            return;
        }
        self.version.advance_to(new);
        self.store.data.repin(old, new);
        debug!(conn = self.id.0, old = old.0, new = new.0, "dispatch pass");

        // Snapshot before any listener runs: entities registered by a
        // callback during this pass wait for the next one.
        let entities = self.registry.snapshot();
        let was_dispatching = self.in_dispatch.replace(true);

        self.store_listeners.notify_all();
        for entity in entities {
            if self.closed.get() {
                break;
            }
            match entity {
                Entity::Object(core) => self.advance_object(&core, new),
                Entity::Results(core) => self.advance_results(&core, new),
            }
        }

        self.in_dispatch.set(was_dispatching);
    }

    fn advance_object(&self, core: &Rc<ObjectCore>, new: Version) {
        let mut state = core.state.borrow_mut();
        if state.last_version == new {
            // Already notified at this version (baselined mid-pass).
            return;
        }
        if !state.loaded {
            // Pending async find-first: nothing observable until delivery.
            state.last_version = new;
            return;
        }
        if !state.valid {
            return;
        }
        let Some((table, id)) = state.ident.clone() else {
            state.last_version = new;
            return;
        };

        match self.store.data.row_at(&table, id, new) {
            None => {
                state.valid = false;
                state.cached = None;
                state.last_version = new;
                drop(state);
                trace!(conn = self.id.0, id = id.0, "object invalidated");
                core.listeners.notify_all();
                self.registry.unregister_object(core);
            }
            Some(row) => {
                let changed = match &state.cached {
                    Some(cached) => !Arc::ptr_eq(cached, &row) && **cached != *row,
                    None => true,
                };
                state.cached = Some(row);
                state.last_version = new;
                drop(state);
                if changed {
                    core.listeners.notify_all();
                }
            }
        }
    }

    fn advance_results(&self, core: &Rc<ResultsCore>, new: Version) {
        let mut state = core.state.borrow_mut();
        if state.last_version == new {
            return;
        }
        if !state.loaded {
            state.last_version = new;
            return;
        }
        if !state.valid {
            return;
        }

        let outcome = self.store.data.evaluate(&core.query, new);
        if !outcome.source_valid {
            state.valid = false;
            state.rows.clear();
            state.last_version = new;
            drop(state);
            trace!(conn = self.id.0, "results invalidated");
            core.listeners.notify_all();
            self.registry.unregister_results(core);
        } else {
            let changed = state.rows != outcome.rows;
            state.rows = outcome.rows;
            state.last_version = new;
            drop(state);
            if changed {
                core.listeners.notify_all();
            }
        }
    }

    /// Materialize a completed async query on the owning thread and fire
    /// its listeners once as a loaded event. Store-level listeners do not
    /// fire: completion is not a version advance.
    fn deliver_async(&self, ticket: AsyncTicket, version: Version, outcome: EvalOutcome) {
        let Some(target) = self.pending_async.borrow_mut().remove(&ticket) else {
            trace!(conn = self.id.0, ticket = ticket.0, "async delivery superseded");
            return;
        };
        let current = self.version.current();

        match target {
            PendingTarget::Results(weak) => {
                let Some(core) = weak.upgrade() else {
                    trace!(conn = self.id.0, ticket = ticket.0, "async handle dropped");
                    return;
                };
                // Keep delivery consistent with the pinned snapshot: the
                // worker may have evaluated a newer version whose wake has
                // not been processed yet.
                let outcome = if version == current {
                    outcome
                } else {
                    self.store.data.evaluate(&core.query, current)
                };
                {
                    let mut state = core.state.borrow_mut();
                    state.loaded = true;
                    state.valid = outcome.source_valid;
                    state.rows = outcome.rows;
                    state.last_version = current;
                }
                trace!(conn = self.id.0, ticket = ticket.0, "async results loaded");
                let was_dispatching = self.in_dispatch.replace(true);
                core.listeners.notify_all();
                self.in_dispatch.set(was_dispatching);
                if !core.state.borrow().valid {
                    self.registry.unregister_results(&core);
                }
            }
            PendingTarget::Object(weak) => {
                let Some(core) = weak.upgrade() else {
                    trace!(conn = self.id.0, ticket = ticket.0, "async handle dropped");
                    return;
                };
                let outcome = if version == current {
                    outcome
                } else {
                    match &core.query {
                        Some(query) => self.store.data.evaluate(query, current),
                        None => outcome,
                    }
                };
                let resolved = outcome.rows.first().and_then(|id| {
                    self.store
                        .data
                        .object_at(*id, current)
                        .map(|(table, data)| (table, *id, data))
                });
                {
                    let mut state = core.state.borrow_mut();
                    state.loaded = true;
                    state.last_version = current;
                    match resolved {
                        Some((table, id, data)) => {
                            state.ident = Some((table, id));
                            state.valid = true;
                            state.cached = Some(data);
                        }
                        None => {
                            state.valid = false;
                            state.cached = None;
                        }
                    }
                }
                trace!(conn = self.id.0, ticket = ticket.0, "async object loaded");
                let was_dispatching = self.in_dispatch.replace(true);
                core.listeners.notify_all();
                self.in_dispatch.set(was_dispatching);
                if !core.state.borrow().valid {
                    self.registry.unregister_object(&core);
                }
            }
        }
    }
}
