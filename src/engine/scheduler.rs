//! Background evaluation of async queries.

use super::{evaluate_in, AsyncTicket, CoreData, EngineEvent};
use crate::query::Query;
use crossbeam_channel::{unbounded, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::trace;

/// One async query to evaluate off-thread.
///
/// The job carries everything a worker needs; workers hold no reference
/// to the store itself, so an idle pool never keeps a store alive.
pub(crate) struct AsyncJob {
    pub(crate) query: Query,
    pub(crate) ticket: AsyncTicket,
    pub(crate) reply: Sender<EngineEvent>,
    pub(crate) data: Arc<CoreData>,
}

/// Worker pool evaluating queries against read-only snapshots and posting
/// completions onto the owning connection's event queue. Workers never
/// touch connection state.
pub(crate) struct AsyncQueryScheduler {
    jobs: Option<Sender<AsyncJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncQueryScheduler {
    pub(crate) fn new(worker_threads: usize) -> Self {
        let (jobs, job_rx) = unbounded::<AsyncJob>();
        let workers = (0..worker_threads)
            .map(|i| {
                let rx = job_rx.clone();
                std::thread::Builder::new()
                    .name(format!("ripple-query-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            // Evaluation targets the latest version at
                            // execution time, not the submitted one.
                            let (version, tables) = job.data.latest_snapshot();
                            let outcome = evaluate_in(&tables, &job.query);
                            trace!(
                                ticket = job.ticket.0,
                                version = version.0,
                                rows = outcome.rows.len(),
                                "async query evaluated"
                            );
                            if job
                                .reply
                                .send(EngineEvent::QueryLoaded {
                                    ticket: job.ticket,
                                    version,
                                    outcome,
                                })
                                .is_err()
                            {
                                // Connection closed before delivery; the
                                // result is superseded and dropped.
                                trace!(ticket = job.ticket.0, "async result dropped");
                            }
                        }
                    })
                    .expect("failed to spawn query worker")
            })
            .collect();

        Self {
            jobs: Some(jobs),
            workers,
        }
    }

    pub(crate) fn submit(&self, job: AsyncJob) {
        if let Some(jobs) = &self.jobs {
            // Send can only fail during teardown, after the last
            // connection closed; nothing is left to notify.
            let _ = jobs.send(job);
        }
    }
}

impl Drop for AsyncQueryScheduler {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectData, ObjectId};
    use crossbeam_channel::unbounded;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn core_with_dog() -> Arc<CoreData> {
        let core = Arc::new(CoreData::new());
        let (_, base) = core.latest_snapshot();
        let mut working = (*base).clone();
        let mut rows = BTreeMap::new();
        rows.insert(ObjectId(1), Arc::new(ObjectData::default()));
        working.insert("Dog".to_string(), rows);
        core.publish(working);
        core
    }

    #[test]
    fn test_completion_is_delivered() {
        let core = core_with_dog();
        let scheduler = AsyncQueryScheduler::new(1);
        let (reply, events) = unbounded();

        scheduler.submit(AsyncJob {
            query: Query::table("Dog"),
            ticket: AsyncTicket(7),
            reply,
            data: core,
        });

        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            EngineEvent::QueryLoaded {
                ticket,
                version,
                outcome,
            } => {
                assert_eq!(ticket, AsyncTicket(7));
                assert_eq!(version.0, 1);
                assert_eq!(outcome.rows, vec![ObjectId(1)]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_closed_receiver_is_silent() {
        let core = core_with_dog();
        let scheduler = AsyncQueryScheduler::new(1);
        let (reply, events) = unbounded();
        drop(events);

        scheduler.submit(AsyncJob {
            query: Query::table("Dog"),
            ticket: AsyncTicket(1),
            reply,
            data: core,
        });
        // Shutdown joins the worker; the failed send must not panic.
        drop(scheduler);
    }
}
