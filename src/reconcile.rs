//! The reconciliation loop.
//!
//! Once a second it cross-checks every persisted IN_PROGRESS job against
//! the live task registry, relays status/progress deltas to the owner's
//! connections, and announces completion when the in-progress set drains.
//! Individual lookup failures are logged and skipped; only the external
//! stop signal ends the loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, Event, JobUpdate};
use crate::job::{JobStatus, JobStore};
use crate::worker::TaskRegistry;

/// Per-job state remembered between ticks, so only deltas go out. Keyed by
/// job id rather than a single "current job" slot: two jobs in progress at
/// once must not trigger a spurious completion when one of them finishes.
pub type SeenMap = HashMap<i64, (JobStatus, u8)>;

pub struct Reconciler {
    store: Arc<JobStore>,
    registry: Arc<TaskRegistry>,
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<TaskRegistry>,
        broadcaster: Arc<Broadcaster>,
        interval: Duration,
    ) -> Self {
        Reconciler {
            store,
            registry,
            broadcaster,
            interval,
        }
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut seen: SeenMap = HashMap::new();
        // owners of jobs observed in progress, cleared on each full drain
        let mut tracked_owners: HashMap<i64, i64> = HashMap::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&mut seen, &mut tracked_owners);
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("reconciler stopped");
    }

    /// One reconciliation pass. Never returns an error: anything that goes
    /// wrong for one job is logged and must not starve the others.
    pub fn tick(&self, seen: &mut SeenMap, tracked_owners: &mut HashMap<i64, i64>) {
        let in_progress = self.store.in_progress();
        let live: HashSet<i64> = in_progress.iter().map(|j| j.id).collect();
        let mut updates_by_owner: HashMap<i64, Vec<JobUpdate>> = HashMap::new();

        for job in &in_progress {
            tracked_owners.insert(job.id, job.user_id);
            let Some(task_id) = job.task_id.as_deref() else {
                // IN_PROGRESS without a task reference violates the store's
                // own invariant; log it loudly and move on
                warn!(job = job.id, "in-progress job has no task reference");
                continue;
            };
            let Some(state) = self.registry.get(task_id) else {
                // dispatched but the worker has not picked it up yet
                debug!(job = job.id, task = task_id, "no live task state yet");
                continue;
            };

            let key = (state.status, state.percent);
            if seen.get(&job.id) != Some(&key) {
                seen.insert(job.id, key);
                updates_by_owner
                    .entry(job.user_id)
                    .or_default()
                    .push(JobUpdate {
                        job_id: job.id,
                        status: state.status,
                        current: state.current,
                        total: state.total,
                        percent: state.percent,
                    });
            }
        }

        for (owner, updates) in updates_by_owner {
            self.broadcaster
                .broadcast_to_user(owner, Event::JobUpdates { updates });
        }

        if live.is_empty() {
            if !tracked_owners.is_empty() {
                // one completion per owner per drain, not one per job
                let owners: HashSet<i64> = tracked_owners.values().copied().collect();
                for owner in owners {
                    self.broadcaster
                        .broadcast_to_user(owner, Event::completion());
                }
                tracked_owners.clear();
            }
            seen.clear();
        } else {
            seen.retain(|id, _| live.contains(id));
        }
    }
}
