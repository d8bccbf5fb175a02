//! The asynchronous transfer worker.
//!
//! One worker drains the assignment queue and runs each strategy to
//! completion on the blocking pool (ssh2 I/O is synchronous). Progress
//! samples land in the shared `TaskRegistry` for the reconciler to poll and
//! are pushed straight to the owner's connections as `transfer_progress`
//! events. Strategy failures become the job's FAILED state; they never take
//! the worker loop down.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broadcast::{Broadcaster, Event};
use crate::error::Result;
use crate::job::{JobStatus, JobStore};
use crate::progress::{ProgressSample, ProgressSink};
use crate::ssh::EndpointFactory;
use crate::strategy::{StrategyKind, TransferOutcome};

/// Everything the worker needs to run one accepted job.
#[derive(Debug, Clone)]
pub struct JobAssignment {
    pub job_id: i64,
    pub user_id: i64,
    pub task_id: String,
    pub source_path: String,
    pub dest_path: String,
    pub strategy: StrategyKind,
}

/// Live view of one worker task, keyed by task id. This is what the
/// reconciler cross-checks persisted jobs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    pub job_id: i64,
    pub user_id: i64,
    pub status: JobStatus,
    pub current: u64,
    pub total: u64,
    pub percent: u8,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskState>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task_id: &str, state: TaskState) {
        self.tasks.write().insert(task_id.to_string(), state);
    }

    pub fn get(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.read().get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &str) {
        self.tasks.write().remove(task_id);
    }

    fn update_progress(&self, task_id: &str, sample: &ProgressSample) {
        if let Some(state) = self.tasks.write().get_mut(task_id) {
            state.current = sample.bytes_transferred;
            state.total = sample.total_bytes;
            state.percent = sample.percent;
        }
    }
}

/// Per-job sink: mirrors every sample into the registry and pushes a
/// throttled `transfer_progress` stream to the owner. The terminal sample
/// always goes out regardless of the throttle.
struct WorkerSink {
    task_id: String,
    user_id: i64,
    registry: Arc<TaskRegistry>,
    broadcaster: Arc<Broadcaster>,
    min_interval: Duration,
    last_push: Mutex<Option<Instant>>,
}

impl WorkerSink {
    fn should_push(&self, sample: &ProgressSample) -> bool {
        let mut last = self.last_push.lock();
        if sample.is_final() || last.map_or(true, |t| t.elapsed() >= self.min_interval) {
            *last = Some(Instant::now());
            return true;
        }
        false
    }
}

impl ProgressSink for WorkerSink {
    fn sample(&self, sample: &ProgressSample, current_file: &str) {
        self.registry.update_progress(&self.task_id, sample);
        if self.should_push(sample) {
            self.broadcaster.broadcast_to_user(
                self.user_id,
                Event::TransferProgress {
                    progress: sample.percent as i64,
                    current_file: Some(current_file.to_string()),
                    bytes_transferred: Some(sample.bytes_transferred),
                    total_bytes: Some(sample.total_bytes),
                    estimated_time_remaining: Some(sample.eta_seconds),
                    error: None,
                },
            );
        }
    }
}

pub struct Worker {
    store: Arc<JobStore>,
    registry: Arc<TaskRegistry>,
    broadcaster: Arc<Broadcaster>,
    connector: Arc<dyn EndpointFactory>,
    source_name: String,
    dest_name: String,
    chunk_size: usize,
    progress_interval: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<TaskRegistry>,
        broadcaster: Arc<Broadcaster>,
        connector: Arc<dyn EndpointFactory>,
        source_name: &str,
        dest_name: &str,
        chunk_size: usize,
        progress_interval: Duration,
    ) -> Self {
        Worker {
            store,
            registry,
            broadcaster,
            connector,
            source_name: source_name.to_string(),
            dest_name: dest_name.to_string(),
            chunk_size,
            progress_interval,
        }
    }

    /// Drain the queue until every sender is gone. Each assignment occupies
    /// this worker for its whole lifetime; queued jobs wait their turn.
    pub async fn run(self, mut queue: mpsc::Receiver<JobAssignment>) {
        while let Some(assignment) = queue.recv().await {
            self.process(assignment).await;
        }
        info!("worker queue closed, worker exiting");
    }

    async fn process(&self, assignment: JobAssignment) {
        let job_id = assignment.job_id;
        let user_id = assignment.user_id;
        let task_id = assignment.task_id.clone();
        info!(
            job = job_id,
            task = %task_id,
            strategy = ?assignment.strategy,
            source = %assignment.source_path,
            dest = %assignment.dest_path,
            "transfer starting"
        );

        self.registry.insert(
            &task_id,
            TaskState {
                job_id,
                user_id,
                status: JobStatus::InProgress,
                current: 0,
                total: 0,
                percent: 0,
            },
        );

        let sink = Arc::new(WorkerSink {
            task_id: task_id.clone(),
            user_id,
            registry: Arc::clone(&self.registry),
            broadcaster: Arc::clone(&self.broadcaster),
            min_interval: self.progress_interval,
            last_push: Mutex::new(None),
        });

        let connector = Arc::clone(&self.connector);
        let source_name = self.source_name.clone();
        let dest_name = self.dest_name.clone();
        let chunk_size = self.chunk_size;
        let blocking_sink = Arc::clone(&sink);
        let JobAssignment {
            source_path,
            dest_path,
            strategy,
            ..
        } = assignment;

        let handle = tokio::task::spawn_blocking(move || -> Result<TransferOutcome> {
            let mut source = connector.connect(&source_name)?;
            let mut dest = connector.connect(&dest_name)?;
            let strategy = strategy.build(chunk_size);
            strategy.run(
                source.as_mut(),
                dest.as_mut(),
                &source_path,
                &dest_path,
                blocking_sink.as_ref(),
            )
        });

        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                // a panicking strategy still must not take the loop down
                error!(job = job_id, error = %join_err, "transfer task panicked");
                Err(crate::error::TransferError::Io(std::io::Error::other(
                    join_err.to_string(),
                )))
            }
        };

        match result {
            Ok(outcome) => {
                if let Err(e) = self.store.update_status(job_id, JobStatus::Completed, None) {
                    warn!(job = job_id, error = %e, "could not persist completion");
                }
                info!(
                    job = job_id,
                    files = outcome.files,
                    bytes = outcome.bytes_transferred,
                    "transfer completed"
                );
                self.broadcaster.broadcast_to_user(
                    user_id,
                    Event::TransferProgress {
                        progress: 100,
                        current_file: Some("Complete".into()),
                        bytes_transferred: Some(outcome.total_bytes),
                        total_bytes: Some(outcome.total_bytes),
                        estimated_time_remaining: Some(0),
                        error: None,
                    },
                );
            }
            Err(e) => {
                let detail = e.to_string();
                if let Err(e) = self
                    .store
                    .update_status(job_id, JobStatus::Failed, Some(detail.clone()))
                {
                    warn!(job = job_id, error = %e, "could not persist failure");
                }
                error!(job = job_id, error = %detail, "transfer failed");
                self.broadcaster.broadcast_to_user(
                    user_id,
                    Event::TransferProgress {
                        progress: -1,
                        current_file: None,
                        bytes_transferred: None,
                        total_bytes: None,
                        estimated_time_remaining: None,
                        error: Some(detail),
                    },
                );
            }
        }

        // reconciler only queries tasks for IN_PROGRESS jobs, so the entry
        // can go as soon as the terminal status is persisted
        self.registry.remove(&task_id);
    }
}
