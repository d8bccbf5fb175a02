//! Accepts transfer requests and hands accepted jobs to the worker queue.

use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, TransferError};
use crate::job::{Job, JobStore};
use crate::strategy::StrategyKind;
use crate::worker::JobAssignment;

/// An incoming request. Lives only long enough to create the job.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub source: String,
    pub dest: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub struct Dispatcher {
    store: Arc<JobStore>,
    queue: mpsc::Sender<JobAssignment>,
    strategy: StrategyKind,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        queue: mpsc::Sender<JobAssignment>,
        strategy: StrategyKind,
    ) -> Self {
        Dispatcher {
            store,
            queue,
            strategy,
        }
    }

    fn validate(request: &TransferRequest) -> Result<()> {
        if request.source.trim().is_empty() {
            return Err(TransferError::Validation {
                field: "source",
                reason: "source storage is required".into(),
            });
        }
        if request.dest.trim().is_empty() {
            return Err(TransferError::Validation {
                field: "dest",
                reason: "destination storage is required".into(),
            });
        }
        if request.source == request.dest {
            return Err(TransferError::Validation {
                field: "dest",
                reason: "source and destination storages cannot be the same".into(),
            });
        }
        Ok(())
    }

    /// Validate, persist a PENDING job, and enqueue it. Enqueue and the
    /// move to IN_PROGRESS happen as one store-coordinated step, so a
    /// worker that picks the assignment up (and possibly fails) before this
    /// returns still finds the job dispatched. A full or closed queue
    /// leaves the job PENDING with no task reference and surfaces a
    /// dispatch error.
    pub fn submit(&self, request: TransferRequest, user_id: i64) -> Result<Job> {
        Self::validate(&request)?;

        let job = self
            .store
            .create(user_id, &request.source, &request.dest, request.description);
        let task_id = Uuid::new_v4().to_string();
        let assignment = JobAssignment {
            job_id: job.id,
            user_id,
            task_id: task_id.clone(),
            source_path: request.source,
            dest_path: request.dest,
            strategy: self.strategy,
        };

        let mut send_error = None;
        let dispatched = self.store.dispatch(job.id, &task_id, |_| {
            match self.queue.try_send(assignment) {
                Ok(()) => true,
                Err(e) => {
                    send_error = Some(e.to_string());
                    false
                }
            }
        });
        match dispatched {
            Ok(job) => {
                info!(job = job.id, task = %task_id, strategy = ?self.strategy, "job dispatched");
                Ok(job)
            }
            Err(e) => {
                if let Some(detail) = send_error {
                    warn!(job = job.id, detail = %detail, "worker queue rejected job");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    fn request(source: &str, dest: &str) -> TransferRequest {
        TransferRequest {
            source: source.into(),
            dest: dest.into(),
            description: None,
        }
    }

    fn dispatcher(depth: usize) -> (Dispatcher, mpsc::Receiver<JobAssignment>, Arc<JobStore>) {
        let store = Arc::new(JobStore::in_memory());
        let (tx, rx) = mpsc::channel(depth);
        (
            Dispatcher::new(Arc::clone(&store), tx, StrategyKind::ArchiveCopy),
            rx,
            store,
        )
    }

    #[test]
    fn rejects_equal_source_and_dest_without_creating_a_job() {
        let (d, _rx, store) = dispatcher(1);
        let err = d.submit(request("/a", "/a"), 7).unwrap_err();
        match err {
            TransferError::Validation { field, .. } => assert_eq!(field, "dest"),
            other => panic!("expected validation error, got {other}"),
        }
        assert!(store.list_for_user(7).is_empty());
    }

    #[test]
    fn rejects_empty_fields_naming_the_field() {
        let (d, _rx, store) = dispatcher(1);
        match d.submit(request("", "/b"), 7).unwrap_err() {
            TransferError::Validation { field, .. } => assert_eq!(field, "source"),
            other => panic!("expected validation error, got {other}"),
        }
        match d.submit(request("/a", "  "), 7).unwrap_err() {
            TransferError::Validation { field, .. } => assert_eq!(field, "dest"),
            other => panic!("expected validation error, got {other}"),
        }
        assert!(store.list_for_user(7).is_empty());
    }

    #[test]
    fn accepted_job_is_in_progress_with_a_task_reference() {
        let (d, mut rx, store) = dispatcher(1);
        let job = d.submit(request("/a", "/b"), 7).unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        let task_id = job.task_id.clone().expect("dispatched job has a task id");

        let assignment = rx.try_recv().unwrap();
        assert_eq!(assignment.job_id, job.id);
        assert_eq!(assignment.task_id, task_id);
        assert_eq!(assignment.strategy, StrategyKind::ArchiveCopy);
        assert_eq!(store.get(job.id).unwrap().status, JobStatus::InProgress);
    }

    #[test]
    fn fast_failing_worker_cannot_wedge_a_job_in_progress() {
        let (d, mut rx, store) = dispatcher(1);

        // drains the queue as fast as it can and fails the job on the
        // spot, like a worker hitting an immediate connection error
        let racer_store = Arc::clone(&store);
        let racer = std::thread::spawn(move || loop {
            match rx.try_recv() {
                Ok(assignment) => {
                    racer_store
                        .update_status(
                            assignment.job_id,
                            JobStatus::Failed,
                            Some("connection refused".into()),
                        )
                        .unwrap();
                    break;
                }
                Err(_) => std::thread::yield_now(),
            }
        });

        let job = d.submit(request("/a", "/b"), 7).unwrap();
        racer.join().unwrap();

        // the terminal report must stick, never leaving the job wedged
        // IN_PROGRESS with no live task
        let job = store.get(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn full_queue_leaves_job_pending_without_task_reference() {
        let (d, _rx, store) = dispatcher(1);
        d.submit(request("/a", "/b"), 7).unwrap();
        // queue depth is 1 and nothing drains it
        let err = d.submit(request("/c", "/d"), 7).unwrap_err();
        let rejected_id = match err {
            TransferError::Dispatch(id) => id,
            other => panic!("expected dispatch error, got {other}"),
        };
        let job = store.get(rejected_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.task_id.is_none());
    }
}
