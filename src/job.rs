//! Durable job records and the forward-only status machine.
//!
//! The store keeps jobs in memory behind one mutex and mirrors every
//! mutation to a JSONL journal, one full snapshot per line; reload replays
//! the last line per id. Status changes go through a single
//! read-modify-write under the lock, so two components can never interleave
//! writes to the same job.

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Result, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Transitions run strictly forward; terminal states accept nothing.
    ///
    /// This governs live updates only. Journal replay in `JobStore::open`
    /// writes FAILED onto any non-terminal job directly: a restart destroys
    /// the queue and the workers, so PENDING and IN_PROGRESS alike have
    /// nothing left that could ever advance them.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Completed)
                | (JobStatus::InProgress, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One requested transfer and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub user_id: i64,
    pub source: String,
    pub dest: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Human-readable failure detail, set only on FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Worker task reference. Present exactly when the job has left PENDING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct StoreInner {
    jobs: HashMap<i64, Job>,
    next_id: i64,
    journal: Option<BufWriter<File>>,
}

/// The single source of truth for job state.
pub struct JobStore {
    inner: Mutex<StoreInner>,
    journal_path: Option<PathBuf>,
}

impl JobStore {
    /// In-memory store with no journal. Used by tests and one-shot runs.
    pub fn in_memory() -> Self {
        JobStore {
            inner: Mutex::new(StoreInner {
                jobs: HashMap::new(),
                next_id: 1,
                journal: None,
            }),
            journal_path: None,
        }
    }

    /// Open a journal-backed store, replaying any existing journal.
    ///
    /// Jobs that were still PENDING or IN_PROGRESS when the previous
    /// process died have no queue slot and no live worker anymore; they are
    /// replayed as FAILED so listings never show a phantom transfer. This
    /// write is deliberately outside `can_transition_to`, see there.
    pub fn open(journal: &Path) -> anyhow::Result<Self> {
        let mut jobs: HashMap<i64, Job> = HashMap::new();
        if journal.exists() {
            let file = File::open(journal)
                .with_context(|| format!("open journal {}", journal.display()))?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Job>(&line) {
                    Ok(job) => {
                        jobs.insert(job.id, job);
                    }
                    Err(e) => warn!(error = %e, "skipping corrupt journal line"),
                }
            }
        } else if let Some(parent) = journal.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let mut interrupted = Vec::new();
        for job in jobs.values_mut() {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error = Some("interrupted by daemon restart".into());
                job.updated_at = Utc::now();
                interrupted.push(job.clone());
            }
        }

        let next_id = jobs.keys().max().copied().unwrap_or(0) + 1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal)
            .with_context(|| format!("append journal {}", journal.display()))?;
        let mut writer = BufWriter::new(file);
        for job in &interrupted {
            serde_json::to_writer(&mut writer, job)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        Ok(JobStore {
            inner: Mutex::new(StoreInner {
                jobs,
                next_id,
                journal: Some(writer),
            }),
            journal_path: Some(journal.to_path_buf()),
        })
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    fn record(inner: &mut StoreInner, job: &Job) {
        inner.jobs.insert(job.id, job.clone());
        if let Some(writer) = inner.journal.as_mut() {
            let append = serde_json::to_writer(&mut *writer, job)
                .map_err(std::io::Error::other)
                .and_then(|_| writer.write_all(b"\n"))
                .and_then(|_| writer.flush());
            if let Err(e) = append {
                warn!(job = job.id, error = %e, "journal append failed");
            }
        }
    }

    pub fn create(
        &self,
        user_id: i64,
        source: &str,
        dest: &str,
        description: Option<String>,
    ) -> Job {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let job = Job {
            id: inner.next_id,
            user_id,
            source: source.to_string(),
            dest: dest.to_string(),
            status: JobStatus::Pending,
            description,
            error: None,
            task_id: None,
            created_at: now,
            updated_at: now,
        };
        inner.next_id += 1;
        Self::record(&mut inner, &job);
        job
    }

    pub fn get(&self, id: i64) -> Option<Job> {
        self.inner.lock().jobs.get(&id).cloned()
    }

    /// All jobs owned by a user, newest first.
    pub fn list_for_user(&self, user_id: i64) -> Vec<Job> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs
    }

    pub fn in_progress(&self) -> Vec<Job> {
        let inner = self.inner.lock();
        inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::InProgress)
            .cloned()
            .collect()
    }

    /// Atomically attach the worker task reference, move PENDING ->
    /// IN_PROGRESS, and hand the job off through `enqueue`, all under the
    /// store lock. A worker picking the assignment up can only touch the
    /// job through this same lock, so it always observes IN_PROGRESS --
    /// even one that fails before the dispatcher's call returns. `enqueue`
    /// returning false leaves the job PENDING with no task reference.
    pub fn dispatch(
        &self,
        id: i64,
        task_id: &str,
        enqueue: impl FnOnce(&Job) -> bool,
    ) -> Result<Job> {
        let mut inner = self.inner.lock();
        let mut job = inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or(TransferError::JobNotFound(id))?;
        if !job.status.can_transition_to(JobStatus::InProgress) {
            return Err(TransferError::Transition {
                from: job.status,
                to: JobStatus::InProgress,
            });
        }
        job.status = JobStatus::InProgress;
        job.task_id = Some(task_id.to_string());
        job.updated_at = Utc::now();
        if !enqueue(&job) {
            return Err(TransferError::Dispatch(id));
        }
        Self::record(&mut inner, &job);
        Ok(job)
    }

    /// `dispatch` without a queue: the transition alone.
    pub fn mark_dispatched(&self, id: i64, task_id: &str) -> Result<Job> {
        self.dispatch(id, task_id, |_| true)
    }

    /// Move a job to a new status, rejecting anything that is not strictly
    /// forward. Error detail is recorded only for FAILED.
    pub fn update_status(&self, id: i64, status: JobStatus, error: Option<String>) -> Result<Job> {
        let mut inner = self.inner.lock();
        let mut job = inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or(TransferError::JobNotFound(id))?;
        if !job.status.can_transition_to(status) {
            return Err(TransferError::Transition {
                from: job.status,
                to: status,
            });
        }
        job.status = status;
        job.error = if status == JobStatus::Failed { error } else { None };
        job.updated_at = Utc::now();
        Self::record(&mut inner, &job);
        Ok(job)
    }
}
