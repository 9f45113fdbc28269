//! Background delivery job table.
//!
//! # Responsibilities
//! - Record every submitted delivery with its status and final outcome
//! - Let a job wait for the jobs it was ordered after
//! - Cancel and forget jobs on request, purge finished ones past retention
//!
//! # Design Decisions
//! - A job is done once it reaches any terminal status; dependents start
//!   regardless of whether their predecessors succeeded
//! - Removing a job wakes its dependents the same way finishing does
//! - Terminal records are never overwritten, so a late task result cannot
//!   undo a cancellation

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::JobError;
use crate::http::RequestSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for the jobs listed in `after`.
    Waiting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// What the admin API reports for one job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: Uuid,
    pub method: String,
    pub url: String,
    pub target_key: String,
    pub status: JobStatus,
    pub after: Vec<Uuid>,
    /// Status code of the last response, successful or not.
    pub response_status: Option<u16>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: Uuid, request: &RequestSpec, after: Vec<Uuid>) -> Self {
        Self {
            id,
            method: request.method.to_string(),
            url: request.url.to_string(),
            target_key: request.target_key(),
            status: if after.is_empty() {
                JobStatus::Running
            } else {
                JobStatus::Waiting
            },
            after,
            response_status: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

struct JobEntry {
    record: JobRecord,
    done: watch::Sender<bool>,
    abort: Option<AbortHandle>,
}

impl JobEntry {
    fn finish(&mut self, status: JobStatus, response_status: Option<u16>, error: Option<String>) -> bool {
        if self.record.status.is_terminal() {
            return false;
        }
        self.record.status = status;
        self.record.response_status = response_status.or(self.record.response_status);
        self.record.error = error;
        self.record.finished_at = Some(Utc::now());
        self.done.send_replace(true);
        true
    }

    fn cancel(&mut self, reason: &str) -> bool {
        let cancelled = self.finish(JobStatus::Cancelled, None, Some(reason.to_string()));
        if cancelled {
            if let Some(abort) = self.abort.take() {
                abort.abort();
            }
        }
        cancelled
    }
}

/// Job id → state, shared by the retry manager and the admin API.
#[derive(Default)]
pub struct JobTable {
    jobs: DashMap<Uuid, JobEntry>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completion signals for `after`, failing on the first id not in the table.
    pub(crate) fn dependencies(&self, after: &[Uuid]) -> Result<Vec<watch::Receiver<bool>>, JobError> {
        after
            .iter()
            .map(|id| {
                self.jobs
                    .get(id)
                    .map(|entry| entry.done.subscribe())
                    .ok_or(JobError::UnknownDependency(*id))
            })
            .collect()
    }

    pub(crate) fn insert(&self, record: JobRecord) {
        let (done, _) = watch::channel(false);
        self.jobs.insert(
            record.id,
            JobEntry {
                record,
                done,
                abort: None,
            },
        );
    }

    pub(crate) fn set_abort(&self, id: Uuid, abort: AbortHandle) {
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            if entry.record.status.is_terminal() {
                abort.abort();
            } else {
                entry.abort = Some(abort);
            }
        }
    }

    pub(crate) fn mark_running(&self, id: Uuid) {
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            if entry.record.status == JobStatus::Waiting {
                entry.record.status = JobStatus::Running;
            }
        }
    }

    /// Record the outcome. `false` if the job is gone or already terminal.
    pub(crate) fn finish(&self, id: Uuid, status: JobStatus, response_status: Option<u16>, error: Option<String>) -> bool {
        self.jobs
            .get_mut(&id)
            .map(|mut entry| entry.finish(status, response_status, error))
            .unwrap_or(false)
    }

    pub fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.get(&id).map(|entry| entry.record.clone())
    }

    /// Every known job, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|entry| entry.record.clone()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.jobs.iter().filter(|entry| !entry.record.status.is_terminal()).count()
    }

    /// Cancel `id` if it is still active, then drop its record.
    pub fn remove(&self, id: Uuid) -> Result<JobRecord, JobError> {
        let (_, mut entry) = self.jobs.remove(&id).ok_or(JobError::NotFound(id))?;
        entry.cancel("deleted");
        Ok(entry.record)
    }

    /// Cancel every active job. Returns the ids that were cancelled.
    pub fn cancel_all(&self, reason: &str) -> Vec<Uuid> {
        self.jobs
            .iter_mut()
            .filter_map(|mut entry| entry.cancel(reason).then_some(entry.record.id))
            .collect()
    }

    /// Forget terminal jobs that finished before `cutoff`.
    pub fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| !entry.record.finished_at.is_some_and(|at| at < cutoff));
        before - self.jobs.len()
    }

    /// Wait until `id` finishes. `None` if it is unknown or was removed meanwhile.
    pub async fn wait(&self, id: Uuid) -> Option<JobRecord> {
        let mut done = self.jobs.get(&id)?.done.subscribe();
        done.wait_for(|finished| *finished).await.ok()?;
        self.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn record(after: Vec<Uuid>) -> JobRecord {
        let request = RequestSpec::get("http://billing.internal/invoices").unwrap();
        JobRecord::new(Uuid::new_v4(), &request, after)
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let table = JobTable::new();
        let first = record(vec![]);
        let id = first.id;
        table.insert(first);

        assert_eq!(table.dependencies(&[id]).unwrap().len(), 1);
        let missing = Uuid::new_v4();
        assert_eq!(
            table.dependencies(&[id, missing]).unwrap_err(),
            JobError::UnknownDependency(missing)
        );
    }

    #[test]
    fn test_terminal_status_is_final() {
        let table = JobTable::new();
        let job = record(vec![]);
        let id = job.id;
        table.insert(job);

        assert_eq!(table.cancel_all("shutdown"), vec![id]);
        assert!(!table.finish(id, JobStatus::Succeeded, Some(200), None));

        let stored = table.get(id).unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.error.as_deref(), Some("shutdown"));
        assert!(table.cancel_all("again").is_empty());
    }

    #[tokio::test]
    async fn test_dependents_wake_on_finish_and_on_remove() {
        let table = JobTable::new();
        let (a, b) = (record(vec![]), record(vec![]));
        let (a_id, b_id) = (a.id, b.id);
        table.insert(a);
        table.insert(b);

        let mut waits = table.dependencies(&[a_id, b_id]).unwrap();
        assert!(!*waits[0].borrow());

        table.finish(a_id, JobStatus::Failed, Some(500), Some("HTTP 500".into()));
        waits[0].wait_for(|done| *done).await.unwrap();

        let removed = table.remove(b_id).unwrap();
        assert_eq!(removed.status, JobStatus::Cancelled);
        waits[1].wait_for(|done| *done).await.unwrap();
        assert!(table.wait(b_id).await.is_none());
        assert_eq!(table.remove(b_id), Err(JobError::NotFound(b_id)));
    }

    #[test]
    fn test_purge_keeps_active_and_recent_jobs() {
        let table = JobTable::new();
        let (done, active) = (record(vec![]), record(vec![]));
        let (done_id, active_id) = (done.id, active.id);
        table.insert(done);
        table.insert(active);
        table.finish(done_id, JobStatus::Succeeded, Some(200), None);

        assert_eq!(table.purge_finished_before(Utc::now() - ChronoDuration::hours(1)), 0);
        assert_eq!(table.purge_finished_before(Utc::now() + ChronoDuration::seconds(1)), 1);
        assert!(table.get(done_id).is_none());
        assert_eq!(table.get(active_id).unwrap().status, JobStatus::Running);
        assert_eq!(table.active_count(), 1);
    }

    #[test]
    fn test_waiting_status_until_started() {
        let table = JobTable::new();
        let first = record(vec![]);
        let second = record(vec![first.id]);
        let second_id = second.id;
        table.insert(first);
        table.insert(second);

        assert_eq!(table.get(second_id).unwrap().status, JobStatus::Waiting);
        table.mark_running(second_id);
        assert_eq!(table.get(second_id).unwrap().status, JobStatus::Running);
        assert_eq!(table.list().len(), 2);
    }
}
