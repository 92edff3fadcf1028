//! In-memory book of the day's scheduled jobs, mirrored to the journal.
//!
//! Status transitions are monotone: once a job is terminal it never
//! changes again, so every job ends in exactly one terminal status.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::storage::Journal;
use crate::types::{JobStatus, RaceEvent, ScheduledJob};

/// Outcome of [`JobBook::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// New job recorded.
    Added,
    /// Job existed and was still pending; its record was refreshed.
    Replaced,
    /// Job already running or finished; left untouched.
    Kept(JobStatus),
}

pub struct JobBook {
    jobs: Mutex<HashMap<String, ScheduledJob>>,
    journal: Arc<Journal>,
}

impl JobBook {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            journal,
        }
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, ScheduledJob>> {
        // A poisoned book still holds consistent rows; keep using it.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a `scheduled` job for `event` firing at `run_at`.
    pub async fn insert(&self, event: &RaceEvent, run_at: DateTime<Utc>) -> (ScheduledJob, Insert) {
        let job = ScheduledJob::new(event, run_at);
        let outcome = {
            let mut jobs = self.jobs();
            match jobs.get(&job.job_id).map(|j| j.status) {
                Some(JobStatus::Scheduled) => {
                    jobs.insert(job.job_id.clone(), job.clone());
                    Insert::Replaced
                }
                Some(status) => Insert::Kept(status),
                None => {
                    jobs.insert(job.job_id.clone(), job.clone());
                    Insert::Added
                }
            }
        };

        if !matches!(outcome, Insert::Kept(_)) {
            if let Err(e) = self.journal.record_schedule(&job).await {
                error!(job_id = %job.job_id, error = %e, "Failed to journal schedule");
            }
        }
        (job, outcome)
    }

    /// Move a job to `status`.
    ///
    /// Returns false when the job is unknown or already terminal.
    pub async fn transition(&self, job_id: &str, status: JobStatus, detail: Option<&str>) -> bool {
        self.apply(job_id, None, status, detail).await
    }

    /// Move a job to `status` only if it is currently `from`.
    pub async fn transition_from(
        &self,
        job_id: &str,
        from: JobStatus,
        status: JobStatus,
        detail: Option<&str>,
    ) -> bool {
        self.apply(job_id, Some(from), status, detail).await
    }

    /// Claim a scheduled job for execution. Only one caller ever wins.
    pub async fn start(&self, job_id: &str) -> bool {
        self.transition_from(job_id, JobStatus::Scheduled, JobStatus::Running, None)
            .await
    }

    async fn apply(
        &self,
        job_id: &str,
        expected: Option<JobStatus>,
        status: JobStatus,
        detail: Option<&str>,
    ) -> bool {
        let moved = {
            let mut jobs = self.jobs();
            match jobs.get_mut(job_id) {
                Some(job) if job.status.is_terminal() => {
                    warn!(job_id, from = %job.status, to = %status, "Refusing transition out of terminal status");
                    false
                }
                Some(job) if expected.is_some_and(|e| e != job.status) => {
                    debug!(job_id, current = %job.status, to = %status, "Job not in expected status");
                    false
                }
                Some(job) => {
                    job.status = status;
                    if let Some(detail) = detail {
                        job.error = Some(match job.error.take() {
                            Some(prev) => format!("{prev}\n{detail}"),
                            None => detail.to_string(),
                        });
                    }
                    true
                }
                None => {
                    warn!(job_id, to = %status, "Transition for unknown job");
                    false
                }
            }
        };

        if moved {
            debug!(job_id, status = %status, "Job status changed");
            if let Err(e) = self.journal.update_status(job_id, status, detail).await {
                error!(job_id, error = %e, "Failed to journal status change");
            }
        }
        moved
    }

    pub fn get(&self, job_id: &str) -> Option<ScheduledJob> {
        self.jobs().get(job_id).cloned()
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs().get(job_id).map(|j| j.status)
    }

    /// All jobs ordered by fire time.
    pub fn snapshot(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<_> = self.jobs().values().cloned().collect();
        jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.job_id.cmp(&b.job_id)));
        jobs
    }

    /// Drop terminal jobs whose local fire date is before `today`.
    pub fn prune(&self, today: NaiveDate, tz: Tz) -> usize {
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.run_at.with_timezone(&tz).date_naive() < today)
        });
        before - jobs.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
