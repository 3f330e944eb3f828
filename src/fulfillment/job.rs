//! In-flight generation jobs and their terminal-state guard

use crate::state_machine::OfferKind;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Submitted,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Submitted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FulfillmentJob {
    pub job_id: String,
    pub user_id: String,
    pub kind: OfferKind,
    /// Gems deducted when the job was submitted
    pub cost: u64,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FulfillmentJob {
    pub fn submitted(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: OfferKind,
        cost: u64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            kind,
            cost,
            submitted_at: Utc::now(),
            status: JobStatus::Submitted,
            finished_at: None,
        }
    }
}

/// How a job ended, from either the poller or a webhook
#[derive(Debug, Clone, PartialEq)]
pub enum JobSignal {
    Completed { artifact_ref: String },
    Failed { reason: String },
    TimedOut,
}

impl JobSignal {
    pub fn status(&self) -> JobStatus {
        match self {
            JobSignal::Completed { .. } => JobStatus::Completed,
            JobSignal::Failed { .. } => JobStatus::Failed,
            JobSignal::TimedOut => JobStatus::TimedOut,
        }
    }
}

/// Result of trying to move a job to a terminal state
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// This caller owns the terminal action
    Claimed(FulfillmentJob),
    AlreadyTerminal(JobStatus),
    Unknown,
}

/// Jobs keyed by backend job id. Terminal jobs are kept until pruned so a
/// late duplicate signal is recognized.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, FulfillmentJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: FulfillmentJob) {
        self.jobs.lock().unwrap().insert(job.job_id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<FulfillmentJob> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    pub fn is_terminal(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .unwrap()
            .get(job_id)
            .is_none_or(|job| job.status.is_terminal())
    }

    /// Mark the job terminal. Exactly one caller per job gets `Claimed`.
    pub fn claim(&self, job_id: &str, status: JobStatus) -> Claim {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(job_id) else {
            return Claim::Unknown;
        };
        if job.status.is_terminal() {
            return Claim::AlreadyTerminal(job.status);
        }
        job.status = status;
        job.finished_at = Some(Utc::now());
        Claim::Claimed(job.clone())
    }

    pub fn active_for(&self, user_id: &str) -> bool {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .any(|job| job.user_id == user_id && !job.status.is_terminal())
    }

    /// Forget terminal jobs that finished before `older_than`
    pub fn prune_terminal(&self, older_than: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, job| job.finished_at.is_none_or(|at| at >= older_than));
        before - jobs.len()
    }
}
