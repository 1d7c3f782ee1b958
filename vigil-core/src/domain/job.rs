//! Job domain types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job record as reported by the backend
///
/// The client only ever holds read-only copies. Newer snapshots are folded
/// into a held copy with [`Job::absorb`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Percentage (0-100), only meaningful while running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Analysis,
    Indexing,
    Reconciliation,
    Export,
}

/// Job lifecycle status
///
/// Transitions only move toward a terminal state:
/// `Pending | Queued | Waiting` -> `Running` -> `Completed | Failed | Cancelled | Skipped`.
/// A pre-execution job may also jump straight to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Waiting,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Waiting,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Skipped,
    ];

    /// No further transition happens from a terminal status
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Skipped
        )
    }

    pub fn is_active(self) -> bool {
        self == JobStatus::Running
    }

    pub fn is_pre_execution(self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Queued | JobStatus::Waiting
        )
    }

    pub fn is_failure(self) -> bool {
        self == JobStatus::Failed
    }

    /// Whether moving from `self` to `next` respects the one-directional lifecycle
    ///
    /// Staying in the same status is always allowed. Pre-execution states may
    /// shuffle among themselves since the backend reports them as it sees fit.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if self.is_active() {
            return next.is_terminal();
        }
        true
    }

    fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Waiting => "WAITING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job status: {}", s))
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobType::Analysis => "ANALYSIS",
            JobType::Indexing => "INDEXING",
            JobType::Reconciliation => "RECONCILIATION",
            JobType::Export => "EXPORT",
        };
        f.write_str(s)
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ANALYSIS" => Ok(JobType::Analysis),
            "INDEXING" => Ok(JobType::Indexing),
            "RECONCILIATION" => Ok(JobType::Reconciliation),
            "EXPORT" => Ok(JobType::Export),
            _ => Err(format!("unknown job type: {}", s)),
        }
    }
}

/// Outcome of folding a newer snapshot into a held job record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobChange {
    /// Snapshot carried nothing new
    Unchanged,
    /// Fields changed but the status did not
    Updated,
    StatusChanged { from: JobStatus, to: JobStatus },
    /// Snapshot would have moved the lifecycle backwards and was ignored
    Rejected,
}

/// A backend record that breaks one of the job invariants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobInvariantViolation {
    CompletedAtWithoutTerminal,
    TerminalWithoutCompletedAt,
    ProgressOutOfRange(u8),
    ProgressWhileInactive,
    ErrorMessageWithoutFailure,
}

impl Job {
    /// Wall-clock duration of the job
    ///
    /// Uses the backend's `duration_ms` when present, otherwise derives it
    /// from the timestamps (up to `now` while the job is still running).
    pub fn duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if let Some(ms) = self.duration_ms {
            return i64::try_from(ms).ok().map(chrono::Duration::milliseconds);
        }
        let started = self.started_at?;
        let end = match self.completed_at {
            Some(completed) => completed,
            None if self.status.is_active() => now,
            None => return None,
        };
        Some(end.signed_duration_since(started))
    }

    /// Fold a newer authoritative snapshot of the same job into this one
    ///
    /// A snapshot whose status the lifecycle cannot reach from the held one
    /// (a terminal job reported running, a running job reported queued) is
    /// rejected wholesale. While the job keeps running, progress never moves
    /// backwards.
    pub fn absorb(&mut self, mut newer: Job) -> JobChange {
        if !self.status.can_transition_to(newer.status) {
            return JobChange::Rejected;
        }

        if self.status.is_active() && newer.status.is_active() {
            newer.progress = match (self.progress, newer.progress) {
                (Some(held), Some(incoming)) => Some(held.max(incoming)),
                (held, None) => held,
                (None, incoming) => incoming,
            };
        }

        if *self == newer {
            return JobChange::Unchanged;
        }

        let from = self.status;
        *self = newer;
        if from == self.status {
            JobChange::Updated
        } else {
            JobChange::StatusChanged {
                from,
                to: self.status,
            }
        }
    }

    /// Apply a status reported outside a full snapshot (terminal stream
    /// event, bulk status change)
    ///
    /// Returns `Rejected` when it would move the lifecycle backwards.
    pub fn apply_status(&mut self, status: JobStatus, message: Option<String>) -> JobChange {
        if self.status == status {
            return JobChange::Unchanged;
        }
        if !self.status.can_transition_to(status) {
            return JobChange::Rejected;
        }

        let from = self.status;
        self.status = status;
        if status.is_terminal() {
            self.progress = None;
            self.current_step = None;
            if status.is_failure() {
                self.error_message = message.or(self.error_message.take());
            }
        }
        JobChange::StatusChanged { from, to: status }
    }

    /// Check the record against the job invariants
    pub fn validate(&self) -> Vec<JobInvariantViolation> {
        let mut violations = Vec::new();
        let terminal = self.status.is_terminal();

        match (terminal, self.completed_at.is_some()) {
            (false, true) => violations.push(JobInvariantViolation::CompletedAtWithoutTerminal),
            (true, false) => violations.push(JobInvariantViolation::TerminalWithoutCompletedAt),
            _ => {}
        }

        if let Some(progress) = self.progress {
            if progress > 100 {
                violations.push(JobInvariantViolation::ProgressOutOfRange(progress));
            }
        }

        if !self.status.is_active() && (self.progress.is_some() || self.current_step.is_some()) {
            violations.push(JobInvariantViolation::ProgressWhileInactive);
        }

        if self.error_message.is_some() && !self.status.is_failure() {
            violations.push(JobInvariantViolation::ErrorMessageWithoutFailure);
        }

        violations
    }
}
