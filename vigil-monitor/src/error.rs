//! Error types for the monitor

use std::fmt;

use thiserror::Error;
use uuid::Uuid;
use vigil_client::ClientError;
use vigil_core::domain::job::JobStatus;

/// Result type alias for monitor operations
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Command the dispatcher was asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Cancel,
    BulkStatus(JobStatus),
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandAction::Cancel => write!(f, "cancel"),
            CommandAction::BulkStatus(status) => write!(f, "bulk status change to {}", status),
        }
    }
}

/// Errors surfaced to callers of monitor operations
///
/// Transport failures of a live stream and data-integrity anomalies never
/// show up here; they only change observable view state.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Job or its logs no longer exist
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    /// Backend rejected a command
    #[error("{action} failed for {} job(s): {reason}", .job_ids.len())]
    CommandFailure {
        action: CommandAction,
        job_ids: Vec<Uuid>,
        reason: String,
    },

    /// A live subscription for the job is already opening or open
    #[error("Job {0} already has a live subscription")]
    SubscriptionActive(Uuid),

    /// The job reached a terminal state, live monitoring is over
    #[error("Job {0} already finished")]
    JobFinished(Uuid),

    /// Snapshot fetch failed
    #[error("Transport error: {0}")]
    Transport(#[from] ClientError),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Session could not be set up from its configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MonitorError {
    /// Classify a failed fetch for `job_id`
    pub fn from_fetch(job_id: Uuid, err: ClientError) -> Self {
        if err.is_not_found() {
            MonitorError::NotFound(job_id)
        } else {
            MonitorError::Transport(err)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MonitorError::NotFound(_))
    }
}
