//! Log DTOs for backend communication

use serde::{Deserialize, Serialize};

use crate::domain::job::JobStatus;
use crate::domain::log::LogEntry;

/// Snapshot of already-produced log lines
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    /// Highest sequence number covered by this snapshot (inclusive)
    #[serde(default)]
    pub latest_sequence: Option<u64>,
    /// The job already finished, no live stream is needed
    #[serde(default)]
    pub is_complete: bool,
}

/// Final signal of a live log stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One event of a live log stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    Log(LogEntry),
    Terminal(TerminalEvent),
}
