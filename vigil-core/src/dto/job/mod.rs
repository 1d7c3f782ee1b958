//! Job DTOs for backend communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{Job, JobStatus, JobType};

/// Fetch key for a page of job summaries
///
/// The monitor never interprets these fields; it passes them through to the
/// list endpoint and uses the whole filter as the identity of a view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub job_type: Option<JobType>,
    pub page: u32,
    pub size: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            page: 0,
            size: 20,
        }
    }
}

/// One page of job summaries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub items: Vec<Job>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
}

/// Request to move several jobs to a new status in one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStatusRequest {
    pub job_ids: Vec<Uuid>,
    pub status: JobStatus,
}

/// Backend's answer to a bulk status change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStatusResult {
    pub success_count: u32,
    pub failure_count: u32,
    #[serde(default)]
    pub failed_ids: Vec<Uuid>,
}
