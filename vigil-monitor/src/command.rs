//! Command dispatcher
//!
//! Issues cancel and bulk status requests. Local state is never flipped
//! optimistically: callers apply only what the backend confirmed.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;
use vigil_client::ClientError;
use vigil_core::domain::job::{Job, JobStatus};

use crate::backend::JobBackend;
use crate::error::{CommandAction, MonitorError, Result};

/// Partitioned result of a bulk status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOutcome {
    pub status: JobStatus,
    /// Requested ids the backend did not report as failed, in request order
    pub success_ids: Vec<Uuid>,
    pub failed_ids: Vec<Uuid>,
}

impl BulkOutcome {
    pub fn failure_count(&self) -> usize {
        self.failed_ids.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed_ids.is_empty()
    }
}

pub struct CommandDispatcher {
    backend: Arc<dyn JobBackend>,
}

impl CommandDispatcher {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self { backend }
    }

    /// Ask the backend to cancel a job
    ///
    /// Returns the backend's snapshot, which may or may not be terminal yet.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job> {
        info!("Cancelling job {}", job_id);

        match self.backend.cancel_job(job_id).await {
            Ok(job) => {
                if job.id != job_id {
                    warn!(
                        "Cancel of job {} answered with snapshot of job {}",
                        job_id, job.id
                    );
                }
                info!("Cancel of job {} accepted, status is {}", job_id, job.status);
                Ok(job)
            }
            Err(e) if e.is_not_found() => Err(MonitorError::NotFound(job_id)),
            Err(e) => Err(command_failure(CommandAction::Cancel, vec![job_id], e)),
        }
    }

    /// Move a batch of jobs to `status` in one request
    pub async fn bulk_update_status(
        &self,
        job_ids: Vec<Uuid>,
        status: JobStatus,
    ) -> Result<BulkOutcome> {
        if job_ids.is_empty() {
            return Err(MonitorError::InvalidRequest(
                "bulk status change needs at least one job id".to_string(),
            ));
        }

        info!("Setting {} job(s) to {}", job_ids.len(), status);

        let result = self
            .backend
            .bulk_update_status(job_ids.clone(), status)
            .await
            .map_err(|e| command_failure(CommandAction::BulkStatus(status), job_ids.clone(), e))?;

        let failed: HashSet<Uuid> = result.failed_ids.iter().copied().collect();
        let (failed_ids, success_ids): (Vec<Uuid>, Vec<Uuid>) =
            job_ids.into_iter().partition(|id| failed.contains(id));

        if failed_ids.len() != failed.len() {
            warn!(
                "Bulk result names {} failed id(s) that were not requested",
                failed.len() - failed_ids.len()
            );
        }
        if result.success_count as usize != success_ids.len()
            || result.failure_count as usize != failed_ids.len()
        {
            warn!(
                "Bulk result counts ({} ok, {} failed) disagree with ids ({} ok, {} failed)",
                result.success_count,
                result.failure_count,
                success_ids.len(),
                failed_ids.len()
            );
        }
        if !failed_ids.is_empty() {
            warn!(
                "Bulk change to {} failed for {} job(s)",
                status,
                failed_ids.len()
            );
        }

        Ok(BulkOutcome {
            status,
            success_ids,
            failed_ids,
        })
    }
}

fn command_failure(action: CommandAction, job_ids: Vec<Uuid>, err: ClientError) -> MonitorError {
    warn!("{} rejected: {}", action, err);
    MonitorError::CommandFailure {
        action,
        job_ids,
        reason: err.to_string(),
    }
}
