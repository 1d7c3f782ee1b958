//! Job-related API endpoints

use crate::VigilClient;
use crate::error::{ClientError, Result};
use uuid::Uuid;
use vigil_core::domain::job::{Job, JobStatus};
use vigil_core::dto::job::{BulkStatusRequest, BulkStatusResult, JobFilter, JobPage};

impl VigilClient {
    // =============================================================================
    // Job Snapshots
    // =============================================================================

    /// Get the authoritative snapshot of a job
    pub async fn fetch_job(&self, job_id: Uuid) -> Result<Job> {
        let url = format!("{}/api/jobs/{}", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// List one page of job summaries
    ///
    /// # Arguments
    /// * `filter` - Status/type/page/size, passed through as query parameters
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        let url = format!("{}/api/jobs", self.base_url);
        let response = self.client.get(&url).query(filter).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Job Commands
    // =============================================================================

    /// Request cancellation of a job
    ///
    /// # Returns
    /// The job snapshot after the backend processed the request. The status
    /// may still be non-terminal if the executor has not stopped yet.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        let url = format!("{}/api/jobs/{}/cancel", self.base_url, job_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    /// Move several jobs to a new status in one batch
    pub async fn bulk_update_status(
        &self,
        job_ids: Vec<Uuid>,
        status: JobStatus,
    ) -> Result<BulkStatusResult> {
        if job_ids.is_empty() {
            return Err(ClientError::InvalidRequest(
                "bulk status change needs at least one job".to_string(),
            ));
        }

        let url = format!("{}/api/jobs/bulk/status", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&BulkStatusRequest { job_ids, status })
            .send()
            .await?;

        self.handle_response(response).await
    }
}
