//! Backend port
//!
//! The monitor talks to the job backend only through [`JobBackend`]. The
//! HTTP implementation is [`VigilClient`]; tests plug in an in-memory fake.

use async_trait::async_trait;
use uuid::Uuid;
use vigil_client::{LogEventStream, Result, VigilClient};
use vigil_core::domain::job::{Job, JobStatus};
use vigil_core::dto::job::{BulkStatusResult, JobFilter, JobPage};
use vigil_core::dto::log::LogPage;

/// Operations the monitor needs from the job backend
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Authoritative snapshot of one job
    async fn fetch_job(&self, job_id: Uuid) -> Result<Job>;

    /// One page of job summaries under `filter`
    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage>;

    /// Already-produced logs, after `after_sequence` or from the beginning
    async fn fetch_logs(&self, job_id: Uuid, after_sequence: Option<u64>) -> Result<LogPage>;

    /// Live log events after `after_sequence`, closed after the terminal event
    async fn open_log_stream(&self, job_id: Uuid, after_sequence: u64) -> Result<LogEventStream>;

    /// Request cancellation, returning the updated snapshot
    async fn cancel_job(&self, job_id: Uuid) -> Result<Job>;

    /// Move several jobs to `status` in one batch
    async fn bulk_update_status(
        &self,
        job_ids: Vec<Uuid>,
        status: JobStatus,
    ) -> Result<BulkStatusResult>;
}

#[async_trait]
impl JobBackend for VigilClient {
    async fn fetch_job(&self, job_id: Uuid) -> Result<Job> {
        VigilClient::fetch_job(self, job_id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        VigilClient::list_jobs(self, filter).await
    }

    async fn fetch_logs(&self, job_id: Uuid, after_sequence: Option<u64>) -> Result<LogPage> {
        VigilClient::fetch_logs(self, job_id, after_sequence).await
    }

    async fn open_log_stream(&self, job_id: Uuid, after_sequence: u64) -> Result<LogEventStream> {
        VigilClient::open_log_stream(self, job_id, after_sequence).await
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        VigilClient::cancel_job(self, job_id).await
    }

    async fn bulk_update_status(
        &self,
        job_ids: Vec<Uuid>,
        status: JobStatus,
    ) -> Result<BulkStatusResult> {
        VigilClient::bulk_update_status(self, job_ids, status).await
    }
}
