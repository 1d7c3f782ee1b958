//! In-memory backend for monitor tests

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;
use vigil_client::{ClientError, LogEventStream, Result};
use vigil_core::domain::job::{Job, JobStatus, JobType};
use vigil_core::domain::log::{LogEntry, LogLevel};
use vigil_core::dto::job::{BulkStatusResult, JobFilter, JobPage};
use vigil_core::dto::log::{LogPage, StreamEvent, TerminalEvent};

use crate::backend::JobBackend;

type EventSender = mpsc::UnboundedSender<Result<StreamEvent>>;

pub(crate) fn job(status: JobStatus) -> Job {
    let now = chrono::Utc::now();
    Job {
        id: Uuid::new_v4(),
        job_type: JobType::Analysis,
        status,
        progress: status.is_active().then_some(10),
        current_step: None,
        created_at: now,
        started_at: (!status.is_pre_execution()).then_some(now),
        completed_at: status.is_terminal().then_some(now),
        duration_ms: None,
        error_message: None,
    }
}

pub(crate) fn log_entry(job_id: Uuid, seq: u64) -> LogEntry {
    LogEntry {
        job_id,
        sequence_number: seq,
        level: LogLevel::Info,
        step: None,
        message: format!("line {}", seq),
        metadata: None,
        duration_ms: None,
        timestamp: chrono::Utc::now(),
    }
}

pub(crate) fn page(items: Vec<Job>) -> JobPage {
    JobPage {
        total: items.len() as u64,
        items,
        page: 0,
        size: 20,
    }
}

/// Backend double with scripted responses and hand-fed live streams
#[derive(Default)]
pub(crate) struct FakeBackend {
    jobs: Mutex<HashMap<Uuid, Job>>,
    logs: Mutex<HashMap<Uuid, Vec<LogEntry>>>,
    pages: Mutex<VecDeque<JobPage>>,
    streams: Mutex<HashMap<Uuid, EventSender>>,
    failing_opens: Mutex<HashMap<Uuid, u32>>,
    cancel_results: Mutex<HashMap<Uuid, Result<Job>>>,
    bulk_result: Mutex<Option<BulkStatusResult>>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
    open_calls: AtomicUsize,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_job(&self, job: Job) -> Uuid {
        let id = job.id;
        self.jobs.lock().unwrap().insert(id, job);
        id
    }

    pub(crate) fn remove_job(&self, job_id: Uuid) {
        self.jobs.lock().unwrap().remove(&job_id);
    }

    pub(crate) fn set_logs(&self, job_id: Uuid, entries: Vec<LogEntry>) {
        self.logs.lock().unwrap().insert(job_id, entries);
    }

    /// Pages returned by successive list calls; the last one repeats
    pub(crate) fn set_pages(&self, pages: Vec<JobPage>) {
        *self.pages.lock().unwrap() = pages.into();
    }

    pub(crate) fn set_cancel_result(&self, job_id: Uuid, result: Result<Job>) {
        self.cancel_results.lock().unwrap().insert(job_id, result);
    }

    pub(crate) fn set_bulk_result(&self, result: BulkStatusResult) {
        *self.bulk_result.lock().unwrap() = Some(result);
    }

    /// Hold the answer of the next job fetch until the returned gate is
    /// notified; the job is read when the fetch is made
    pub(crate) fn hold_next_fetch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.fetch_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn fail_next_opens(&self, job_id: Uuid, count: u32) {
        self.failing_opens.lock().unwrap().insert(job_id, count);
    }

    pub(crate) fn push_log(&self, job_id: Uuid, entry: LogEntry) {
        self.push(job_id, Ok(StreamEvent::Log(entry)));
    }

    pub(crate) fn push_terminal(&self, job_id: Uuid, status: JobStatus, message: Option<String>) {
        self.push(
            job_id,
            Ok(StreamEvent::Terminal(TerminalEvent { status, message })),
        );
    }

    /// End the current stream of the job without a terminal event
    pub(crate) fn close_stream(&self, job_id: Uuid) {
        self.streams.lock().unwrap().remove(&job_id);
    }

    pub(crate) fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn push(&self, job_id: Uuid, item: Result<StreamEvent>) {
        if let Some(sender) = self.streams.lock().unwrap().get(&job_id) {
            // The reader may already be gone; that is what some tests check
            let _ = sender.send(item);
        }
    }
}

#[async_trait]
impl JobBackend for FakeBackend {
    async fn fetch_job(&self, job_id: Uuid) -> Result<Job> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(job_id.to_string()));

        let gate = self.fetch_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        result
    }

    async fn list_jobs(&self, _filter: &JobFilter) -> Result<JobPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut pages = self.pages.lock().unwrap();
        let page = if pages.len() > 1 {
            pages.pop_front()
        } else {
            pages.front().cloned()
        };
        page.ok_or_else(|| ClientError::api_error(500, "no page scripted"))
    }

    async fn fetch_logs(&self, job_id: Uuid, after_sequence: Option<u64>) -> Result<LogPage> {
        let job = self
            .jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(job_id.to_string()))?;
        let all = self
            .logs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_default();

        let after = after_sequence.unwrap_or(0);
        Ok(LogPage {
            latest_sequence: all.last().map(|e| e.sequence_number),
            entries: all
                .into_iter()
                .filter(|e| e.sequence_number > after)
                .collect(),
            is_complete: job.status.is_terminal(),
        })
    }

    async fn open_log_stream(&self, job_id: Uuid, _after_sequence: u64) -> Result<LogEventStream> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut failing = self.failing_opens.lock().unwrap();
            if let Some(remaining) = failing.get_mut(&job_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ClientError::api_error(503, "stream unavailable"));
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().insert(job_id, tx);

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        if let Some(result) = self.cancel_results.lock().unwrap().remove(&job_id) {
            return result;
        }
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| ClientError::NotFound(job_id.to_string()))?;
        job.status = JobStatus::Cancelled;
        job.progress = None;
        job.completed_at = Some(chrono::Utc::now());
        Ok(job.clone())
    }

    async fn bulk_update_status(
        &self,
        job_ids: Vec<Uuid>,
        _status: JobStatus,
    ) -> Result<BulkStatusResult> {
        Ok(self
            .bulk_result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(BulkStatusResult {
                success_count: job_ids.len() as u32,
                failure_count: 0,
                failed_ids: Vec::new(),
            }))
    }
}
