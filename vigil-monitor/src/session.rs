//! Monitoring session
//!
//! [`MonitorSession`] is the context object that ties the pieces together
//! for one consumer: the live subscriptions, the poll coordinator, the
//! command dispatcher and one published [`JobView`] per watched job. There is
//! no shared global state; everything a session starts is owned by it and
//! torn down when it is closed or dropped.
//!
//! The session is driven by [`MonitorSession::next_update`]. Each call waits
//! on whichever comes first (a stream signal, a finished fetch, the poll
//! tick or the stale check) and handles it to completion before the next
//! one, so merge decisions and status changes never interleave.
//!
//! # Status recency
//!
//! Every fetch takes a ticket when it is issued. A job snapshot is only
//! applied, to the job's view and to its list summary alike, if its ticket
//! is newer than the last snapshot applied there, so a slow fetch can never
//! overwrite a faster, later one. On top of that the lifecycle only moves
//! forward: once a job is seen running or finished, no snapshot moves it
//! back.
//!
//! # Log completeness
//!
//! When a job finishes with holes in its merged logs, or finishes without
//! its stream saying so, the logs after the resume cursor are fetched once
//! more. Whatever is still missing after that is reported with
//! [`SessionUpdate::LogsMissing`].

use std::collections::{HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_client::VigilClient;
use vigil_core::domain::job::{Job, JobChange, JobStatus};
use vigil_core::dto::job::{JobFilter, JobPage};
use vigil_core::dto::log::LogPage;

use crate::backend::JobBackend;
use crate::command::{BulkOutcome, CommandDispatcher};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::merge::{LogMerger, MergeDecision};
use crate::poll::{FetchTicket, PollCoordinator, StatusChange};
use crate::stream::{ConnectionState, RoutedSignal, StreamController, StreamOutcome};

/// Published state of one watched job
#[derive(Debug, Clone)]
pub struct JobView {
    pub job: Job,
    /// Merged logs, ascending by sequence number
    pub logs: LogMerger,
    pub stream_state: ConnectionState,
    /// A live subscription is opening or open
    pub is_live: bool,
    /// Non-terminal and quiet for longer than the stale threshold
    pub is_stale: bool,
    /// The live subscription failed; shown as "live updates unavailable"
    pub live_unavailable: bool,
}

impl JobView {
    fn new(job: Job, logs: LogMerger) -> Self {
        Self {
            job,
            logs,
            stream_state: ConnectionState::Closed,
            is_live: false,
            is_stale: false,
            live_unavailable: false,
        }
    }

    fn set_stream_state(&mut self, state: ConnectionState) -> bool {
        let is_live = matches!(state, ConnectionState::Opening | ConnectionState::Open);
        let live_unavailable = state == ConnectionState::Error;
        if self.stream_state == state
            && self.is_live == is_live
            && self.live_unavailable == live_unavailable
        {
            return false;
        }
        self.stream_state = state;
        self.is_live = is_live;
        self.live_unavailable = live_unavailable;
        true
    }
}

/// Something observable that happened in the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// New entries were merged into the job's view
    LogsAppended { job_id: Uuid, count: usize },
    /// An incoming entry was not merged
    LogDropped {
        job_id: Uuid,
        sequence: u64,
        decision: MergeDecision,
    },
    StatusChanged {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    /// Progress, step or timing fields changed
    JobUpdated { job_id: Uuid },
    StreamOpened { job_id: Uuid },
    /// Live updates are unavailable until a restart succeeds
    StreamFailed { job_id: Uuid, reason: String },
    /// The job finished and its subscription is closed
    StreamClosed { job_id: Uuid, status: JobStatus },
    Stale { job_id: Uuid },
    PollCompleted {
        changes: Vec<StatusChange>,
        all_terminal: bool,
    },
    FetchFailed {
        job_id: Option<Uuid>,
        reason: String,
    },
    /// Log entries the backend no longer returns; the view has holes there
    LogsMissing {
        job_id: Uuid,
        ranges: Vec<RangeInclusive<u64>>,
    },
    /// The job no longer exists; it has been unwatched
    JobVanished { job_id: Uuid },
}

enum FetchResult {
    Job {
        job_id: Uuid,
        ticket: FetchTicket,
        result: vigil_client::Result<Job>,
    },
    Page {
        ticket: FetchTicket,
        filter: JobFilter,
        result: vigil_client::Result<JobPage>,
    },
    Logs {
        job_id: Uuid,
        after: u64,
        result: vigil_client::Result<LogPage>,
    },
}

struct WatchedJob {
    view: watch::Sender<JobView>,
    last_ticket: FetchTicket,
    last_activity: Instant,
}

impl WatchedJob {
    fn status(&self) -> JobStatus {
        self.view.borrow().job.status
    }
}

/// Monitoring context of one consumer
pub struct MonitorSession {
    backend: Arc<dyn JobBackend>,
    config: MonitorConfig,
    streams: StreamController,
    poller: PollCoordinator,
    commands: CommandDispatcher,
    watched: HashMap<Uuid, WatchedJob>,
    fetches: JoinSet<FetchResult>,
    page_in_flight: bool,
    last_page_ticket: FetchTicket,
    next_ticket: u64,
    poll_timer: Interval,
    stale_timer: Interval,
    pending: VecDeque<SessionUpdate>,
}

impl MonitorSession {
    /// Create a session over `backend`
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(backend: Arc<dyn JobBackend>, config: MonitorConfig) -> Self {
        let poll_timer = timer(config.poll_interval);
        let stale_timer = timer(config.poll_interval);

        Self {
            streams: StreamController::new(Arc::clone(&backend)),
            poller: PollCoordinator::new(config.max_stream_restarts),
            commands: CommandDispatcher::new(Arc::clone(&backend)),
            backend,
            config,
            watched: HashMap::new(),
            fetches: JoinSet::new(),
            page_in_flight: false,
            last_page_ticket: FetchTicket(0),
            next_ticket: 0,
            poll_timer,
            stale_timer,
            pending: VecDeque::new(),
        }
    }

    /// Create a session talking HTTP to `config.base_url`
    pub fn connect(config: MonitorConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| MonitorError::Config(e.to_string()))?;

        // A total timeout would also cut live streams; only bound the connect
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| MonitorError::Config(e.to_string()))?;
        let client = VigilClient::with_client(config.base_url.as_str(), http);

        Ok(Self::new(Arc::new(client), config))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Filter for the first page at the configured page size
    pub fn default_filter(&self) -> JobFilter {
        JobFilter {
            size: self.config.page_size,
            ..JobFilter::default()
        }
    }

    // =========================================================================
    // Watched jobs
    // =========================================================================

    /// Start monitoring a job
    ///
    /// Fetches the job and its log snapshot, then opens a live subscription
    /// if the job can still produce output. Watching a job twice returns
    /// another receiver of the same view.
    pub async fn watch(&mut self, job_id: Uuid) -> Result<watch::Receiver<JobView>> {
        if let Some(watched) = self.watched.get(&job_id) {
            return Ok(watched.view.subscribe());
        }

        let ticket = self.issue_ticket();
        let job = self
            .backend
            .fetch_job(job_id)
            .await
            .map_err(|e| MonitorError::from_fetch(job_id, e))?;
        let snapshot = self
            .backend
            .fetch_logs(job_id, None)
            .await
            .map_err(|e| MonitorError::from_fetch(job_id, e))?;

        report_violations(&job);

        let snapshot_complete = snapshot.is_complete;
        let mut logs = LogMerger::new();
        let held = logs.seed(snapshot);
        let status = job.status;

        info!(
            "Watching job {} ({}, {} log entries up to #{})",
            job_id,
            status,
            held,
            logs.cursor()
        );

        let (view, receiver) = watch::channel(JobView::new(job, logs));
        self.watched.insert(
            job_id,
            WatchedJob {
                view,
                last_ticket: ticket,
                last_activity: Instant::now(),
            },
        );
        self.poller.rearm();

        if status.is_terminal() {
            debug!("Job {} already finished, no live stream needed", job_id);
        } else if snapshot_complete {
            // Logs say finished but the job record does not yet
            self.spawn_refresh(job_id);
        } else {
            self.open_stream(job_id);
        }

        Ok(receiver)
    }

    /// Stop monitoring a job
    ///
    /// Returns whether the job was watched. Receivers of its view see the
    /// channel close.
    pub fn unwatch(&mut self, job_id: Uuid) -> bool {
        self.streams.stop(job_id);
        self.poller.forget(job_id);
        let existed = self.watched.remove(&job_id).is_some();
        if existed {
            info!("Stopped watching job {}", job_id);
        }
        existed
    }

    /// Current view of a watched job
    pub fn view(&self, job_id: Uuid) -> Option<watch::Ref<'_, JobView>> {
        self.watched.get(&job_id).map(|watched| watched.view.borrow())
    }

    pub fn watched_jobs(&self) -> Vec<Uuid> {
        self.watched.keys().copied().collect()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Ask the backend to cancel a job
    ///
    /// The backend's answer is applied as an ordinary snapshot. If it is
    /// already terminal the job's subscription is stopped right away.
    pub async fn cancel(&mut self, job_id: Uuid) -> Result<Job> {
        let ticket = self.issue_ticket();
        let job = self.commands.cancel(job_id).await?;
        self.apply_job(job_id, ticket, job.clone());
        Ok(job)
    }

    /// Move a batch of jobs to `status`
    ///
    /// Only the ids the backend confirmed change locally; failed ids keep
    /// their previous state.
    pub async fn bulk_update_status(
        &mut self,
        job_ids: Vec<Uuid>,
        status: JobStatus,
    ) -> Result<BulkOutcome> {
        let outcome = self.commands.bulk_update_status(job_ids, status).await?;

        for job_id in &outcome.success_ids {
            self.poller.apply_status(*job_id, status);
            self.apply_status(*job_id, status, None);
        }

        Ok(outcome)
    }

    // =========================================================================
    // List view
    // =========================================================================

    /// Switch the polled list view; fetches the new page right away
    pub fn set_filter(&mut self, filter: JobFilter) {
        if self.poller.set_filter(filter) {
            self.poll_timer.reset();
            self.spawn_page();
        }
    }

    /// Latest job summaries of the list view
    pub fn summaries(&self) -> &[Job] {
        self.poller.summaries()
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Wait for and return the next update
    ///
    /// Returns `None` once there is nothing left to wait for: no live
    /// subscription, no fetch in flight, and polling is idle.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(update);
            }

            let needing = self.jobs_needing_stream();
            let polling = self.poller.should_poll(&needing);
            let fetching = !self.fetches.is_empty();
            let streaming = self.streams.live_count() > 0;
            if !polling && !fetching && !streaming {
                return None;
            }
            let checking_stale = self.watched.values().any(|watched| {
                let view = watched.view.borrow();
                !view.job.status.is_terminal() && !view.is_stale
            });

            tokio::select! {
                Some(routed) = self.streams.next_signal() => self.handle_signal(routed),
                Some(joined) = self.fetches.join_next(), if fetching => self.handle_fetch(joined),
                _ = self.poll_timer.tick(), if polling => self.on_poll_tick(),
                _ = self.stale_timer.tick(), if checking_stale => self.check_staleness(),
            }
        }
    }

    /// Stop every subscription, fetch and timer
    pub fn close(&mut self) {
        info!("Closing monitor session");
        self.streams.stop_all();
        self.fetches.abort_all();
        self.page_in_flight = false;
        self.poller.clear_filter();
        self.watched.clear();
        self.pending.clear();
    }

    fn handle_signal(&mut self, routed: RoutedSignal) {
        let job_id = routed.job_id;
        let Some(watched) = self.watched.get_mut(&job_id) else {
            debug!("Dropping stream signal for unwatched job {}", job_id);
            return;
        };

        let streams = &mut self.streams;
        let mut outcome = None;
        watched.view.send_if_modified(|view| {
            outcome = streams.route(routed, &mut view.logs);
            let state_changed = view.set_stream_state(streams.state(job_id));
            outcome.is_some() || state_changed
        });

        let Some(outcome) = outcome else {
            return;
        };

        match outcome {
            StreamOutcome::Opened => {
                self.poller.record_stream_opened(job_id);
                self.touch(job_id);
                self.pending.push_back(SessionUpdate::StreamOpened { job_id });
            }
            StreamOutcome::Log {
                sequence,
                decision: MergeDecision::Accept,
            } => {
                debug!("Merged log entry #{} of job {}", sequence, job_id);
                self.touch(job_id);
                self.pending
                    .push_back(SessionUpdate::LogsAppended { job_id, count: 1 });
            }
            StreamOutcome::Log { sequence, decision } => {
                self.touch(job_id);
                self.pending.push_back(SessionUpdate::LogDropped {
                    job_id,
                    sequence,
                    decision,
                });
            }
            StreamOutcome::Terminal(event) => {
                self.poller.apply_status(job_id, event.status);
                self.apply_status(job_id, event.status, event.message);
                self.pending.push_back(SessionUpdate::StreamClosed {
                    job_id,
                    status: event.status,
                });
                if self.has_gaps(job_id) {
                    self.spawn_catch_up(job_id);
                }
                // Progress, duration and error are only final in the record
                self.spawn_refresh(job_id);
            }
            StreamOutcome::Failed(err) => {
                self.pending.push_back(SessionUpdate::StreamFailed {
                    job_id,
                    reason: err.to_string(),
                });
                // Find out whether the job finished or vanished meanwhile
                self.spawn_refresh(job_id);
            }
        }
    }

    fn handle_fetch(&mut self, joined: std::result::Result<FetchResult, JoinError>) {
        let fetched = match joined {
            Ok(fetched) => fetched,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                // The failed task is unknown, let the next tick retry the page
                warn!("Fetch task failed: {}", e);
                self.page_in_flight = false;
                return;
            }
        };

        match fetched {
            FetchResult::Job {
                job_id,
                ticket,
                result,
            } => match result {
                Ok(job) => self.apply_job(job_id, ticket, job),
                Err(e) if e.is_not_found() => {
                    warn!("Job {} no longer exists", job_id);
                    if self.unwatch(job_id) {
                        self.pending
                            .push_back(SessionUpdate::JobVanished { job_id });
                    }
                }
                Err(e) => {
                    warn!("Refreshing job {} failed: {}", job_id, e);
                    self.pending.push_back(SessionUpdate::FetchFailed {
                        job_id: Some(job_id),
                        reason: e.to_string(),
                    });
                }
            },
            FetchResult::Page {
                ticket,
                filter,
                result,
            } => self.apply_page(ticket, filter, result),
            FetchResult::Logs {
                job_id,
                after,
                result,
            } => match result {
                Ok(page) => self.apply_catch_up(job_id, after, page),
                Err(e) => {
                    warn!("Fetching remaining logs of job {} failed: {}", job_id, e);
                    self.pending.push_back(SessionUpdate::FetchFailed {
                        job_id: Some(job_id),
                        reason: e.to_string(),
                    });
                    self.report_missing(job_id, after);
                }
            },
        }
    }

    fn on_poll_tick(&mut self) {
        if self.poller.wants_page() && !self.page_in_flight {
            self.spawn_page();
        }

        let needing = self.jobs_needing_stream();
        for job_id in self.poller.grant_restarts(&needing) {
            info!("Restarting log stream for job {}", job_id);
            self.spawn_refresh(job_id);
            self.open_stream(job_id);
        }
    }

    fn check_staleness(&mut self) {
        let now = Instant::now();
        let stale_after = self.config.stale_after;

        for (job_id, watched) in &self.watched {
            let quiet_for = now.duration_since(watched.last_activity);
            if quiet_for < stale_after {
                continue;
            }
            let flagged = watched.view.send_if_modified(|view| {
                if view.job.status.is_terminal() || view.is_stale {
                    return false;
                }
                view.is_stale = true;
                true
            });
            if flagged {
                warn!(
                    "Job {} has shown no activity for {}s",
                    job_id,
                    quiet_for.as_secs()
                );
                self.pending
                    .push_back(SessionUpdate::Stale { job_id: *job_id });
            }
        }
    }

    // =========================================================================
    // Applying state
    // =========================================================================

    /// Apply an authoritative snapshot fetched with `ticket`
    fn apply_job(&mut self, job_id: Uuid, ticket: FetchTicket, job: Job) {
        report_violations(&job);
        self.poller.apply_snapshot(&job, ticket);

        let Some(watched) = self.watched.get_mut(&job_id) else {
            return;
        };
        if ticket < watched.last_ticket {
            debug!("Ignoring outdated snapshot of job {}", job_id);
            return;
        }
        watched.last_ticket = ticket;

        let mut change = JobChange::Unchanged;
        watched.view.send_if_modified(|view| {
            change = view.job.absorb(job);
            !matches!(change, JobChange::Unchanged | JobChange::Rejected)
        });

        self.on_job_change(job_id, change);
    }

    /// Apply a status learned from a stream event or confirmed command
    fn apply_status(&mut self, job_id: Uuid, status: JobStatus, message: Option<String>) {
        let Some(watched) = self.watched.get_mut(&job_id) else {
            return;
        };

        let mut change = JobChange::Unchanged;
        watched.view.send_if_modified(|view| {
            change = view.job.apply_status(status, message);
            matches!(change, JobChange::StatusChanged { .. })
        });

        self.on_job_change(job_id, change);
    }

    fn on_job_change(&mut self, job_id: Uuid, change: JobChange) {
        match change {
            JobChange::StatusChanged { from, to } => {
                info!("Job {} is now {} (was {})", job_id, to, from);
                self.touch(job_id);
                self.pending
                    .push_back(SessionUpdate::StatusChanged { job_id, from, to });

                if to.is_terminal() {
                    self.finish(job_id, to);
                } else if self.streams.state(job_id) == ConnectionState::Closed
                    && !self.streams.is_terminal(job_id)
                {
                    // Newly running job that never had a stream
                    self.open_stream(job_id);
                }
            }
            JobChange::Updated => {
                self.touch(job_id);
                self.pending.push_back(SessionUpdate::JobUpdated { job_id });
            }
            JobChange::Rejected => {
                debug!("Ignoring status that would move job {} backwards", job_id);
            }
            JobChange::Unchanged => {}
        }
    }

    /// Job seen terminal outside its stream: stop it and fetch the tail
    fn finish(&mut self, job_id: Uuid, status: JobStatus) {
        if self.streams.is_terminal(job_id) {
            return;
        }
        if self.streams.stop(job_id) {
            self.sync_stream_state(job_id);
            self.pending
                .push_back(SessionUpdate::StreamClosed { job_id, status });
        }

        self.spawn_catch_up(job_id);
    }

    fn apply_page(
        &mut self,
        ticket: FetchTicket,
        filter: JobFilter,
        result: vigil_client::Result<JobPage>,
    ) {
        self.page_in_flight = false;

        if self.poller.filter() != Some(&filter) || ticket < self.last_page_ticket {
            debug!("Ignoring page fetched for a previous view");
            return;
        }
        self.last_page_ticket = ticket;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!("Polling job summaries failed: {}", e);
                self.pending.push_back(SessionUpdate::FetchFailed {
                    job_id: None,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let watched_items: Vec<Job> = page
            .items
            .iter()
            .filter(|job| self.watched.contains_key(&job.id))
            .cloned()
            .collect();

        let report = self.poller.apply(page, ticket);
        debug!(
            "Poll applied, {} status change(s), all terminal: {}",
            report.changes.len(),
            report.all_terminal
        );

        for job in watched_items {
            self.apply_job(job.id, ticket, job);
        }

        self.pending.push_back(SessionUpdate::PollCompleted {
            changes: report.changes,
            all_terminal: report.all_terminal,
        });
    }

    /// Merge the logs fetched after `after` once the job finished
    fn apply_catch_up(&mut self, job_id: Uuid, after: u64, page: LogPage) {
        let Some(watched) = self.watched.get(&job_id) else {
            return;
        };

        let mut added = 0;
        watched.view.send_if_modified(|view| {
            added = view.logs.seed(page);
            added > 0
        });

        if added > 0 {
            debug!("Caught up {} log entries of job {}", added, job_id);
            self.pending
                .push_back(SessionUpdate::LogsAppended { job_id, count: added });
        }
        self.report_missing(job_id, after);
    }

    /// Report the holes left above `after` in a finished job's logs
    fn report_missing(&mut self, job_id: Uuid, after: u64) {
        let Some(watched) = self.watched.get(&job_id) else {
            return;
        };
        let ranges = watched.view.borrow().logs.missing_after(after);
        if ranges.is_empty() {
            return;
        }

        warn!(
            "Job {} finished with {} range(s) of log entries missing: {:?}",
            job_id,
            ranges.len(),
            ranges
        );
        self.pending
            .push_back(SessionUpdate::LogsMissing { job_id, ranges });
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn issue_ticket(&mut self) -> FetchTicket {
        self.next_ticket += 1;
        FetchTicket(self.next_ticket)
    }

    fn spawn_refresh(&mut self, job_id: Uuid) {
        let ticket = self.issue_ticket();
        let backend = Arc::clone(&self.backend);
        self.fetches.spawn(async move {
            let result = backend.fetch_job(job_id).await;
            FetchResult::Job {
                job_id,
                ticket,
                result,
            }
        });
    }

    /// Fetch the logs after the resume cursor of a finished job
    fn spawn_catch_up(&mut self, job_id: Uuid) {
        let Some(watched) = self.watched.get(&job_id) else {
            return;
        };
        let after = watched.view.borrow().logs.cursor();
        let backend = Arc::clone(&self.backend);
        self.fetches.spawn(async move {
            let result = backend.fetch_logs(job_id, Some(after)).await;
            FetchResult::Logs {
                job_id,
                after,
                result,
            }
        });
    }

    fn spawn_page(&mut self) {
        let Some(filter) = self.poller.filter().cloned() else {
            return;
        };
        let ticket = self.issue_ticket();
        let backend = Arc::clone(&self.backend);
        self.page_in_flight = true;
        self.fetches.spawn(async move {
            let result = backend.list_jobs(&filter).await;
            FetchResult::Page {
                ticket,
                filter,
                result,
            }
        });
    }

    fn open_stream(&mut self, job_id: Uuid) {
        let Some(watched) = self.watched.get(&job_id) else {
            return;
        };
        let cursor = watched.view.borrow().logs.cursor();

        match self.streams.start(job_id, cursor) {
            Ok(_) => self.sync_stream_state(job_id),
            Err(e) => debug!("Not opening stream for job {}: {}", job_id, e),
        }
    }

    fn sync_stream_state(&mut self, job_id: Uuid) {
        if let Some(watched) = self.watched.get(&job_id) {
            let state = self.streams.state(job_id);
            watched.view.send_if_modified(|view| view.set_stream_state(state));
        }
    }

    /// Record activity on a job, clearing its stale flag
    fn touch(&mut self, job_id: Uuid) {
        if let Some(watched) = self.watched.get_mut(&job_id) {
            watched.last_activity = Instant::now();
            watched.view.send_if_modified(|view| {
                let was_stale = view.is_stale;
                view.is_stale = false;
                was_stale
            });
        }
    }

    fn has_gaps(&self, job_id: Uuid) -> bool {
        self.watched
            .get(&job_id)
            .is_some_and(|watched| !watched.view.borrow().logs.gaps().is_empty())
    }

    fn jobs_needing_stream(&self) -> Vec<Uuid> {
        self.poller.restart_candidates(
            self.watched
                .iter()
                .map(|(job_id, watched)| (*job_id, watched.status())),
            &self.streams,
        )
    }
}

fn timer(period: std::time::Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

fn report_violations(job: &Job) {
    for violation in job.validate() {
        warn!("Job {} record is inconsistent: {:?}", job.id, violation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, job, log_entry, page};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use vigil_core::dto::job::BulkStatusResult;

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(3),
            max_stream_restarts: 2,
            ..MonitorConfig::default()
        }
    }

    fn session(backend: &Arc<FakeBackend>) -> MonitorSession {
        MonitorSession::new(backend.clone(), test_config())
    }

    async fn next(session: &mut MonitorSession) -> Option<SessionUpdate> {
        tokio::time::timeout(Duration::from_secs(30), session.next_update())
            .await
            .expect("timed out waiting for a session update")
    }

    /// Collect updates until the session goes idle
    async fn drain(session: &mut MonitorSession) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = next(session).await {
            updates.push(update);
            assert!(updates.len() < 100, "session never went idle");
        }
        updates
    }

    fn sequences(view: &JobView) -> Vec<u64> {
        view.logs.entries().iter().map(|e| e.sequence_number).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_then_stream_until_completed() {
        let backend = Arc::new(FakeBackend::new());
        let running = job(JobStatus::Running);
        let job_id = backend.add_job(running.clone());
        backend.set_logs(job_id, (1..=3).map(|seq| log_entry(job_id, seq)).collect());
        let mut session = session(&backend);

        let view = session.watch(job_id).await.unwrap();
        assert_eq!(sequences(&view.borrow()), vec![1, 2, 3]);
        assert_eq!(
            next(&mut session).await,
            Some(SessionUpdate::StreamOpened { job_id })
        );

        let mut completed = running.clone();
        completed.status = JobStatus::Completed;
        completed.progress = None;
        completed.completed_at = Some(chrono::Utc::now());
        backend.add_job(completed);

        backend.push_log(job_id, log_entry(job_id, 4));
        backend.push_log(job_id, log_entry(job_id, 3));
        backend.push_terminal(job_id, JobStatus::Completed, None);

        let updates = drain(&mut session).await;
        assert!(updates.contains(&SessionUpdate::LogsAppended { job_id, count: 1 }));
        assert!(updates.contains(&SessionUpdate::LogDropped {
            job_id,
            sequence: 3,
            decision: MergeDecision::Duplicate
        }));
        assert!(updates.contains(&SessionUpdate::StatusChanged {
            job_id,
            from: JobStatus::Running,
            to: JobStatus::Completed
        }));

        let view = view.borrow();
        assert_eq!(sequences(&view), vec![1, 2, 3, 4]);
        assert_eq!(view.job.status, JobStatus::Completed);
        assert_eq!(view.stream_state, ConnectionState::Closed);
        assert!(!view.is_live);
    }

    fn completed(running: &Job) -> Job {
        let mut completed = running.clone();
        completed.status = JobStatus::Completed;
        completed.progress = None;
        completed.completed_at = Some(chrono::Utc::now());
        completed
    }

    #[tokio::test(start_paused = true)]
    async fn test_hole_at_stream_end_is_filled_from_backend() {
        let backend = Arc::new(FakeBackend::new());
        let running = job(JobStatus::Running);
        let job_id = backend.add_job(running.clone());
        let mut session = session(&backend);

        let view = session.watch(job_id).await.unwrap();
        next(&mut session).await;

        backend.set_logs(job_id, (1..=3).map(|seq| log_entry(job_id, seq)).collect());
        backend.add_job(completed(&running));
        backend.push_log(job_id, log_entry(job_id, 1));
        backend.push_log(job_id, log_entry(job_id, 3));
        backend.push_terminal(job_id, JobStatus::Completed, None);

        let updates = drain(&mut session).await;
        assert!(
            !updates
                .iter()
                .any(|u| matches!(u, SessionUpdate::LogsMissing { .. }))
        );

        let view = view.borrow();
        assert_eq!(sequences(&view), vec![1, 2, 3]);
        assert!(view.logs.gaps().is_empty());
        assert_eq!(view.job.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_lost_at_stream_end_are_reported() {
        let backend = Arc::new(FakeBackend::new());
        let running = job(JobStatus::Running);
        let job_id = backend.add_job(running.clone());
        let mut session = session(&backend);

        let view = session.watch(job_id).await.unwrap();
        next(&mut session).await;

        backend.set_logs(job_id, vec![log_entry(job_id, 1), log_entry(job_id, 3)]);
        backend.add_job(completed(&running));
        backend.push_log(job_id, log_entry(job_id, 1));
        backend.push_log(job_id, log_entry(job_id, 3));
        backend.push_terminal(job_id, JobStatus::Completed, None);

        let updates = drain(&mut session).await;
        assert!(updates.contains(&SessionUpdate::LogsMissing {
            job_id,
            ranges: vec![2..=2]
        }));
        assert_eq!(sequences(&view.borrow()), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_refresh_does_not_overwrite_newer_page() {
        let backend = Arc::new(FakeBackend::new());
        let mut scanning = job(JobStatus::Running);
        scanning.progress = Some(20);
        scanning.current_step = Some("scan".to_string());
        let job_id = backend.add_job(scanning.clone());
        let mut writing = scanning.clone();
        writing.progress = Some(50);
        writing.current_step = Some("write".to_string());
        backend.set_pages(vec![page(vec![writing])]);
        let mut session = MonitorSession::new(
            backend.clone(),
            MonitorConfig {
                max_stream_restarts: 0,
                ..test_config()
            },
        );

        let view = session.watch(job_id).await.unwrap();
        assert_eq!(
            next(&mut session).await,
            Some(SessionUpdate::StreamOpened { job_id })
        );

        // The refresh after the stream drops answers after a later page
        let gate = backend.hold_next_fetch();
        backend.close_stream(job_id);
        assert!(matches!(
            next(&mut session).await,
            Some(SessionUpdate::StreamFailed { .. })
        ));

        session.set_filter(JobFilter::default());
        loop {
            if let Some(SessionUpdate::PollCompleted { .. }) = next(&mut session).await {
                break;
            }
        }
        assert_eq!(view.borrow().job.current_step.as_deref(), Some("write"));

        gate.notify_one();
        // Shorter than the poll interval, so no newer page hides the outcome
        let _ = tokio::time::timeout(Duration::from_millis(500), async {
            while session.next_update().await.is_some() {}
        })
        .await;

        assert_eq!(backend.fetch_calls(), 2);
        let summary = &session.summaries()[0];
        assert_eq!(summary.current_step.as_deref(), Some("write"));
        assert_eq!(summary.progress, Some(50));
        let view = view.borrow();
        assert_eq!(view.job.current_step.as_deref(), Some("write"));
        assert_eq!(view.job.progress, Some(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_opens_no_stream() {
        let backend = Arc::new(FakeBackend::new());
        let job_id = backend.add_job(job(JobStatus::Failed));
        backend.set_logs(job_id, vec![log_entry(job_id, 1)]);
        let mut session = session(&backend);

        let view = session.watch(job_id).await.unwrap();

        assert!(drain(&mut session).await.is_empty());
        assert_eq!(backend.open_calls(), 0);
        assert!(!view.borrow().is_live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_unknown_job_is_not_found() {
        let backend = Arc::new(FakeBackend::new());
        let mut session = session(&backend);

        let err = session.watch(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_stream_and_discards_later_entries() {
        let backend = Arc::new(FakeBackend::new());
        let job_id = backend.add_job(job(JobStatus::Running));
        backend.set_logs(job_id, vec![log_entry(job_id, 1)]);
        let mut session = session(&backend);

        let view = session.watch(job_id).await.unwrap();
        next(&mut session).await;

        let job = session.cancel(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(view.borrow().stream_state, ConnectionState::Closed);

        backend.push_log(job_id, log_entry(job_id, 2));

        let updates = drain(&mut session).await;
        assert!(updates.contains(&SessionUpdate::StreamClosed {
            job_id,
            status: JobStatus::Cancelled
        }));
        assert!(
            !updates
                .iter()
                .any(|u| matches!(u, SessionUpdate::LogsAppended { .. }))
        );
        assert_eq!(sequences(&view.borrow()), vec![1]);
        assert_eq!(view.borrow().job.status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_without_terminal_answer_keeps_streaming() {
        let backend = Arc::new(FakeBackend::new());
        let running = job(JobStatus::Running);
        let job_id = backend.add_job(running.clone());
        backend.set_cancel_result(job_id, Ok(running));
        let mut session = session(&backend);

        let view = session.watch(job_id).await.unwrap();
        next(&mut session).await;
        session.cancel(job_id).await.unwrap();

        assert_eq!(view.borrow().job.status, JobStatus::Running);
        assert!(view.borrow().is_live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_applies_only_confirmed_ids() {
        let backend = Arc::new(FakeBackend::new());
        let jobs: Vec<Job> = (0..5).map(|_| job(JobStatus::Running)).collect();
        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        backend.set_pages(vec![page(jobs)]);
        backend.set_bulk_result(BulkStatusResult {
            success_count: 3,
            failure_count: 2,
            failed_ids: vec![ids[3], ids[4]],
        });
        let mut session = session(&backend);

        session.set_filter(JobFilter::default());
        assert!(matches!(
            next(&mut session).await,
            Some(SessionUpdate::PollCompleted { .. })
        ));

        let outcome = session
            .bulk_update_status(ids.clone(), JobStatus::Cancelled)
            .await
            .unwrap();

        assert_eq!(outcome.failure_count(), 2);
        let statuses: Vec<JobStatus> = session.summaries().iter().map(|j| j.status).collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Cancelled,
                JobStatus::Cancelled,
                JobStatus::Cancelled,
                JobStatus::Running,
                JobStatus::Running,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_when_all_terminal() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_pages(vec![page(vec![
            job(JobStatus::Completed),
            job(JobStatus::Cancelled),
        ])]);
        let mut session = session(&backend);

        session.set_filter(JobFilter::default());
        let updates = drain(&mut session).await;

        assert!(matches!(
            updates.as_slice(),
            [SessionUpdate::PollCompleted {
                all_terminal: true,
                ..
            }]
        ));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(next(&mut session).await, None);
        assert_eq!(backend.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_continues_while_a_job_is_active() {
        let backend = Arc::new(FakeBackend::new());
        let queued = job(JobStatus::Queued);
        let mut running = queued.clone();
        running.status = JobStatus::Running;
        running.started_at = Some(chrono::Utc::now());
        let mut done = running.clone();
        done.status = JobStatus::Completed;
        done.progress = None;
        done.completed_at = Some(chrono::Utc::now());
        backend.set_pages(vec![page(vec![queued]), page(vec![running]), page(vec![done])]);
        let mut session = session(&backend);

        session.set_filter(JobFilter::default());
        let updates = drain(&mut session).await;

        let polls: Vec<&SessionUpdate> = updates
            .iter()
            .filter(|u| matches!(u, SessionUpdate::PollCompleted { .. }))
            .collect();
        assert_eq!(polls.len(), 3);
        assert_eq!(backend.list_calls(), 3);
        assert_eq!(session.summaries()[0].status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_page_does_not_revert_terminal_status() {
        let backend = Arc::new(FakeBackend::new());
        let running = job(JobStatus::Running);
        let job_id = backend.add_job(running.clone());
        let finished_id = backend.add_job(job(JobStatus::Completed));
        backend.set_pages(vec![page(vec![running.clone()])]);
        let mut session = session(&backend);

        session.set_filter(JobFilter::default());
        let view = session.watch(job_id).await.unwrap();
        while view.borrow().stream_state != ConnectionState::Open
            || session.summaries().is_empty()
        {
            next(&mut session).await;
        }

        // Backend record and page both keep claiming RUNNING
        backend.push_terminal(job_id, JobStatus::Completed, None);
        while view.borrow().job.status != JobStatus::Completed {
            next(&mut session).await;
        }
        assert_eq!(session.summaries()[0].status, JobStatus::Completed);

        // Watching another job re-arms polling, which fetches the stale page
        session.watch(finished_id).await.unwrap();
        drain(&mut session).await;

        assert_eq!(backend.list_calls(), 2);
        assert_eq!(view.borrow().job.status, JobStatus::Completed);
        assert_eq!(session.summaries()[0].status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stream_is_restarted_on_next_tick() {
        let backend = Arc::new(FakeBackend::new());
        let job_id = backend.add_job(job(JobStatus::Running));
        backend.fail_next_opens(job_id, 1);
        let mut session = session(&backend);

        let view = session.watch(job_id).await.unwrap();
        assert!(matches!(
            next(&mut session).await,
            Some(SessionUpdate::StreamFailed { .. })
        ));
        assert!(view.borrow().live_unavailable);

        loop {
            if let Some(SessionUpdate::StreamOpened { .. }) = next(&mut session).await {
                break;
            }
        }
        assert_eq!(backend.open_calls(), 2);
        assert!(!view.borrow().live_unavailable);
        assert!(view.borrow().is_live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_restarts_are_bounded() {
        let backend = Arc::new(FakeBackend::new());
        let job_id = backend.add_job(job(JobStatus::Running));
        backend.fail_next_opens(job_id, 10);
        let mut session = session(&backend);

        let view = session.watch(job_id).await.unwrap();
        let updates = drain(&mut session).await;

        let failures = updates
            .iter()
            .filter(|u| matches!(u, SessionUpdate::StreamFailed { .. }))
            .count();
        // Initial open plus two granted restarts
        assert_eq!(failures, 3);
        assert_eq!(backend.open_calls(), 3);
        assert!(view.borrow().live_unavailable);
        assert_eq!(view.borrow().job.status, JobStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_job_is_flagged_stale_until_activity() {
        let backend = Arc::new(FakeBackend::new());
        let job_id = backend.add_job(job(JobStatus::Running));
        let mut session = session(&backend);

        let view = session.watch(job_id).await.unwrap();
        next(&mut session).await;

        assert_eq!(
            next(&mut session).await,
            Some(SessionUpdate::Stale { job_id })
        );
        assert!(view.borrow().is_stale);
        assert_eq!(view.borrow().job.status, JobStatus::Running);

        backend.push_log(job_id, log_entry(job_id, 1));
        assert_eq!(
            next(&mut session).await,
            Some(SessionUpdate::LogsAppended { job_id, count: 1 })
        );
        assert!(!view.borrow().is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_job_is_unwatched() {
        let backend = Arc::new(FakeBackend::new());
        let job_id = backend.add_job(job(JobStatus::Running));
        backend.fail_next_opens(job_id, 1);
        let mut session = session(&backend);

        let view = session.watch(job_id).await.unwrap();
        backend.remove_job(job_id);

        let updates = drain(&mut session).await;
        assert!(updates.contains(&SessionUpdate::JobVanished { job_id }));
        assert!(session.view(job_id).is_none());
        assert!(view.has_changed().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_everything() {
        let backend = Arc::new(FakeBackend::new());
        let job_id = backend.add_job(job(JobStatus::Running));
        backend.set_pages(vec![page(vec![job(JobStatus::Running)])]);
        let mut session = session(&backend);

        session.set_filter(JobFilter::default());
        session.watch(job_id).await.unwrap();
        session.close();

        assert_eq!(next(&mut session).await, None);
        assert!(session.watched_jobs().is_empty());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(next(&mut session).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watching_twice_shares_the_view() {
        let backend = Arc::new(FakeBackend::new());
        let job_id = backend.add_job(job(JobStatus::Completed));
        let mut session = session(&backend);

        let first = session.watch(job_id).await.unwrap();
        let second = session.watch(job_id).await.unwrap();

        assert!(first.same_channel(&second));
        assert_eq!(backend.fetch_calls(), 1);
    }
}
