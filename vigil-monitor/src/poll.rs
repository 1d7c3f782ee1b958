//! Poll coordinator
//!
//! Decides when a page of job summaries is worth re-fetching and when a
//! watched job deserves a new live subscription. It never performs I/O: the
//! session runs the fetches and the timer, and feeds the results back here.
//!
//! Polling only continues while at least one job in view is non-terminal.
//! Once every summary is terminal the coordinator disarms until the filter
//! changes or [`PollCoordinator::rearm`] is called.
//!
//! Every page and snapshot comes with the [`FetchTicket`] it was issued
//! with. A summary is only replaced by data fetched after the data it holds.
//!
//! Stream restarts are granted at most once per job per tick, and only
//! `max_stream_restarts` times in a row before the job is given up on.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::domain::job::{Job, JobChange, JobStatus};
use vigil_core::dto::job::{JobFilter, JobPage};

use crate::stream::{ConnectionState, StreamController};

/// Issue order of a fetch
///
/// Tickets grow monotonically within a session; a larger ticket means the
/// request was sent later.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchTicket(pub u64);

/// Status transition observed between two polls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub job_id: Uuid,
    /// `None` when the job is new to the view
    pub from: Option<JobStatus>,
    pub to: JobStatus,
}

/// Result of applying one fetched page
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub changes: Vec<StatusChange>,
    /// Every job in view is terminal; polling is now paused
    pub all_terminal: bool,
}

pub struct PollCoordinator {
    filter: Option<JobFilter>,
    summaries: Vec<Job>,
    fetched: HashMap<Uuid, FetchTicket>,
    armed: bool,
    restart_attempts: HashMap<Uuid, u32>,
    max_stream_restarts: u32,
}

impl PollCoordinator {
    pub fn new(max_stream_restarts: u32) -> Self {
        Self {
            filter: None,
            summaries: Vec::new(),
            fetched: HashMap::new(),
            armed: false,
            restart_attempts: HashMap::new(),
            max_stream_restarts,
        }
    }

    /// The active list view, if any
    pub fn filter(&self) -> Option<&JobFilter> {
        self.filter.as_ref()
    }

    /// Switch the list view
    ///
    /// Returns `true` if the filter changed, in which case the previous
    /// summaries are discarded and polling is re-armed.
    pub fn set_filter(&mut self, filter: JobFilter) -> bool {
        if self.filter.as_ref() == Some(&filter) {
            return false;
        }
        debug!("Poll filter changed to {:?}", filter);
        self.filter = Some(filter);
        self.summaries.clear();
        self.fetched.clear();
        self.armed = true;
        true
    }

    /// Drop the list view and stop polling it
    pub fn clear_filter(&mut self) {
        self.filter = None;
        self.summaries.clear();
        self.fetched.clear();
        self.armed = false;
    }

    /// Resume polling after a new job appeared in the view
    pub fn rearm(&mut self) {
        if self.filter.is_some() && !self.armed {
            debug!("Polling re-armed");
            self.armed = true;
        }
    }

    /// Whether the list view should be fetched on the next tick
    pub fn wants_page(&self) -> bool {
        self.filter.is_some() && self.armed
    }

    /// Latest summaries of the list view
    pub fn summaries(&self) -> &[Job] {
        &self.summaries
    }

    /// Fold a fetched page into the view and diff statuses
    ///
    /// Summaries already seen terminal keep their terminal status even if the
    /// page reports otherwise. A summary refreshed by a fetch issued after
    /// `ticket` is kept as is.
    pub fn apply(&mut self, page: JobPage, ticket: FetchTicket) -> PollReport {
        let mut previous: HashMap<Uuid, Job> =
            self.summaries.drain(..).map(|job| (job.id, job)).collect();
        let mut changes = Vec::new();

        for incoming in page.items {
            let job = match previous.remove(&incoming.id) {
                Some(held) if self.is_newer(held.id, ticket) => {
                    debug!("Keeping newer summary of job {}", held.id);
                    held
                }
                Some(mut held) => {
                    self.fetched.insert(held.id, ticket);
                    match held.absorb(incoming) {
                        JobChange::StatusChanged { from, to } => changes.push(StatusChange {
                            job_id: held.id,
                            from: Some(from),
                            to,
                        }),
                        JobChange::Rejected => debug!(
                            "Ignoring summary that would move job {} back from {}",
                            held.id, held.status
                        ),
                        JobChange::Unchanged | JobChange::Updated => {}
                    }
                    held
                }
                None => {
                    self.fetched.insert(incoming.id, ticket);
                    changes.push(StatusChange {
                        job_id: incoming.id,
                        from: None,
                        to: incoming.status,
                    });
                    incoming
                }
            };
            self.summaries.push(job);
        }
        let summaries = &self.summaries;
        self.fetched
            .retain(|job_id, _| summaries.iter().any(|job| job.id == *job_id));

        let all_terminal = self.summaries.iter().all(|job| job.status.is_terminal());
        if all_terminal && self.armed {
            info!(
                "All {} job(s) in view are terminal, polling paused",
                self.summaries.len()
            );
        }
        self.armed = !all_terminal;

        PollReport {
            changes,
            all_terminal,
        }
    }

    /// Apply a status learned outside a poll (stream terminal event, command)
    ///
    /// Returns whether a summary in view changed.
    pub fn apply_status(&mut self, job_id: Uuid, status: JobStatus) -> bool {
        let Some(job) = self.summaries.iter_mut().find(|job| job.id == job_id) else {
            return false;
        };
        let changed = matches!(
            job.apply_status(status, None),
            JobChange::StatusChanged { .. }
        );
        if changed && self.summaries.iter().all(|job| job.status.is_terminal()) {
            self.armed = false;
        }
        changed
    }

    /// Apply a full snapshot learned outside a poll, fetched with `ticket`
    ///
    /// Ignored if the summary already holds data from a later fetch.
    pub fn apply_snapshot(&mut self, snapshot: &Job, ticket: FetchTicket) -> bool {
        if self.is_newer(snapshot.id, ticket) {
            debug!("Ignoring outdated snapshot of job {} for the list view", snapshot.id);
            return false;
        }
        let Some(job) = self.summaries.iter_mut().find(|job| job.id == snapshot.id) else {
            return false;
        };
        self.fetched.insert(snapshot.id, ticket);
        !matches!(
            job.absorb(snapshot.clone()),
            JobChange::Unchanged | JobChange::Rejected
        )
    }

    /// Whether the next tick has any work to do
    ///
    /// `needing` are the watched jobs whose stream is down; see
    /// [`restart_candidates`](Self::restart_candidates).
    pub fn should_poll(&self, needing: &[Uuid]) -> bool {
        self.wants_page() || self.has_grantable(needing)
    }

    /// Watched, non-terminal jobs whose subscription is closed or failed
    ///
    /// `watched` pairs each watched job with its last known status.
    pub fn restart_candidates<I>(&self, watched: I, streams: &StreamController) -> Vec<Uuid>
    where
        I: IntoIterator<Item = (Uuid, JobStatus)>,
    {
        watched
            .into_iter()
            .filter(|(job_id, status)| {
                !status.is_terminal()
                    && !streams.is_terminal(*job_id)
                    && matches!(
                        streams.state(*job_id),
                        ConnectionState::Closed | ConnectionState::Error
                    )
            })
            .map(|(job_id, _)| job_id)
            .collect()
    }

    /// Whether any of the jobs needing a stream may still be restarted
    pub fn has_grantable(&self, needing: &[Uuid]) -> bool {
        needing.iter().any(|id| self.attempts(*id) < self.max_stream_restarts)
    }

    /// Grant this tick's stream restarts for jobs needing one
    ///
    /// Each granted job uses up one attempt until
    /// [`record_stream_opened`](Self::record_stream_opened) resets it.
    pub fn grant_restarts(&mut self, needing: &[Uuid]) -> Vec<Uuid> {
        let mut granted = Vec::new();
        for job_id in needing {
            let attempts = self.restart_attempts.entry(*job_id).or_insert(0);
            if *attempts >= self.max_stream_restarts {
                continue;
            }
            *attempts += 1;
            if *attempts == self.max_stream_restarts {
                warn!(
                    "Last stream restart attempt for job {} ({} in a row)",
                    job_id, attempts
                );
            }
            granted.push(*job_id);
        }
        granted
    }

    pub fn record_stream_opened(&mut self, job_id: Uuid) {
        self.restart_attempts.remove(&job_id);
    }

    /// Forget restart bookkeeping of a job no longer watched
    pub fn forget(&mut self, job_id: Uuid) {
        self.restart_attempts.remove(&job_id);
    }

    /// The summary of `job_id` comes from a fetch issued after `ticket`
    fn is_newer(&self, job_id: Uuid, ticket: FetchTicket) -> bool {
        self.fetched
            .get(&job_id)
            .is_some_and(|held| *held > ticket)
    }

    fn attempts(&self, job_id: Uuid) -> u32 {
        self.restart_attempts.get(&job_id).copied().unwrap_or(0)
    }
}
