//! Stream controller
//!
//! Owns the live log subscriptions of a monitoring session, at most one per
//! job. Each subscription runs a reader task that opens the backend stream
//! and forwards tagged signals into a single channel; the session drains
//! that channel and hands each signal back to [`StreamController::route`].
//!
//! Signals carry the id of the subscription that produced them. Once a
//! subscription is stopped or replaced its id is no longer current, so
//! anything it still had in flight is dropped instead of reaching the
//! merge engine.
//!
//! The controller never retries on its own. A failed subscription stays in
//! `Error` until the poll coordinator decides to start a new one.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_client::ClientError;
use vigil_core::dto::log::{StreamEvent, TerminalEvent};

use crate::backend::JobBackend;
use crate::error::{MonitorError, Result};
use crate::merge::{LogMerger, MergeDecision};

/// Identity of one subscription instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Connection state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Error,
}

/// What a reader task observed on its stream
#[derive(Debug)]
pub enum StreamSignal {
    Opened,
    Event(StreamEvent),
    Failed(ClientError),
    /// Stream ended without a terminal event
    Ended,
}

/// A signal tagged with the subscription that produced it
#[derive(Debug)]
pub struct RoutedSignal {
    pub job_id: Uuid,
    pub subscription: SubscriptionId,
    pub signal: StreamSignal,
}

/// Result of routing a signal from the current subscription
#[derive(Debug)]
pub enum StreamOutcome {
    Opened,
    Log {
        sequence: u64,
        decision: MergeDecision,
    },
    /// Job finished; the subscription is closed and the job state should be
    /// refreshed from the backend
    Terminal(TerminalEvent),
    Failed(ClientError),
}

struct Subscription {
    id: SubscriptionId,
    resume_cursor: u64,
    state: ConnectionState,
    terminal: bool,
    reader: Option<JoinHandle<()>>,
}

impl Subscription {
    fn abort_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

/// Lifecycle owner for live log subscriptions
pub struct StreamController {
    backend: Arc<dyn JobBackend>,
    signals_tx: mpsc::UnboundedSender<RoutedSignal>,
    signals_rx: mpsc::UnboundedReceiver<RoutedSignal>,
    subscriptions: HashMap<Uuid, Subscription>,
    next_id: u64,
}

impl StreamController {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            signals_tx,
            signals_rx,
            subscriptions: HashMap::new(),
            next_id: 0,
        }
    }

    /// Open a live subscription for `job_id`, resuming after `resume_cursor`
    ///
    /// Fails if a subscription for the job is already opening or open, or
    /// if the job was already seen terminal. A failed or closed
    /// subscription is replaced.
    pub fn start(&mut self, job_id: Uuid, resume_cursor: u64) -> Result<SubscriptionId> {
        if let Some(existing) = self.subscriptions.get(&job_id) {
            if existing.terminal {
                return Err(MonitorError::JobFinished(job_id));
            }
            if matches!(
                existing.state,
                ConnectionState::Opening | ConnectionState::Open
            ) {
                return Err(MonitorError::SubscriptionActive(job_id));
            }
            debug!(
                "Replacing {:?} subscription for job {}",
                existing.state, job_id
            );
        }

        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let reader = self.spawn_reader(job_id, id, resume_cursor);

        // Dropping a replaced subscription aborts its reader
        self.subscriptions.insert(
            job_id,
            Subscription {
                id,
                resume_cursor,
                state: ConnectionState::Opening,
                terminal: false,
                reader: Some(reader),
            },
        );

        info!(
            "Opening log stream for job {} after #{}",
            job_id, resume_cursor
        );
        Ok(id)
    }

    /// Stop the subscription for `job_id`
    ///
    /// Idempotent. Returns whether a subscription existed. Signals already
    /// in flight from it are dropped by [`route`](Self::route).
    pub fn stop(&mut self, job_id: Uuid) -> bool {
        match self.subscriptions.remove(&job_id) {
            Some(_) => {
                debug!("Stopped log stream for job {}", job_id);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        if !self.subscriptions.is_empty() {
            debug!("Stopping {} log stream(s)", self.subscriptions.len());
        }
        self.subscriptions.clear();
    }

    /// Wait for the next signal from any reader task
    pub async fn next_signal(&mut self) -> Option<RoutedSignal> {
        self.signals_rx.recv().await
    }

    /// Apply a signal to its subscription and the job's merge engine
    ///
    /// Returns `None` when the signal came from a subscription that is no
    /// longer current (stopped, replaced, failed or already terminal).
    pub fn route(&mut self, routed: RoutedSignal, logs: &mut LogMerger) -> Option<StreamOutcome> {
        let job_id = routed.job_id;
        let Some(sub) = self.subscriptions.get_mut(&job_id) else {
            debug!("Dropping signal for job {} without subscription", job_id);
            return None;
        };

        if sub.id != routed.subscription
            || sub.terminal
            || matches!(sub.state, ConnectionState::Closed | ConnectionState::Error)
        {
            debug!("Dropping signal from stale subscription of job {}", job_id);
            return None;
        }

        let outcome = match routed.signal {
            StreamSignal::Opened => {
                sub.state = ConnectionState::Open;
                StreamOutcome::Opened
            }
            StreamSignal::Event(StreamEvent::Log(entry)) => {
                if entry.job_id != job_id {
                    warn!(
                        "Dropping log entry #{} of job {} delivered on stream of job {}",
                        entry.sequence_number, entry.job_id, job_id
                    );
                    return None;
                }
                let sequence = entry.sequence_number;
                let decision = logs.reconcile(entry);
                if decision == MergeDecision::Accept {
                    sub.resume_cursor = logs.cursor();
                }
                StreamOutcome::Log { sequence, decision }
            }
            StreamSignal::Event(StreamEvent::Terminal(event)) if !event.status.is_terminal() => {
                sub.state = ConnectionState::Error;
                sub.abort_reader();
                warn!(
                    "Log stream for job {} sent a terminal event with status {}",
                    job_id, event.status
                );
                StreamOutcome::Failed(ClientError::StreamClosed(format!(
                    "terminal event with non-terminal status {}",
                    event.status
                )))
            }
            StreamSignal::Event(StreamEvent::Terminal(event)) => {
                sub.terminal = true;
                sub.state = ConnectionState::Closed;
                sub.abort_reader();
                info!(
                    "Job {} finished with {}, log stream closed",
                    job_id, event.status
                );
                StreamOutcome::Terminal(event)
            }
            StreamSignal::Failed(err) => {
                sub.state = ConnectionState::Error;
                sub.abort_reader();
                warn!("Log stream for job {} failed: {}", job_id, err);
                StreamOutcome::Failed(err)
            }
            StreamSignal::Ended => {
                sub.state = ConnectionState::Error;
                sub.abort_reader();
                warn!("Log stream for job {} ended before the job finished", job_id);
                StreamOutcome::Failed(ClientError::StreamClosed(
                    "stream ended before a terminal event".to_string(),
                ))
            }
        };

        Some(outcome)
    }

    pub fn state(&self, job_id: Uuid) -> ConnectionState {
        self.subscriptions
            .get(&job_id)
            .map(|sub| sub.state)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Whether the job has a subscription that is opening or open
    pub fn is_live(&self, job_id: Uuid) -> bool {
        matches!(
            self.state(job_id),
            ConnectionState::Opening | ConnectionState::Open
        )
    }

    /// Whether the subscription of the job has seen the terminal event
    pub fn is_terminal(&self, job_id: Uuid) -> bool {
        self.subscriptions
            .get(&job_id)
            .is_some_and(|sub| sub.terminal)
    }

    pub fn resume_cursor(&self, job_id: Uuid) -> Option<u64> {
        self.subscriptions.get(&job_id).map(|sub| sub.resume_cursor)
    }

    /// Number of subscriptions currently opening or open
    pub fn live_count(&self) -> usize {
        self.subscriptions
            .values()
            .filter(|sub| {
                matches!(
                    sub.state,
                    ConnectionState::Opening | ConnectionState::Open
                )
            })
            .count()
    }

    fn spawn_reader(&self, job_id: Uuid, id: SubscriptionId, after: u64) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let signals = self.signals_tx.clone();

        tokio::spawn(async move {
            let send = |signal: StreamSignal| {
                signals
                    .send(RoutedSignal {
                        job_id,
                        subscription: id,
                        signal,
                    })
                    .is_ok()
            };

            let mut stream = match backend.open_log_stream(job_id, after).await {
                Ok(stream) => stream,
                Err(e) => {
                    send(StreamSignal::Failed(e));
                    return;
                }
            };

            if !send(StreamSignal::Opened) {
                return;
            }

            while let Some(item) = stream.next().await {
                let signal = match item {
                    Ok(event) => StreamSignal::Event(event),
                    Err(e) => {
                        send(StreamSignal::Failed(e));
                        return;
                    }
                };
                if !send(signal) {
                    return;
                }
            }

            send(StreamSignal::Ended);
        })
    }
}
