//! Vigil Monitor
//!
//! Client-side monitoring core for long-running backend jobs: merges log
//! snapshots with live log streams, owns the live subscriptions, polls job
//! summaries while anything in view is still active, and dispatches job
//! commands.
//!
//! [`MonitorSession`] is the entry point; the other types are its building
//! blocks and are usable on their own.
//!
//! # Example
//!
//! ```no_run
//! use vigil_monitor::{MonitorConfig, MonitorSession, SessionUpdate};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut session = MonitorSession::connect(MonitorConfig::default())?;
//!     let view = session.watch(uuid::Uuid::new_v4()).await?;
//!
//!     while let Some(update) = session.next_update().await {
//!         if let SessionUpdate::StreamClosed { status, .. } = update {
//!             println!("finished with {}", status);
//!         }
//!     }
//!     println!("{} log entries", view.borrow().logs.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod merge;
pub mod poll;
pub mod session;
pub mod stream;

#[cfg(test)]
mod testing;

pub use backend::JobBackend;
pub use command::{BulkOutcome, CommandDispatcher};
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use merge::{LogMerger, MergeDecision};
pub use poll::{FetchTicket, PollCoordinator, PollReport, StatusChange};
pub use session::{JobView, MonitorSession, SessionUpdate};
pub use stream::{ConnectionState, StreamController};
