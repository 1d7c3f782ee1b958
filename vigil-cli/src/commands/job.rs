//! Job command handlers
//!
//! Handles all job-related CLI commands including listing, viewing details,
//! following logs and issuing cancel / bulk status changes.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use tracing::debug;
use uuid::Uuid;
use vigil_core::domain::job::{Job, JobStatus, JobType};
use vigil_core::domain::log::{LogEntry, LogLevel};
use vigil_core::dto::job::JobFilter;
use vigil_monitor::{CommandDispatcher, JobView, MonitorSession, SessionUpdate};

use crate::config::Config;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// List jobs
    List {
        /// Only jobs in this status
        #[arg(long)]
        status: Option<JobStatus>,

        /// Only jobs of this type
        #[arg(long = "type")]
        job_type: Option<JobType>,

        /// Page number, starting at 0
        #[arg(long, default_value_t = 0)]
        page: u32,

        /// Page size (defaults to VIGIL_PAGE_SIZE or 20)
        #[arg(long)]
        size: Option<u32>,

        /// Keep polling and print status changes until every job is finished
        #[arg(short, long)]
        watch: bool,
    },
    /// Get job details
    Get {
        /// Job ID
        id: Uuid,
    },
    /// Get job logs
    Logs {
        /// Job ID
        id: Uuid,

        /// Follow live logs until the job finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Cancel a job
    Cancel {
        /// Job ID
        id: Uuid,
    },
    /// Move several jobs to a status in one request
    BulkStatus {
        /// Target status
        #[arg(long)]
        status: JobStatus,

        /// Job IDs
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },
}

/// Handle job commands
///
/// Routes job subcommands to their respective handlers.
///
/// # Arguments
/// * `command` - The job command to execute
/// * `config` - The CLI configuration
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    match command {
        JobCommands::List {
            status,
            job_type,
            page,
            size,
            watch,
        } => {
            let filter = JobFilter {
                status,
                job_type,
                page,
                size: size.unwrap_or(config.monitor.page_size),
            };
            if watch {
                watch_jobs(config, filter).await
            } else {
                list_jobs(config, &filter).await
            }
        }
        JobCommands::Get { id } => get_job(config, id).await,
        JobCommands::Logs { id, follow } => {
            if follow {
                follow_job_logs(config, id).await
            } else {
                get_job_logs(config, id).await
            }
        }
        JobCommands::Cancel { id } => cancel_job(config, id).await,
        JobCommands::BulkStatus { status, ids } => bulk_status(config, ids, status).await,
    }
}

/// List one page of jobs
async fn list_jobs(config: &Config, filter: &JobFilter) -> Result<()> {
    let page = config.client()?.list_jobs(filter).await?;

    if page.items.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!(
            "{}",
            format!(
                "Showing {} of {} job(s) (page {}):",
                page.items.len(),
                page.total,
                page.page
            )
            .bold()
        );
        println!();
        for job in &page.items {
            print_job_summary(job);
        }
    }

    Ok(())
}

/// Poll a page of jobs and print status changes until all are finished
async fn watch_jobs(config: &Config, filter: JobFilter) -> Result<()> {
    let mut session = MonitorSession::connect(config.monitor.clone())?;
    session.set_filter(filter);

    let mut first = true;
    loop {
        let update = tokio::select! {
            update = session.next_update() => update,
            _ = tokio::signal::ctrl_c() => {
                session.close();
                println!("{}", "Stopped watching.".dimmed());
                return Ok(());
            }
        };

        match update {
            Some(SessionUpdate::PollCompleted { changes, .. }) if first => {
                first = false;
                debug!("Initial page with {} change(s)", changes.len());
                if session.summaries().is_empty() {
                    println!("{}", "No jobs found.".yellow());
                }
                for job in session.summaries() {
                    print_job_summary(job);
                }
            }
            Some(SessionUpdate::PollCompleted { changes, .. }) => {
                for change in changes {
                    let from = change
                        .from
                        .map(|status| colorize_status(&status).to_string())
                        .unwrap_or_else(|| "new".dimmed().to_string());
                    println!(
                        "{} {} {} → {}",
                        chrono::Local::now().format("%H:%M:%S").to_string().dimmed(),
                        change.job_id.to_string().dimmed(),
                        from,
                        colorize_status(&change.to)
                    );
                }
            }
            Some(SessionUpdate::FetchFailed { reason, .. }) => {
                println!("{} {}", "⚠ Poll failed:".yellow(), reason);
            }
            Some(_) => {}
            None => break,
        }
    }

    println!("{}", "All jobs in view are finished.".green());
    Ok(())
}

/// Get and display a single job
async fn get_job(config: &Config, id: Uuid) -> Result<()> {
    let job = config.client()?.fetch_job(id).await?;

    print_job_details(&job);

    Ok(())
}

/// Get and display the logs produced so far
async fn get_job_logs(config: &Config, id: Uuid) -> Result<()> {
    let page = config.client()?.fetch_logs(id, None).await?;

    if page.entries.is_empty() {
        println!("{}", "No logs found for this job.".yellow());
    } else {
        println!("{}", format!("Logs for job {}:", id).bold());
        println!("{}", "─".repeat(80).dimmed());
        for log in &page.entries {
            print_log_entry(log);
        }
        println!("{}", "─".repeat(80).dimmed());
    }

    if !page.is_complete {
        println!("{}", "Job is still running, use --follow for live logs.".dimmed());
    }

    Ok(())
}

/// Follow the logs of a job until it finishes
async fn follow_job_logs(config: &Config, id: Uuid) -> Result<()> {
    let mut session = MonitorSession::connect(config.monitor.clone())?;
    let view = session
        .watch(id)
        .await
        .with_context(|| format!("Failed to watch job {}", id))?;

    println!("{}", format!("Following logs for job {}:", id).bold());
    println!("{}", "─".repeat(80).dimmed());

    let mut printed = print_new_entries(&view.borrow(), 0, false);

    loop {
        let update = tokio::select! {
            update = session.next_update() => update,
            _ = tokio::signal::ctrl_c() => {
                session.close();
                break;
            }
        };

        let Some(update) = update else {
            break;
        };

        match update {
            SessionUpdate::LogsAppended { .. } => {
                printed = print_new_entries(&view.borrow(), printed, false);
            }
            SessionUpdate::StatusChanged { to, .. } => {
                println!("{} {}", "● Status:".bold(), colorize_status(&to));
            }
            SessionUpdate::Stale { .. } => {
                println!(
                    "{}",
                    "⚠ No activity for a while, the job may be stuck".yellow()
                );
            }
            SessionUpdate::StreamFailed { reason, .. } => {
                println!(
                    "{} {}",
                    "⚠ Live updates unavailable:".yellow(),
                    reason.dimmed()
                );
            }
            SessionUpdate::StreamOpened { .. } => {
                debug!("Live log stream for job {} is open", id);
            }
            SessionUpdate::LogsMissing { ranges, .. } => {
                let ranges: Vec<String> = ranges
                    .iter()
                    .map(|range| {
                        if range.start() == range.end() {
                            format!("#{}", range.start())
                        } else {
                            format!("#{}-#{}", range.start(), range.end())
                        }
                    })
                    .collect();
                println!(
                    "{} {}",
                    "⚠ Log entries missing from the backend:".yellow(),
                    ranges.join(", ")
                );
            }
            SessionUpdate::JobVanished { .. } => {
                anyhow::bail!("Job {} no longer exists", id);
            }
            _ => {}
        }
    }

    let view = view.borrow();
    print_new_entries(&view, printed, true);
    println!("{}", "─".repeat(80).dimmed());

    if view.job.status.is_terminal() {
        println!("Job finished: {}", colorize_status(&view.job.status));
    } else if view.live_unavailable {
        println!(
            "{}",
            format!(
                "Live updates unavailable, last known status is {}",
                view.job.status
            )
            .yellow()
        );
    }
    if view.logs.anomalies() > 0 {
        println!(
            "{}",
            format!(
                "⚠ {} log entries arrived out of order and were dropped",
                view.logs.anomalies()
            )
            .yellow()
        );
    }

    Ok(())
}

/// Cancel a job and print the status the backend reports
async fn cancel_job(config: &Config, id: Uuid) -> Result<()> {
    let dispatcher = CommandDispatcher::new(Arc::new(config.client()?));
    let job = dispatcher.cancel(id).await?;

    if job.status.is_terminal() {
        println!(
            "{} Job {} is {}",
            "✓".green(),
            id.to_string().cyan(),
            colorize_status(&job.status)
        );
    } else {
        println!(
            "{} Cancellation requested, job {} is still {}",
            "…".yellow(),
            id.to_string().cyan(),
            colorize_status(&job.status)
        );
    }

    Ok(())
}

/// Change the status of several jobs at once
async fn bulk_status(config: &Config, ids: Vec<Uuid>, status: JobStatus) -> Result<()> {
    let dispatcher = CommandDispatcher::new(Arc::new(config.client()?));
    let outcome = dispatcher.bulk_update_status(ids, status).await?;

    println!(
        "{}",
        format!(
            "{} job(s) moved to {}:",
            outcome.success_ids.len(),
            outcome.status
        )
        .bold()
    );
    for id in &outcome.success_ids {
        println!("  {} {}", "✓".green(), id);
    }

    if !outcome.is_complete_success() {
        println!(
            "{}",
            format!("{} job(s) failed:", outcome.failure_count())
                .red()
                .bold()
        );
        for id in &outcome.failed_ids {
            println!("  {} {}", "✗".red(), id);
        }
    }

    Ok(())
}

/// Print merged entries after sequence `printed`
///
/// Only the contiguous prefix is printed so an entry that fills a hole is
/// never skipped; `flush` prints everything held.
fn print_new_entries(view: &JobView, printed: u64, flush: bool) -> u64 {
    let upto = if flush {
        view.logs.highest().unwrap_or(0)
    } else {
        view.logs.cursor()
    };

    let mut last = printed;
    for entry in view.logs.entries() {
        if entry.sequence_number > printed && entry.sequence_number <= upto {
            print_log_entry(entry);
            last = entry.sequence_number;
        }
    }
    last
}

/// Print a job summary
fn print_job_summary(job: &Job) {
    let status_colored = colorize_status(&job.status);

    println!("  {} Job {}", "▸".cyan(), job.id.to_string().dimmed());
    println!("    Type:     {}", job.job_type);
    println!("    Status:   {}", status_colored);
    if let Some(progress) = job.progress {
        println!("    Progress: {}%", progress);
    }
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

/// Print detailed job information
fn print_job_details(job: &Job) {
    let status_colored = colorize_status(&job.status);

    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  Type:        {}", job.job_type);
    println!("  Status:      {}", status_colored);
    println!(
        "  Created:     {}",
        job.created_at.format("%Y-%m-%d %H:%M:%S")
    );

    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(completed) = job.completed_at {
        println!("  Completed:   {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(duration) = job.duration(chrono::Utc::now()) {
        println!("  Duration:    {}s", duration.num_seconds());
    }

    if let Some(progress) = job.progress {
        println!("  Progress:    {}%", progress);
    }

    if let Some(step) = &job.current_step {
        println!("  Step:        {}", step);
    }

    if let Some(error) = &job.error_message {
        println!("\n{}", "Error:".bold());
        println!("{}", error.red());
    }
}

/// Print a log entry
fn print_log_entry(log: &LogEntry) {
    let level_str = format!("{:?}", log.level).to_uppercase();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warn => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };

    let step = log
        .step
        .as_deref()
        .map(|step| format!("{} ", step.dimmed()))
        .unwrap_or_default();

    println!(
        "{} {} [{}] {}{}",
        format!("#{}", log.sequence_number).dimmed(),
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        level_colored,
        step,
        log.message
    );

    if let Some(metadata) = &log.metadata {
        if let Ok(compact) = serde_json::to_string(metadata) {
            println!("    {}", compact.dimmed());
        }
    }
}

/// Colorize job status for display
fn colorize_status(status: &JobStatus) -> colored::ColoredString {
    let status_str = status.to_string();
    match status {
        JobStatus::Pending | JobStatus::Queued | JobStatus::Waiting => status_str.yellow(),
        JobStatus::Running => status_str.cyan(),
        JobStatus::Completed => status_str.green(),
        JobStatus::Failed => status_str.red(),
        JobStatus::Cancelled | JobStatus::Skipped => status_str.dimmed(),
    }
}
