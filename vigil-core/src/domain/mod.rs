//! Core domain types
//!
//! These types are read-only copies of records owned by the job backend.
//! The monitor never invents a status or a log entry; it only reconciles
//! what the backend reports.

pub mod job;
pub mod log;
