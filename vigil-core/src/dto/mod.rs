//! Data Transfer Objects for backend communication
//!
//! Lightweight request/response shapes used by the HTTP client and the
//! monitor. Filters are opaque to the monitor; it only uses them as fetch keys.

pub mod job;
pub mod log;
