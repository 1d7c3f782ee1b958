//! Vigil Core
//!
//! Core types shared by the Vigil job monitor.
//!
//! This crate contains:
//! - Domain types: the job record and its status state machine, log entries
//! - DTOs: request/response shapes exchanged with the job backend

pub mod domain;
pub mod dto;
