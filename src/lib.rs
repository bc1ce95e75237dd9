#![forbid(unsafe_code)]

//! Bounded, streaming, async request/reply client for command-line AI agents.
//!
//! - [`process`] spawns the agent binary with timeouts and streaming output.
//! - [`stream`] turns its line-delimited JSON into events and a response.
//! - [`limiter`] bounds concurrent executions per key.
//! - [`retry`] retries transient launch failures with backoff.
//! - [`correlation`] matches out-of-band replies to pending requests.
//! - [`session`] tracks long-lived connections with idle eviction.
//! - [`client`], [`bus`] and [`ipc`] compose those into callable surfaces.

pub mod bus;
pub mod client;
pub mod config;
pub mod correlation;
pub mod errors;
pub mod ipc;
pub mod limiter;
pub mod process;
pub mod retry;
pub mod session;
pub mod stream;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
