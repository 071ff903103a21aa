//! mailpulse-core: Core library for mailpulse
//!
//! Turns an MTA's cumulative metrics endpoint and its delivery logs into
//! windowed throughput, per-minute rates, all-time peaks and per-domain
//! deferral history, and keeps that history across restarts.
//!
//! # Architecture
//!
//! ```text
//! metrics endpoint → Counter Normalizer → Sample Store → Windows / Peaks / Rates
//!                                                    ↘
//! tail commands → Tail Supervisors → Classifier → Ledgers → Dashboard Snapshot
//!                                                    ↗
//!                            State File (periodic + shutdown flush)
//! ```
//!
//! # Modules
//!
//! - `counters`: Counter normalization over heterogeneous metric shapes
//! - `samples`: Sample store, window sums and peak records
//! - `rates`: Per-minute rate and queue-depth series
//! - `classify`: JSON/text log line classification rule tables
//! - `ledger`: Deferral log, per-domain error ledger, recent events
//! - `tailer`: Subprocess-backed tail supervisors
//! - `persist`: Durable state file
//! - `state`: Single-owner pipeline state
//! - `query`: Dashboard snapshot read model
//! - `source`: Metrics document sources
//! - `runtime`: Timer, tail and shutdown orchestration
//! - `config`: Configuration management
//! - `logging`: Tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod classify;
pub mod config;
pub mod counters;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod persist;
pub mod query;
pub mod rates;
pub mod ring_buffer;
pub mod runtime;
pub mod samples;
pub mod source;
pub mod state;
pub mod tailer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
