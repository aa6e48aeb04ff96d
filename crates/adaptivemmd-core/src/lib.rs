//! # adaptivemmd-core
//!
//! Core of an adaptive memory-management daemon: watches per-NUMA-node
//! page-allocator state, predicts imminent free-memory exhaustion and
//! high-order fragmentation with a bounded least-squares trend model, and
//! recommends kernel watermark rescaling, per-node compaction, and a
//! negative-dentry cap. A secondary leak heuristic tracks the unaccounted
//! memory residual over time.
//!
//! ## Architecture
//!
//! Sampler → Predictor (+ Rate Tracker) → Actuator, with the neg-dentry
//! sizer and leak detector as side-band bookkeeping. [`Daemon`] owns all
//! per-node state and sequences these once per [`Daemon::run_once`] tick.
//!
//! This crate has no process-level concerns: no CLI parsing, no
//! daemonization, no signal installation. Those belong to the
//! `adaptivemmd` binary crate, which drives this crate's `Daemon` to
//! completion.

pub mod actuator;
pub mod config;
pub mod control;
pub mod error;
pub mod leak;
pub mod negdentry;
pub mod paths;
pub mod predict;
pub mod rates;
pub mod regression;
pub mod sampler;
pub mod snapshot;

pub use config::{CliOverrides, Config, ConfigFileValues};
pub use control::{Daemon, NodeTickReport, TickReport};
pub use error::{Error, Result};
pub use paths::{FixturePaths, LinuxPaths, PagePaths};
pub use predict::Signal;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
