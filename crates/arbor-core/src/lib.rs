//! # arbor-core
//!
//! Core types for the Arbor supervision tree.
//!
//! A Coordinator splits a request into subtasks, runs them through a Worker
//! Pool, and watches them through an independent Monitor. Every Coordinator
//! and every worker owns exactly one record in the shared state store; the
//! Monitor only reads.
//!
//! ## Layout
//!
//! - [`types`]: run/worker records, identifiers, subtasks
//! - [`events`]: Monitor events and recovery actions
//! - [`store`]: the shared state store (file-backed and in-memory)
//! - [`config`]: `.arbor/config.toml` and environment overrides
//! - [`clock`]: injectable time source

pub mod clock;
pub mod config;
mod error;
pub mod events;
pub mod fail_open;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ArborConfig, Limits, ResilienceConfig, ResourceThresholds, Timing};
pub use error::{ArborError, Result};
pub use events::{EventLine, MonitorEvent, RecoveryAction, WarningKind};
pub use store::{FileStateStore, MemoryStateStore, ReadOnlyStore, StateReader, StateStore};
pub use types::*;
