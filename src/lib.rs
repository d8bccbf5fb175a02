//! RelaySync library
//!
//! Remote-to-remote transfer pipeline: jobs are accepted over a line-based
//! control service, copied between SSH endpoints by a background worker, and
//! reconciled against persisted state once a second.

pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod progress;
pub mod reconcile;
pub mod server;
pub mod ssh;
pub mod strategy;
pub mod worker;
