//! Deferred Core: leased job runner and global capacity autoscaler.

pub mod autoscale;
pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
