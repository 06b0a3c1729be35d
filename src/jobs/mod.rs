//! Job registry.
//!
//! Accepts job specifications, assigns job IDs and drives each job through
//! parsing, image download, dryad acquisition and dispatch.

pub mod job;
pub mod manager;
mod table;

pub use job::{JobFilter, JobInfo, JobSortKey, JobStatus};
pub use manager::{JobManager, RESULTS_ALIAS, SPEC_ALIAS};
