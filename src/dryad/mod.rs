//! Dryad job dispatcher.
//!
//! Executes one job's test procedure against one leased dryad and streams
//! the dispatch status back over the status channel protocol.
//!
//! # Components
//!
//! - [`DryadJobManager`]: create, cancel, list and reap dispatches
//! - [`DryadRunner`]: the remote execution capability a dispatch drives
//! - [`CommandRunner`]: runs test commands locally or over ssh

pub mod manager;
pub mod runner;
pub mod types;

pub use manager::{DispatchSpec, DryadJobManager};
pub use runner::{CommandRunner, DryadRunner, RunSummary};
pub use types::{Dryad, DryadJobFilter, DryadJobInfo, DryadJobStatus};
