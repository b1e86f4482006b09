//! Persistence for the archival orchestrator: job definitions and
//! execution history in SQLite, known-source sets as one JSON artifact
//! per plugin in the data directory.

mod error;
mod executions;
mod jobs;
mod known_sources;
mod schema;

pub use error::StoreError;
pub use executions::{ExecutionRecord, ExecutionStore};
pub use jobs::{JobStatsUpdate, JobStore};
pub use known_sources::{KnownSourceStats, KnownSourceStore};
pub use schema::connect;

pub type Result<T> = std::result::Result<T, StoreError>;
