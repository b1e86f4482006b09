//! The recurring-job scheduler and job executor.
//!
//! Cron-parsed triggers fire jobs; each fire resolves the job's plugin,
//! discovers sources, filters them against the known-source store, archives
//! what's new with bounded concurrency, and enqueues every archived file
//! into the processing pipeline. Jobs and execution history are durable;
//! a JSON state backup covers database loss.

mod cron;
mod engine;
mod executor;
mod scheduler;

pub use cron::{next_run_or_fallback, CronSchedule};
pub use engine::{CronEngine, FireHandler, MISFIRE_GRACE_SECS};
pub use executor::{BatchJobExecutor, JobExecutor};
pub use scheduler::{JobNextRun, JobScheduler, SchedulerStatus};
