//! In-process pub/sub for the archival orchestrator.
//!
//! Every component publishes typed [`Event`]s onto a shared [`EventBus`];
//! pipeline-scope events carry the owning context's correlation id so
//! subscribers can stitch together the life of one work item.

mod bus;
mod types;

pub use bus::{EventBus, HistoryFilter, Subscription};
pub use types::{Event, EventType};
