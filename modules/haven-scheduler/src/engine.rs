//! The trigger engine: one task per registered cron trigger.
//!
//! Each task projects the next fire time, sleeps, and runs its handler to
//! completion before projecting again — which gives at most one execution
//! in flight per trigger and coalesces ticks that arrive while a previous
//! run is still going. A fire observed later than the misfire grace is
//! logged and dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cron::CronSchedule;

/// How late a fire may be observed before it is treated as missed.
pub const MISFIRE_GRACE_SECS: i64 = 5 * 60;

fn misfire_grace() -> Duration {
    Duration::seconds(MISFIRE_GRACE_SECS)
}

/// Invoked on each trigger fire with the owning job's id.
pub type FireHandler = Arc<dyn Fn(Uuid) -> BoxFuture<'static, ()> + Send + Sync>;

struct Trigger {
    schedule: Arc<CronSchedule>,
    handle: JoinHandle<()>,
}

pub struct CronEngine {
    triggers: Mutex<HashMap<Uuid, Trigger>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for CronEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CronEngine {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            triggers: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Register a trigger. Re-registering an id replaces its trigger.
    pub fn register(&self, id: Uuid, schedule: CronSchedule, handler: FireHandler) {
        let schedule = Arc::new(schedule);
        let task_schedule = schedule.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = task_schedule.upcoming() else {
                    warn!(job_id = %id, "Trigger has no future fire time, stopping");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(wait) => {
                        let lateness = Utc::now() - next;
                        if lateness > misfire_grace() {
                            // Coalesce: the missed tick is dropped, the loop
                            // projects the next one.
                            warn!(job_id = %id, late_secs = lateness.num_seconds(), "Missed scheduled run");
                            continue;
                        }
                        debug!(job_id = %id, "Trigger fired");
                        handler(id).await;
                        debug!(job_id = %id, "Trigger handler finished");
                    }
                }
            }
        });

        let mut triggers = self.triggers.lock().unwrap();
        if let Some(old) = triggers.insert(id, Trigger { schedule, handle }) {
            old.handle.abort();
        }
    }

    /// Remove a trigger, stopping its task. Returns false if unknown.
    pub fn unregister(&self, id: Uuid) -> bool {
        match self.triggers.lock().unwrap().remove(&id) {
            Some(trigger) => {
                trigger.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.triggers.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.triggers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This trigger's own projection of its next fire.
    pub fn next_run(&self, id: Uuid) -> Option<DateTime<Utc>> {
        let triggers = self.triggers.lock().unwrap();
        triggers.get(&id).and_then(|t| t.schedule.upcoming())
    }

    pub fn next_runs(&self) -> Vec<(Uuid, Option<DateTime<Utc>>)> {
        let triggers = self.triggers.lock().unwrap();
        triggers
            .iter()
            .map(|(id, t)| (*id, t.schedule.upcoming()))
            .collect()
    }

    /// Signal every trigger task and wait up to `grace` for in-flight
    /// handlers; stragglers are aborted.
    pub async fn shutdown(&self, grace: StdDuration) {
        let _ = self.shutdown_tx.send(true);
        let drained: Vec<(Uuid, Trigger)> = self.triggers.lock().unwrap().drain().collect();

        for (id, trigger) in drained {
            let mut handle = trigger.handle;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(job_id = %id, "Trigger did not stop within grace, aborting");
                handle.abort();
            }
        }
        info!("Cron engine stopped");
    }
}

impl Drop for CronEngine {
    fn drop(&mut self) {
        for trigger in self.triggers.lock().unwrap().values() {
            trigger.handle.abort();
        }
    }
}
