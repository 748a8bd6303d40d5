//! Retention sweeps.
//!
//! Finished tasks past the retention window lose their files and become
//! EXPIRED. EXPIRED records stay queryable for a grace period, then are
//! dropped from the registry. PENDING and RUNNING tasks are never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::jobs::registry::TaskRegistry;
use crate::storage::FileStore;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks moved to EXPIRED.
    pub expired: usize,
    /// EXPIRED records dropped from the registry.
    pub removed: usize,
    /// Tasks left for the next sweep because a file could not be deleted.
    pub deferred: usize,
}

pub struct Janitor {
    registry: Arc<TaskRegistry>,
    store: FileStore,
    retention: Duration,
    expired_grace: Duration,
}

impl Janitor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: FileStore,
        retention: Duration,
        expired_grace: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            retention,
            expired_grace,
        }
    }

    /// Run one sweep against the current time.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as if the clock read `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for task in self.registry.list_expired(cutoff(now, self.retention)).await {
            let failures = self.store.remove_all(&task.owned_files()).await;
            if failures > 0 {
                warn!(task_id = %task.id, failures, "Could not remove all task files, retrying next sweep");
                report.deferred += 1;
                continue;
            }

            match self
                .registry
                .update(task.id, |t| t.expire("retention window elapsed"))
                .await
            {
                Ok(()) => {
                    debug!(task_id = %task.id, "Task expired");
                    report.expired += 1;
                }
                Err(e) => error!(task_id = %task.id, error = %e, "Failed to expire task"),
            }
        }

        for id in self
            .registry
            .list_removable(cutoff(now, self.expired_grace))
            .await
        {
            if self.registry.remove(id).await.is_ok() {
                debug!(task_id = %id, "Expired task removed");
                report.removed += 1;
            }
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                removed = report.removed,
                deferred = report.deferred,
                "Janitor sweep finished"
            );
        }
        report
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Spawn the periodic sweep. Runs until `shutdown` flips to `true` or its
/// sender is dropped.
pub fn spawn_janitor(
    janitor: Arc<Janitor>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = every.as_secs(),
            retention_secs = janitor.retention.as_secs(),
            "Janitor started"
        );

        let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Janitor stopping");
                        break;
                    }
                }
                _ = interval.tick() => {
                    janitor.sweep().await;
                }
            }
        }
    })
}
