//! In-memory task table.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::JobError;
use crate::jobs::state::{Task, TaskFiles, TaskId, TaskState, TransitionError};

/// Owns every task record. All external references are [`TaskId`]s; callers
/// only ever receive cloned snapshots.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Generate an identifier not currently present in the table.
    pub async fn allocate_id(&self) -> TaskId {
        let tasks = self.tasks.read().await;
        loop {
            let id = TaskId::new();
            if !tasks.contains_key(&id) {
                return id;
            }
        }
    }

    /// Create a pending task with a fresh identifier.
    pub async fn create(&self, files: TaskFiles) -> Task {
        let mut tasks = self.tasks.write().await;
        let mut id = TaskId::new();
        while tasks.contains_key(&id) {
            id = TaskId::new();
        }
        let task = Task::new(id, files);
        tasks.insert(id, task.clone());
        task
    }

    /// Create a pending task under an identifier from [`Self::allocate_id`].
    pub async fn create_with_id(&self, id: TaskId, files: TaskFiles) -> Result<Task, JobError> {
        let mut tasks = self.tasks.write().await;
        if let Some(existing) = tasks.get(&id) {
            return Err(JobError::InvalidTransition {
                id,
                from: existing.state,
                to: TaskState::Pending,
            });
        }
        let task = Task::new(id, files);
        tasks.insert(id, task.clone());
        Ok(task)
    }

    /// Get a snapshot of a task.
    pub async fn get(&self, id: TaskId) -> Result<Task, JobError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(JobError::NotFound { id })
    }

    /// Atomically mutate a task. A rejected transition leaves the record
    /// untouched as far as the state machine is concerned.
    pub async fn update<F, R>(&self, id: TaskId, f: F) -> Result<R, JobError>
    where
        F: FnOnce(&mut Task) -> Result<R, TransitionError>,
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(JobError::NotFound { id })?;
        f(task).map_err(|e| JobError::InvalidTransition {
            id,
            from: e.from,
            to: e.to,
        })
    }

    /// Finished (succeeded/failed) tasks whose retention anchor predates `cutoff`.
    pub async fn list_expired(&self, cutoff: DateTime<Utc>) -> Vec<Task> {
        let mut expired: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| matches!(t.state, TaskState::Succeeded | TaskState::Failed))
            .filter(|t| t.retention_anchor() < cutoff)
            .cloned()
            .collect();
        expired.sort_by_key(|t| t.retention_anchor());
        expired
    }

    /// Expired tasks whose grace period ended before `cutoff`.
    pub async fn list_removable(&self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.state == TaskState::Expired)
            .filter(|t| t.expired_at.is_some_and(|at| at < cutoff))
            .map(|t| t.id)
            .collect()
    }

    /// Remove a task from the table.
    pub async fn remove(&self, id: TaskId) -> Result<Task, JobError> {
        self.tasks
            .write()
            .await
            .remove(&id)
            .ok_or(JobError::NotFound { id })
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Point-in-time counts and latency aggregation.
    pub async fn summary(&self) -> RegistrySummary {
        let tasks = self.tasks.read().await;

        let mut summary = RegistrySummary::default();
        let mut latency_total_ms: i64 = 0;
        let mut latency_samples: i64 = 0;

        for task in tasks.values() {
            match task.state {
                TaskState::Pending => summary.pending += 1,
                TaskState::Running => summary.running += 1,
                TaskState::Succeeded => summary.succeeded += 1,
                TaskState::Failed => summary.failed += 1,
                TaskState::Expired => summary.expired += 1,
            }
            if let Some(latency) = task.latency() {
                latency_total_ms += latency.num_milliseconds().max(0);
                latency_samples += 1;
            }
        }

        summary.total = tasks.len();
        if latency_samples > 0 {
            summary.average_latency_ms = Some(latency_total_ms as f64 / latency_samples as f64);
        }
        summary
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of all tasks.
#[derive(Debug, Default, Clone)]
pub struct RegistrySummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
    /// Mean submission-to-finish time over tasks that finished.
    pub average_latency_ms: Option<f64>,
}
