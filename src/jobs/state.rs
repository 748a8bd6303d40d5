//! Task record and its state machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of transitions kept per task.
const MAX_TRANSITIONS: usize = 32;

/// Maximum number of processor log lines kept per task.
pub const MAX_LOG_LINES: usize = 200;

/// Opaque task identifier (random 128-bit value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted and waiting for a worker slot.
    Pending,
    /// Currently held by a worker slot.
    Running,
    /// Processor produced an output file.
    Succeeded,
    /// Processor failed or timed out.
    Failed,
    /// Files reclaimed by the janitor.
    Expired,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Pending, Expired)
                | (Running, Expired)
                | (Succeeded, Expired)
                | (Failed, Expired)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Expired)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// Kind of failure recorded on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The image processor reported failure.
    ProcessingError,
    /// The processor exceeded the per-job ceiling and was killed.
    Timeout,
    /// Storage failure while preparing or collecting files.
    IoError,
    /// The task was reclaimed before it ever finished.
    Expired,
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ProcessingError => "processing_error",
            Self::Timeout => "timeout",
            Self::IoError => "io_error",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// Structured error stored on a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Failure category.
    pub kind: TaskErrorKind,
    /// Human-readable detail, usually from the processor.
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// How a running task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded { output_path: PathBuf },
    Failed(TaskError),
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot transition from {from} to {to}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state.
    pub from: TaskState,
    /// New state.
    pub to: TaskState,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition.
    pub reason: Option<String>,
}

/// Input and output files owned by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFiles {
    /// Stored face image.
    pub source_path: PathBuf,
    /// Stored scene image.
    pub target_path: PathBuf,
    /// Where the processor is asked to write its result.
    pub planned_output: PathBuf,
}

/// One face-swap job tracked from submission to removal.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Current state.
    pub state: TaskState,
    /// Uploaded face image in the upload directory.
    pub source_path: PathBuf,
    /// Uploaded scene image in the upload directory.
    pub target_path: PathBuf,
    /// Where the processor writes its result.
    #[serde(skip)]
    pub planned_output: PathBuf,
    /// Set only once the task succeeded.
    pub output_path: Option<PathBuf>,
    /// Set only once the task failed (or expired without finishing).
    pub error: Option<TaskError>,
    /// When the task was accepted.
    pub submitted_at: DateTime<Utc>,
    /// When a worker slot picked it up.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached SUCCEEDED or FAILED.
    pub finished_at: Option<DateTime<Utc>>,
    /// When the janitor reclaimed its files.
    pub expired_at: Option<DateTime<Utc>>,
    /// Incremented on every successful mutation.
    pub version: u64,
    /// Recent state history, oldest first.
    pub transitions: Vec<StateTransition>,
    /// Processor output captured for this task.
    pub logs: Vec<String>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: TaskId, files: TaskFiles) -> Self {
        Self {
            id,
            state: TaskState::Pending,
            source_path: files.source_path,
            target_path: files.target_path,
            planned_output: files.planned_output,
            output_path: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            expired_at: None,
            version: 0,
            transitions: Vec::new(),
            logs: Vec::new(),
        }
    }

    /// Transition to a new state, stamping the matching timestamp.
    fn transition_to(
        &mut self,
        new_state: TaskState,
        reason: Option<String>,
    ) -> Result<DateTime<Utc>, TransitionError> {
        if !self.state.can_transition_to(new_state) {
            return Err(TransitionError {
                from: self.state,
                to: new_state,
            });
        }

        let now = self.monotonic_now();
        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: now,
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;
        self.version += 1;

        match new_state {
            TaskState::Running => self.started_at = Some(now),
            TaskState::Succeeded | TaskState::Failed => self.finished_at = Some(now),
            TaskState::Expired => self.expired_at = Some(now),
            TaskState::Pending => {}
        }

        Ok(now)
    }

    /// The wall clock, clamped so timestamps never go backwards.
    fn monotonic_now(&self) -> DateTime<Utc> {
        let latest = [
            Some(self.submitted_at),
            self.started_at,
            self.finished_at,
            self.expired_at,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(self.submitted_at);
        Utc::now().max(latest)
    }

    /// PENDING -> RUNNING.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition_to(TaskState::Running, None).map(|_| ())
    }

    /// RUNNING -> SUCCEEDED / FAILED.
    pub fn finish(&mut self, outcome: TaskOutcome) -> Result<(), TransitionError> {
        match outcome {
            TaskOutcome::Succeeded { output_path } => {
                self.transition_to(TaskState::Succeeded, None)?;
                self.output_path = Some(output_path);
            }
            TaskOutcome::Failed(error) => {
                let reason = format!("{}: {}", error.kind, error.message);
                self.transition_to(TaskState::Failed, Some(reason))?;
                self.error = Some(error);
            }
        }
        Ok(())
    }

    /// Finish, then record the processor output. A rejected transition
    /// leaves the logs untouched.
    pub fn finish_with_logs(
        &mut self,
        outcome: TaskOutcome,
        logs: Vec<String>,
    ) -> Result<(), TransitionError> {
        self.finish(outcome)?;
        self.append_logs(logs);
        Ok(())
    }

    /// Any state -> EXPIRED. Keeps whichever of output/error was recorded.
    pub fn expire(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        let was_finished = matches!(self.state, TaskState::Succeeded | TaskState::Failed);
        self.transition_to(TaskState::Expired, Some(reason.into()))?;
        if !was_finished {
            self.error = Some(TaskError::new(
                TaskErrorKind::Expired,
                "task expired before it finished",
            ));
        }
        Ok(())
    }

    /// Append processor output lines, keeping only the most recent ones.
    pub fn append_logs(&mut self, lines: impl IntoIterator<Item = String>) {
        self.logs.extend(lines);
        if self.logs.len() > MAX_LOG_LINES {
            let drain_count = self.logs.len() - MAX_LOG_LINES;
            self.logs.drain(..drain_count);
        }
    }

    /// Exactly one of output/error is populated once terminal.
    pub fn outcome_is_consistent(&self) -> bool {
        if self.state.is_terminal() {
            self.output_path.is_some() != self.error.is_some()
        } else {
            self.output_path.is_none() && self.error.is_none()
        }
    }

    /// Reference time used for retention: finish time, else submission time.
    pub fn retention_anchor(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.submitted_at)
    }

    /// Submission-to-finish latency, if finished.
    pub fn latency(&self) -> Option<chrono::Duration> {
        self.finished_at
            .map(|finished| finished.signed_duration_since(self.submitted_at))
    }

    /// Files that belong to this task and may exist on disk.
    pub fn owned_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.source_path.clone(), self.target_path.clone()];
        match &self.output_path {
            Some(output) => files.push(output.clone()),
            None => files.push(self.planned_output.clone()),
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task() -> Task {
        let id = TaskId::new();
        Task::new(
            id,
            TaskFiles {
                source_path: PathBuf::from(format!("/tmp/{id}_source.png")),
                target_path: PathBuf::from(format!("/tmp/{id}_target.png")),
                planned_output: PathBuf::from(format!("/tmp/{id}_output.png")),
            },
        )
    }

    #[test]
    fn state_transitions_valid() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Running));
        assert!(TaskState::Running.can_transition_to(TaskState::Succeeded));
        assert!(TaskState::Running.can_transition_to(TaskState::Failed));
        assert!(TaskState::Succeeded.can_transition_to(TaskState::Expired));
        assert!(TaskState::Failed.can_transition_to(TaskState::Expired));
        assert!(TaskState::Pending.can_transition_to(TaskState::Expired));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!TaskState::Pending.can_transition_to(TaskState::Succeeded));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Running));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Succeeded));
        assert!(!TaskState::Expired.can_transition_to(TaskState::Expired));
        assert!(!TaskState::Expired.can_transition_to(TaskState::Pending));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Expired.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn success_lifecycle_sets_timestamps_in_order() {
        let mut task = make_task();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.outcome_is_consistent());

        task.start().unwrap();
        assert_eq!(task.state, TaskState::Running);
        let output = task.planned_output.clone();
        task.finish(TaskOutcome::Succeeded {
            output_path: output.clone(),
        })
        .unwrap();

        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.output_path, Some(output));
        assert!(task.error.is_none());
        assert!(task.outcome_is_consistent());
        let started = task.started_at.unwrap();
        let finished = task.finished_at.unwrap();
        assert!(task.submitted_at <= started);
        assert!(started <= finished);
        assert_eq!(task.version, 2);
        assert_eq!(task.transitions.len(), 2);
    }

    #[test]
    fn failure_records_error_only() {
        let mut task = make_task();
        task.start().unwrap();
        task.finish(TaskOutcome::Failed(TaskError::new(
            TaskErrorKind::ProcessingError,
            "bad face",
        )))
        .unwrap();

        assert_eq!(task.state, TaskState::Failed);
        assert!(task.output_path.is_none());
        assert_eq!(task.error.as_ref().unwrap().message, "bad face");
        assert!(task.outcome_is_consistent());
    }

    #[test]
    fn cannot_finish_pending_task() {
        let mut task = make_task();
        let err = task
            .finish(TaskOutcome::Succeeded {
                output_path: PathBuf::from("/tmp/out.png"),
            })
            .unwrap_err();
        assert_eq!(err.from, TaskState::Pending);
        assert_eq!(err.to, TaskState::Succeeded);
        assert!(task.output_path.is_none());
        assert_eq!(task.version, 0);
    }

    #[test]
    fn expire_keeps_previous_outcome() {
        let mut task = make_task();
        task.start().unwrap();
        task.finish(TaskOutcome::Succeeded {
            output_path: PathBuf::from("/tmp/out.png"),
        })
        .unwrap();
        task.expire("retention elapsed").unwrap();

        assert_eq!(task.state, TaskState::Expired);
        assert!(task.output_path.is_some());
        assert!(task.error.is_none());
        assert!(task.expired_at.is_some());
        assert!(task.outcome_is_consistent());
        assert!(task.expire("again").is_err());
    }

    #[test]
    fn expire_unfinished_records_error() {
        let mut task = make_task();
        task.expire("stale").unwrap();
        assert_eq!(task.error.as_ref().unwrap().kind, TaskErrorKind::Expired);
        assert!(task.outcome_is_consistent());
    }

    #[test]
    fn logs_capped() {
        let mut task = make_task();
        task.append_logs((0..MAX_LOG_LINES + 50).map(|i| format!("line {i}")));
        assert_eq!(task.logs.len(), MAX_LOG_LINES);
        assert_eq!(task.logs.last().unwrap(), &format!("line {}", MAX_LOG_LINES + 49));
    }

    #[test]
    fn rejected_finish_keeps_logs_and_version() {
        let mut task = make_task();
        let outcome = TaskOutcome::Failed(TaskError::new(TaskErrorKind::ProcessingError, "x"));

        assert!(task.finish_with_logs(outcome.clone(), vec!["late".into()]).is_err());
        assert!(task.logs.is_empty());
        assert_eq!(task.version, 0);

        task.start().unwrap();
        task.finish_with_logs(outcome, vec!["ERROR: x".into()]).unwrap();
        assert_eq!(task.logs, vec!["ERROR: x"]);
        assert_eq!(task.version, 2);
    }

    #[test]
    fn task_id_parse_roundtrip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn task_state_serde() {
        let json = serde_json::to_string(&TaskState::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
        let kind = serde_json::to_string(&TaskErrorKind::ProcessingError).unwrap();
        assert_eq!(kind, "\"processing_error\"");
    }
}
