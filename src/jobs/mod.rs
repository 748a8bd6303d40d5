//! Job orchestration: task records, the registry that owns them, the
//! dispatcher that runs them and the janitor that reclaims them.

pub mod dispatcher;
pub mod janitor;
pub mod registry;
pub mod state;

pub use dispatcher::{Dispatcher, DispatcherConfig, QueueSlot};
pub use janitor::{Janitor, SweepReport, spawn_janitor};
pub use registry::{RegistrySummary, TaskRegistry};
pub use state::{Task, TaskError, TaskErrorKind, TaskFiles, TaskId, TaskOutcome, TaskState};
