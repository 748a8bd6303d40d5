//! Bounded FIFO queue feeding a fixed pool of worker slots.
//!
//! A single dispatch loop owns the queue receiver. For every task it first
//! acquires a slot permit, then pops the next queued id, marks it RUNNING and
//! hands it to a worker. Because the loop starts tasks one at a time in queue
//! order, dispatch is FIFO, and because a task only becomes RUNNING while its
//! permit is held, RUNNING tasks never outnumber slots.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{JobError, ProcessorError};
use crate::jobs::registry::TaskRegistry;
use crate::jobs::state::{Task, TaskError, TaskErrorKind, TaskId, TaskOutcome};
use crate::processor::{ExecutionProvider, ImageProcessor, ProcessRequest};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Concurrent processor invocations.
    pub slots: usize,
    /// Queued tasks accepted before load shedding.
    pub queue_depth: usize,
    /// Per-job processor ceiling.
    pub job_timeout: Duration,
    /// Execution provider passed to every processor invocation.
    pub backend: ExecutionProvider,
}

/// Reserved queue capacity. Sending through it cannot fail with `Overloaded`.
pub struct QueueSlot {
    permit: mpsc::OwnedPermit<TaskId>,
}

impl QueueSlot {
    /// Enqueue the task into the reserved position.
    pub fn submit(self, task_id: TaskId) {
        self.permit.send(task_id);
        debug!(task_id = %task_id, "Task queued");
    }
}

/// Slot usage counters shared between the loop and workers.
#[derive(Debug, Default)]
struct SlotCounters {
    /// Slots running a task right now.
    busy: AtomicUsize,
    /// High-water mark of `busy`.
    peak: AtomicUsize,
}

/// Decrements the busy counter when a worker ends, however it ends.
struct BusyGuard {
    counters: Arc<SlotCounters>,
    _permit: OwnedSemaphorePermit,
}

impl BusyGuard {
    fn new(counters: Arc<SlotCounters>, permit: OwnedSemaphorePermit) -> Self {
        let busy = counters.busy.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(busy, Ordering::SeqCst);
        Self {
            counters,
            _permit: permit,
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.counters.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a worker needs to run one task.
struct WorkerContext {
    registry: Arc<TaskRegistry>,
    processor: Arc<dyn ImageProcessor>,
    job_timeout: Duration,
    backend: ExecutionProvider,
}

/// Accepts task ids and runs them on the processor with bounded concurrency.
pub struct Dispatcher {
    queue_tx: mpsc::Sender<TaskId>,
    config: DispatcherConfig,
    counters: Arc<SlotCounters>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: JoinHandle<()>,
}

impl Dispatcher {
    /// Create the dispatcher and spawn its dispatch loop.
    pub fn start(
        config: DispatcherConfig,
        registry: Arc<TaskRegistry>,
        processor: Arc<dyn ImageProcessor>,
    ) -> Self {
        let slots = config.slots.max(1);
        let depth = config.queue_depth.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(SlotCounters::default());

        let ctx = Arc::new(WorkerContext {
            registry,
            processor,
            job_timeout: config.job_timeout,
            backend: config.backend,
        });

        info!(
            slots,
            queue_depth = depth,
            timeout_secs = config.job_timeout.as_secs(),
            processor = ctx.processor.name(),
            "Dispatcher started"
        );

        let loop_handle = tokio::spawn(dispatch_loop(
            queue_rx,
            Arc::new(Semaphore::new(slots)),
            Arc::clone(&counters),
            ctx,
            shutdown_rx,
        ));

        Self {
            queue_tx,
            config: DispatcherConfig {
                slots,
                queue_depth: depth,
                ..config
            },
            counters,
            shutdown_tx,
            loop_handle,
        }
    }

    fn overloaded(&self) -> JobError {
        JobError::Overloaded {
            depth: self.config.queue_depth,
        }
    }

    /// Reserve queue capacity without enqueuing anything yet.
    pub fn reserve(&self) -> Result<QueueSlot, JobError> {
        match self.queue_tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(depth = self.config.queue_depth, "Queue full, shedding load");
                Err(self.overloaded())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Dispatcher stopped, rejecting submission");
                Err(self.overloaded())
            }
        }
    }

    /// Enqueue a task; fails fast with `Overloaded` when the queue is full.
    pub fn submit(&self, task_id: TaskId) -> Result<(), JobError> {
        self.reserve()?.submit(task_id);
        Ok(())
    }

    pub fn slot_count(&self) -> usize {
        self.config.slots
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.queue_depth
    }

    /// Tasks waiting in (or reserved in) the queue.
    pub fn queued(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Slots currently running a task.
    pub fn busy_slots(&self) -> usize {
        self.counters.busy.load(Ordering::SeqCst)
    }

    pub fn idle_slots(&self) -> usize {
        self.config.slots.saturating_sub(self.busy_slots())
    }

    /// Highest number of simultaneously busy slots observed.
    pub fn peak_busy_slots(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Whether the dispatch loop is still accepting work.
    pub fn is_running(&self) -> bool {
        !self.loop_handle.is_finished() && !*self.shutdown_tx.borrow()
    }

    /// Stop dispatching new tasks. Running workers finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn dispatch_loop(
    mut queue_rx: mpsc::Receiver<TaskId>,
    slots: Arc<Semaphore>,
    counters: Arc<SlotCounters>,
    ctx: Arc<WorkerContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let permit = tokio::select! {
            _ = shutdown_rx.changed() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task_id = tokio::select! {
            _ = shutdown_rx.changed() => break,
            next = queue_rx.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        let task = match ctx.registry.update(task_id, |t| t.start().map(|_| t.clone())).await {
            Ok(task) => task,
            Err(e) => {
                // Task vanished or was expired while queued; the permit is released here.
                warn!(task_id = %task_id, error = %e, "Skipping queued task");
                continue;
            }
        };

        let guard = BusyGuard::new(Arc::clone(&counters), permit);
        info!(
            task_id = %task_id,
            busy = counters.busy.load(Ordering::SeqCst),
            "Task started"
        );

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let _guard = guard;
            ctx.run(task).await;
        });
    }

    info!("Dispatcher loop stopped");
}

impl WorkerContext {
    /// Invoke the processor for a RUNNING task and record the outcome.
    async fn run(&self, task: Task) {
        let started = Instant::now();
        let request = ProcessRequest {
            task_id: task.id,
            source: task.source_path.clone(),
            target: task.target_path.clone(),
            output: task.planned_output.clone(),
            backend: self.backend,
        };

        let (outcome, logs) = self.invoke(request).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            TaskOutcome::Succeeded { output_path } => {
                info!(task_id = %task.id, elapsed_ms, output = %output_path.display(), "Task succeeded")
            }
            TaskOutcome::Failed(err) => {
                warn!(task_id = %task.id, elapsed_ms, kind = %err.kind, error = %err.message, "Task failed")
            }
        }

        let result = self
            .registry
            .update(task.id, move |t| t.finish_with_logs(outcome, logs))
            .await;
        if let Err(e) = result {
            error!(task_id = %task.id, error = %e, "Failed to record task outcome");
        }
    }

    /// Run the processor under the job timeout. The processor runs in its own
    /// task so a panic is contained and a timeout can abort it.
    async fn invoke(&self, request: ProcessRequest) -> (TaskOutcome, Vec<String>) {
        let processor = Arc::clone(&self.processor);
        let output = request.output.clone();
        let mut handle = tokio::spawn(async move { processor.process(&request).await });

        match tokio::time::timeout(self.job_timeout, &mut handle).await {
            Ok(Ok(Ok(result))) => {
                if tokio::fs::try_exists(&output).await.unwrap_or(false) {
                    (TaskOutcome::Succeeded { output_path: output }, result.logs)
                } else {
                    let err = ProcessorError::MissingOutput(output);
                    (failed(TaskErrorKind::ProcessingError, err.to_string()), result.logs)
                }
            }
            Ok(Ok(Err(mut err))) => {
                let logs = err.take_logs();
                let kind = match err {
                    ProcessorError::InputMissing(_) => TaskErrorKind::IoError,
                    _ => TaskErrorKind::ProcessingError,
                };
                (failed(kind, err.to_string()), logs)
            }
            Ok(Err(join_err)) => {
                let message = format!("processor crashed: {join_err}");
                let logs = vec![format!("Task aborted: {message}")];
                (failed(TaskErrorKind::ProcessingError, message), logs)
            }
            Err(_) => {
                handle.abort();
                // Wait for the aborted invocation to be dropped so its
                // resources are released before the slot is.
                let _ = handle.await;
                let message = format!(
                    "processing timed out after {}s",
                    self.job_timeout.as_secs_f64()
                );
                let logs = vec![format!("Task killed: {message}")];
                (failed(TaskErrorKind::Timeout, message), logs)
            }
        }
    }
}

fn failed(kind: TaskErrorKind, message: impl Into<String>) -> TaskOutcome {
    TaskOutcome::Failed(TaskError::new(kind, message))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;

    use super::*;
    use crate::jobs::state::{TaskFiles, TaskState};
    use crate::processor::ProcessOutput;

    /// Writes the output after a delay, or fails/hangs on request.
    struct ScriptedProcessor {
        delay: Duration,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl ImageProcessor for ScriptedProcessor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn process(&self, request: &ProcessRequest) -> Result<ProcessOutput, ProcessorError> {
            tokio::time::sleep(self.delay).await;
            if let Some(msg) = &self.fail_with {
                return Err(ProcessorError::Rejected(msg.clone()));
            }
            tokio::fs::write(&request.output, b"result")
                .await
                .map_err(ProcessorError::Spawn)?;
            Ok(ProcessOutput {
                logs: vec!["done".to_string()],
            })
        }
    }

    fn config(slots: usize, depth: usize, timeout: Duration) -> DispatcherConfig {
        DispatcherConfig {
            slots,
            queue_depth: depth,
            job_timeout: timeout,
            backend: ExecutionProvider::Cpu,
        }
    }

    async fn create_task(registry: &TaskRegistry, dir: &Path) -> TaskId {
        let id = registry.allocate_id().await;
        let files = TaskFiles {
            source_path: dir.join(format!("{id}_source.png")),
            target_path: dir.join(format!("{id}_target.png")),
            planned_output: dir.join(format!("{id}_output.png")),
        };
        registry.create_with_id(id, files).await.unwrap();
        id
    }

    async fn wait_terminal(registry: &TaskRegistry, id: TaskId) -> Task {
        for _ in 0..200 {
            let task = registry.get(id).await.unwrap();
            if task.state.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never finished");
    }

    #[tokio::test]
    async fn runs_task_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let processor = Arc::new(ScriptedProcessor {
            delay: Duration::from_millis(5),
            fail_with: None,
        });
        let dispatcher = Dispatcher::start(
            config(1, 4, Duration::from_secs(5)),
            Arc::clone(&registry),
            processor,
        );

        let id = create_task(&registry, dir.path()).await;
        dispatcher.submit(id).unwrap();

        let task = wait_terminal(&registry, id).await;
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(
            task.output_path,
            Some(dir.path().join(format!("{id}_output.png")))
        );
        assert_eq!(task.logs, vec!["done"]);
        assert!(task.outcome_is_consistent());
    }

    #[tokio::test]
    async fn processor_failure_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let processor = Arc::new(ScriptedProcessor {
            delay: Duration::ZERO,
            fail_with: Some("bad face".to_string()),
        });
        let dispatcher = Dispatcher::start(
            config(1, 4, Duration::from_secs(5)),
            Arc::clone(&registry),
            processor,
        );

        let id = create_task(&registry, dir.path()).await;
        dispatcher.submit(id).unwrap();

        let task = wait_terminal(&registry, id).await;
        assert_eq!(task.state, TaskState::Failed);
        let err = task.error.unwrap();
        assert_eq!(err.kind, TaskErrorKind::ProcessingError);
        assert!(err.message.contains("bad face"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_subprocess_keeps_its_output() {
        use crate::processor::FaceFusionProcessor;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("swap.sh");
        tokio::fs::write(
            &script,
            "echo 'loading models'\necho 'no face detected' >&2\nexit 3\n",
        )
        .await
        .unwrap();

        let registry = Arc::new(TaskRegistry::new());
        let dispatcher = Dispatcher::start(
            config(1, 4, Duration::from_secs(10)),
            Arc::clone(&registry),
            Arc::new(FaceFusionProcessor::new("sh", &script)),
        );

        let id = create_task(&registry, dir.path()).await;
        let task = registry.get(id).await.unwrap();
        tokio::fs::write(&task.source_path, b"s").await.unwrap();
        tokio::fs::write(&task.target_path, b"t").await.unwrap();
        dispatcher.submit(id).unwrap();

        let task = wait_terminal(&registry, id).await;
        assert_eq!(task.state, TaskState::Failed);
        let err = task.error.unwrap();
        assert_eq!(err.kind, TaskErrorKind::ProcessingError);
        assert!(err.message.contains("no face detected"));
        assert_eq!(
            task.logs,
            vec![
                "loading models",
                "ERROR: no face detected",
                "Task failed with return code 3"
            ]
        );
    }

    #[tokio::test]
    async fn missing_output_is_failure() {
        struct NoOutput;

        #[async_trait]
        impl ImageProcessor for NoOutput {
            fn name(&self) -> &str {
                "no-output"
            }
            async fn process(&self, _: &ProcessRequest) -> Result<ProcessOutput, ProcessorError> {
                Ok(ProcessOutput::default())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let dispatcher = Dispatcher::start(
            config(1, 4, Duration::from_secs(5)),
            Arc::clone(&registry),
            Arc::new(NoOutput),
        );
        let id = create_task(&registry, dir.path()).await;
        dispatcher.submit(id).unwrap();

        let task = wait_terminal(&registry, id).await;
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.unwrap().message.contains("no output"));
    }

    #[tokio::test]
    async fn timeout_fails_task_and_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let processor = Arc::new(ScriptedProcessor {
            delay: Duration::from_secs(30),
            fail_with: None,
        });
        let dispatcher = Dispatcher::start(
            config(1, 4, Duration::from_millis(50)),
            Arc::clone(&registry),
            processor,
        );

        let id = create_task(&registry, dir.path()).await;
        dispatcher.submit(id).unwrap();

        let task = wait_terminal(&registry, id).await;
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.unwrap().kind, TaskErrorKind::Timeout);
        assert!(task.logs.last().unwrap().contains("timed out"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.busy_slots(), 0);
        assert_eq!(dispatcher.idle_slots(), 1);
    }

    #[tokio::test]
    async fn full_queue_is_overloaded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let processor = Arc::new(ScriptedProcessor {
            delay: Duration::from_secs(30),
            fail_with: None,
        });
        let dispatcher = Dispatcher::start(
            config(1, 2, Duration::from_secs(60)),
            Arc::clone(&registry),
            processor,
        );

        // First task occupies the slot.
        let first = create_task(&registry, dir.path()).await;
        dispatcher.submit(first).unwrap();
        for _ in 0..100 {
            if dispatcher.busy_slots() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dispatcher.busy_slots(), 1);

        // Two more fill the queue.
        let _a = dispatcher.reserve().unwrap();
        let _b = dispatcher.reserve().unwrap();
        assert_eq!(dispatcher.queued(), 2);

        let result = dispatcher.reserve();
        assert!(matches!(result, Err(JobError::Overloaded { depth: 2 })));
    }

    #[tokio::test]
    async fn fifo_dispatch_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let processor = Arc::new(ScriptedProcessor {
            delay: Duration::from_millis(5),
            fail_with: None,
        });
        let dispatcher = Dispatcher::start(
            config(1, 16, Duration::from_secs(5)),
            Arc::clone(&registry),
            processor,
        );

        let mut ids = Vec::new();
        for _ in 0..6 {
            let id = create_task(&registry, dir.path()).await;
            dispatcher.submit(id).unwrap();
            ids.push(id);
        }

        let mut started = Vec::new();
        for id in &ids {
            let task = wait_terminal(&registry, *id).await;
            started.push(task.started_at.unwrap());
        }
        assert!(started.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn never_exceeds_slot_count() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let processor = Arc::new(ScriptedProcessor {
            delay: Duration::from_millis(20),
            fail_with: None,
        });
        let dispatcher = Dispatcher::start(
            config(3, 64, Duration::from_secs(5)),
            Arc::clone(&registry),
            processor,
        );

        let mut ids = Vec::new();
        for _ in 0..20 {
            let id = create_task(&registry, dir.path()).await;
            dispatcher.submit(id).unwrap();
            ids.push(id);
        }

        let mut max_running = 0;
        loop {
            let summary = registry.summary().await;
            max_running = max_running.max(summary.running);
            if summary.succeeded == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert!(max_running <= 3, "observed {max_running} running tasks");
        assert!(dispatcher.peak_busy_slots() <= 3);
        assert!(dispatcher.peak_busy_slots() >= 1);
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let registry = Arc::new(TaskRegistry::new());
        let processor = Arc::new(ScriptedProcessor {
            delay: Duration::ZERO,
            fail_with: None,
        });
        let dispatcher = Dispatcher::start(config(1, 4, Duration::from_secs(5)), registry, processor);
        assert!(dispatcher.is_running());

        dispatcher.shutdown();
        for _ in 0..100 {
            if !dispatcher.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!dispatcher.is_running());
    }
}
