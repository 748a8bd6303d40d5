//! Orchestration facade: the single entry point the HTTP layer talks to.
//!
//! Submission order matters. Inputs are validated first, then queue capacity
//! is reserved, and only then are files written and the task recorded. A
//! rejected submission therefore never leaves a record or a file behind.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::{ImageFormat, ImageReader};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::{Error, JobError};
use crate::jobs::{
    Dispatcher, DispatcherConfig, Janitor, Task, TaskError, TaskFiles, TaskId, TaskRegistry,
    TaskState,
};
use crate::processor::ImageProcessor;
use crate::storage::{FileRole, FileStore, normalize_extension};

/// Extensions accepted on uploaded file names.
const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// One uploaded image as received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Client-supplied file name, if any.
    pub file_name: Option<String>,
    /// Raw file contents.
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(file_name: Option<String>, bytes: Vec<u8>) -> Self {
        Self { file_name, bytes }
    }
}

/// Client-facing view of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub version: u64,
    pub logs: Vec<String>,
}

impl From<Task> for TaskStatusView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            status: task.state,
            submitted_at: task.submitted_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
            expired_at: task.expired_at,
            output_path: task.output_path,
            error: task.error,
            version: task.version,
            logs: task.logs,
        }
    }
}

/// Where a task's result stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultLookup {
    /// The output file exists at this path.
    Ready(PathBuf),
    /// No downloadable result in this state.
    NotReady(TaskState),
}

/// Liveness and capacity snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Storage writable and dispatcher running.
    pub ok: bool,
    /// What is wrong when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub idle_slots: usize,
    pub busy_slots: usize,
    pub queued: usize,
    pub queue_capacity: usize,
    pub storage_writable: bool,
    pub dispatcher_running: bool,
}

/// Aggregate counters.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub pending_count: usize,
    pub running_count: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub expired_count: usize,
    pub total: usize,
    /// Mean submit-to-finish time over finished tasks.
    pub average_latency_ms: Option<f64>,
    pub slot_count: usize,
    /// Most slots ever busy at once since startup.
    pub peak_busy_slots: usize,
    pub queue_capacity: usize,
    pub upload_dir_bytes: u64,
    pub uptime_secs: i64,
}

/// Face-swap job service.
pub struct SwapService {
    config: ServiceConfig,
    store: FileStore,
    registry: Arc<TaskRegistry>,
    dispatcher: Dispatcher,
    started_at: DateTime<Utc>,
}

impl SwapService {
    /// Prepare storage and start the dispatcher. Must run inside a Tokio runtime.
    pub async fn start(
        config: ServiceConfig,
        processor: Arc<dyn ImageProcessor>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let store = FileStore::new(&config.upload_dir, &config.output_dir);
        store.ensure_dirs().await?;

        let registry = Arc::new(TaskRegistry::new());
        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                slots: config.worker_slots,
                queue_depth: config.max_queue_depth,
                job_timeout: config.job_timeout,
                backend: config.execution_provider,
            },
            Arc::clone(&registry),
            processor,
        );

        info!(
            upload_dir = %store.upload_dir().display(),
            output_dir = %store.output_dir().display(),
            backend = %config.execution_provider,
            "Swap service ready"
        );

        Ok(Self {
            config,
            store,
            registry,
            dispatcher,
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// A janitor sweeping this service's tasks with the configured retention.
    pub fn janitor(&self) -> Janitor {
        Janitor::new(
            Arc::clone(&self.registry),
            self.store.clone(),
            self.config.retention,
            self.config.expired_grace,
        )
    }

    /// Accept a job. Returns once the task is PENDING and queued.
    pub async fn submit_job(&self, source: Upload, target: Upload) -> Result<TaskId, JobError> {
        let source_ext = self.validate_upload("source_image", &source)?;
        let target_ext = self.validate_upload("target_image", &target)?;

        let slot = self.dispatcher.reserve()?;
        let id = self.registry.allocate_id().await;

        let mut stored = Vec::with_capacity(2);
        for (role, ext, upload) in [
            (FileRole::Source, &source_ext, &source),
            (FileRole::Target, &target_ext, &target),
        ] {
            match self.store.store(id, role, ext, &upload.bytes).await {
                Ok(path) => stored.push(path),
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Failed to persist upload");
                    self.store.remove_all(&stored).await;
                    return Err(e.into());
                }
            }
        }

        let planned_output = match self.store.output_path_for(id, &target_ext) {
            Ok(path) => path,
            Err(e) => {
                self.store.remove_all(&stored).await;
                return Err(e.into());
            }
        };

        let files = TaskFiles {
            source_path: stored[0].clone(),
            target_path: stored[1].clone(),
            planned_output,
        };
        if let Err(e) = self.registry.create_with_id(id, files).await {
            self.store.remove_all(&stored).await;
            return Err(e);
        }

        slot.submit(id);
        info!(
            task_id = %id,
            source_bytes = source.bytes.len(),
            target_bytes = target.bytes.len(),
            "Job accepted"
        );
        Ok(id)
    }

    /// Check size, decodable header and a file-name extension that agrees with
    /// the content; returns the extension to store under.
    fn validate_upload(&self, field: &str, upload: &Upload) -> Result<String, JobError> {
        if upload.bytes.is_empty() {
            return Err(JobError::InvalidInput(format!("{field} is empty")));
        }
        if upload.bytes.len() > self.config.max_upload_bytes {
            return Err(JobError::InvalidInput(format!(
                "{field} is {} bytes, limit is {}",
                upload.bytes.len(),
                self.config.max_upload_bytes
            )));
        }

        let unreadable = |reason: String| {
            JobError::InvalidInput(format!("{field} is not a readable image: {reason}"))
        };
        let reader = ImageReader::new(Cursor::new(upload.bytes.as_slice()))
            .with_guessed_format()
            .map_err(|e| unreadable(e.to_string()))?;
        let detected = match reader.format() {
            Some(ImageFormat::Png) => "png",
            Some(ImageFormat::Jpeg) => "jpg",
            Some(ImageFormat::WebP) => "webp",
            Some(other) => {
                return Err(JobError::InvalidInput(format!(
                    "{field} has unsupported format {other:?}"
                )));
            }
            None => {
                return Err(JobError::InvalidInput(format!(
                    "{field} is not a recognised image"
                )));
            }
        };
        reader
            .into_dimensions()
            .map_err(|e| unreadable(e.to_string()))?;

        let named = upload
            .file_name
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str());
        let Some(ext) = named else {
            return Ok(detected.to_string());
        };

        let ext = normalize_extension(ext)
            .map_err(|_| JobError::InvalidInput(format!("{field} has an invalid file extension")))?;
        if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(JobError::InvalidInput(format!(
                "{field} extension .{ext} is not allowed"
            )));
        }
        let same_format = ext == detected || (detected == "jpg" && ext == "jpeg");
        if !same_format {
            return Err(JobError::InvalidInput(format!(
                "{field} is named .{ext} but contains {detected} data"
            )));
        }
        Ok(ext)
    }

    /// Current status of a task.
    pub async fn get_status(&self, id: TaskId) -> Result<TaskStatusView, JobError> {
        self.registry.get(id).await.map(TaskStatusView::from)
    }

    /// Locate the output of a task for download.
    pub async fn result_path(&self, id: TaskId) -> Result<ResultLookup, JobError> {
        let task = self.registry.get(id).await?;
        match (task.state, task.output_path) {
            (TaskState::Succeeded, Some(path)) if self.store.exists(&path).await => {
                Ok(ResultLookup::Ready(path))
            }
            (TaskState::Succeeded, _) => {
                warn!(task_id = %id, "Succeeded task has no output file on disk");
                Err(JobError::NotFound { id })
            }
            (state, _) => Ok(ResultLookup::NotReady(state)),
        }
    }

    /// Liveness: storage writable and the dispatcher still running.
    pub async fn health(&self) -> HealthReport {
        let storage = self.store.check_writable().await;
        let dispatcher_running = self.dispatcher.is_running();

        let mut problems = Vec::new();
        if let Err(e) = &storage {
            problems.push(e.to_string());
        }
        if !dispatcher_running {
            problems.push("dispatcher is not running".to_string());
        }

        HealthReport {
            ok: problems.is_empty(),
            detail: (!problems.is_empty()).then(|| problems.join("; ")),
            idle_slots: self.dispatcher.idle_slots(),
            busy_slots: self.dispatcher.busy_slots(),
            queued: self.dispatcher.queued(),
            queue_capacity: self.dispatcher.queue_capacity(),
            storage_writable: storage.is_ok(),
            dispatcher_running,
        }
    }

    pub async fn stats(&self) -> ServiceStats {
        let summary = self.registry.summary().await;
        let upload_dir_bytes = match self.store.upload_dir_bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Could not size upload directory");
                0
            }
        };

        ServiceStats {
            pending_count: summary.pending,
            running_count: summary.running,
            succeeded_count: summary.succeeded,
            failed_count: summary.failed,
            expired_count: summary.expired,
            total: summary.total,
            average_latency_ms: summary.average_latency_ms,
            slot_count: self.dispatcher.slot_count(),
            peak_busy_slots: self.dispatcher.peak_busy_slots(),
            queue_capacity: self.dispatcher.queue_capacity(),
            upload_dir_bytes,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    /// Stop dispatching queued tasks.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::ProcessorError;
    use crate::processor::{ProcessOutput, ProcessRequest};

    /// PNG signature and IHDR with no CRC or image data.
    const TRUNCATED_PNG: &[u8] =
        b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x02\0\0\0";

    fn encode(format: ImageFormat) -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbImage::new(2, 2)
            .write_to(&mut Cursor::new(&mut bytes), format)
            .unwrap();
        bytes
    }

    struct SlowCopy {
        delay: Duration,
    }

    #[async_trait]
    impl ImageProcessor for SlowCopy {
        fn name(&self) -> &str {
            "slow-copy"
        }

        async fn process(&self, request: &ProcessRequest) -> Result<ProcessOutput, ProcessorError> {
            tokio::time::sleep(self.delay).await;
            tokio::fs::copy(&request.target, &request.output)
                .await
                .map_err(ProcessorError::Spawn)?;
            Ok(ProcessOutput::default())
        }
    }

    async fn service(dir: &Path, slots: usize, depth: usize, delay: Duration) -> SwapService {
        let config = ServiceConfig {
            upload_dir: dir.join("uploads"),
            output_dir: dir.join("outputs"),
            worker_slots: slots,
            max_queue_depth: depth,
            max_upload_bytes: 1024,
            ..ServiceConfig::default()
        };
        SwapService::start(config, Arc::new(SlowCopy { delay }))
            .await
            .unwrap()
    }

    fn png(name: &str) -> Upload {
        Upload::new(Some(name.to_string()), encode(ImageFormat::Png))
    }

    async fn wait_for(svc: &SwapService, id: TaskId, state: TaskState) -> TaskStatusView {
        for _ in 0..300 {
            let view = svc.get_status(id).await.unwrap();
            if view.status == state {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {state}");
    }

    async fn file_count(dir: &Path) -> usize {
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(dir).await.unwrap();
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn submit_runs_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 1, 4, Duration::from_millis(10)).await;

        let id = svc.submit_job(png("a.png"), png("b.png")).await.unwrap();
        let view = wait_for(&svc, id, TaskState::Succeeded).await;

        let output = view.output_path.unwrap();
        assert!(output.starts_with(svc.store().output_dir()));
        assert!(view.error.is_none());
        assert_eq!(svc.result_path(id).await.unwrap(), ResultLookup::Ready(output));
    }

    #[tokio::test]
    async fn quick_job_succeeded_within_fifty_ms() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 1, 4, Duration::from_millis(10)).await;

        let id = svc.submit_job(png("a.png"), png("b.png")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let view = svc.get_status(id).await.unwrap();
        assert_eq!(view.status, TaskState::Succeeded);
        assert!(!view.output_path.unwrap().as_os_str().is_empty());
    }

    #[tokio::test]
    async fn output_extension_follows_target() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 1, 4, Duration::ZERO).await;

        let target = Upload::new(None, encode(ImageFormat::Jpeg));
        let id = svc.submit_job(png("a.png"), target).await.unwrap();
        let task = svc.registry().get(id).await.unwrap();
        assert!(task.planned_output.to_string_lossy().ends_with("_output.jpg"));
        assert!(task.source_path.to_string_lossy().ends_with("_source.png"));
    }

    #[tokio::test]
    async fn invalid_inputs_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 1, 4, Duration::ZERO).await;

        let cases = [
            Upload::new(Some("a.png".into()), Vec::new()),
            Upload::new(Some("a.png".into()), b"definitely not an image".to_vec()),
            Upload::new(Some("a.png".into()), vec![0x89; 512]),
            Upload::new(Some("a.exe".into()), encode(ImageFormat::Png)),
            Upload::new(Some("a.png".into()), TRUNCATED_PNG.to_vec()),
            Upload::new(None, TRUNCATED_PNG.to_vec()),
            Upload::new(Some("a.png".into()), encode(ImageFormat::Jpeg)),
            Upload::new(Some("a.webp".into()), encode(ImageFormat::Png)),
        ];
        for bad in cases {
            let result = svc.submit_job(bad, png("b.png")).await;
            assert!(matches!(result, Err(JobError::InvalidInput(_))), "{result:?}");
        }

        assert!(svc.registry().is_empty().await);
        assert_eq!(file_count(svc.store().upload_dir()).await, 0);
    }

    #[tokio::test]
    async fn overloaded_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 1, 1, Duration::from_secs(30)).await;

        let running = svc.submit_job(png("a.png"), png("b.png")).await.unwrap();
        wait_for(&svc, running, TaskState::Running).await;
        svc.submit_job(png("a.png"), png("b.png")).await.unwrap();

        let before = svc.registry().len().await;
        let files_before = file_count(svc.store().upload_dir()).await;

        let result = svc.submit_job(png("a.png"), png("b.png")).await;
        assert!(matches!(result, Err(JobError::Overloaded { .. })));
        assert_eq!(svc.registry().len().await, before);
        assert_eq!(file_count(svc.store().upload_dir()).await, files_before);
    }

    #[tokio::test]
    async fn unknown_task_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 1, 4, Duration::ZERO).await;
        let id = TaskId::new();

        assert!(matches!(svc.get_status(id).await, Err(JobError::NotFound { .. })));
        assert!(matches!(svc.result_path(id).await, Err(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn result_not_ready_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 1, 4, Duration::from_secs(30)).await;

        let id = svc.submit_job(png("a.png"), png("b.png")).await.unwrap();
        wait_for(&svc, id, TaskState::Running).await;
        assert_eq!(
            svc.result_path(id).await.unwrap(),
            ResultLookup::NotReady(TaskState::Running)
        );
    }

    #[tokio::test]
    async fn health_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 2, 4, Duration::ZERO).await;

        let health = svc.health().await;
        assert!(health.ok);
        assert!(health.storage_writable);
        assert_eq!(health.idle_slots, 2);
        assert_eq!(health.queue_capacity, 4);

        let id = svc.submit_job(png("a.png"), png("b.png")).await.unwrap();
        wait_for(&svc, id, TaskState::Succeeded).await;

        let stats = svc.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.succeeded_count, 1);
        assert_eq!(stats.slot_count, 2);
        assert_eq!(stats.upload_dir_bytes, 2 * encode(ImageFormat::Png).len() as u64);
        assert_eq!(stats.peak_busy_slots, 1);
        assert!(stats.average_latency_ms.is_some());

        svc.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let health = svc.health().await;
        assert!(!health.ok);
        assert!(health.detail.unwrap().contains("dispatcher"));
    }
}
