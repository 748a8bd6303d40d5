//! Subprocess-backed processor running `facefusion.py headless-run`.
//!
//! Provides:
//! - Direct launch (`python facefusion.py ...`) or submission through a Ray
//!   cluster (`ray job submit --address=... -- python facefusion.py ...`)
//! - Line-by-line capture of stdout/stderr into the task log
//! - Child termination when the invocation future is dropped (job timeout)

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ImageProcessor, ProcessOutput, ProcessRequest};
use crate::error::ProcessorError;

/// Number of trailing stderr lines carried in a failure message.
const ERROR_TAIL_LINES: usize = 5;

/// How the processor script is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    /// Run the interpreter directly on this host.
    Direct,
    /// Submit through `ray job submit` to the given cluster address.
    Ray { address: String },
}

/// Runs the facefusion CLI once per task.
#[derive(Debug, Clone)]
pub struct FaceFusionProcessor {
    python_bin: String,
    script: PathBuf,
    launcher: Launcher,
    /// Working directory for the child (defaults to the script's directory).
    working_dir: Option<PathBuf>,
}

impl FaceFusionProcessor {
    pub fn new(python_bin: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        let script = script.into();
        let working_dir = script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        Self {
            python_bin: python_bin.into(),
            script,
            launcher: Launcher::Direct,
            working_dir,
        }
    }

    /// Launch through a Ray cluster instead of directly.
    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Build the full argument vector, program first.
    fn command_line(&self, request: &ProcessRequest) -> Vec<String> {
        let mut args = Vec::new();
        if let Launcher::Ray { address } = &self.launcher {
            args.extend([
                "ray".to_string(),
                "job".to_string(),
                "submit".to_string(),
                format!("--address={address}"),
                "--".to_string(),
            ]);
        }
        args.extend([
            self.python_bin.clone(),
            self.script.display().to_string(),
            "headless-run".to_string(),
            "-s".to_string(),
            request.source.display().to_string(),
            "-t".to_string(),
            request.target.display().to_string(),
            "-o".to_string(),
            request.output.display().to_string(),
            "--execution-providers".to_string(),
            request.backend.to_string(),
        ]);
        args
    }
}

#[async_trait]
impl ImageProcessor for FaceFusionProcessor {
    fn name(&self) -> &str {
        match self.launcher {
            Launcher::Direct => "facefusion",
            Launcher::Ray { .. } => "facefusion-ray",
        }
    }

    async fn process(&self, request: &ProcessRequest) -> Result<ProcessOutput, ProcessorError> {
        for input in [&request.source, &request.target] {
            if !tokio::fs::try_exists(input).await.unwrap_or(false) {
                return Err(ProcessorError::InputMissing(input.clone()));
            }
        }
        if let Some(parent) = request.output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ProcessorError::Spawn)?;
        }

        let argv = self.command_line(request);
        info!(task_id = %request.task_id, command = %argv.join(" "), "Launching processor");

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(ProcessorError::Spawn)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, out_lines, err_lines) = tokio::join!(
            child.wait(),
            collect_lines(stdout),
            collect_lines(stderr)
        );
        let status = status.map_err(ProcessorError::Spawn)?;

        for line in &out_lines {
            debug!(task_id = %request.task_id, "{line}");
        }

        let mut logs = out_lines;
        logs.extend(err_lines.iter().map(|l| format!("ERROR: {l}")));

        if !status.success() {
            let tail = err_lines
                .iter()
                .rev()
                .take(ERROR_TAIL_LINES)
                .rev()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            warn!(task_id = %request.task_id, code = ?status.code(), "Processor exited unsuccessfully");
            logs.push(match status.code() {
                Some(code) => format!("Task failed with return code {code}"),
                None => "Task failed: terminated by signal".to_string(),
            });
            return Err(ProcessorError::Failed {
                code: status.code(),
                detail: if tail.is_empty() {
                    "no error output".to_string()
                } else {
                    tail
                },
                logs,
            });
        }

        Ok(ProcessOutput { logs })
    }
}

async fn collect_lines<R>(reader: Option<R>) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end().to_string();
                if !line.is_empty() {
                    collected.push(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                collected.push(format!("<unreadable output: {e}>"));
                break;
            }
        }
    }
    collected
}
