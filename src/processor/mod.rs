//! Image processor interface.
//!
//! The orchestration core never looks inside the processor: it hands over
//! `(source, target, output, backend)` and gets back success or a
//! [`ProcessorError`]. [`FaceFusionProcessor`] is the production
//! implementation; tests plug in their own.

pub mod facefusion;

pub use facefusion::{FaceFusionProcessor, Launcher};

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProcessorError;
use crate::jobs::state::TaskId;

/// Accelerator backend the processor runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    Cuda,
    Cpu,
    TensorRt,
    Rocm,
    CoreMl,
    OpenVino,
}

impl ExecutionProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Cpu => "cpu",
            Self::TensorRt => "tensorrt",
            Self::Rocm => "rocm",
            Self::CoreMl => "coreml",
            Self::OpenVino => "openvino",
        }
    }
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Ok(Self::Cuda),
            "cpu" => Ok(Self::Cpu),
            "tensorrt" => Ok(Self::TensorRt),
            "rocm" => Ok(Self::Rocm),
            "coreml" => Ok(Self::CoreMl),
            "openvino" => Ok(Self::OpenVino),
            other => Err(format!("unknown execution provider '{other}'")),
        }
    }
}

/// One processor invocation.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Task the invocation belongs to, for log correlation.
    pub task_id: TaskId,
    /// Face to transplant.
    pub source: PathBuf,
    /// Scene receiving the face.
    pub target: PathBuf,
    /// Where the result must be written.
    pub output: PathBuf,
    /// Accelerator to run on.
    pub backend: ExecutionProvider,
}

/// What a successful invocation reports back.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Output lines captured from the processor.
    pub logs: Vec<String>,
}

/// A face-swap engine. Must be safe to call concurrently up to the
/// configured slot count.
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Produce `request.output` from `request.source` and `request.target`.
    ///
    /// The future may be dropped when the job times out; implementations must
    /// release their resources (e.g. kill child processes) on drop.
    async fn process(&self, request: &ProcessRequest) -> Result<ProcessOutput, ProcessorError>;
}
