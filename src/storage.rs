//! File store for uploaded inputs and processor outputs.
//!
//! Every file is named after the task that owns it (`{task_id}_{role}.{ext}`),
//! so concurrent writes never collide without any locking.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::jobs::state::TaskId;

/// Longest accepted file extension.
const MAX_EXTENSION_LEN: usize = 8;

/// Which file of a task is being stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Source,
    Target,
    Output,
}

impl FileRole {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
            Self::Output => "output",
        }
    }
}

/// Manages the upload and output directories.
#[derive(Debug, Clone)]
pub struct FileStore {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at the given directories. Relative paths are
    /// resolved against the current directory so stored paths are absolute.
    pub fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: absolutize(upload_dir.into()),
            output_dir: absolutize(output_dir.into()),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Ensure both directories exist.
    pub async fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [&self.upload_dir, &self.output_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::io(dir, e))?;
        }
        Ok(())
    }

    fn dir_for(&self, role: FileRole) -> &Path {
        match role {
            FileRole::Source | FileRole::Target => &self.upload_dir,
            FileRole::Output => &self.output_dir,
        }
    }

    /// Path a task's file of the given role lives at.
    pub fn path_for(
        &self,
        id: TaskId,
        role: FileRole,
        extension: &str,
    ) -> Result<PathBuf, StorageError> {
        let ext = normalize_extension(extension)?;
        Ok(self
            .dir_for(role)
            .join(format!("{id}_{}.{ext}", role.as_str())))
    }

    /// Where the processor must write the result for a task.
    pub fn output_path_for(&self, id: TaskId, extension: &str) -> Result<PathBuf, StorageError> {
        self.path_for(id, FileRole::Output, extension)
    }

    /// Persist bytes for a task file. The data is written to a temporary
    /// sibling first and renamed into place, so readers never see a partial file.
    pub async fn store(
        &self,
        id: TaskId,
        role: FileRole,
        extension: &str,
        data: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let path = self.path_for(id, role, extension)?;
        let dir = self.dir_for(role);
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::io(dir, e))?;

        let tmp = path.with_extension("part");
        if let Err(e) = fs::write(&tmp, data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::io(&tmp, e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::io(&path, e));
        }

        debug!(task_id = %id, role = role.as_str(), path = %path.display(), bytes = data.len(), "Stored file");
        Ok(path)
    }

    /// Delete a file. Already-absent files count as removed.
    pub async fn remove(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "File already absent");
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove file");
                Err(StorageError::io(path, e))
            }
        }
    }

    /// Remove several files, returning how many removals failed.
    pub async fn remove_all(&self, paths: &[PathBuf]) -> usize {
        let mut failures = 0;
        for path in paths {
            if self.remove(path).await.is_err() {
                failures += 1;
            }
        }
        failures
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Verify both directories accept writes by creating and deleting a probe file.
    pub async fn check_writable(&self) -> Result<(), StorageError> {
        for dir in [&self.upload_dir, &self.output_dir] {
            let probe = dir.join(format!(".probe-{}", TaskId::new()));
            fs::write(&probe, b"ok")
                .await
                .map_err(|e| StorageError::NotWritable {
                    path: dir.clone(),
                    reason: e.to_string(),
                })?;
            let _ = fs::remove_file(&probe).await;
        }
        Ok(())
    }

    /// Total size in bytes of regular files in the upload directory.
    pub async fn upload_dir_bytes(&self) -> Result<u64, StorageError> {
        let mut total = 0;
        let mut entries = fs::read_dir(&self.upload_dir)
            .await
            .map_err(|e| StorageError::io(&self.upload_dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.upload_dir, e))?
        {
            if let Ok(meta) = entry.metadata().await
                && meta.is_file()
            {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

/// Validate and lowercase an extension (leading dot optional).
pub fn normalize_extension(extension: &str) -> Result<String, StorageError> {
    let ext = extension.trim().trim_start_matches('.');
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(StorageError::InvalidExtension(extension.to_string()));
    }
    Ok(ext.to_ascii_lowercase())
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}
