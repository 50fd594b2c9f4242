//! Advisory per-task execution lock.
//!
//! The dispatcher delivers at least once, so two workers can receive the
//! same task. A lock file named after the task directory, kept outside
//! that directory, marks an execution in flight. Release happens in
//! `Drop`, covering every exit path of the holder.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Serialize)]
struct LockRecord<'a> {
    start: String,
    directory: &'a str,
}

/// Held for the duration of one task execution. Dropping the guard
/// removes the lock file.
#[derive(Debug)]
pub struct TaskLock {
    path: PathBuf,
}

impl TaskLock {
    /// Try to acquire the lock for a task directory. Returns `None` when
    /// another worker already holds it; that is a normal no-op for the
    /// caller, not an error.
    pub async fn acquire(lock_root: &Path, task_directory: &Path) -> Result<Option<TaskLock>> {
        fs::create_dir_all(lock_root).await?;
        let path = lock_root.join(Self::lock_name(task_directory));

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(lock = %path.display(), "Task already locked by another worker");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let directory = task_directory.to_string_lossy();
        let record = LockRecord {
            start: Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            directory: &directory,
        };
        file.write_all(&serde_json::to_vec(&record)?).await?;
        debug!(lock = %path.display(), "Task lock acquired");
        Ok(Some(TaskLock { path }))
    }

    fn lock_name(task_directory: &Path) -> String {
        task_directory
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "_")
    }
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release task lock");
        }
    }
}
