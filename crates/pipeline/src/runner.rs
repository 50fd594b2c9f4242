//! Task execution driver: takes a stored task from `queued` through the
//! pipeline to a terminal status under an advisory lock.

use bindsight_core::{StructureSource, TaskConfiguration, TaskStatus};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use store::{TaskLock, TaskStore};

use crate::error::Result;
use crate::executor::{Execution, PipelineExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The pipeline ran to completion and the task is `successful`.
    Completed,
    /// The pipeline failed and the task is `failed`.
    Failed,
    /// Another worker holds the lock for this task.
    AlreadyRunning,
    /// The task already reached a terminal status; nothing to do.
    AlreadyDone,
}

pub struct TaskRunner {
    store: TaskStore,
    lock_root: PathBuf,
    executor: Arc<PipelineExecutor>,
    keep_working: bool,
    lazy: bool,
}

impl TaskRunner {
    pub fn new(store: TaskStore, lock_root: impl Into<PathBuf>, executor: Arc<PipelineExecutor>) -> Self {
        Self {
            store,
            lock_root: lock_root.into(),
            executor,
            keep_working: false,
            lazy: false,
        }
    }

    /// Keep the working subtree after a successful run instead of
    /// removing it.
    pub fn with_keep_working(mut self, keep_working: bool) -> Self {
        self.keep_working = keep_working;
        self
    }

    /// Skip stages whose outputs already exist, also for freshly queued
    /// tasks.
    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Execute a single task. Duplicate dispatches are absorbed here:
    /// locked tasks and tasks already in a terminal status are no-ops.
    pub async fn run(&self, id: &str) -> Result<RunOutcome> {
        let directory = self.store.task_directory(id)?;
        let Some(_lock) = TaskLock::acquire(&self.lock_root, &directory).await? else {
            info!(task_id = %id, "Task is locked by another worker");
            return Ok(RunOutcome::AlreadyRunning);
        };

        let info = self.store.read_status(id).await?;
        let resumed = match info.status {
            TaskStatus::Successful | TaskStatus::Failed => {
                info!(task_id = %id, status = info.status.as_str(), "Task already finished");
                return Ok(RunOutcome::AlreadyDone);
            }
            TaskStatus::Running => {
                // A worker died mid-run; re-enter and pick up where the
                // on-disk outputs left off.
                warn!(task_id = %id, "Resuming task left in running state");
                true
            }
            TaskStatus::Queued => {
                self.store
                    .write_status(id, |info| info.status = TaskStatus::Running)
                    .await?;
                false
            }
        };

        let configuration = self.store.read_configuration(id).await?;
        let execution = Execution {
            configuration,
            input_directory: self.store.input_directory(id)?,
            working_directory: self.store.working_directory(id)?,
            public_directory: self.store.public_directory(id)?,
            log_path: self.store.log_path(id)?,
            lazy: self.lazy || resumed,
        };

        match self.executor.execute(&execution).await {
            Ok(outcome) => {
                let prediction = prediction_name(&execution.configuration);
                self.store
                    .write_status(id, |info| {
                        info.status = TaskStatus::Successful;
                        info.metadata.insert(
                            "predictionName".to_string(),
                            Value::String(prediction),
                        );
                        info.metadata.insert(
                            "structureName".to_string(),
                            Value::String(outcome.structure_name),
                        );
                    })
                    .await?;
                if !self.keep_working {
                    self.store.remove_working_subtree(id).await?;
                }
                info!(task_id = %id, "Task finished");
                Ok(RunOutcome::Completed)
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "Task failed");
                self.append_log(&execution.log_path, &format!("prediction failed: {e}\n"))
                    .await;
                self.store
                    .write_status(id, |info| info.status = TaskStatus::Failed)
                    .await?;
                Ok(RunOutcome::Failed)
            }
        }
    }

    /// Run every queued task in the store once. Failures are isolated
    /// per task; the count of completed tasks is returned.
    pub async fn run_pending(&self) -> Result<usize> {
        let mut completed = 0;
        for id in self.store.list_tasks().await? {
            let info = match self.store.read_status(&id).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Skipping unreadable task");
                    continue;
                }
            };
            if info.status != TaskStatus::Queued {
                continue;
            }
            match self.run(&id).await {
                Ok(RunOutcome::Completed) => completed += 1,
                Ok(_) => {}
                Err(e) => error!(task_id = %id, error = %e, "Task run errored"),
            }
        }
        Ok(completed)
    }

    async fn append_log(&self, log_path: &Path, message: &str) {
        let open = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await;
        match open {
            Ok(mut file) => {
                if let Err(e) = file.write_all(message.as_bytes()).await {
                    warn!(error = %e, "Failed to append to task log");
                }
            }
            Err(e) => warn!(error = %e, "Failed to open task log"),
        }
    }
}

/// Display name recorded for the finished prediction, derived from the
/// structure source the way identifiers are presented to users.
fn prediction_name(configuration: &TaskConfiguration) -> String {
    match &configuration.source {
        StructureSource::AccessionCode { code } => {
            if configuration.chains.is_empty() {
                code.clone()
            } else {
                format!("{code}_{}", configuration.chains.join(","))
            }
        }
        StructureSource::UploadedFile { file } => Path::new(file)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "structure".to_string()),
        StructureSource::PredictedModel { id } => id.clone(),
    }
}
