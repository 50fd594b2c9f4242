//! Directory-backed task persistence.
//!
//! Each task lives under `{root}/{shard}/{ID}/` where the shard is a
//! two-character slice of the identifier, keeping directory fan-out
//! bounded:
//!
//! ```text
//! {root}/
//! └── SR/
//!     └── 2SRC_A/
//!         ├── status.json
//!         ├── log
//!         ├── input/configuration.json
//!         ├── working/          # ephemeral
//!         └── public/           # persisted artifacts
//! ```

use bindsight_core::{TaskConfiguration, TaskInfo, TaskStateMachine};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::fs::{read_json, write_json_atomic};

const STATUS_FILE: &str = "status.json";
const LOG_FILE: &str = "log";
const INPUT_DIR: &str = "input";
const CONFIGURATION_FILE: &str = "configuration.json";
const WORKING_DIR: &str = "working";
const PUBLIC_DIR: &str = "public";

/// How long to wait for a concurrent creator to finish writing the
/// status record before declaring the directory corrupted.
const CREATION_RACE_ATTEMPTS: u32 = 5;
const CREATION_RACE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
    sharded: bool,
}

impl TaskStore {
    /// Store with two-character shard directories, used for tasks keyed
    /// by accession code.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sharded: true,
        }
    }

    /// Flat store without shard directories, used for upload tasks whose
    /// generated identifiers do not cluster.
    pub fn unsharded(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sharded: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the directory for a task, rejecting identifiers that
    /// could escape the store root.
    pub fn task_directory(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ',' | '-'))
        {
            return Err(StoreError::InvalidIdentifier(id.to_string()));
        }
        if !self.sharded {
            return Ok(self.root.join(id));
        }
        if id.len() < 3 {
            return Err(StoreError::InvalidIdentifier(id.to_string()));
        }
        let shard: String = id.to_uppercase().chars().skip(1).take(2).collect();
        Ok(self.root.join(shard).join(id))
    }

    pub fn status_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.task_directory(id)?.join(STATUS_FILE))
    }

    pub fn log_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.task_directory(id)?.join(LOG_FILE))
    }

    pub fn input_directory(&self, id: &str) -> Result<PathBuf> {
        Ok(self.task_directory(id)?.join(INPUT_DIR))
    }

    pub fn configuration_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.input_directory(id)?.join(CONFIGURATION_FILE))
    }

    pub fn working_directory(&self, id: &str) -> Result<PathBuf> {
        Ok(self.task_directory(id)?.join(WORKING_DIR))
    }

    pub fn public_directory(&self, id: &str) -> Result<PathBuf> {
        Ok(self.task_directory(id)?.join(PUBLIC_DIR))
    }

    /// Create a new task directory with its initial status record and
    /// input configuration. When a concurrent creator won the race the
    /// existing record is returned unchanged; a directory that never
    /// produces a valid record within the bounded wait is a fault.
    pub async fn create(
        &self,
        id: &str,
        configuration: &TaskConfiguration,
        metadata: Map<String, Value>,
    ) -> Result<TaskInfo> {
        let directory = self.task_directory(id)?;
        if let Some(parent) = directory.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::create_dir(&directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return self.wait_for_existing(id).await;
            }
            Err(e) => return Err(e.into()),
        }

        let info = TaskInfo::new(id).with_metadata(metadata);
        write_json_atomic(&directory.join(STATUS_FILE), &info).await?;
        fs::create_dir_all(directory.join(INPUT_DIR)).await?;
        write_json_atomic(
            &directory.join(INPUT_DIR).join(CONFIGURATION_FILE),
            configuration,
        )
        .await?;

        info!(task_id = %id, "Task created");
        Ok(info)
    }

    /// Somebody else owns the directory; give them a moment to finish
    /// writing the status record.
    async fn wait_for_existing(&self, id: &str) -> Result<TaskInfo> {
        let status_path = self.status_path(id)?;
        for _ in 0..CREATION_RACE_ATTEMPTS {
            if let Some(info) = read_json::<TaskInfo>(&status_path).await? {
                debug!(task_id = %id, "Task already exists, returning existing record");
                return Ok(info);
            }
            tokio::time::sleep(CREATION_RACE_DELAY).await;
        }
        Err(StoreError::CreationRace(id.to_string()))
    }

    pub async fn read_status(&self, id: &str) -> Result<TaskInfo> {
        read_json(&self.status_path(id)?)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub async fn read_configuration(&self, id: &str) -> Result<TaskConfiguration> {
        read_json(&self.configuration_path(id)?)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Atomically update the status record through a mutator. A status
    /// change produced by the mutator must follow a legal state-machine
    /// edge; metadata-only updates pass through untouched. The
    /// last-change timestamp is refreshed on every write.
    pub async fn write_status<F>(&self, id: &str, mutate: F) -> Result<TaskInfo>
    where
        F: FnOnce(&mut TaskInfo),
    {
        let mut info = self.read_status(id).await?;
        let previous = info.status;
        mutate(&mut info);
        if info.status != previous {
            TaskStateMachine::validate_transition(&previous, &info.status)?;
        }
        info.last_change = chrono::Utc::now();
        write_json_atomic(&self.status_path(id)?, &info).await?;
        debug!(task_id = %id, status = info.status.as_str(), "Status written");
        Ok(info)
    }

    /// Best-effort cleanup of ephemeral intermediate files. The status
    /// record and public artifacts are never touched.
    pub async fn remove_working_subtree(&self, id: &str) -> Result<()> {
        let working = self.working_directory(id)?;
        match fs::remove_dir_all(&working).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Failed to remove working subtree");
                Ok(())
            }
        }
    }

    /// Enumerate identifiers of every task with a status record,
    /// descending one level of shard directories when sharding is
    /// enabled. Stray files and empty directories are skipped.
    pub async fn list_tasks(&self) -> Result<Vec<String>> {
        let mut parents = vec![self.root.clone()];
        if self.sharded {
            parents = Self::child_directories(&self.root).await?;
        }
        let mut tasks = Vec::new();
        for parent in parents {
            for candidate in Self::child_directories(&parent).await? {
                let has_status = fs::try_exists(candidate.join(STATUS_FILE))
                    .await
                    .unwrap_or(false);
                if !has_status {
                    continue;
                }
                if let Some(name) = candidate.file_name() {
                    tasks.push(name.to_string_lossy().to_string());
                }
            }
        }
        tasks.sort();
        Ok(tasks)
    }

    async fn child_directories(parent: &Path) -> Result<Vec<PathBuf>> {
        let mut result = Vec::new();
        let mut entries = match fs::read_dir(parent).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                result.push(path);
            }
        }
        Ok(result)
    }

    pub async fn exists(&self, id: &str) -> bool {
        match self.status_path(id) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}
