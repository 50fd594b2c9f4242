//! The local synchronization index: one flat JSON document tracking
//! every known accession code and how far it got through prediction and
//! export.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::Result;
use store::fs::{read_json, write_json_atomic};

const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: &str = "1";

/// Timestamp format shared by every date field in the index.
pub const INDEX_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Where a record stands in the `new → queued → predicted → converted →
/// submitted` progression, with `failed`, `empty` and `funpdbe-failed`
/// as terminal side exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryStatus {
    /// Imported from the catalogue, not yet sent for prediction.
    New,
    /// Submitted to the prediction service, result pending.
    Queued,
    /// The prediction service reported a failure. An operator reset
    /// moves these back to `new` for a retry.
    Failed,
    /// Prediction finished, export not yet attempted.
    Predicted,
    /// The prediction holds zero binding sites; nothing to export.
    Empty,
    /// Conversion to the export schema failed.
    FunpdbeFailed,
    /// Export artifact produced but not yet delivered.
    Converted,
    /// Export artifact delivered into the export tree.
    Submitted,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Failed => "failed",
            Self::Predicted => "predicted",
            Self::Empty => "empty",
            Self::FunpdbeFailed => "funpdbe-failed",
            Self::Converted => "converted",
            Self::Submitted => "submitted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub status: EntryStatus,
    #[serde(rename = "createDate")]
    pub create_date: String,
    #[serde(rename = "pdbReleaseDate", skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(rename = "remoteCreatedDate", skip_serializing_if = "Option::is_none")]
    pub remote_created: Option<String>,
    #[serde(rename = "remoteCheckDate", skip_serializing_if = "Option::is_none")]
    pub remote_checked: Option<String>,
}

impl IndexRecord {
    pub fn new(release_date: Option<String>) -> Self {
        Self {
            status: EntryStatus::New,
            create_date: Utc::now().format(INDEX_TIME_FORMAT).to_string(),
            release_date,
            remote_created: None,
            remote_checked: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CursorSection {
    #[serde(rename = "lastSynchronization", skip_serializing_if = "Option::is_none")]
    pub last_synchronization: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncIndex {
    pub version: String,
    #[serde(default)]
    pub pdb: CursorSection,
    #[serde(default)]
    pub data: BTreeMap<String, IndexRecord>,
}

impl Default for SyncIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            pdb: CursorSection::default(),
            data: BTreeMap::new(),
        }
    }
}

impl SyncIndex {
    /// Insert catalogue entries that are not yet tracked as `new`.
    pub fn insert_new(&mut self, code: &str, release_date: Option<String>) -> bool {
        if self.data.contains_key(code) {
            return false;
        }
        self.data
            .insert(code.to_string(), IndexRecord::new(release_date));
        true
    }

    /// Operator retry: every `failed` record goes back to `new`.
    pub fn reset_failed(&mut self) -> usize {
        let mut count = 0;
        for record in self.data.values_mut() {
            if record.status == EntryStatus::Failed {
                record.status = EntryStatus::New;
                count += 1;
            }
        }
        count
    }

    pub fn count_with_status(&self, status: EntryStatus) -> usize {
        self.data
            .values()
            .filter(|record| record.status == status)
            .count()
    }

    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for record in self.data.values() {
            *counts.entry(record.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    pub fn log_status_counts(&self) {
        let summary = self
            .status_counts()
            .into_iter()
            .map(|(status, count)| format!("    {status}: {count}"))
            .collect::<Vec<_>>()
            .join("\n");
        info!("Synchronization summary:\n{summary}");
    }
}

/// Loads and persists the index document; every save is atomic.
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            path: directory.as_ref().join(INDEX_FILE),
        }
    }

    pub async fn load(&self) -> Result<SyncIndex> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    pub async fn save(&self, index: &SyncIndex) -> Result<()> {
        write_json_atomic(&self.path, index).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_index_is_default() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path());
        let index = store.load().await.unwrap();
        assert_eq!(index.version, "1");
        assert!(index.data.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path());
        let mut index = SyncIndex::default();
        index.insert_new("2SRC", Some("2026-01-01T00:00:00Z".to_string()));
        index.pdb.last_synchronization = Some("2026-02-01T00:00:00Z".to_string());
        store.save(&index).await.unwrap();

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.data["2SRC"].status, EntryStatus::New);
        assert_eq!(
            reloaded.data["2SRC"].release_date.as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
        assert_eq!(
            reloaded.pdb.last_synchronization.as_deref(),
            Some("2026-02-01T00:00:00Z")
        );
    }

    #[test]
    fn test_insert_new_does_not_overwrite() {
        let mut index = SyncIndex::default();
        assert!(index.insert_new("2SRC", None));
        index.data.get_mut("2SRC").unwrap().status = EntryStatus::Queued;
        assert!(!index.insert_new("2SRC", None));
        assert_eq!(index.data["2SRC"].status, EntryStatus::Queued);
    }

    #[test]
    fn test_reset_failed_only_touches_failed() {
        let mut index = SyncIndex::default();
        index.insert_new("1AAA", None);
        index.insert_new("1BBB", None);
        index.insert_new("1CCC", None);
        index.data.get_mut("1AAA").unwrap().status = EntryStatus::Failed;
        index.data.get_mut("1BBB").unwrap().status = EntryStatus::FunpdbeFailed;

        assert_eq!(index.reset_failed(), 1);
        assert_eq!(index.data["1AAA"].status, EntryStatus::New);
        assert_eq!(index.data["1BBB"].status, EntryStatus::FunpdbeFailed);
        assert_eq!(index.data["1CCC"].status, EntryStatus::New);
    }

    #[test]
    fn test_status_serialization_names() {
        let json = serde_json::to_string(&EntryStatus::FunpdbeFailed).unwrap();
        assert_eq!(json, "\"funpdbe-failed\"");
    }
}
