//! Reconciliation passes against an on-disk index, with the catalogue
//! and the prediction service mocked.

use async_trait::async_trait;
use bindsight_core::{TaskInfo, TaskStatus};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use synchronization::{
    CatalogClient, CatalogEntry, EntryStatus, ExportConfiguration, IndexStore, PredictionService,
    Reconciler, ReconcilerOptions, RemoteJob, Result, SyncError, SyncIndex,
};

struct MockCatalog {
    entries: Vec<CatalogEntry>,
}

#[async_trait]
impl CatalogClient for MockCatalog {
    async fn entries_since(&self, _date: Option<&str>) -> Result<Vec<CatalogEntry>> {
        Ok(self.entries.clone())
    }
}

#[derive(Clone)]
enum InfoAnswer {
    Status(TaskStatus),
    Rejected(u16),
    Unreachable,
}

#[derive(Clone)]
enum ArchiveAnswer {
    Bundle(Vec<u8>),
    Missing,
}

struct MockService {
    info: HashMap<String, InfoAnswer>,
    archives: HashMap<String, ArchiveAnswer>,
}

impl MockService {
    fn new() -> Self {
        Self {
            info: HashMap::new(),
            archives: HashMap::new(),
        }
    }

    fn with_info(mut self, code: &str, answer: InfoAnswer) -> Self {
        self.info.insert(code.to_string(), answer);
        self
    }

    fn with_archive(mut self, code: &str, answer: ArchiveAnswer) -> Self {
        self.archives.insert(code.to_string(), answer);
        self
    }
}

#[async_trait]
impl PredictionService for MockService {
    async fn fetch_info(&self, code: &str) -> Result<RemoteJob> {
        match self.info.get(code) {
            Some(InfoAnswer::Status(status)) => {
                let mut info = TaskInfo::new(code);
                info.status = *status;
                Ok(RemoteJob::Available(info))
            }
            Some(InfoAnswer::Rejected(status)) => Ok(RemoteJob::Rejected(*status)),
            Some(InfoAnswer::Unreachable) | None => {
                Err(SyncError::transient("connection refused"))
            }
        }
    }

    async fn fetch_archive(&self, code: &str, destination: &Path) -> Result<()> {
        match self.archives.get(code) {
            Some(ArchiveAnswer::Bundle(bytes)) => {
                tokio::fs::write(destination, bytes).await?;
                Ok(())
            }
            Some(ArchiveAnswer::Missing) | None => Err(SyncError::Remote {
                code: code.to_string(),
                status: 404,
            }),
        }
    }
}

const PREDICTIONS: &str = "\
name, rank, score, probability, center_x, center_y, center_z, residue_ids, surf_atom_ids
pocket1, 1, 4.2, 0.71, 1.0, 2.0, 3.0, A_12, 101
";

const EMPTY_PREDICTIONS: &str = "\
name, rank, score, probability, center_x, center_y, center_z, residue_ids, surf_atom_ids
";

const RESIDUES: &str = "\
chain, residue_label, residue_name, score, zscore, probability, pocket
A, 12, HIS, 3.0, 0.1, 0.9, 1
";

fn bundle(predictions: &str, residues: &str) -> Vec<u8> {
    let cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);
    let options = zip::write::SimpleFileOptions::default();
    writer
        .start_file("structure.cif_predictions.csv", options)
        .unwrap();
    writer.write_all(predictions.as_bytes()).unwrap();
    writer
        .start_file("structure.cif_residues.csv", options)
        .unwrap();
    writer.write_all(residues.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

fn export_configuration() -> ExportConfiguration {
    ExportConfiguration::new("bindsight", "http://localhost/analyze/?code={}", "2.4")
}

async fn seed_index(directory: &Path, records: &[(&str, EntryStatus)]) {
    let mut index = SyncIndex::default();
    for (code, status) in records {
        index.insert_new(code, None);
        index.data.get_mut(*code).unwrap().status = *status;
    }
    IndexStore::new(directory).save(&index).await.unwrap();
}

async fn load_index(directory: &Path) -> SyncIndex {
    IndexStore::new(directory).load().await.unwrap()
}

#[tokio::test]
async fn test_queue_limit_zero_blocks_promotion() {
    let dir = TempDir::new().unwrap();
    seed_index(dir.path(), &[("1ABC", EntryStatus::New)]).await;

    let reconciler = Reconciler::new(
        dir.path(),
        Arc::new(MockCatalog { entries: vec![] }),
        Arc::new(MockService::new().with_info("1ABC", InfoAnswer::Status(TaskStatus::Queued))),
        export_configuration(),
        ReconcilerOptions {
            queue_limit: 0,
            ..Default::default()
        },
    );
    reconciler.run_pass().await.unwrap();

    let index = load_index(dir.path()).await;
    assert_eq!(index.data["1ABC"].status, EntryStatus::New);
}

#[tokio::test]
async fn test_promotion_under_queue_limit() {
    let dir = TempDir::new().unwrap();
    seed_index(
        dir.path(),
        &[("1ABC", EntryStatus::New), ("2DEF", EntryStatus::New)],
    )
    .await;

    let service = MockService::new()
        .with_info("1ABC", InfoAnswer::Status(TaskStatus::Queued))
        .with_info("2DEF", InfoAnswer::Status(TaskStatus::Queued));
    let reconciler = Reconciler::new(
        dir.path(),
        Arc::new(MockCatalog { entries: vec![] }),
        Arc::new(service),
        export_configuration(),
        ReconcilerOptions {
            queue_limit: 1,
            ..Default::default()
        },
    );
    reconciler.run_pass().await.unwrap();

    let index = load_index(dir.path()).await;
    let queued = index.count_with_status(EntryStatus::Queued);
    let fresh = index.count_with_status(EntryStatus::New);
    assert_eq!(queued, 1);
    assert_eq!(fresh, 1);
}

#[tokio::test]
async fn test_poll_maps_remote_statuses() {
    let dir = TempDir::new().unwrap();
    seed_index(
        dir.path(),
        &[
            ("1RUN", EntryStatus::Queued),
            ("1BAD", EntryStatus::Queued),
            ("1OFF", EntryStatus::Queued),
        ],
    )
    .await;

    let service = MockService::new()
        .with_info("1RUN", InfoAnswer::Status(TaskStatus::Running))
        .with_info("1BAD", InfoAnswer::Rejected(500))
        .with_info("1OFF", InfoAnswer::Unreachable);
    let reconciler = Reconciler::new(
        dir.path(),
        Arc::new(MockCatalog { entries: vec![] }),
        Arc::new(service),
        export_configuration(),
        ReconcilerOptions::default(),
    );
    reconciler.run_pass().await.unwrap();

    let index = load_index(dir.path()).await;
    // Still running remotely: stays queued.
    assert_eq!(index.data["1RUN"].status, EntryStatus::Queued);
    assert!(index.data["1RUN"].remote_checked.is_some());
    // Rejected by the service: failed.
    assert_eq!(index.data["1BAD"].status, EntryStatus::Failed);
    // Unreachable: transient, record untouched.
    assert_eq!(index.data["1OFF"].status, EntryStatus::Queued);
    assert!(index.data["1OFF"].remote_checked.is_none());
}

#[tokio::test]
async fn test_export_isolates_record_failures() {
    let dir = TempDir::new().unwrap();
    seed_index(
        dir.path(),
        &[
            ("1AAA", EntryStatus::Predicted),
            ("1BBB", EntryStatus::Predicted),
            ("1CCC", EntryStatus::Predicted),
        ],
    )
    .await;

    let service = MockService::new()
        .with_archive("1AAA", ArchiveAnswer::Bundle(bundle(PREDICTIONS, RESIDUES)))
        .with_archive("1BBB", ArchiveAnswer::Missing)
        .with_archive(
            "1CCC",
            ArchiveAnswer::Bundle(bundle(EMPTY_PREDICTIONS, RESIDUES)),
        );
    let reconciler = Reconciler::new(
        dir.path(),
        Arc::new(MockCatalog { entries: vec![] }),
        Arc::new(service),
        export_configuration(),
        ReconcilerOptions::default(),
    );
    reconciler.run_pass().await.unwrap();

    let index = load_index(dir.path()).await;
    assert_eq!(index.data["1AAA"].status, EntryStatus::Submitted);
    assert_eq!(index.data["1BBB"].status, EntryStatus::FunpdbeFailed);
    assert_eq!(index.data["1CCC"].status, EntryStatus::Empty);

    // The good record landed in the sharded export tree.
    assert!(dir.path().join("ftp").join("aa").join("1aaa.json").exists());
    // The failed record left a diagnostic behind.
    assert!(dir
        .path()
        .join("working")
        .join("1BBB")
        .join("error.log")
        .exists());
}

#[tokio::test]
async fn test_catalogue_import_and_cursor() {
    let dir = TempDir::new().unwrap();
    seed_index(dir.path(), &[("2SRC", EntryStatus::Submitted)]).await;

    let catalog = MockCatalog {
        entries: vec![
            CatalogEntry {
                code: "2SRC".to_string(),
                release_date: "2026-01-01T00:00:00Z".to_string(),
            },
            CatalogEntry {
                code: "9NEW".to_string(),
                release_date: "2026-08-01T00:00:00Z".to_string(),
            },
        ],
    };
    let reconciler = Reconciler::new(
        dir.path(),
        Arc::new(catalog),
        Arc::new(MockService::new()),
        export_configuration(),
        ReconcilerOptions {
            queue_limit: 0,
            ..Default::default()
        },
    );
    let summary = reconciler.run_pass().await.unwrap();

    assert_eq!(summary.imported, 1);
    let index = load_index(dir.path()).await;
    // Already-tracked records are never reset by an import.
    assert_eq!(index.data["2SRC"].status, EntryStatus::Submitted);
    assert_eq!(index.data["9NEW"].status, EntryStatus::New);
    assert!(index.pdb.last_synchronization.is_some());
}

#[tokio::test]
async fn test_retry_resets_failed_records() {
    let dir = TempDir::new().unwrap();
    seed_index(
        dir.path(),
        &[
            ("1ERR", EntryStatus::Failed),
            ("1XXX", EntryStatus::FunpdbeFailed),
        ],
    )
    .await;

    let reconciler = Reconciler::new(
        dir.path(),
        Arc::new(MockCatalog { entries: vec![] }),
        Arc::new(MockService::new().with_info("1ERR", InfoAnswer::Status(TaskStatus::Queued))),
        export_configuration(),
        ReconcilerOptions {
            queue_limit: 4,
            retry_failed: true,
            ..Default::default()
        },
    );
    let summary = reconciler.run_pass().await.unwrap();

    assert_eq!(summary.reverted, 1);
    let index = load_index(dir.path()).await;
    // Reset to new, then promoted again within the same pass.
    assert_eq!(index.data["1ERR"].status, EntryStatus::Queued);
    // Conversion failures are not retried by the reset.
    assert_eq!(index.data["1XXX"].status, EntryStatus::FunpdbeFailed);
}
