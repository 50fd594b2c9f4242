//! One synchronization pass over the whole record index.
//!
//! A pass imports new catalogue entries, polls queued jobs, promotes new
//! records under the admission limit, and drives predicted records
//! through export. Records are processed independently; the index is
//! persisted after every phase so a mid-pass failure loses at most the
//! phase in flight.

use bindsight_core::TaskStatus;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogClient;
use crate::convert::{convert_prediction, ExportConfiguration};
use crate::error::{Result, SyncError};
use crate::index::{EntryStatus, IndexRecord, IndexStore, SyncIndex, INDEX_TIME_FORMAT};
use crate::remote::{PredictionService, RemoteJob};

const WORKING_DIR: &str = "working";
const EXPORT_DIR: &str = "ftp";
const PREDICTIONS_TABLE: &str = "structure.cif_predictions.csv";
const RESIDUES_TABLE: &str = "structure.cif_residues.csv";

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Maximum number of records allowed to sit in `queued` at once.
    pub queue_limit: usize,
    /// Reset `failed` records to `new` before the pass.
    pub retry_failed: bool,
    /// Override the stored synchronization cursor for this pass.
    pub since: Option<String>,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            queue_limit: 4,
            retry_failed: false,
            since: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PassSummary {
    pub imported: usize,
    pub reverted: usize,
    pub status_counts: std::collections::BTreeMap<&'static str, usize>,
}

pub struct Reconciler {
    data_directory: PathBuf,
    index_store: IndexStore,
    catalog: Arc<dyn CatalogClient>,
    service: Arc<dyn PredictionService>,
    export: ExportConfiguration,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        data_directory: impl Into<PathBuf>,
        catalog: Arc<dyn CatalogClient>,
        service: Arc<dyn PredictionService>,
        export: ExportConfiguration,
        options: ReconcilerOptions,
    ) -> Self {
        let data_directory = data_directory.into();
        Self {
            index_store: IndexStore::new(&data_directory),
            data_directory,
            catalog,
            service,
            export,
            options,
        }
    }

    /// Run one full pass. Assumes it is the only active reconciler; the
    /// index document has a single writer by operational convention.
    pub async fn run_pass(&self) -> Result<PassSummary> {
        let started = Utc::now().format(INDEX_TIME_FORMAT).to_string();
        fs::create_dir_all(&self.data_directory).await?;
        let mut index = self.index_store.load().await?;

        let since = self
            .options
            .since
            .clone()
            .or_else(|| index.pdb.last_synchronization.clone());
        let imported = match self.import_catalogue(&mut index, since.as_deref()).await {
            Ok(imported) => {
                // The catalogue answered; entries released after this
                // pass started will be picked up by the next one.
                index.pdb.last_synchronization = Some(started);
                imported
            }
            Err(e) => {
                warn!(error = %e, "Catalogue fetch failed, keeping cursor");
                0
            }
        };
        self.index_store.save(&index).await?;

        let mut reverted = 0;
        if self.options.retry_failed {
            reverted = index.reset_failed();
            info!(count = reverted, "Reverted failed records for retry");
            self.index_store.save(&index).await?;
        }

        self.synchronize_queue(&mut index).await;
        self.index_store.save(&index).await?;

        if let Err(e) = self.export_predicted(&mut index).await {
            error!(error = %e, "Export phase aborted");
        }
        self.index_store.save(&index).await?;

        index.log_status_counts();
        Ok(PassSummary {
            imported,
            reverted,
            status_counts: index.status_counts(),
        })
    }

    async fn import_catalogue(
        &self,
        index: &mut SyncIndex,
        since: Option<&str>,
    ) -> Result<usize> {
        info!(since = since.unwrap_or("beginning"), "Fetching catalogue entries");
        let entries = self.catalog.entries_since(since).await?;
        let mut imported = 0;
        for entry in entries {
            if index.insert_new(&entry.code, Some(entry.release_date)) {
                imported += 1;
            }
        }
        info!(imported = imported, "Catalogue entries imported");
        Ok(imported)
    }

    /// Poll everything queued, then promote `new` records while the
    /// queue depth stays under the admission limit.
    async fn synchronize_queue(&self, index: &mut SyncIndex) {
        info!("Checking queued records ...");
        for (code, record) in index.data.iter_mut() {
            if record.status == EntryStatus::Queued {
                self.poll_record(code, record).await;
            }
        }
        let mut queued = index.count_with_status(EntryStatus::Queued);
        info!(queued = queued, limit = self.options.queue_limit, "Queue depth");

        for (code, record) in index.data.iter_mut() {
            if queued >= self.options.queue_limit {
                break;
            }
            if record.status != EntryStatus::New {
                continue;
            }
            self.poll_record(code, record).await;
            if record.status == EntryStatus::Queued {
                queued += 1;
            }
        }
    }

    /// Ask the prediction service about one record and fold the answer
    /// into its status. Requesting info is also what enqueues a new
    /// record remotely. Connection failures leave the record untouched.
    async fn poll_record(&self, code: &str, record: &mut IndexRecord) {
        let job = match self.service.fetch_info(code).await {
            Ok(job) => job,
            Err(e) => {
                warn!(code = %code, error = %e, "Cannot reach prediction service");
                return;
            }
        };
        match job {
            RemoteJob::Rejected(status) => {
                warn!(code = %code, status = status, "Prediction service rejected record");
                record.status = EntryStatus::Failed;
            }
            RemoteJob::Available(info) => {
                record.remote_created =
                    Some(info.created.format(INDEX_TIME_FORMAT).to_string());
                record.remote_checked =
                    Some(info.last_change.format(INDEX_TIME_FORMAT).to_string());
                record.status = match info.status {
                    TaskStatus::Successful => EntryStatus::Predicted,
                    TaskStatus::Failed => EntryStatus::Failed,
                    TaskStatus::Queued | TaskStatus::Running => EntryStatus::Queued,
                };
                debug!(code = %code, status = record.status.as_str(), "Record updated");
            }
        }
    }

    /// Convert and deliver every `predicted` record. Each record is
    /// isolated: one failure never stops the others.
    async fn export_predicted(&self, index: &mut SyncIndex) -> Result<()> {
        fs::create_dir_all(self.data_directory.join(EXPORT_DIR)).await?;
        fs::create_dir_all(self.data_directory.join(WORKING_DIR)).await?;

        let predicted: Vec<String> = index
            .data
            .iter()
            .filter(|(_, record)| record.status == EntryStatus::Predicted)
            .map(|(code, _)| code.clone())
            .collect();

        for code in predicted {
            let working_directory = self.data_directory.join(WORKING_DIR).join(&code);
            fs::create_dir_all(&working_directory).await?;

            let converted = match self.convert_record(&code, &working_directory).await {
                Ok(output) => output,
                Err(SyncError::EmptyPrediction) => {
                    info!(code = %code, "Prediction is empty, nothing to export");
                    set_status(index, &code, EntryStatus::Empty);
                    remove_directory(&working_directory).await;
                    continue;
                }
                Err(e) => {
                    error!(code = %code, error = %e, "Conversion failed");
                    write_error_log(&working_directory, &e).await;
                    set_status(index, &code, EntryStatus::FunpdbeFailed);
                    continue;
                }
            };
            set_status(index, &code, EntryStatus::Converted);

            match self.deliver(&code, &converted).await {
                Ok(()) => {
                    set_status(index, &code, EntryStatus::Submitted);
                    remove_directory(&working_directory).await;
                    debug!(code = %code, "Export done");
                }
                Err(e) => {
                    error!(code = %code, error = %e, "Delivery failed");
                    write_error_log(&working_directory, &e).await;
                    set_status(index, &code, EntryStatus::FunpdbeFailed);
                }
            }
        }
        Ok(())
    }

    /// Download the raw bundle, pull out the predictor tables and
    /// convert them. Returns the converted document in the working
    /// directory.
    async fn convert_record(&self, code: &str, working_directory: &Path) -> Result<PathBuf> {
        let archive = working_directory.join(format!("{code}.zip"));
        self.service.fetch_archive(code, &archive).await?;
        unpack_tables(
            archive,
            working_directory.to_path_buf(),
            vec![PREDICTIONS_TABLE.to_string(), RESIDUES_TABLE.to_string()],
        )
        .await?;

        let output = working_directory.join(format!("{}.json", code.to_lowercase()));
        convert_prediction(
            &self.export,
            code,
            &working_directory.join(PREDICTIONS_TABLE),
            &working_directory.join(RESIDUES_TABLE),
            &output,
        )
        .await?;
        Ok(output)
    }

    /// Move the converted document into the sharded export tree.
    async fn deliver(&self, code: &str, converted: &Path) -> Result<()> {
        let lower = code.to_lowercase();
        let shard: String = lower.chars().skip(1).take(2).collect();
        let target_directory = self.data_directory.join(EXPORT_DIR).join(shard);
        fs::create_dir_all(&target_directory).await?;
        fs::rename(converted, target_directory.join(format!("{lower}.json"))).await?;
        Ok(())
    }
}

fn set_status(index: &mut SyncIndex, code: &str, status: EntryStatus) {
    if let Some(record) = index.data.get_mut(code) {
        record.status = status;
    }
}

async fn remove_directory(directory: &Path) {
    if let Err(e) = fs::remove_dir_all(directory).await {
        warn!(directory = %directory.display(), error = %e, "Cleanup failed");
    }
}

async fn write_error_log(working_directory: &Path, error: &SyncError) {
    let path = working_directory.join("error.log");
    if let Err(e) = fs::write(&path, error.to_string()).await {
        warn!(error = %e, "Cannot write error log");
    }
}

/// Extract the named top-level files from a zip archive.
async fn unpack_tables(
    archive: PathBuf,
    destination: PathBuf,
    names: Vec<String>,
) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&archive)?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| SyncError::conversion(format!("archive is not a zip: {e}")))?;
        for name in &names {
            let mut entry = zip.by_name(name).map_err(|e| {
                SyncError::conversion(format!("archive is missing {name}: {e}"))
            })?;
            let mut output = std::fs::File::create(destination.join(name))?;
            std::io::copy(&mut entry, &mut output)?;
        }
        Ok(())
    })
    .await
    .map_err(|e| SyncError::conversion(format!("unpack task failed: {e}")))?
}
