//! External collaborators of the pipeline, behind trait seams.
//!
//! The scientific tools (structure manipulation, conservation pipelines,
//! the predictor itself) and remote structure sources are processes and
//! services this crate only invokes. Tests substitute mocks for all of
//! them.

use async_trait::async_trait;
use bindsight_core::PredictorProfile;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{PipelineError, Result};

const ACCESSION_URL_TEMPLATE: &str = "https://files.rcsb.org/download/{}.cif";
const MODEL_ENTRY_URL_TEMPLATE: &str = "https://alphafold.ebi.ac.uk/api/prediction/{}";

/// Run an external command, appending its stdout and stderr to the task
/// log. A nonzero exit status is fatal for the task.
pub async fn run_logged(program: &Path, args: &[String], log_path: &Path) -> Result<()> {
    let command_line = format!(
        "{} {}",
        program.display(),
        args.join(" ")
    );
    debug!(command = %command_line, "Executing external command");

    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let mut log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;
    log.write_all(format!("$ {command_line}\n").as_bytes())
        .await?;
    log.write_all(&output.stdout).await?;
    log.write_all(&output.stderr).await?;
    log.flush().await?;

    if !output.status.success() {
        return Err(PipelineError::ExternalTool {
            command: command_line,
            status: output.status.code().unwrap_or(-1),
        });
    }
    debug!(command = %command_line, "External command done");
    Ok(())
}

/// Obtains raw structure files from remote services.
#[async_trait]
pub trait StructureFetcher: Send + Sync {
    /// Download a published structure by accession code.
    async fn fetch_accession(&self, code: &str, destination: &Path) -> Result<()>;

    /// Resolve a predicted model's entry and download its structure
    /// file. Returns the entry metadata for the status record.
    async fn fetch_predicted_model(&self, id: &str, destination: &Path) -> Result<Value>;
}

/// Fetcher backed by the public structure archive and the prediction
/// service's entry API.
pub struct HttpStructureFetcher {
    client: reqwest::Client,
    accession_template: String,
    model_entry_template: String,
}

impl HttpStructureFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            accession_template: ACCESSION_URL_TEMPLATE.to_string(),
            model_entry_template: MODEL_ENTRY_URL_TEMPLATE.to_string(),
        }
    }

    pub fn with_endpoints(
        mut self,
        accession_template: impl Into<String>,
        model_entry_template: impl Into<String>,
    ) -> Self {
        self.accession_template = accession_template.into();
        self.model_entry_template = model_entry_template.into();
        self
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<()> {
        debug!(url = %url, destination = %destination.display(), "Downloading");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::transient(format!("request to {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(PipelineError::transient(format!(
                "download of {url} failed with status {}",
                response.status()
            )));
        }
        let content = response
            .bytes()
            .await
            .map_err(|e| PipelineError::transient(format!("reading {url} failed: {e}")))?;
        fs::write(destination, &content).await?;
        Ok(())
    }
}

impl Default for HttpStructureFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StructureFetcher for HttpStructureFetcher {
    async fn fetch_accession(&self, code: &str, destination: &Path) -> Result<()> {
        let url = self.accession_template.replace("{}", code);
        self.download(&url, destination).await
    }

    async fn fetch_predicted_model(&self, id: &str, destination: &Path) -> Result<Value> {
        let url = self.model_entry_template.replace("{}", id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::transient(format!("request to {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(PipelineError::transient(format!(
                "model entry request for {id} failed with status {}",
                response.status()
            )));
        }
        let entries: Vec<Value> = response
            .json()
            .await
            .map_err(|e| PipelineError::transient(format!("reading model entry failed: {e}")))?;
        let entry = entries.first().ok_or_else(|| {
            PipelineError::configuration(format!("no predicted-model entry found for {id}"))
        })?;
        let model_url = entry
            .get("cifUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PipelineError::data_integrity(format!("model entry for {id} has no file URL"))
            })?
            .to_string();
        self.download(&model_url, destination).await?;
        Ok(Value::Array(entries))
    }
}

/// Structure manipulation: chain reduction, sequence extraction, and
/// residue-level structure summaries.
#[async_trait]
pub trait StructureTool: Send + Sync {
    async fn reduce_to_chains(
        &self,
        input: &Path,
        output: &Path,
        chains: &[String],
        log: &Path,
    ) -> Result<()>;

    /// Derive one sequence file per chain into `output_directory` and
    /// return the chain-to-file map.
    async fn extract_sequences(
        &self,
        structure: &Path,
        output_directory: &Path,
        log: &Path,
    ) -> Result<BTreeMap<String, PathBuf>>;

    /// Write the residue-level structure summary as JSON.
    async fn structure_info(&self, input: &Path, output: &Path, log: &Path) -> Result<()>;
}

/// Structure tool invoked as an external process.
pub struct ProcessStructureTool {
    executable: PathBuf,
    info_executable: PathBuf,
}

impl ProcessStructureTool {
    pub fn new(executable: impl Into<PathBuf>, info_executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            info_executable: info_executable.into(),
        }
    }
}

/// Collect `{name}_{CHAIN}.fasta` files from a directory into a
/// chain-keyed map.
pub async fn collect_sequence_files(directory: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut result = BTreeMap::new();
    let mut entries = fs::read_dir(directory).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = name.strip_suffix(".fasta") else {
            continue;
        };
        let Some((_, chain)) = stem.rsplit_once('_') else {
            continue;
        };
        result.insert(chain.to_string(), entry.path());
    }
    Ok(result)
}

#[async_trait]
impl StructureTool for ProcessStructureTool {
    async fn reduce_to_chains(
        &self,
        input: &Path,
        output: &Path,
        chains: &[String],
        log: &Path,
    ) -> Result<()> {
        let args = vec![
            "transform".to_string(),
            "reduce-to-chains".to_string(),
            "-f".to_string(),
            input.to_string_lossy().to_string(),
            "--out_file".to_string(),
            output.to_string_lossy().to_string(),
            "-chains".to_string(),
            chains.join(","),
        ];
        run_logged(&self.executable, &args, log).await
    }

    async fn extract_sequences(
        &self,
        structure: &Path,
        output_directory: &Path,
        log: &Path,
    ) -> Result<BTreeMap<String, PathBuf>> {
        let args = vec![
            "analyze".to_string(),
            "fasta-masked".to_string(),
            "--f".to_string(),
            structure.to_string_lossy().to_string(),
            "--o".to_string(),
            output_directory.to_string_lossy().to_string(),
        ];
        run_logged(&self.executable, &args, log).await?;
        collect_sequence_files(output_directory).await
    }

    async fn structure_info(&self, input: &Path, output: &Path, log: &Path) -> Result<()> {
        let args = vec![
            "structure-info".to_string(),
            format!("--input={}", input.display()),
            format!("--output={}", output.display()),
        ];
        run_logged(&self.info_executable, &args, log).await
    }
}

/// Conservation pipelines (multiple-sequence alignment or profile HMM).
#[async_trait]
pub trait ConservationTool: Send + Sync {
    /// Compute per-residue conservation for one sequence file into
    /// `output_file`, using `working_directory` for scratch data.
    async fn compute(
        &self,
        fasta_file: &Path,
        working_directory: &Path,
        output_file: &Path,
        log: &Path,
    ) -> Result<()>;
}

/// Conservation pipeline invoked as an external script.
pub struct ProcessConservationTool {
    executable: PathBuf,
}

impl ProcessConservationTool {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl ConservationTool for ProcessConservationTool {
    async fn compute(
        &self,
        fasta_file: &Path,
        working_directory: &Path,
        output_file: &Path,
        log: &Path,
    ) -> Result<()> {
        let args = vec![
            "--file".to_string(),
            fasta_file.to_string_lossy().to_string(),
            "--working".to_string(),
            working_directory.to_string_lossy().to_string(),
            "--output".to_string(),
            output_file.to_string_lossy().to_string(),
        ];
        run_logged(&self.executable, &args, log).await
    }
}

/// The binding-site predictor.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(
        &self,
        profile: PredictorProfile,
        input_structure: &Path,
        output_directory: &Path,
        log: &Path,
    ) -> Result<()>;
}

/// Predictor invoked as an external process.
pub struct ProcessPredictor {
    executable: PathBuf,
}

impl ProcessPredictor {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl Predictor for ProcessPredictor {
    async fn predict(
        &self,
        profile: PredictorProfile,
        input_structure: &Path,
        output_directory: &Path,
        log: &Path,
    ) -> Result<()> {
        let args = vec![
            "predict".to_string(),
            "-c".to_string(),
            profile.as_str().to_string(),
            "-threads".to_string(),
            "1".to_string(),
            "-f".to_string(),
            input_structure.to_string_lossy().to_string(),
            "-o".to_string(),
            output_directory.to_string_lossy().to_string(),
            "--log_to_console".to_string(),
            "1".to_string(),
        ];
        run_logged(&self.executable, &args, log).await
    }
}
