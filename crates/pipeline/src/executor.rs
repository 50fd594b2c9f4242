//! The staged pipeline for one prediction task.
//!
//! Stages run strictly in order: structure acquisition, chain reduction,
//! sequence extraction, conservation, prediction, output assembly. Each
//! stage skips recomputation under the lazy flag when its declared
//! output already exists, and any failure aborts the remaining stages.

use bindsight_core::{ConservationMode, StructureSource, TaskConfiguration};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::hom::{read_fasta_sequence, read_hom_file, write_hom_file};
use crate::output::{self, ExecutionOutcome};
use crate::tools::{ConservationTool, Predictor, StructureFetcher, StructureTool};
use store::ConservationCache;

const RAW_STRUCTURE_STEM: &str = "structure-raw";
const REDUCED_STRUCTURE_STEM: &str = "structure";
const SEQUENCE_DIR: &str = "fasta";
const CONSERVATION_DIR: &str = "conservation";
const PREDICTOR_INPUT_DIR: &str = "predictor-input";
const PREDICTOR_OUTPUT_DIR: &str = "predictor-output";

/// One task execution: where its files live and what to compute.
#[derive(Debug, Clone)]
pub struct Execution {
    pub configuration: TaskConfiguration,
    pub input_directory: PathBuf,
    pub working_directory: PathBuf,
    pub public_directory: PathBuf,
    pub log_path: PathBuf,
    /// Reuse outputs of already-finished stages instead of recomputing.
    pub lazy: bool,
}

/// Conservation caches per mode; either may be absent, disabling the
/// cross-run cache for that mode.
#[derive(Debug, Clone, Default)]
pub struct ConservationCaches {
    pub alignment: Option<ConservationCache>,
    pub hmm: Option<ConservationCache>,
}

impl ConservationCaches {
    /// Mode-specific namespaces under one cache root.
    pub fn rooted(directory: impl AsRef<Path>) -> Self {
        let directory = directory.as_ref();
        Self {
            alignment: Some(ConservationCache::new(directory.join("alignment"))),
            hmm: Some(ConservationCache::new(directory.join("hmm"))),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    fn for_mode(&self, mode: ConservationMode) -> Option<&ConservationCache> {
        match mode {
            ConservationMode::None => None,
            ConservationMode::Alignment => self.alignment.as_ref(),
            ConservationMode::Hmm => self.hmm.as_ref(),
        }
    }
}

struct PreparedStructure {
    raw_file: PathBuf,
    reduced_file: PathBuf,
    sequence_files: BTreeMap<String, PathBuf>,
    extension: String,
    metadata: Map<String, Value>,
}

pub struct PipelineExecutor {
    fetcher: Arc<dyn StructureFetcher>,
    structure_tool: Arc<dyn StructureTool>,
    conservation_tool: Arc<dyn ConservationTool>,
    predictor: Arc<dyn Predictor>,
    caches: ConservationCaches,
}

impl PipelineExecutor {
    pub fn new(
        fetcher: Arc<dyn StructureFetcher>,
        structure_tool: Arc<dyn StructureTool>,
        conservation_tool: Arc<dyn ConservationTool>,
        predictor: Arc<dyn Predictor>,
        caches: ConservationCaches,
    ) -> Self {
        Self {
            fetcher,
            structure_tool,
            conservation_tool,
            predictor,
            caches,
        }
    }

    /// Run all stages for one task. Preconditions are checked before any
    /// external process or network call happens.
    pub async fn execute(&self, execution: &Execution) -> Result<ExecutionOutcome> {
        execution
            .configuration
            .validate()
            .map_err(|e| PipelineError::configuration(e.to_string()))?;
        fs::create_dir_all(&execution.working_directory).await?;

        let structure = self.prepare_structure(execution).await?;
        let conservation = self.prepare_conservation(execution, &structure).await?;
        let predictor_output = self
            .run_predictor(execution, &structure, &conservation)
            .await?;
        let outcome = output::prepare_output(
            execution,
            self.structure_tool.as_ref(),
            &predictor_output,
            &structure.raw_file,
            &structure.extension,
            &conservation,
            structure.metadata,
        )
        .await?;
        info!("All stages done");
        Ok(outcome)
    }

    async fn prepare_structure(&self, execution: &Execution) -> Result<PreparedStructure> {
        info!("Preparing structure ...");
        let mut metadata = Map::new();
        let extension = match &execution.configuration.source {
            StructureSource::AccessionCode { .. } | StructureSource::PredictedModel { .. } => {
                "cif".to_string()
            }
            StructureSource::UploadedFile { file } => Path::new(file)
                .extension()
                .map(|extension| extension.to_string_lossy().to_string())
                .ok_or_else(|| {
                    PipelineError::configuration(format!(
                        "uploaded structure {file} has no file extension"
                    ))
                })?,
        };

        let raw_file = execution
            .working_directory
            .join(format!("{RAW_STRUCTURE_STEM}.{extension}"));
        if execution.lazy && fs::try_exists(&raw_file).await.unwrap_or(false) {
            debug!("Raw structure already exists, skipping acquisition");
        } else {
            match &execution.configuration.source {
                StructureSource::AccessionCode { code } => {
                    self.fetcher.fetch_accession(code, &raw_file).await?;
                }
                StructureSource::UploadedFile { file } => {
                    let source = execution.input_directory.join(file);
                    fs::copy(&source, &raw_file).await.map_err(|e| {
                        PipelineError::data_integrity(format!(
                            "uploaded structure {} is missing: {e}",
                            source.display()
                        ))
                    })?;
                }
                StructureSource::PredictedModel { id } => {
                    let entry = self.fetcher.fetch_predicted_model(id, &raw_file).await?;
                    metadata.insert("predictedModelEntry".to_string(), entry);
                }
            }
        }

        let reduced_file = self.reduce_structure(execution, &raw_file, &extension).await?;

        // Sequences come from the raw file: the viewer needs every
        // chain, including the ones reduction dropped.
        let sequence_directory = execution.working_directory.join(SEQUENCE_DIR);
        fs::create_dir_all(&sequence_directory).await?;
        let sequence_files = self
            .structure_tool
            .extract_sequences(&raw_file, &sequence_directory, &execution.log_path)
            .await?;

        Ok(PreparedStructure {
            raw_file,
            reduced_file,
            sequence_files,
            extension,
            metadata,
        })
    }

    async fn reduce_structure(
        &self,
        execution: &Execution,
        raw_file: &Path,
        extension: &str,
    ) -> Result<PathBuf> {
        if execution.configuration.structure_sealed {
            return Ok(raw_file.to_path_buf());
        }
        let reduced = execution
            .working_directory
            .join(format!("{REDUCED_STRUCTURE_STEM}.{extension}"));
        if execution.lazy && fs::try_exists(&reduced).await.unwrap_or(false) {
            debug!("Reduced structure already exists, skipping reduction");
            return Ok(reduced);
        }
        self.structure_tool
            .reduce_to_chains(
                raw_file,
                &reduced,
                &execution.configuration.chains,
                &execution.log_path,
            )
            .await?;
        Ok(reduced)
    }

    /// Compute (or reuse) conservation per chain. Chains sharing one
    /// sequence within the run compute once; the cross-run cache is
    /// consulted before any external pipeline runs.
    async fn prepare_conservation(
        &self,
        execution: &Execution,
        structure: &PreparedStructure,
    ) -> Result<BTreeMap<String, PathBuf>> {
        let mode = execution.configuration.conservation;
        if mode == ConservationMode::None {
            return Ok(BTreeMap::new());
        }
        info!("Computing conservation ...");
        let output_directory = execution.working_directory.join(CONSERVATION_DIR);
        fs::create_dir_all(&output_directory).await?;

        let mut result = BTreeMap::new();
        let mut computed_this_run: HashMap<String, PathBuf> = HashMap::new();

        for (chain, fasta_file) in &structure.sequence_files {
            let output_file = output_directory.join(format!("conservation-{chain}"));
            if execution.lazy && fs::try_exists(&output_file).await.unwrap_or(false) {
                debug!(chain = %chain, "Conservation file already exists");
                result.insert(chain.clone(), output_file);
                continue;
            }

            let sequence = read_fasta_sequence(fasta_file).await?;
            if let Some(source) = computed_this_run.get(&sequence) {
                debug!(chain = %chain, "Reusing conservation computed for another chain");
                fs::copy(source, &output_file).await?;
                result.insert(chain.clone(), output_file);
                continue;
            }

            if let Some(cache) = self.caches.for_mode(mode) {
                if let Some(scores) = cache.lookup(&sequence).await? {
                    write_hom_file(&output_file, &sequence, &scores).await?;
                    computed_this_run.insert(sequence, output_file.clone());
                    result.insert(chain.clone(), output_file);
                    continue;
                }
            }

            let chain_working = execution
                .working_directory
                .join(format!("conservation-{chain}"));
            fs::create_dir_all(&chain_working).await?;
            self.conservation_tool
                .compute(fasta_file, &chain_working, &output_file, &execution.log_path)
                .await?;

            if let Some(cache) = self.caches.for_mode(mode) {
                let scores: Vec<f64> = read_hom_file(&output_file)
                    .await?
                    .into_iter()
                    .map(|score| score.value)
                    .collect();
                cache.store(&sequence, &scores).await?;
            }
            computed_this_run.insert(sequence, output_file.clone());
            result.insert(chain.clone(), output_file);
        }
        Ok(result)
    }

    /// Stage the predictor input layout and run the predictor.
    async fn run_predictor(
        &self,
        execution: &Execution,
        structure: &PreparedStructure,
        conservation: &BTreeMap<String, PathBuf>,
    ) -> Result<PathBuf> {
        let input_directory = execution.working_directory.join(PREDICTOR_INPUT_DIR);
        fs::create_dir_all(&input_directory).await?;
        let input_structure =
            input_directory.join(format!("structure.{}", structure.extension));
        fs::copy(&structure.reduced_file, &input_structure).await?;
        for (chain, file) in conservation {
            fs::copy(
                file,
                input_directory.join(format!("structure{}.hom", chain.to_uppercase())),
            )
            .await?;
        }

        let output_directory = execution.working_directory.join(PREDICTOR_OUTPUT_DIR);
        let predictions = output::predictions_path(&output_directory, &structure.extension);
        if execution.lazy && fs::try_exists(&predictions).await.unwrap_or(false) {
            debug!("Predictor output already exists, skipping prediction");
            return Ok(output_directory);
        }
        self.predictor
            .predict(
                execution.configuration.predictor_profile,
                &input_structure,
                &output_directory,
                &execution.log_path,
            )
            .await?;
        Ok(output_directory)
    }
}
