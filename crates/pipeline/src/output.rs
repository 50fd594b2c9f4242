//! Output assembly: the final stage turning predictor output into the
//! published artifact set.
//!
//! Produces `public/prediction.json` (merged structure summary, pockets
//! and conservation), `public/bundle.zip` (the predictor's raw working
//! directory, conservation included) and a gzipped copy of the original
//! structure for display.

use bindsight_core::{Pocket, PredictionFile, StructureSummary};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::executor::Execution;
use crate::hom::read_hom_file;
use crate::tools::StructureTool;

const PREDICTION_FILE: &str = "prediction.json";
const BUNDLE_FILE: &str = "bundle.zip";
const PARAMETERS_FILE: &str = "params.txt";
const STRUCTURE_INFO_FILE: &str = "structure-information.json";

/// What the runner records into the status metadata after a successful
/// execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Name of the gzipped display structure in the public directory.
    pub structure_name: String,
}

/// Path of the predictor's pocket table for a given structure extension.
pub fn predictions_path(predictor_output: &Path, extension: &str) -> PathBuf {
    predictor_output.join(format!("structure.{extension}_predictions.csv"))
}

#[allow(clippy::too_many_arguments)]
pub async fn prepare_output(
    execution: &Execution,
    structure_tool: &dyn StructureTool,
    predictor_output: &Path,
    raw_structure: &Path,
    extension: &str,
    conservation: &BTreeMap<String, PathBuf>,
    mut metadata: Map<String, Value>,
) -> Result<ExecutionOutcome> {
    info!("Collecting output ...");
    fs::create_dir_all(&execution.public_directory).await?;

    copy_conservation(conservation, &predictor_output.join("conservation")).await?;
    zip_directory(
        predictor_output.to_path_buf(),
        execution.public_directory.join(BUNDLE_FILE),
    )
    .await?;

    let structure_name = format!("structure.{extension}.gz");
    gzip_file(
        raw_structure.to_path_buf(),
        execution.public_directory.join(&structure_name),
    )
    .await?;

    let info_path = execution.working_directory.join(STRUCTURE_INFO_FILE);
    structure_tool
        .structure_info(raw_structure, &info_path, &execution.log_path)
        .await?;
    let mut structure = load_structure_summary(&info_path).await?;
    if !conservation.is_empty() {
        let merged = merge_conservation(&structure, conservation).await?;
        structure.scores.insert("conservation".to_string(), merged);
    }

    let pockets = load_pockets(&predictions_path(predictor_output, extension)).await?;
    metadata.insert(
        "predictor_version".to_string(),
        Value::String(read_predictor_version(&predictor_output.join(PARAMETERS_FILE)).await),
    );

    let prediction = PredictionFile {
        structure,
        pockets,
        metadata,
    };
    store::fs::write_json_atomic(
        &execution.public_directory.join(PREDICTION_FILE),
        &prediction,
    )
    .await?;

    Ok(ExecutionOutcome { structure_name })
}

async fn copy_conservation(
    conservation: &BTreeMap<String, PathBuf>,
    destination: &Path,
) -> Result<()> {
    if conservation.is_empty() {
        return Ok(());
    }
    fs::create_dir_all(destination).await?;
    for source in conservation.values() {
        let Some(name) = source.file_name() else {
            continue;
        };
        fs::copy(source, destination.join(name)).await?;
    }
    Ok(())
}

async fn zip_directory(directory: PathBuf, output: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::create(&output)?;
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        let mut pending = vec![directory.clone()];
        while let Some(current) = pending.pop() {
            for entry in std::fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = path
                    .strip_prefix(&directory)
                    .map_err(|_| {
                        PipelineError::data_integrity(format!(
                            "file {} escaped the bundle root",
                            path.display()
                        ))
                    })?
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/");
                writer
                    .start_file(name, options)
                    .map_err(|e| PipelineError::data_integrity(format!("zip failed: {e}")))?;
                let content = std::fs::read(&path)?;
                writer.write_all(&content)?;
            }
        }
        writer
            .finish()
            .map_err(|e| PipelineError::data_integrity(format!("zip failed: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| PipelineError::data_integrity(format!("bundle task failed: {e}")))?
}

async fn gzip_file(source: PathBuf, destination: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut input = std::fs::File::open(&source)?;
        let output = std::fs::File::create(&destination)?;
        let mut encoder = flate2::write::GzEncoder::new(output, flate2::Compression::default());
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    })
    .await
    .map_err(|e| PipelineError::data_integrity(format!("gzip task failed: {e}")))?
}

async fn load_structure_summary(path: &Path) -> Result<StructureSummary> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        PipelineError::data_integrity(format!(
            "missing structure summary {}: {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        PipelineError::data_integrity(format!("malformed structure summary: {e}"))
    })
}

/// Concatenate per-chain conservation into one score list following the
/// region order of the structure summary. Scores below zero carry no
/// signal and are clamped.
async fn merge_conservation(
    structure: &StructureSummary,
    conservation: &BTreeMap<String, PathBuf>,
) -> Result<Vec<f64>> {
    let mut result = Vec::new();
    for region in &structure.regions {
        let file = conservation.get(&region.name).ok_or_else(|| {
            PipelineError::data_integrity(format!(
                "missing conservation for chain {}",
                region.name
            ))
        })?;
        let scores = read_hom_file(file).await?;
        let region_size = region.end + 1 - region.start;
        if region_size != scores.len() {
            return Err(PipelineError::data_integrity(format!(
                "chain {} region covers {} residues but conservation has {}",
                region.name,
                region_size,
                scores.len()
            )));
        }
        result.extend(scores.iter().map(|score| score.value.max(0.0)));
    }
    Ok(result)
}

/// Parse the predictor's pocket table. The table is plain CSV without
/// quoting; values carry incidental whitespace.
pub async fn load_pockets(path: &Path) -> Result<Vec<Pocket>> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        PipelineError::data_integrity(format!("missing pocket table {}: {e}", path.display()))
    })?;
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();

    let mut pockets = Vec::new();
    for line in lines {
        let row: BTreeMap<&str, &str> = columns
            .iter()
            .zip(line.split(',').map(str::trim))
            .map(|(key, value)| (*key, value))
            .collect();
        pockets.push(parse_pocket(&row).ok_or_else(|| {
            PipelineError::data_integrity(format!("malformed pocket record: {line}"))
        })?);
    }
    Ok(pockets)
}

fn parse_pocket(row: &BTreeMap<&str, &str>) -> Option<Pocket> {
    Some(Pocket {
        name: row.get("name")?.to_string(),
        rank: row.get("rank")?.parse().ok()?,
        score: row.get("score")?.parse().ok()?,
        probability: row.get("probability")?.parse().ok()?,
        center: [
            row.get("center_x")?.parse().ok()?,
            row.get("center_y")?.parse().ok()?,
            row.get("center_z")?.parse().ok()?,
        ],
        residues: split_id_list(row.get("residue_ids")?),
        surface: split_id_list(row.get("surf_atom_ids")?),
    })
}

fn split_id_list(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// The predictor writes its parameters to a plain-text file, one of
/// which names its version.
async fn read_predictor_version(path: &Path) -> String {
    let Ok(content) = fs::read_to_string(path).await else {
        return "unknown".to_string();
    };
    content
        .lines()
        .find_map(|line| line.strip_prefix("version:"))
        .map(|version| version.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
