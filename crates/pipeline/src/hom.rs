//! Conservation intermediate files.
//!
//! A `.hom` file is newline-delimited `index<TAB>score<TAB>residue-code`
//! records, one per residue, shared between the conservation pipelines,
//! the cache, and output assembly.

use std::path::Path;
use tokio::fs;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ResidueScore {
    pub code: String,
    pub value: f64,
}

/// Parse a conservation file. Raw scores are kept as-is; callers decide
/// whether to clamp.
pub async fn read_hom_file(path: &Path) -> Result<Vec<ResidueScore>> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        PipelineError::data_integrity(format!(
            "missing conservation file {}: {e}",
            path.display()
        ))
    })?;
    let mut result = Vec::new();
    for (line_number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (Some(_index), Some(value), Some(code)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(PipelineError::data_integrity(format!(
                "malformed conservation record at {}:{}",
                path.display(),
                line_number + 1
            )));
        };
        let value: f64 = value.trim().parse().map_err(|_| {
            PipelineError::data_integrity(format!(
                "invalid conservation score at {}:{}",
                path.display(),
                line_number + 1
            ))
        })?;
        result.push(ResidueScore {
            code: code.trim().to_string(),
            value,
        });
    }
    Ok(result)
}

/// Write a conservation file from a sequence and its per-residue scores.
pub async fn write_hom_file(path: &Path, sequence: &str, scores: &[f64]) -> Result<()> {
    if sequence.chars().count() != scores.len() {
        return Err(PipelineError::data_integrity(format!(
            "sequence length {} does not match {} scores for {}",
            sequence.chars().count(),
            scores.len(),
            path.display()
        )));
    }
    let mut content = String::new();
    for (index, (code, score)) in sequence.chars().zip(scores).enumerate() {
        content.push_str(&format!("{index}\t{score}\t{code}\n"));
    }
    fs::write(path, content).await?;
    Ok(())
}

/// Read the single sequence from a FASTA file, ignoring header lines.
pub async fn read_fasta_sequence(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        PipelineError::data_integrity(format!("missing sequence file {}: {e}", path.display()))
    })?;
    Ok(content
        .lines()
        .filter(|line| !line.starts_with('>'))
        .collect::<Vec<_>>()
        .concat())
}
