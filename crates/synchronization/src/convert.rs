//! Conversion of raw predictor tables into the export schema consumed
//! by the downstream annotation archive.
//!
//! Input: the predictor's pocket table plus its per-residue table.
//! Output: one JSON document per accession, listing binding sites and
//! per-chain residue annotations referencing them.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

use crate::error::{Result, SyncError};

/// Static fields of every export document.
#[derive(Debug, Clone)]
pub struct ExportConfiguration {
    pub data_resource: String,
    pub resource_version: String,
    /// Release day in `dd/mm/yyyy`, stamped into each document.
    pub release_day: String,
    /// URL template with a `{}` placeholder for the accession code.
    pub url_template: String,
    pub predictor_version: String,
}

impl ExportConfiguration {
    pub fn new(
        data_resource: impl Into<String>,
        url_template: impl Into<String>,
        predictor_version: impl Into<String>,
    ) -> Self {
        Self {
            data_resource: data_resource.into(),
            resource_version: "1.0".to_string(),
            release_day: chrono::Utc::now().format("%d/%m/%Y").to_string(),
            url_template: url_template.into(),
            predictor_version: predictor_version.into(),
        }
    }
}

struct ResidueRow {
    chain: String,
    label: String,
    name: String,
    score: f64,
    probability: f64,
}

struct PocketRow {
    name: String,
    score: String,
    center: [String; 3],
    residues: Vec<(String, String)>,
}

/// Convert one prediction into the export schema and write it to
/// `output_path`. A prediction without any pocket is reported as
/// [`SyncError::EmptyPrediction`].
pub async fn convert_prediction(
    configuration: &ExportConfiguration,
    code: &str,
    predictions_path: &Path,
    residues_path: &Path,
    output_path: &Path,
) -> Result<()> {
    let pockets = read_pockets(predictions_path).await?;
    if pockets.is_empty() {
        return Err(SyncError::EmptyPrediction);
    }
    let residues = read_residues(residues_path).await?;

    let mut sites = Vec::new();
    let mut chains: BTreeMap<String, BTreeMap<(String, String), Value>> = BTreeMap::new();
    for pocket in &pockets {
        let site_id = site_identifier(&pocket.name)?;
        sites.push(json!({
            "site_id": site_id,
            "label": pocket.name,
            "additional_site_annotations": {
                "score": pocket.score,
                "center": {
                    "x": pocket.center[0],
                    "y": pocket.center[1],
                    "z": pocket.center[2],
                },
            },
        }));
        for residue in residues
            .iter()
            .filter(|residue| pocket.residues.contains(&(residue.chain.clone(), residue.label.clone())))
        {
            add_residue(&mut chains, residue, site_id)?;
        }
    }

    let chains: Vec<Value> = chains
        .into_iter()
        .map(|(chain, residues)| {
            json!({
                "chain_label": chain,
                "residues": residues.into_values().collect::<Vec<_>>(),
            })
        })
        .collect();

    let content = json!({
        "data_resource": configuration.data_resource,
        "resource_version": configuration.resource_version,
        "software_version": configuration.predictor_version,
        "resource_entry_url": configuration.url_template.replace("{}", &code.to_uppercase()),
        "release_date": configuration.release_day,
        "pdb_id": code.to_lowercase(),
        "chains": chains,
        "sites": sites,
        "evidence_code_ontology": [
            {
                "eco_term": "computational combinatorial evidence",
                "eco_code": "ECO_0000246",
            }
        ],
    });

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(output_path, serde_json::to_vec_pretty(&content)?).await?;
    Ok(())
}

fn site_identifier(pocket_name: &str) -> Result<i64> {
    pocket_name
        .strip_prefix("pocket")
        .and_then(|suffix| suffix.parse().ok())
        .ok_or_else(|| SyncError::conversion(format!("unexpected pocket name: {pocket_name}")))
}

fn add_residue(
    chains: &mut BTreeMap<String, BTreeMap<(String, String), Value>>,
    residue: &ResidueRow,
    site_id: i64,
) -> Result<()> {
    let site_data = json!({
        "site_id_ref": site_id,
        "confidence_score": residue.probability,
        "confidence_classification": confidence_class(residue.probability)?,
        "raw_score": residue.score,
    });
    let entry = chains
        .entry(residue.chain.clone())
        .or_default()
        .entry((residue.label.clone(), residue.name.clone()))
        .or_insert_with(|| {
            json!({
                "pdb_res_label": residue.label,
                "aa_type": residue.name,
                "site_data": [],
            })
        });
    if let Some(data) = entry.get_mut("site_data").and_then(Value::as_array_mut) {
        data.push(site_data);
    }
    Ok(())
}

fn confidence_class(probability: f64) -> Result<&'static str> {
    if probability < 0.33 {
        Ok("low")
    } else if probability < 0.6 {
        Ok("medium")
    } else if probability <= 1.0 {
        Ok("high")
    } else {
        Err(SyncError::conversion(format!(
            "unexpected probability: {probability}"
        )))
    }
}

async fn read_pockets(path: &Path) -> Result<Vec<PocketRow>> {
    let mut result = Vec::new();
    for row in read_csv(path).await? {
        let residues = field(&row, "residue_ids", path)?
            .split_whitespace()
            .map(|item| {
                item.split_once('_')
                    .map(|(chain, label)| (chain.to_string(), label.to_string()))
                    .ok_or_else(|| {
                        SyncError::conversion(format!("malformed residue reference: {item}"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        result.push(PocketRow {
            name: field(&row, "name", path)?.to_string(),
            score: field(&row, "score", path)?.to_string(),
            center: [
                field(&row, "center_x", path)?.to_string(),
                field(&row, "center_y", path)?.to_string(),
                field(&row, "center_z", path)?.to_string(),
            ],
            residues,
        });
    }
    Ok(result)
}

async fn read_residues(path: &Path) -> Result<Vec<ResidueRow>> {
    let mut result = Vec::new();
    for row in read_csv(path).await? {
        result.push(ResidueRow {
            chain: field(&row, "chain", path)?.to_string(),
            label: field(&row, "residue_label", path)?.to_string(),
            name: field(&row, "residue_name", path)?.to_string(),
            score: parse_number(field(&row, "score", path)?)?,
            probability: parse_number(field(&row, "probability", path)?)?,
        });
    }
    Ok(result)
}

fn parse_number(value: &str) -> Result<f64> {
    value
        .parse()
        .map_err(|_| SyncError::conversion(format!("not a number: {value}")))
}

fn field<'a>(
    row: &'a BTreeMap<String, String>,
    name: &str,
    path: &Path,
) -> Result<&'a str> {
    row.get(name).map(String::as_str).ok_or_else(|| {
        SyncError::conversion(format!("missing column {name} in {}", path.display()))
    })
}

/// Plain CSV without quoting; both predictor tables use it, values may
/// carry incidental whitespace.
async fn read_csv(path: &Path) -> Result<Vec<BTreeMap<String, String>>> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        SyncError::conversion(format!("missing table {}: {e}", path.display()))
    })?;
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let columns: Vec<String> = header.split(',').map(|key| key.trim().to_string()).collect();
    Ok(lines
        .map(|line| {
            columns
                .iter()
                .cloned()
                .zip(line.split(',').map(|value| value.trim().to_string()))
                .collect()
        })
        .collect())
}
