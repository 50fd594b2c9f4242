use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One chain of the structure as a region over the merged residue
/// sequence; `start` and `end` are inclusive indices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

/// Residue-level view of the structure shipped to the viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureSummary {
    pub indices: Vec<String>,
    pub sequence: Vec<String>,
    pub binding: Vec<usize>,
    pub regions: Vec<Region>,
    /// Per-residue score lists keyed by kind, e.g. `conservation`.
    #[serde(default)]
    pub scores: BTreeMap<String, Vec<f64>>,
}

/// A predicted binding pocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pocket {
    pub name: String,
    pub rank: u32,
    pub score: f64,
    pub probability: f64,
    pub center: [f64; 3],
    pub residues: Vec<String>,
    pub surface: Vec<String>,
}

/// The published artifact, persisted as `public/prediction.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionFile {
    pub structure: StructureSummary,
    pub pockets: Vec<Pocket>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}
