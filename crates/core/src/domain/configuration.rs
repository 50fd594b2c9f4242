use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Where the input structure comes from. Exactly one source exists by
/// construction; the old "three optional fields" shape is gone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructureSource {
    /// Published structure identified by its accession code.
    AccessionCode { code: String },
    /// Structure file uploaded by the user, path relative to the task
    /// input directory.
    UploadedFile { file: String },
    /// Model produced by a structure-prediction service.
    PredictedModel { id: String },
}

impl StructureSource {
    pub fn describe(&self) -> String {
        match self {
            Self::AccessionCode { code } => format!("accession:{code}"),
            Self::UploadedFile { file } => format!("upload:{file}"),
            Self::PredictedModel { id } => format!("model:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConservationMode {
    #[default]
    None,
    Alignment,
    Hmm,
}

impl ConservationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Alignment => "alignment",
            Self::Hmm => "hmm",
        }
    }
}

/// Named predictor configuration selecting model and feature set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PredictorProfile {
    #[default]
    Default,
    ConservationHmm,
    Alphafold,
    AlphafoldConservationHmm,
}

impl PredictorProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::ConservationHmm => "conservation_hmm",
            Self::Alphafold => "alphafold",
            Self::AlphafoldConservationHmm => "alphafold_conservation_hmm",
        }
    }
}

/// The input configuration persisted as `input/configuration.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfiguration {
    pub source: StructureSource,
    /// Restriction to given chains. Empty means all chains.
    #[serde(default)]
    pub chains: Vec<String>,
    /// If true the input structure is used without change.
    #[serde(default)]
    pub structure_sealed: bool,
    #[serde(default)]
    pub conservation: ConservationMode,
    #[serde(default)]
    pub predictor_profile: PredictorProfile,
}

impl TaskConfiguration {
    pub fn new(source: StructureSource) -> Self {
        Self {
            source,
            chains: Vec::new(),
            structure_sealed: true,
            conservation: ConservationMode::None,
            predictor_profile: PredictorProfile::Default,
        }
    }

    pub fn with_chains(mut self, chains: Vec<String>) -> Self {
        self.structure_sealed = chains.is_empty();
        self.chains = chains;
        self
    }

    pub fn with_conservation(mut self, mode: ConservationMode) -> Self {
        self.conservation = mode;
        self
    }

    pub fn with_profile(mut self, profile: PredictorProfile) -> Self {
        self.predictor_profile = profile;
        self
    }

    /// Chain filtering only makes sense when chains are given; a sealed
    /// structure must not carry a chain restriction.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.structure_sealed && !self.chains.is_empty() {
            return Err(CoreError::Validation(
                "sealed structure must not select chains".to_string(),
            ));
        }
        if !self.structure_sealed && self.chains.is_empty() {
            return Err(CoreError::Validation(
                "chain filtering requested without chains".to_string(),
            ));
        }
        Ok(())
    }
}

/// Split `2SRC_A,B` into the accession code `2SRC` and chains `[A, B]`.
/// Identifiers without an underscore have no chain restriction.
pub fn parse_identifier(identifier: &str) -> (String, Vec<String>) {
    match identifier.split_once('_') {
        None => (identifier.to_uppercase(), Vec::new()),
        Some((code, chains)) => (
            code.to_uppercase(),
            chains
                .split(',')
                .filter(|chain| !chain.is_empty())
                .map(|chain| chain.to_uppercase())
                .collect(),
        ),
    }
}

/// Identifier for upload tasks, unique and roughly sortable by creation.
pub fn create_upload_identifier() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y-%m-%d-%H-%M-%S"),
        Uuid::new_v4().to_string().to_uppercase()
    )
}
