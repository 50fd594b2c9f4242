//! Binding-site prediction pipeline.
//!
//! The pipeline takes a stored task through six stages: structure
//! acquisition, chain reduction, sequence extraction, conservation
//! scoring, pocket prediction and output assembly. External tools and
//! services sit behind traits so the stages can be exercised without a
//! network or the real binaries.

pub mod error;
pub mod executor;
pub mod hom;
pub mod output;
pub mod runner;
pub mod tools;

pub use error::{PipelineError, Result};
pub use executor::{ConservationCaches, Execution, PipelineExecutor};
pub use output::ExecutionOutcome;
pub use runner::{RunOutcome, TaskRunner};
pub use tools::{
    ConservationTool, HttpStructureFetcher, Predictor, ProcessConservationTool, ProcessPredictor,
    ProcessStructureTool, StructureFetcher, StructureTool,
};
