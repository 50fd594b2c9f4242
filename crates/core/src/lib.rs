pub mod domain;
pub mod error;

pub use domain::configuration::{
    create_upload_identifier, parse_identifier, ConservationMode, PredictorProfile,
    StructureSource, TaskConfiguration,
};
pub use domain::prediction::{Pocket, PredictionFile, Region, StructureSummary};
pub use domain::task::{TaskInfo, TaskStateMachine, TaskStatus};
pub use error::CoreError;
