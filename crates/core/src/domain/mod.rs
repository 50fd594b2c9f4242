pub mod configuration;
pub mod prediction;
pub mod task;
