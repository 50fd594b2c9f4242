//! Bulk synchronization of predictions for newly released structures.
//!
//! A flat JSON index tracks one record per accession code. Each
//! reconciliation pass imports new catalogue entries, polls the
//! prediction service for queued jobs under an admission limit, and
//! converts finished predictions into the export schema delivered
//! through a sharded export tree.

pub mod catalog;
pub mod convert;
pub mod error;
pub mod index;
pub mod reconciler;
pub mod remote;

pub use catalog::{CatalogClient, CatalogEntry, HttpCatalogClient};
pub use convert::ExportConfiguration;
pub use error::{Result, SyncError};
pub use index::{EntryStatus, IndexRecord, IndexStore, SyncIndex};
pub use reconciler::{PassSummary, Reconciler, ReconcilerOptions};
pub use remote::{HttpPredictionService, PredictionService, RemoteJob};
