//! Database structure snapshots and the refresh scheduler.

mod scheduler;
mod snapshot;

pub use scheduler::{RefreshOutcome, StructureAnalyser, StructureScheduler};
pub use snapshot::{ColumnStructure, StructureSnapshot, TableStructure, ViewStructure};
