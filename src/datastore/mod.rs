//! Append-only stream files for query results.
//!
//! # File format
//!
//! ```text
//! <data_dir>/jsldata/<jslid>.jsonl        one JSON record per line
//!   {"__isStreamHeader":true,"columns":[...]}   optional header (line 1)
//!   {"id":1,"name":"a"}                          data rows
//!   ...
//! <data_dir>/jsldata/<jslid>.jsonl.stats  {"rowCount":..,"changeIndex":..,"isFinished":..}
//! ```
//!
//! A first line without the header marker is a data row; readers then
//! synthesize a dynamic-structure header. The side-car is rewritten whole on
//! every stats flush, so "how many rows so far" never needs a scan.
//!
//! [`TableWriter`] produces these files (inside workers), [`JsonLinesDatastore`]
//! pages through them and [`DatastoreRegistry`] maps store ids to readers.

mod filter;
mod reader;
mod registry;
mod stats;
mod writer;

pub use filter::{BinaryOperator, Condition, Expression, Matcher};
pub use reader::JsonLinesDatastore;
pub use registry::{new_store_id, stream_dir, stream_file_path, validate_store_id, DatastoreRegistry};
pub use stats::{stats_path, StreamStats};
pub use writer::{TableWriter, WriterOptions};

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::protocol::ResultColumn;

/// Marker field of the header record.
pub const HEADER_MARKER: &str = "__isStreamHeader";
/// Marker field of a header whose columns are not known up front.
pub const DYNAMIC_MARKER: &str = "__isDynamicStructure";

pub type DatastoreResult<T> = Result<T, DatastoreError>;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid record at line {line} of {}: {source}", path.display())]
    InvalidRecord {
        path: PathBuf,
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid stream store id: {0:?}")]
    InvalidStoreId(String),

    #[error("stream writer is not initialized")]
    NotInitialized,

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl DatastoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Schema record written as line 1 of a stream file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    #[serde(rename = "__isStreamHeader")]
    pub is_stream_header: bool,
    #[serde(
        rename = "__isDynamicStructure",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub is_dynamic_structure: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ResultColumn>,
}

impl StreamHeader {
    pub fn with_columns(columns: Vec<ResultColumn>) -> Self {
        Self {
            is_stream_header: true,
            is_dynamic_structure: false,
            columns,
        }
    }

    /// Header for results whose columns are discovered row by row.
    pub fn dynamic() -> Self {
        Self {
            is_stream_header: true,
            is_dynamic_structure: true,
            columns: Vec::new(),
        }
    }

    /// Whether a parsed line is a header record.
    pub fn is_header(value: &serde_json::Value) -> bool {
        value
            .get(HEADER_MARKER)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}
