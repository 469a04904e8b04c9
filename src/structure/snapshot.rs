//! Serializable description of database objects.

use serde::{Deserialize, Serialize};

use crate::cache::compute_hash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnStructure {
    pub column_name: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStructure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub pure_name: String,
    pub columns: Vec<ColumnStructure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
}

impl TableStructure {
    pub fn column(&self, name: &str) -> Option<&ColumnStructure> {
        self.columns.iter().find(|c| c.column_name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewStructure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub pure_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_sql: Option<String>,
}

/// Everything the analyser knows about one database.
///
/// `schema_version` is an engine-specific change counter used by incremental
/// analysis; engines without one leave it `None` and always rescan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureSnapshot {
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<i64>,
    #[serde(default)]
    pub tables: Vec<TableStructure>,
    #[serde(default)]
    pub views: Vec<ViewStructure>,
}

impl StructureSnapshot {
    pub fn table(&self, name: &str) -> Option<&TableStructure> {
        self.tables.iter().find(|t| t.pure_name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.views.is_empty()
    }

    /// Hash over the serialized form; equal snapshots hash equally.
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        compute_hash(self)
    }
}
