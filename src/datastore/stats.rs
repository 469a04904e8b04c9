//! Side-car statistics file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{DatastoreError, DatastoreResult};

/// Live progress of a stream file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub row_count: u64,
    pub change_index: u64,
    pub is_finished: bool,
}

/// `<streamfile>.stats`
pub fn stats_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(".stats");
    PathBuf::from(name)
}

impl StreamStats {
    /// Read the side-car of `data_path`; `None` if it does not exist yet.
    pub fn read(data_path: &Path) -> DatastoreResult<Option<Self>> {
        let path = stats_path(data_path);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map(Some).map_err(|source| {
                DatastoreError::InvalidRecord {
                    path,
                    line: 1,
                    source,
                }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DatastoreError::io(path, e)),
        }
    }

    /// Rewrite the side-car of `data_path` (write-then-rename, never appended).
    pub fn write(&self, data_path: &Path) -> DatastoreResult<()> {
        let path = stats_path(data_path);
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, serde_json::to_vec(self)?).map_err(|e| DatastoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| DatastoreError::io(&path, e))
    }
}
