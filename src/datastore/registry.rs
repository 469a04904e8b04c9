//! Maps stream store ids to files and open readers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use super::filter::Condition;
use super::reader::JsonLinesDatastore;
use super::stats::{stats_path, StreamStats};
use super::{DatastoreError, DatastoreResult};
use crate::worker::protocol::Row;

/// Directory holding all stream files under `data_dir`.
pub fn stream_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("jsldata")
}

/// `<data_dir>/jsldata/<jslid>.jsonl`
pub fn stream_file_path(data_dir: &Path, jslid: &str) -> DatastoreResult<PathBuf> {
    validate_store_id(jslid)?;
    Ok(stream_dir(data_dir).join(format!("{jslid}.jsonl")))
}

/// Store ids become file names: `[A-Za-z0-9_-]+` only.
pub fn validate_store_id(jslid: &str) -> DatastoreResult<()> {
    let valid = !jslid.is_empty()
        && jslid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DatastoreError::InvalidStoreId(jslid.to_string()))
    }
}

pub fn new_store_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One reader per store id, shared by all callers.
pub struct DatastoreRegistry {
    data_dir: PathBuf,
    stores: DashMap<String, Arc<JsonLinesDatastore>>,
}

impl DatastoreRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            stores: DashMap::new(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path(&self, jslid: &str) -> DatastoreResult<PathBuf> {
        stream_file_path(&self.data_dir, jslid)
    }

    pub fn open(&self, jslid: &str) -> DatastoreResult<Arc<JsonLinesDatastore>> {
        let path = self.path(jslid)?;
        Ok(self
            .stores
            .entry(jslid.to_string())
            .or_insert_with(|| Arc::new(JsonLinesDatastore::new(path)))
            .clone())
    }

    pub async fn read_rows(
        &self,
        jslid: &str,
        offset: u64,
        limit: usize,
        filter: Option<&Condition>,
    ) -> DatastoreResult<Vec<Row>> {
        let store = self.open(jslid)?;
        store.get_rows(offset, limit, filter).await
    }

    /// Rows were appended by a writer; the next read starts fresh.
    pub async fn notify_changed(&self, jslid: &str) -> DatastoreResult<()> {
        validate_store_id(jslid)?;
        let store = self.stores.get(jslid).map(|entry| entry.value().clone());
        if let Some(store) = store {
            store.notify_changed().await;
        }
        Ok(())
    }

    pub fn stats(&self, jslid: &str) -> DatastoreResult<Option<StreamStats>> {
        StreamStats::read(&self.path(jslid)?)
    }

    /// Forget the reader and delete the stream file and its side-car.
    pub async fn remove(&self, jslid: &str) -> DatastoreResult<()> {
        let path = self.path(jslid)?;
        if let Some((_, store)) = self.stores.remove(jslid) {
            store.close().await;
        }
        for file in [stats_path(&path), path] {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(DatastoreError::io(file, e)),
            }
        }
        Ok(())
    }

    pub fn open_count(&self) -> usize {
        self.stores.len()
    }
}
