//! Paginated reader over a stream file.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use super::filter::{Condition, Matcher};
use super::{DatastoreError, DatastoreResult, StreamHeader};
use crate::worker::protocol::Row;

/// Forward-only position in the file.
struct Cursor {
    reader: BufReader<File>,
    /// Bytes of a line whose terminating newline has not been written yet.
    partial: String,
    line: u64,
    header_checked: bool,
    /// Rows (matching `filter_key`) consumed so far.
    rows_read: u64,
    filter_key: String,
}

impl Cursor {
    async fn open(path: &Path, filter_key: String) -> DatastoreResult<Self> {
        let file = File::open(path)
            .await
            .map_err(|e| DatastoreError::io(path, e))?;
        Ok(Self {
            reader: BufReader::new(file),
            partial: String::new(),
            line: 0,
            header_checked: false,
            rows_read: 0,
            filter_key,
        })
    }

    /// Next complete, non-empty line; `None` at end of the written data.
    async fn next_line(&mut self, path: &Path) -> DatastoreResult<Option<String>> {
        loop {
            let read = self
                .reader
                .read_line(&mut self.partial)
                .await
                .map_err(|e| DatastoreError::io(path, e))?;
            if read == 0 || !self.partial.ends_with('\n') {
                // EOF, possibly in the middle of a line still being written
                return Ok(None);
            }
            self.line += 1;
            let line = std::mem::take(&mut self.partial);
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
    }

    /// Next data row satisfying `filter`.
    async fn next_row(
        &mut self,
        path: &Path,
        filter: &mut Option<Matcher<'_>>,
    ) -> DatastoreResult<Option<Row>> {
        while let Some(line) = self.next_line(path).await? {
            let value: serde_json::Value =
                serde_json::from_str(&line).map_err(|source| DatastoreError::InvalidRecord {
                    path: path.to_path_buf(),
                    line: self.line,
                    source,
                })?;

            if !self.header_checked {
                self.header_checked = true;
                if StreamHeader::is_header(&value) {
                    continue;
                }
            }

            let row: Row = serde_json::from_value(value).map_err(|source| {
                DatastoreError::InvalidRecord {
                    path: path.to_path_buf(),
                    line: self.line,
                    source,
                }
            })?;

            if filter.as_mut().map_or(true, |m| m.matches(&row)) {
                self.rows_read += 1;
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

/// Reader over one stream file with a single reusable cursor.
///
/// Reads are serialized by the cursor lock. A read continues from the open
/// cursor when `offset` is at or past its position and the filter is the
/// same; anything else reopens the file from the start. The header line is
/// never returned, and neither is an unterminated trailing line.
pub struct JsonLinesDatastore {
    path: PathBuf,
    cursor: Mutex<Option<Cursor>>,
}

impl JsonLinesDatastore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cursor: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Up to `limit` rows after skipping `offset` rows. With a filter, both
    /// count matching rows only.
    pub async fn get_rows(
        &self,
        offset: u64,
        limit: usize,
        filter: Option<&Condition>,
    ) -> DatastoreResult<Vec<Row>> {
        let filter_key = Condition::canonical(filter);
        let mut guard = self.cursor.lock().await;

        let reusable = matches!(
            guard.as_ref(),
            Some(cursor) if cursor.filter_key == filter_key && cursor.rows_read <= offset
        );
        if !reusable {
            *guard = Some(Cursor::open(&self.path, filter_key).await?);
        }
        let Some(cursor) = guard.as_mut() else {
            return Ok(Vec::new());
        };

        let page = Self::read_page(cursor, &self.path, offset, limit, filter).await;
        if page.is_err() {
            // The cursor already moved past the bad line.
            *guard = None;
        }
        page
    }

    async fn read_page(
        cursor: &mut Cursor,
        path: &Path,
        offset: u64,
        limit: usize,
        filter: Option<&Condition>,
    ) -> DatastoreResult<Vec<Row>> {
        let mut matcher = filter.map(Matcher::new);
        while cursor.rows_read < offset {
            if cursor.next_row(path, &mut matcher).await?.is_none() {
                return Ok(Vec::new());
            }
        }

        let mut rows = Vec::with_capacity(limit.min(1024));
        while rows.len() < limit {
            match cursor.next_row(path, &mut matcher).await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    /// The file was appended to by someone else; drop the cursor.
    pub async fn notify_changed(&self) {
        self.cursor.lock().await.take();
    }

    pub async fn close(&self) {
        self.notify_changed().await;
    }

    /// The schema header, or a synthesized dynamic one when line 1 is data.
    /// `None` while no complete line has been written.
    pub async fn header(&self) -> DatastoreResult<Option<StreamHeader>> {
        let mut cursor = Cursor::open(&self.path, String::new()).await?;
        let Some(line) = cursor.next_line(&self.path).await? else {
            return Ok(None);
        };
        let value: serde_json::Value =
            serde_json::from_str(&line).map_err(|source| DatastoreError::InvalidRecord {
                path: self.path.clone(),
                line: cursor.line,
                source,
            })?;
        if !StreamHeader::is_header(&value) {
            return Ok(Some(StreamHeader::dynamic()));
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| DatastoreError::InvalidRecord {
                path: self.path.clone(),
                line: cursor.line,
                source,
            })
    }
}
