//! Stream file writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::stats::StreamStats;
use super::{DatastoreError, DatastoreResult, StreamHeader};
use crate::config::DatastoreSettings;
use crate::worker::protocol::Row;

/// When buffered rows become visible through the side-car.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    /// Rewrite the side-car after this many rows.
    pub batch_rows: u64,
    /// ...or once this much time passed since the last rewrite.
    pub flush_interval: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self::from(&DatastoreSettings::default())
    }
}

impl From<&DatastoreSettings> for WriterOptions {
    fn from(settings: &DatastoreSettings) -> Self {
        Self {
            batch_rows: settings.stats_batch_rows.max(1),
            flush_interval: Duration::from_millis(settings.stats_flush_interval_ms),
        }
    }
}

type ProgressFn = Box<dyn FnMut(&StreamStats) + Send>;

/// Appends rows to one stream file and keeps its side-car current.
///
/// The side-car is rewritten at most once per batch, never per row. Rows are
/// flushed to the data file before every side-car rewrite, so a reader never
/// sees a `rowCount` larger than the rows actually on disk.
pub struct TableWriter {
    path: PathBuf,
    stream: Option<BufWriter<File>>,
    options: WriterOptions,
    row_count: u64,
    change_index: u64,
    rows_since_stats: u64,
    last_stats: Instant,
    on_progress: Option<ProgressFn>,
}

impl TableWriter {
    pub fn new(path: impl Into<PathBuf>, options: WriterOptions) -> Self {
        Self {
            path: path.into(),
            stream: None,
            options,
            row_count: 0,
            change_index: 0,
            rows_since_stats: 0,
            last_stats: Instant::now(),
            on_progress: None,
        }
    }

    /// Callback invoked after every side-car rewrite.
    pub fn on_progress(mut self, callback: impl FnMut(&StreamStats) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Create (truncate) the file, write the header record and open the
    /// append stream.
    pub fn initialize_from_schema(&mut self, header: &StreamHeader) -> DatastoreResult<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| DatastoreError::io(dir, e))?;
        }
        let file = File::create(&self.path).map_err(|e| DatastoreError::io(&self.path, e))?;
        let mut stream = BufWriter::new(file);

        serde_json::to_writer(&mut stream, header)?;
        stream
            .write_all(b"\n")
            .map_err(|e| DatastoreError::io(&self.path, e))?;

        self.stream = Some(stream);
        self.row_count = 0;
        self.change_index = 0;
        self.write_stats(false).map(|_| ())
    }

    /// Append one data record.
    pub fn write_row(&mut self, row: &Row) -> DatastoreResult<()> {
        let stream = self.stream.as_mut().ok_or(DatastoreError::NotInitialized)?;
        serde_json::to_writer(&mut *stream, row)?;
        stream
            .write_all(b"\n")
            .map_err(|e| DatastoreError::io(&self.path, e))?;

        self.row_count += 1;
        self.rows_since_stats += 1;

        if self.rows_since_stats >= self.options.batch_rows
            || self.last_stats.elapsed() >= self.options.flush_interval
        {
            self.flush_stats()?;
        }
        Ok(())
    }

    /// Make all rows written so far visible and rewrite the side-car.
    pub fn flush_stats(&mut self) -> DatastoreResult<()> {
        if self.rows_since_stats == 0 {
            return Ok(());
        }
        self.write_stats(false).map(|_| ())
    }

    /// Flush, fsync, and write the final `isFinished` side-car.
    ///
    /// Returns only after the data file is durably on disk.
    pub fn close(mut self) -> DatastoreResult<StreamStats> {
        let stream = self.stream.take().ok_or(DatastoreError::NotInitialized)?;
        let file = stream
            .into_inner()
            .map_err(|e| DatastoreError::io(&self.path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| DatastoreError::io(&self.path, e))?;

        self.write_stats(true)
    }

    fn write_stats(&mut self, is_finished: bool) -> DatastoreResult<StreamStats> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .flush()
                .map_err(|e| DatastoreError::io(&self.path, e))?;
        }

        let stats = StreamStats {
            row_count: self.row_count,
            change_index: self.change_index,
            is_finished,
        };
        stats.write(&self.path)?;
        self.change_index += 1;
        self.rows_since_stats = 0;
        self.last_stats = Instant::now();

        if let Some(callback) = self.on_progress.as_mut() {
            callback(&stats);
        }
        Ok(stats)
    }
}
