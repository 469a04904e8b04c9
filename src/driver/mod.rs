//! Database drivers hosted inside a worker process.
//!
//! A [`Connector`] turns a [`ConnectionDescriptor`] into a live
//! [`DatabaseConnection`]. The worker runtime only talks to these traits;
//! the built-in implementation is [`sqlite::SqliteConnector`].

pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{ConnectionDescriptor, Engine};
use crate::datastore::{stream_file_path, DatastoreError, StreamStats, TableWriter, WriterOptions};
use crate::structure::{StructureAnalyser, StructureSnapshot};
use crate::worker::protocol::{
    DatabaseInfo, ExecuteResult, QueryResult, ScriptResult, ServerVersion, WorkerMessage,
};

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to connect: {0}")]
    Connect(String),

    /// The underlying connection is unusable; the worker must exit.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("{0}")]
    Query(String),

    #[error("engine {engine} does not support {operation}")]
    Unsupported {
        engine: &'static str,
        operation: &'static str,
    },

    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error("failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("driver task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DriverError {
    /// Whether the connection can still serve further requests.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Connect(_) | DriverError::ConnectionLost(_))
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> DriverResult<Arc<dyn DatabaseConnection>>;
}

/// One live connection. Implementations serialize access internally.
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    fn engine(&self) -> Engine;

    /// Cheap round trip proving the connection still works.
    async fn ping(&self) -> DriverResult<()>;

    async fn server_version(&self) -> DriverResult<ServerVersion>;

    async fn list_databases(&self) -> DriverResult<Vec<DatabaseInfo>>;

    async fn analyse_full(&self) -> DriverResult<StructureSnapshot>;

    /// `None` when nothing changed since `previous`.
    async fn analyse_incremental(
        &self,
        previous: &StructureSnapshot,
    ) -> DriverResult<Option<StructureSnapshot>>;

    async fn query(&self, sql: &str, limit: Option<usize>) -> DriverResult<QueryResult>;

    async fn run_script(&self, sql: &str) -> DriverResult<ScriptResult>;

    /// Stream the rows of a single query into `jslid`.
    async fn stream_query(
        &self,
        sql: &str,
        jslid: &str,
        target: &StreamTarget,
    ) -> DriverResult<StreamStats>;

    /// Run every statement of `sql`; each result set goes to its own store.
    async fn execute_query(&self, sql: &str, target: &StreamTarget) -> DriverResult<ExecuteResult>;
}

/// Adapts a connection to the structure scheduler.
pub struct ConnectionAnalyser(pub Arc<dyn DatabaseConnection>);

#[async_trait]
impl StructureAnalyser for ConnectionAnalyser {
    async fn analyse_full(&self) -> DriverResult<StructureSnapshot> {
        self.0.analyse_full().await
    }

    async fn analyse_incremental(
        &self,
        previous: &StructureSnapshot,
    ) -> DriverResult<Option<StructureSnapshot>> {
        self.0.analyse_incremental(previous).await
    }
}

/// Where streamed result sets are written and who hears about progress.
#[derive(Clone)]
pub struct StreamTarget {
    data_dir: PathBuf,
    options: WriterOptions,
    progress: Option<mpsc::UnboundedSender<WorkerMessage>>,
}

impl StreamTarget {
    pub fn new(data_dir: impl Into<PathBuf>, options: WriterOptions) -> Self {
        Self {
            data_dir: data_dir.into(),
            options,
            progress: None,
        }
    }

    /// Report every side-car rewrite as a `progress` message.
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn writer(&self, jslid: &str) -> DriverResult<TableWriter> {
        let path = stream_file_path(&self.data_dir, jslid)?;
        let writer = TableWriter::new(path, self.options);
        Ok(match self.progress.clone() {
            Some(sender) => {
                let jslid = jslid.to_string();
                writer.on_progress(move |stats| {
                    let _ = sender.send(WorkerMessage::Progress {
                        jslid: jslid.clone(),
                        stats: *stats,
                    });
                })
            }
            None => writer,
        })
    }
}

/// The connector for `engine`, if this build ships one.
pub fn connector_for(engine: Engine) -> DriverResult<Box<dyn Connector>> {
    match engine {
        Engine::Sqlite => Ok(Box::new(sqlite::SqliteConnector)),
        other => Err(DriverError::Unsupported {
            engine: other.as_str(),
            operation: "connect",
        }),
    }
}
