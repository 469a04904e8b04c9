//! Protocol types for supervisor/worker communication.
//!
//! Every message is one JSON object per line with a mandatory `kind`
//! discriminator. [`ControlMessage`] flows supervisor → worker (stdin),
//! [`WorkerMessage`] flows worker → supervisor (stdout).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConnectionDescriptor;
use crate::datastore::StreamStats;
use crate::structure::StructureSnapshot;
use crate::tunnel::{TunnelInfo, TunnelKey};

/// One data row: column name → value.
pub type Row = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Resource kinds and status
// ============================================================================

/// What a worker process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Connection to one database.
    Database,
    /// Server-level connection (database list, version).
    Server,
    /// Interactive query session.
    Session,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Database => "database",
            ResourceKind::Server => "server",
            ResourceKind::Session => "session",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(ResourceKind::Database),
            "server" => Ok(ResourceKind::Server),
            "session" => Ok(ResourceKind::Session),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// Connection status names pushed by workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusName {
    #[default]
    Pending,
    Ok,
    Error,
    CheckStructure,
    LoadStructure,
}

/// Last-write-wins connection status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub name: StatusName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Status {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn ok() -> Self {
        Self {
            name: StatusName::Ok,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            name: StatusName::Error,
            message: Some(message.into()),
        }
    }

    pub fn named(name: StatusName) -> Self {
        Self {
            name,
            message: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.name == StatusName::Error
    }
}

/// Server version reported after connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_text: Option<String>,
}

/// Database entry of a server connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Informational message emitted by a worker (e.g. per-statement notices).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub severity: Severity,
    pub message: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jslid: Option<String>,
}

impl InfoMessage {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            time: Utc::now(),
            jslid: None,
        }
    }
}

// ============================================================================
// Operations (typed requests)
// ============================================================================

/// Typed operation carried by [`ControlMessage::Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Operation {
    /// Run a query and return its rows inline.
    Query {
        sql: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    /// Execute statements, returning the number of affected rows.
    RunScript { sql: String },
    /// Stream the rows of a query into the stream store `jslid`.
    StreamQuery { sql: String, jslid: String },
    /// Session query: every result set gets its own stream store.
    ExecuteQuery { sql: String },
    /// List databases of a server connection.
    ListDatabases,
    /// Fetch the server version.
    ServerVersion,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Query { .. } => "query",
            Operation::RunScript { .. } => "runScript",
            Operation::StreamQuery { .. } => "streamQuery",
            Operation::ExecuteQuery { .. } => "executeQuery",
            Operation::ListDatabases => "listDatabases",
            Operation::ServerVersion => "serverVersion",
        }
    }
}

/// Column description in query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub column_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

/// Result of [`Operation::Query`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Row>,
}

/// Result of [`Operation::RunScript`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub rows_affected: u64,
}

/// Result of [`Operation::StreamQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamResult {
    pub jslid: String,
    pub row_count: u64,
}

/// Result of [`Operation::ExecuteQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub recordsets: Vec<StreamResult>,
    pub rows_affected: u64,
}

// ============================================================================
// Messages
// ============================================================================

/// Messages sent by the supervisor to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Establish the connection. `structure` is the last known snapshot, used
    /// for an incremental first refresh instead of a full scan.
    Connect {
        connection: ConnectionDescriptor,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structure: Option<StructureSnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_refresh_secs: Option<u64>,
    },
    /// Typed operation; answered by exactly one `response` with the same `msgid`.
    Request { msgid: String, operation: Operation },
    Ping,
    /// Trigger a structure (database) or database-list (server) refresh.
    Refresh { full: bool },
    Close,
    /// Answer to a worker's tunnel request.
    #[serde(rename = "getsshtunnel-response")]
    TunnelResponse {
        msgid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<TunnelInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

/// Messages sent by a worker to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkerMessage {
    Status { status: Status },
    Structure { structure: StructureSnapshot },
    StructureTime { analysed_time: DateTime<Utc> },
    Version { version: ServerVersion },
    Databases { databases: Vec<DatabaseInfo> },
    Response {
        msgid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Progress { jslid: String, stats: StreamStats },
    Info { info: InfoMessage },
    Done { jslid: String },
    Ping,
    /// Ask the parent to get or create an SSH tunnel.
    #[serde(rename = "getsshtunnel-request")]
    TunnelRequest { msgid: String, key: TunnelKey },
}

impl WorkerMessage {
    /// Successful response to `msgid`.
    pub fn success(msgid: impl Into<String>, result: serde_json::Value) -> Self {
        WorkerMessage::Response {
            msgid: msgid.into(),
            result: Some(result),
            error_message: None,
        }
    }

    /// Failed response to `msgid`, carrying the error message verbatim.
    pub fn failure(msgid: impl Into<String>, message: impl Into<String>) -> Self {
        WorkerMessage::Response {
            msgid: msgid.into(),
            result: None,
            error_message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Status { .. } => "status",
            WorkerMessage::Structure { .. } => "structure",
            WorkerMessage::StructureTime { .. } => "structureTime",
            WorkerMessage::Version { .. } => "version",
            WorkerMessage::Databases { .. } => "databases",
            WorkerMessage::Response { .. } => "response",
            WorkerMessage::Progress { .. } => "progress",
            WorkerMessage::Info { .. } => "info",
            WorkerMessage::Done { .. } => "done",
            WorkerMessage::Ping => "ping",
            WorkerMessage::TunnelRequest { .. } => "getsshtunnel-request",
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Serialize a message as one NDJSON line (trailing newline included).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one NDJSON line.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end_matches(['\r', '\n']))
}
