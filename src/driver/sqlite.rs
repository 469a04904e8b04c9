//! SQLite driver (rusqlite).
//!
//! rusqlite is synchronous, so every call runs on the blocking pool with the
//! connection behind a mutex. Incremental structure analysis compares
//! `PRAGMA schema_version`, which SQLite bumps on every schema change.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection, ErrorCode, Statement};
use serde_json::Value;

use super::{Connector, DatabaseConnection, DriverError, DriverResult, StreamTarget};
use crate::config::{ConnectionDescriptor, Engine};
use crate::datastore::{new_store_id, StreamHeader, StreamStats, TableWriter};
use crate::structure::{ColumnStructure, StructureSnapshot, TableStructure, ViewStructure};
use crate::worker::protocol::{
    DatabaseInfo, ExecuteResult, QueryResult, ResultColumn, Row, ScriptResult, ServerVersion,
    StreamResult,
};

const ENGINE: &str = "sqlite";

impl From<rusqlite::Error> for DriverError {
    fn from(e: rusqlite::Error) -> Self {
        let lost = matches!(
            e.sqlite_error_code(),
            Some(
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::SystemIoFailure
            )
        );
        if lost {
            DriverError::ConnectionLost(e.to_string())
        } else {
            DriverError::Query(e.to_string())
        }
    }
}

pub struct SqliteConnector;

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> DriverResult<Arc<dyn DatabaseConnection>> {
        let file = descriptor
            .file
            .clone()
            .or_else(|| descriptor.database.clone())
            .ok_or_else(|| DriverError::Connect("sqlite connection has no file".to_string()))?;

        let conn = tokio::task::spawn_blocking(move || -> DriverResult<Connection> {
            let conn =
                Connection::open(&file).map_err(|e| DriverError::Connect(format!("{file}: {e}")))?;
            // Opening is lazy; touch the schema to surface "not a database" now.
            conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
                .map_err(|e| DriverError::Connect(format!("{file}: {e}")))?;
            Ok(conn)
        })
        .await??;

        tracing::info!(file = ?descriptor.file, "sqlite connection opened");
        Ok(Arc::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConnection {
    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> DriverResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| DriverError::ConnectionLost("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await?
    }
}

fn schema_version(conn: &Connection) -> DriverResult<i64> {
    Ok(conn.query_row("PRAGMA schema_version", [], |row| row.get(0))?)
}

fn analyse(conn: &Connection) -> DriverResult<StructureSnapshot> {
    let version = schema_version(conn)?;

    let mut objects = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )?;
    let objects = objects
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut columns = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;

    let mut snapshot = StructureSnapshot {
        engine: ENGINE.to_string(),
        schema_version: Some(version),
        ..Default::default()
    };

    for (kind, name, sql) in objects {
        if kind == "view" {
            snapshot.views.push(ViewStructure {
                schema_name: None,
                pure_name: name,
                create_sql: sql,
            });
            continue;
        }

        let mut keyed = Vec::new();
        let table_columns = columns
            .query_map([&name], |row| {
                let column = ColumnStructure {
                    column_name: row.get(0)?,
                    data_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    not_null: row.get::<_, i64>(2)? != 0,
                    default_value: row.get(3)?,
                };
                Ok((column, row.get::<_, i64>(4)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(column, pk)| {
                if pk > 0 {
                    keyed.push((pk, column.column_name.clone()));
                }
                column
            })
            .collect();
        keyed.sort();

        snapshot.tables.push(TableStructure {
            schema_name: None,
            pure_name: name,
            columns: table_columns,
            primary_key: keyed.into_iter().map(|(_, column)| column).collect(),
        });
    }

    Ok(snapshot)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

fn result_columns(stmt: &Statement<'_>) -> Vec<ResultColumn> {
    stmt.column_names()
        .into_iter()
        .map(|name| ResultColumn {
            column_name: name.to_string(),
            data_type: None,
        })
        .collect()
}

/// Call `sink` for every row of `stmt`.
fn for_each_row(
    stmt: &mut Statement<'_>,
    columns: &[ResultColumn],
    mut sink: impl FnMut(Row) -> DriverResult<bool>,
) -> DriverResult<()> {
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (index, column) in columns.iter().enumerate() {
            record.insert(column.column_name.clone(), to_json(row.get_ref(index)?));
        }
        if !sink(record)? {
            break;
        }
    }
    Ok(())
}

fn stream_statement(stmt: &mut Statement<'_>, mut writer: TableWriter) -> DriverResult<StreamStats> {
    let columns = result_columns(stmt);
    writer.initialize_from_schema(&StreamHeader::with_columns(columns.clone()))?;
    for_each_row(stmt, &columns, |row| {
        writer.write_row(&row)?;
        Ok(true)
    })?;
    Ok(writer.close()?)
}

#[async_trait]
impl DatabaseConnection for SqliteConnection {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    async fn ping(&self) -> DriverResult<()> {
        self.with_conn(|conn| schema_version(conn).map(|_| ())).await
    }

    async fn server_version(&self) -> DriverResult<ServerVersion> {
        self.with_conn(|conn| {
            let version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
            Ok(ServerVersion {
                version_text: Some(format!("SQLite {version}")),
                version,
            })
        })
        .await
    }

    async fn list_databases(&self) -> DriverResult<Vec<DatabaseInfo>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM pragma_database_list ORDER BY seq")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names.into_iter().map(|name| DatabaseInfo { name }).collect())
        })
        .await
    }

    async fn analyse_full(&self) -> DriverResult<StructureSnapshot> {
        self.with_conn(analyse).await
    }

    async fn analyse_incremental(
        &self,
        previous: &StructureSnapshot,
    ) -> DriverResult<Option<StructureSnapshot>> {
        let known = (previous.engine == ENGINE)
            .then_some(previous.schema_version)
            .flatten();
        self.with_conn(move |conn| {
            if known == Some(schema_version(conn)?) {
                return Ok(None);
            }
            analyse(conn).map(Some)
        })
        .await
    }

    async fn query(&self, sql: &str, limit: Option<usize>) -> DriverResult<QueryResult> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns = result_columns(&stmt);
            let mut rows = Vec::new();
            if limit != Some(0) {
                for_each_row(&mut stmt, &columns, |row| {
                    rows.push(row);
                    Ok(limit.map_or(true, |limit| rows.len() < limit))
                })?;
            }
            Ok(QueryResult { columns, rows })
        })
        .await
    }

    async fn run_script(&self, sql: &str) -> DriverResult<ScriptResult> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let mut rows_affected = 0u64;
            let mut batch = Batch::new(conn, &sql);
            while let Some(mut stmt) = batch.next()? {
                if stmt.column_count() > 0 {
                    let mut rows = stmt.query([])?;
                    while rows.next()?.is_some() {}
                } else {
                    rows_affected += stmt.execute([])? as u64;
                }
            }
            Ok(ScriptResult { rows_affected })
        })
        .await
    }

    async fn stream_query(
        &self,
        sql: &str,
        jslid: &str,
        target: &StreamTarget,
    ) -> DriverResult<StreamStats> {
        let sql = sql.to_string();
        let writer = target.writer(jslid)?;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            stream_statement(&mut stmt, writer)
        })
        .await
    }

    async fn execute_query(&self, sql: &str, target: &StreamTarget) -> DriverResult<ExecuteResult> {
        let sql = sql.to_string();
        let target = target.clone();
        self.with_conn(move |conn| {
            let mut result = ExecuteResult::default();
            let mut batch = Batch::new(conn, &sql);
            while let Some(mut stmt) = batch.next()? {
                if stmt.column_count() == 0 {
                    result.rows_affected += stmt.execute([])? as u64;
                    continue;
                }
                let jslid = new_store_id();
                let stats = stream_statement(&mut stmt, target.writer(&jslid)?)?;
                result.recordsets.push(StreamResult {
                    jslid,
                    row_count: stats.row_count,
                });
            }
            Ok(result)
        })
        .await
    }
}
