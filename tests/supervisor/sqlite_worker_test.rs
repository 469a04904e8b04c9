// tests/supervisor/sqlite_worker_test.rs
//
// End-to-end: supervisor + real `conduit-worker` processes + SQLite.
use std::path::Path;
use std::time::Duration;

use conduit::config::{ConnectionDescriptor, Settings};
use conduit::datastore::{new_store_id, BinaryOperator, Condition};
use conduit::supervisor::{ResourceKey, Supervisor, SupervisorError, SupervisorEvent};
use conduit::worker::protocol::{
    DatabaseInfo, ExecuteResult, Operation, QueryResult, ScriptResult, StatusName, StreamResult,
};
use tokio::sync::broadcast;

const WORKER: &str = env!("CARGO_BIN_EXE_conduit-worker");

fn create_database(path: &Path, users: u32) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT);",
    )
    .unwrap();
    for id in 1..=users {
        let email = (id % 2 == 0).then(|| format!("user{id}@example.com"));
        conn.execute(
            "INSERT INTO users (id, name, email) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, format!("user {id}"), email],
        )
        .unwrap();
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    supervisor: Supervisor,
    descriptor: ConnectionDescriptor,
}

fn fixture(users: u32) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    create_database(&db, users);

    let mut settings = Settings::default();
    settings.logging.level = "warn".to_string();
    let supervisor = Supervisor::builder(settings)
        .data_dir(dir.path().join("data"))
        .worker_program(WORKER)
        .build()
        .unwrap();

    Fixture {
        descriptor: ConnectionDescriptor::sqlite("local", db.display().to_string()),
        _dir: dir,
        supervisor,
    }
}

async fn next_structure_change(events: &mut broadcast::Receiver<SupervisorEvent>) -> SupervisorEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event @ SupervisorEvent::StructureChanged { .. }) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_connect_analyse_and_query() {
    let f = fixture(3);
    let key = ResourceKey::database("local", None);

    f.supervisor.ensure_open(&key, &f.descriptor).await.unwrap();
    let status = f.supervisor.wait_connected(&key).await.unwrap();
    assert_eq!(status.name, StatusName::Ok);

    let version = f.supervisor.get_version(&key).await.unwrap();
    assert!(version.version.starts_with('3'));

    let structure = f.supervisor.wait_for_structure(&key).await.unwrap().unwrap();
    let users = structure.table("users").unwrap();
    assert_eq!(users.primary_key, vec!["id"]);
    assert!(users.column("name").unwrap().not_null);

    let result: QueryResult = f
        .supervisor
        .request(
            &key,
            Operation::Query {
                sql: "SELECT id, name FROM users ORDER BY id".to_string(),
                limit: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 3);
    assert_eq!(result.rows[0]["name"], "user 1");
    assert_eq!(result.columns[1].column_name, "name");

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_operation_failure_is_passed_through() {
    let f = fixture(1);
    let key = ResourceKey::database("local", None);
    f.supervisor.ensure_open(&key, &f.descriptor).await.unwrap();

    let err = f
        .supervisor
        .send_request(
            &key,
            Operation::Query {
                sql: "SELEC nonsense".to_string(),
                limit: None,
            },
        )
        .await
        .unwrap_err();
    match &err {
        SupervisorError::Worker(e) => {
            assert!(e.is_operation_failure());
            assert!(e.to_string().contains("syntax error"), "{e}");
        }
        other => panic!("expected operation failure, got {other}"),
    }

    // The worker keeps serving.
    let result: QueryResult = f
        .supervisor
        .request(
            &key,
            Operation::Query {
                sql: "SELECT count(*) AS n FROM users".to_string(),
                limit: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.rows[0]["n"], 1);

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stream_query_into_store() {
    let f = fixture(2500);
    let key = ResourceKey::database("local", None);
    f.supervisor.ensure_open(&key, &f.descriptor).await.unwrap();

    let jslid = new_store_id();
    let streamed: StreamResult = f
        .supervisor
        .request(
            &key,
            Operation::StreamQuery {
                sql: "SELECT id, name, email FROM users ORDER BY id".to_string(),
                jslid: jslid.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(streamed.jslid, jslid);
    assert_eq!(streamed.row_count, 2500);

    let stats = f.supervisor.stream_stats(&jslid).unwrap().unwrap();
    assert_eq!(stats.row_count, 2500);
    assert!(stats.is_finished);

    let tail = f.supervisor.read_rows(&jslid, 2490, 20, None).await.unwrap();
    assert_eq!(tail.len(), 10);
    assert_eq!(tail[9]["id"], 2500);

    let with_email = Condition::IsNotNull {
        expr: conduit::datastore::Expression::column("email"),
    };
    let rows = f
        .supervisor
        .read_rows(&jslid, 0, 5, Some(&with_email))
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|r| r["id"].as_u64().unwrap() % 2 == 0));

    let large_ids = Condition::compare("id", BinaryOperator::Gt, 2495);
    let rows = f
        .supervisor
        .read_rows(&jslid, 0, 100, Some(&large_ids))
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_session_execute_query_streams_each_result_set() {
    let f = fixture(4);
    let key = ResourceKey::session("s1");
    f.supervisor.ensure_open(&key, &f.descriptor).await.unwrap();

    let result: ExecuteResult = f
        .supervisor
        .request(
            &key,
            Operation::ExecuteQuery {
                sql: "SELECT id FROM users; UPDATE users SET name = 'x' WHERE id = 1; SELECT name FROM users WHERE id = 1;"
                    .to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(result.recordsets.len(), 2);
    assert_eq!(result.recordsets[0].row_count, 4);

    let renamed = f
        .supervisor
        .read_rows(&result.recordsets[1].jslid, 0, 10, None)
        .await
        .unwrap();
    assert_eq!(renamed[0]["name"], "x");

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_refresh_detects_schema_change() {
    let f = fixture(1);
    let key = ResourceKey::database("local", None);
    let mut events = f.supervisor.subscribe();
    f.supervisor.ensure_open(&key, &f.descriptor).await.unwrap();
    f.supervisor.wait_for_structure(&key).await.unwrap();
    next_structure_change(&mut events).await;

    let script: ScriptResult = f
        .supervisor
        .request(
            &key,
            Operation::RunScript {
                sql: "CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER)".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(script.rows_affected, 0);

    f.supervisor.refresh(&key, false).await.unwrap();
    match next_structure_change(&mut events).await {
        SupervisorEvent::StructureChanged { structure, .. } => {
            assert!(structure.table("orders").is_some());
        }
        other => panic!("unexpected event {other:?}"),
    }

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_reopen_starts_from_cached_structure() {
    let f = fixture(1);
    let key = ResourceKey::database("local", None);

    f.supervisor.ensure_open(&key, &f.descriptor).await.unwrap();
    let first = f.supervisor.wait_for_structure(&key).await.unwrap().unwrap();
    f.supervisor.close(&key, false).await.unwrap();
    assert_eq!(f.supervisor.live_count().await, 0);

    let reopened = f.supervisor.ensure_open(&key, &f.descriptor).await.unwrap();
    // Known before the new worker analysed anything.
    assert_eq!(reopened.structure().await.as_deref(), Some(&*first));

    let second = f.supervisor.wait_for_structure(&key).await.unwrap().unwrap();
    assert_eq!(*second, *first);

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_server_lists_databases() {
    let f = fixture(1);
    let key = ResourceKey::server("local");
    f.supervisor.ensure_open(&key, &f.descriptor).await.unwrap();
    f.supervisor.wait_connected(&key).await.unwrap();

    let databases: Vec<DatabaseInfo> = f
        .supervisor
        .request(&key, Operation::ListDatabases)
        .await
        .unwrap();
    assert!(databases.iter().any(|d| d.name == "main"));

    f.supervisor.shutdown().await;
}
