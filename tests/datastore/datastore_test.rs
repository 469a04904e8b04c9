// tests/datastore/datastore_test.rs
use std::io::Write;
use std::path::Path;

use conduit::datastore::{
    DatastoreRegistry, JsonLinesDatastore, StreamHeader, StreamStats, TableWriter, WriterOptions,
};
use conduit::worker::protocol::{ResultColumn, Row};
use serde_json::json;
use std::time::Duration;

fn row(id: u64) -> Row {
    json!({"id": id, "name": format!("row {id}")})
        .as_object()
        .cloned()
        .unwrap()
}

fn header() -> StreamHeader {
    StreamHeader::with_columns(vec![
        ResultColumn {
            column_name: "id".to_string(),
            data_type: Some("integer".to_string()),
        },
        ResultColumn {
            column_name: "name".to_string(),
            data_type: Some("text".to_string()),
        },
    ])
}

fn batched() -> WriterOptions {
    WriterOptions {
        batch_rows: 500,
        flush_interval: Duration::from_secs(3600),
    }
}

fn write_rows(path: &Path, count: u64) -> StreamStats {
    let mut writer = TableWriter::new(path, batched());
    writer.initialize_from_schema(&header()).unwrap();
    for id in 0..count {
        writer.write_row(&row(id)).unwrap();
    }
    writer.close().unwrap()
}

#[tokio::test]
async fn test_round_trip_skips_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("result.jsonl");
    let stats = write_rows(&path, 250);
    assert_eq!(stats.row_count, 250);
    assert!(stats.is_finished);

    let store = JsonLinesDatastore::new(&path);
    let rows = store.get_rows(0, 250, None).await.unwrap();

    let expected: Vec<Row> = (0..250).map(row).collect();
    assert_eq!(rows, expected);
    assert!(rows.iter().all(|r| !r.contains_key("__isStreamHeader")));
    assert_eq!(store.header().await.unwrap(), Some(header()));
}

#[tokio::test]
async fn test_read_near_end_returns_remaining_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.jsonl");
    write_rows(&path, 10_000);

    let store = JsonLinesDatastore::new(&path);
    let rows = store.get_rows(9990, 20, None).await.unwrap();

    assert_eq!(rows.len(), 10);
    assert_eq!(rows[0], row(9990));
    assert_eq!(rows[9], row(9999));
}

#[tokio::test]
async fn test_same_page_twice_is_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pages.jsonl");
    write_rows(&path, 1000);

    let store = JsonLinesDatastore::new(&path);
    let first = store.get_rows(300, 50, None).await.unwrap();
    let second = store.get_rows(300, 50, None).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 50);
}

#[tokio::test]
async fn test_forward_and_backward_paging() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pages.jsonl");
    write_rows(&path, 100);

    let store = JsonLinesDatastore::new(&path);
    let mut seen = Vec::new();
    for page in 0..5 {
        seen.extend(store.get_rows(page * 20, 20, None).await.unwrap());
    }
    assert_eq!(seen, (0..100).map(row).collect::<Vec<_>>());

    // Going back reopens the file.
    assert_eq!(store.get_rows(10, 2, None).await.unwrap(), vec![row(10), row(11)]);
    assert!(store.get_rows(100, 10, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rows_appended_after_notify() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live.jsonl");

    let mut writer = TableWriter::new(&path, batched());
    writer.initialize_from_schema(&header()).unwrap();
    for id in 0..10 {
        writer.write_row(&row(id)).unwrap();
    }
    writer.flush_stats().unwrap();

    let store = JsonLinesDatastore::new(&path);
    assert_eq!(store.get_rows(0, 100, None).await.unwrap().len(), 10);
    assert_eq!(StreamStats::read(&path).unwrap().unwrap().row_count, 10);

    for id in 10..25 {
        writer.write_row(&row(id)).unwrap();
    }
    let stats = writer.close().unwrap();
    store.notify_changed().await;

    let rows = store.get_rows(0, 100, None).await.unwrap();
    assert_eq!(rows.len(), 25);
    assert_eq!(stats.row_count, 25);
    assert!(StreamStats::read(&path).unwrap().unwrap().is_finished);
}

#[tokio::test]
async fn test_unterminated_last_line_is_held_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.jsonl");
    std::fs::write(&path, "{\"id\":0}\n{\"id\":1}\n{\"id\":").unwrap();

    let store = JsonLinesDatastore::new(&path);
    let rows = store.get_rows(0, 10, None).await.unwrap();
    assert_eq!(rows.len(), 2);

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"2}\n").unwrap();
    store.notify_changed().await;

    let rows = store.get_rows(2, 10, None).await.unwrap();
    assert_eq!(rows, vec![json!({"id": 2}).as_object().cloned().unwrap()]);
    assert_eq!(store.header().await.unwrap(), Some(StreamHeader::dynamic()));
}

#[tokio::test]
async fn test_registry_shares_readers_and_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let registry = DatastoreRegistry::new(dir.path());
    let path = registry.path("query-1").unwrap();
    write_rows(&path, 5);

    let a = registry.open("query-1").unwrap();
    let b = registry.open("query-1").unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));
    assert_eq!(registry.read_rows("query-1", 0, 10, None).await.unwrap().len(), 5);
    assert_eq!(registry.stats("query-1").unwrap().unwrap().row_count, 5);

    registry.remove("query-1").await.unwrap();
    assert_eq!(registry.open_count(), 0);
    assert!(!path.exists());
    assert!(registry.stats("query-1").unwrap().is_none());

    assert!(registry.open("../escape").is_err());
}
