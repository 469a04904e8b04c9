// tests/datastore/filter_test.rs
use conduit::datastore::{
    BinaryOperator, Condition, Expression, JsonLinesDatastore, StreamHeader, TableWriter,
    WriterOptions,
};
use conduit::worker::protocol::Row;
use serde_json::json;

const CATEGORIES: [&str; 3] = ["a", "b", "c"];

fn row(id: u64) -> Row {
    let note = if id % 7 == 0 { json!(null) } else { json!(format!("note {id}")) };
    json!({
        "id": id,
        "category": CATEGORIES[(id % 3) as usize],
        "amount": (id * 37) % 100,
        "note": note,
    })
    .as_object()
    .cloned()
    .unwrap()
}

fn store(dir: &tempfile::TempDir, count: u64) -> JsonLinesDatastore {
    let path = dir.path().join("filtered.jsonl");
    let mut writer = TableWriter::new(&path, WriterOptions::default());
    writer.initialize_from_schema(&StreamHeader::dynamic()).unwrap();
    for id in 0..count {
        writer.write_row(&row(id)).unwrap();
    }
    writer.close().unwrap();
    JsonLinesDatastore::new(path)
}

fn conditions() -> Vec<Condition> {
    vec![
        Condition::compare("category", BinaryOperator::Eq, "b"),
        Condition::compare("amount", BinaryOperator::GtEq, 50),
        Condition::IsNull {
            expr: Expression::column("note"),
        },
        Condition::Like {
            left: Expression::column("note"),
            right: Expression::value("%1_"),
        },
        Condition::And {
            conditions: vec![
                Condition::compare("category", BinaryOperator::NotEq, "a"),
                Condition::compare("amount", BinaryOperator::Lt, 10),
            ],
        },
        Condition::Not {
            condition: Box::new(Condition::In {
                expr: Expression::column("category"),
                values: vec![json!("a"), json!("c")],
            }),
        },
    ]
}

#[tokio::test]
async fn test_filtered_reads_respect_limit_and_predicate() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir, 1000);

    for condition in conditions() {
        for limit in [0, 1, 7, 50] {
            let rows = store.get_rows(0, limit, Some(&condition)).await.unwrap();
            assert!(rows.len() <= limit, "{condition:?} returned {} rows", rows.len());
            assert!(rows.iter().all(|r| condition.evaluate(r)), "{condition:?}");
        }
    }
}

#[tokio::test]
async fn test_offset_counts_matching_rows_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir, 100);
    let only_a = Condition::compare("category", BinaryOperator::Eq, "a");

    let rows = store.get_rows(5, 3, Some(&only_a)).await.unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, vec![15, 18, 21]);
}

#[tokio::test]
async fn test_changing_filter_restarts_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir, 100);
    let only_a = Condition::compare("category", BinaryOperator::Eq, "a");
    let only_b = Condition::compare("category", BinaryOperator::Eq, "b");

    store.get_rows(10, 5, Some(&only_a)).await.unwrap();
    let rows = store.get_rows(0, 2, Some(&only_b)).await.unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, vec![1, 4]);

    let unfiltered = store.get_rows(0, 2, None).await.unwrap();
    assert_eq!(unfiltered, vec![row(0), row(1)]);
}

#[tokio::test]
async fn test_filter_from_ui_json() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir, 30);
    let condition: Condition = serde_json::from_value(json!({
        "conditionType": "or",
        "conditions": [
            {"conditionType": "binary", "operator": "=",
             "left": {"exprType": "column", "columnName": "id"},
             "right": {"exprType": "value", "value": "3"}},
            {"conditionType": "binary", "operator": "=",
             "left": {"exprType": "column", "columnName": "id"},
             "right": {"exprType": "value", "value": 29}}
        ]
    }))
    .unwrap();

    let rows = store.get_rows(0, 10, Some(&condition)).await.unwrap();
    assert_eq!(rows, vec![row(3), row(29)]);
}
