// tests/structure/structure_test.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conduit::driver::{DriverError, DriverResult};
use conduit::structure::{
    ColumnStructure, RefreshOutcome, StructureAnalyser, StructureScheduler, StructureSnapshot,
    TableStructure,
};
use conduit::worker::protocol::{StatusName, WorkerMessage};
use tokio::sync::{mpsc, Notify};

fn snapshot(version: i64, tables: &[&str]) -> StructureSnapshot {
    StructureSnapshot {
        engine: "sqlite".to_string(),
        schema_version: Some(version),
        tables: tables
            .iter()
            .map(|name| TableStructure {
                schema_name: None,
                pure_name: name.to_string(),
                columns: vec![ColumnStructure {
                    column_name: "id".to_string(),
                    data_type: "INTEGER".to_string(),
                    not_null: true,
                    default_value: None,
                }],
                primary_key: vec!["id".to_string()],
            })
            .collect(),
        views: Vec::new(),
    }
}

/// Serves whatever `current` holds; incremental analysis reports "no
/// change" while the schema version is unchanged.
#[derive(Default)]
struct FakeAnalyser {
    current: Mutex<StructureSnapshot>,
    full_calls: AtomicUsize,
    incremental_calls: AtomicUsize,
    fail: Mutex<bool>,
    gate: Option<Arc<Notify>>,
}

impl FakeAnalyser {
    fn serving(snapshot: StructureSnapshot) -> Self {
        Self {
            current: Mutex::new(snapshot),
            ..Default::default()
        }
    }

    fn gated(snapshot: StructureSnapshot, gate: Arc<Notify>) -> Self {
        Self {
            current: Mutex::new(snapshot),
            gate: Some(gate),
            ..Default::default()
        }
    }

    async fn pass_gate(&self) -> DriverResult<()> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if *self.fail.lock().unwrap() {
            return Err(DriverError::Query("analysis failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StructureAnalyser for FakeAnalyser {
    async fn analyse_full(&self) -> DriverResult<StructureSnapshot> {
        self.full_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await?;
        Ok(self.current.lock().unwrap().clone())
    }

    async fn analyse_incremental(
        &self,
        previous: &StructureSnapshot,
    ) -> DriverResult<Option<StructureSnapshot>> {
        self.incremental_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await?;
        let current = self.current.lock().unwrap().clone();
        if current.schema_version == previous.schema_version {
            Ok(None)
        } else {
            Ok(Some(current))
        }
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Vec<WorkerMessage> {
    let mut drained = Vec::new();
    while let Ok(message) = events.try_recv() {
        drained.push(message);
    }
    drained
}

fn kinds(messages: &[WorkerMessage]) -> Vec<&'static str> {
    messages.iter().map(WorkerMessage::kind).collect()
}

#[tokio::test]
async fn test_unchanged_refresh_keeps_snapshot_and_updates_time() {
    let analyser = Arc::new(FakeAnalyser::serving(snapshot(1, &["users"])));
    let (tx, mut events) = mpsc::unbounded_channel();
    let scheduler = StructureScheduler::new(analyser.clone(), tx, None);

    assert_eq!(scheduler.full_refresh().await.unwrap(), RefreshOutcome::Changed);
    let first = scheduler.snapshot().await.unwrap();
    let first_time = scheduler.analysed_time().await.unwrap();
    assert_eq!(
        kinds(&drain(&mut events)),
        vec!["status", "structure", "structureTime", "status"]
    );

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(
        scheduler.incremental_refresh().await.unwrap(),
        RefreshOutcome::Unchanged
    );

    let second = scheduler.snapshot().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(scheduler.analysed_time().await.unwrap() > first_time);
    // No structure message, but a fresh timestamp.
    assert_eq!(
        kinds(&drain(&mut events)),
        vec!["status", "structureTime", "status"]
    );
}

#[tokio::test]
async fn test_full_refresh_with_same_content_emits_no_structure() {
    let analyser = Arc::new(FakeAnalyser::serving(snapshot(1, &["users"])));
    let (tx, mut events) = mpsc::unbounded_channel();
    let scheduler = StructureScheduler::new(analyser.clone(), tx, Some(snapshot(1, &["users"])));

    assert_eq!(scheduler.full_refresh().await.unwrap(), RefreshOutcome::Unchanged);
    assert!(!kinds(&drain(&mut events)).contains(&"structure"));
    assert_eq!(analyser.full_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_previous_snapshot_enables_incremental_start() {
    let analyser = Arc::new(FakeAnalyser::serving(snapshot(2, &["users", "orders"])));
    let (tx, mut events) = mpsc::unbounded_channel();
    let scheduler = StructureScheduler::new(analyser.clone(), tx, Some(snapshot(1, &["users"])));

    assert_eq!(
        scheduler.incremental_refresh().await.unwrap(),
        RefreshOutcome::Changed
    );
    assert_eq!(analyser.full_calls.load(Ordering::SeqCst), 0);
    assert_eq!(analyser.incremental_calls.load(Ordering::SeqCst), 1);
    assert!(scheduler.snapshot().await.unwrap().table("orders").is_some());

    let messages = drain(&mut events);
    match &messages[0] {
        WorkerMessage::Status { status } => assert_eq!(status.name, StatusName::CheckStructure),
        other => panic!("expected status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_overlapping_refresh_is_skipped() {
    let gate = Arc::new(Notify::new());
    let analyser = Arc::new(FakeAnalyser::gated(snapshot(1, &["users"]), gate.clone()));
    let (tx, _events) = mpsc::unbounded_channel();
    let scheduler = Arc::new(StructureScheduler::new(analyser.clone(), tx, None));

    let running = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.full_refresh().await }
    });
    while !scheduler.is_loading() {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        scheduler.incremental_refresh().await.unwrap(),
        RefreshOutcome::Skipped
    );
    assert_eq!(scheduler.full_refresh().await.unwrap(), RefreshOutcome::Skipped);

    gate.notify_one();
    assert_eq!(running.await.unwrap().unwrap(), RefreshOutcome::Changed);
    assert_eq!(analyser.full_calls.load(Ordering::SeqCst), 1);
    assert!(!scheduler.is_loading());
}

#[tokio::test]
async fn test_waiters_released_after_refresh() {
    let gate = Arc::new(Notify::new());
    let analyser = Arc::new(FakeAnalyser::gated(snapshot(1, &["users"]), gate.clone()));
    let (tx, _events) = mpsc::unbounded_channel();
    let scheduler = Arc::new(StructureScheduler::new(analyser, tx, None));

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.wait_for_structure().await })
        })
        .collect();

    let refresh = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.full_refresh().await }
    });
    while !scheduler.is_loading() {
        tokio::task::yield_now().await;
    }
    gate.notify_one();
    refresh.await.unwrap().unwrap();

    for waiter in waiters {
        let structure = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(structure.unwrap().table("users").is_some());
    }

    // Already settled: returns at once.
    assert!(scheduler.wait_for_structure().await.is_some());
}

#[tokio::test]
async fn test_failed_refresh_releases_waiters_and_reports_error() {
    let gate = Arc::new(Notify::new());
    let analyser = Arc::new(FakeAnalyser::gated(snapshot(1, &["users"]), gate.clone()));
    *analyser.fail.lock().unwrap() = true;
    let (tx, mut events) = mpsc::unbounded_channel();
    let scheduler = Arc::new(StructureScheduler::new(analyser, tx, None));

    let waiter = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.wait_for_structure().await }
    });
    let refresh = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.full_refresh().await }
    });
    while !scheduler.is_loading() {
        tokio::task::yield_now().await;
    }
    gate.notify_one();

    assert!(refresh.await.unwrap().is_err());
    assert!(waiter.await.unwrap().is_none());
    assert!(scheduler.analysed_time().await.is_none());

    let last = drain(&mut events).pop();
    match last {
        Some(WorkerMessage::Status { status }) => assert!(status.is_error()),
        other => panic!("expected error status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_auto_refresh_picks_up_changes() {
    let analyser = Arc::new(FakeAnalyser::serving(snapshot(1, &["users"])));
    let (tx, mut events) = mpsc::unbounded_channel();
    let scheduler = Arc::new(StructureScheduler::new(analyser.clone(), tx, None));
    scheduler.full_refresh().await.unwrap();
    drain(&mut events);

    let handle = scheduler.spawn_auto_refresh(Duration::from_millis(50));
    *analyser.current.lock().unwrap() = snapshot(2, &["users", "orders"]);

    let structure = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(WorkerMessage::Structure { structure }) => return structure,
                Some(_) => continue,
                None => panic!("scheduler dropped"),
            }
        }
    })
    .await
    .unwrap();
    handle.abort();
    assert!(structure.table("orders").is_some());
    assert!(analyser.incremental_calls.load(Ordering::SeqCst) >= 1);
}
