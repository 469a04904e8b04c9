//! Full / incremental structure refresh for one database connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::snapshot::StructureSnapshot;
use crate::driver::DriverResult;
use crate::worker::protocol::{Status, StatusName, WorkerMessage};

/// Produces structure snapshots.
#[async_trait]
pub trait StructureAnalyser: Send + Sync {
    async fn analyse_full(&self) -> DriverResult<StructureSnapshot>;

    /// `None` means nothing changed since `previous`.
    async fn analyse_incremental(
        &self,
        previous: &StructureSnapshot,
    ) -> DriverResult<Option<StructureSnapshot>>;
}

#[derive(Default)]
struct State {
    snapshot: Option<Arc<StructureSnapshot>>,
    hash: Option<String>,
    analysed_time: Option<DateTime<Utc>>,
}

/// Outcome of a refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another refresh was running; nothing was done.
    Skipped,
    Unchanged,
    Changed,
}

/// Clears the loading flag however the refresh ends.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Serializes structure refreshes and publishes their results.
///
/// Emits on `events`, in order: `status` (checkStructure / loadStructure),
/// `structure` only when the content hash changed, `structureTime` after
/// every completed refresh, then `status` ok (or error).
pub struct StructureScheduler {
    analyser: Arc<dyn StructureAnalyser>,
    events: mpsc::UnboundedSender<WorkerMessage>,
    state: Mutex<State>,
    loading: AtomicBool,
    generation: watch::Sender<u64>,
}

impl StructureScheduler {
    /// `previous` is a snapshot known from an earlier connection; the first
    /// incremental refresh diffs against it instead of rescanning.
    pub fn new(
        analyser: Arc<dyn StructureAnalyser>,
        events: mpsc::UnboundedSender<WorkerMessage>,
        previous: Option<StructureSnapshot>,
    ) -> Self {
        let hash = previous.as_ref().and_then(|s| s.content_hash().ok());
        let (generation, _) = watch::channel(0);
        Self {
            analyser,
            events,
            state: Mutex::new(State {
                snapshot: previous.map(Arc::new),
                hash,
                analysed_time: None,
            }),
            loading: AtomicBool::new(false),
            generation,
        }
    }

    pub async fn full_refresh(&self) -> DriverResult<RefreshOutcome> {
        self.refresh(true).await
    }

    /// Falls back to a full scan when there is no previous snapshot.
    pub async fn incremental_refresh(&self) -> DriverResult<RefreshOutcome> {
        self.refresh(false).await
    }

    async fn refresh(&self, full: bool) -> DriverResult<RefreshOutcome> {
        if self.loading.swap(true, Ordering::AcqRel) {
            tracing::debug!("structure refresh already running, skipped");
            return Ok(RefreshOutcome::Skipped);
        }
        let _guard = LoadingGuard(&self.loading);

        let previous = self.state.lock().await.snapshot.clone();
        let result = match previous.as_deref() {
            Some(previous) if !full => {
                self.emit_status(StatusName::CheckStructure);
                self.analyser.analyse_incremental(previous).await
            }
            _ => {
                self.emit_status(StatusName::LoadStructure);
                self.analyser.analyse_full().await.map(Some)
            }
        };

        let outcome = match result {
            Ok(next) => {
                let outcome = self.apply(next).await;
                let _ = self.events.send(WorkerMessage::Status {
                    status: Status::ok(),
                });
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(error = %e, full, "structure analysis failed");
                let _ = self.events.send(WorkerMessage::Status {
                    status: Status::error(e.to_string()),
                });
                Err(e)
            }
        };

        self.generation.send_modify(|g| *g += 1);
        outcome
    }

    async fn apply(&self, next: Option<StructureSnapshot>) -> RefreshOutcome {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.analysed_time = Some(now);

        let mut outcome = RefreshOutcome::Unchanged;
        if let Some(next) = next {
            let hash = next.content_hash().ok();
            if hash.is_none() || hash != state.hash {
                let _ = self.events.send(WorkerMessage::Structure {
                    structure: next.clone(),
                });
                state.snapshot = Some(Arc::new(next));
                state.hash = hash;
                outcome = RefreshOutcome::Changed;
            }
        }

        let _ = self
            .events
            .send(WorkerMessage::StructureTime { analysed_time: now });
        outcome
    }

    fn emit_status(&self, name: StatusName) {
        let _ = self.events.send(WorkerMessage::Status {
            status: Status::named(name),
        });
    }

    pub async fn snapshot(&self) -> Option<Arc<StructureSnapshot>> {
        self.state.lock().await.snapshot.clone()
    }

    pub async fn analysed_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.analysed_time
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    /// Wait until a refresh has completed, unless one already has and none is
    /// running. Returns the current snapshot (`None` if analysis failed).
    pub async fn wait_for_structure(&self) -> Option<Arc<StructureSnapshot>> {
        let mut generation = self.generation.subscribe();
        let ready = *generation.borrow() > 0 && !self.is_loading();
        if !ready {
            let _ = generation.changed().await;
        }
        self.snapshot().await
    }

    /// Incremental refresh every `interval` until the handle is aborted.
    pub fn spawn_auto_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval() fires immediately; the connect path already refreshed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.incremental_refresh().await {
                    tracing::warn!(error = %e, "auto-refresh failed");
                }
            }
        })
    }
}
