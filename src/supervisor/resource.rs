//! Per-resource bookkeeping held by the supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};

use super::key::ResourceKey;
use crate::structure::StructureSnapshot;
use crate::worker::protocol::{DatabaseInfo, ServerVersion, Status, StatusName};
use crate::worker::WorkerClient;

/// Last known state pushed by a worker.
#[derive(Debug)]
pub(crate) struct ResourceState {
    pub status: Status,
    pub structure: Option<Arc<StructureSnapshot>>,
    pub structure_hash: Option<String>,
    pub analysed_time: Option<DateTime<Utc>>,
    pub version: Option<ServerVersion>,
    pub databases: Vec<DatabaseInfo>,
    pub last_pong: Instant,
    /// Why the supervisor killed the worker, if it did.
    pub exit_reason: Option<String>,
}

impl ResourceState {
    fn new(structure: Option<Arc<StructureSnapshot>>) -> Self {
        let structure_hash = structure
            .as_deref()
            .and_then(|snapshot| snapshot.content_hash().ok());
        Self {
            status: Status::pending(),
            structure,
            structure_hash,
            analysed_time: None,
            version: None,
            databases: Vec::new(),
            last_pong: Instant::now(),
            exit_reason: None,
        }
    }

    fn is_loading(&self) -> bool {
        matches!(
            self.status.name,
            StatusName::CheckStructure | StatusName::LoadStructure
        )
    }
}

/// What survives a closed resource: enough to answer `get_status` and to hand
/// the structure back to the next worker as its incremental-refresh baseline.
#[derive(Debug, Clone)]
pub struct ClosedResource {
    pub status: Status,
    pub structure: Option<Arc<StructureSnapshot>>,
    pub analysed_time: Option<DateTime<Utc>>,
}

/// A live worker and the state it reported.
pub struct OpenedResource {
    key: ResourceKey,
    client: WorkerClient,
    pub(crate) state: Mutex<ResourceState>,
    disconnected: AtomicBool,
    generation: watch::Sender<u64>,
}

impl OpenedResource {
    pub(crate) fn new(
        key: ResourceKey,
        client: WorkerClient,
        structure: Option<Arc<StructureSnapshot>>,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            key,
            client,
            state: Mutex::new(ResourceState::new(structure)),
            disconnected: AtomicBool::new(false),
            generation,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn client(&self) -> &WorkerClient {
        &self.client
    }

    pub fn pid(&self) -> Option<u32> {
        self.client.pid()
    }

    pub fn is_alive(&self) -> bool {
        self.client.is_alive() && !self.is_disconnected()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Set the disconnected flag. Returns `true` only for the first caller.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    pub async fn status(&self) -> Status {
        self.state.lock().await.status.clone()
    }

    pub async fn structure(&self) -> Option<Arc<StructureSnapshot>> {
        self.state.lock().await.structure.clone()
    }

    pub async fn analysed_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.analysed_time
    }

    pub async fn version(&self) -> Option<ServerVersion> {
        self.state.lock().await.version.clone()
    }

    pub async fn databases(&self) -> Vec<DatabaseInfo> {
        self.state.lock().await.databases.clone()
    }

    pub(crate) async fn archive(&self) -> ClosedResource {
        let state = self.state.lock().await;
        ClosedResource {
            status: state.status.clone(),
            structure: state.structure.clone(),
            analysed_time: state.analysed_time,
        }
    }

    /// Wake structure waiters so they re-check the state.
    pub(crate) fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    /// Wait until the worker reported anything but `pending`, or went away.
    pub async fn wait_for_status(&self) -> Status {
        let mut generation = self.generation.subscribe();
        loop {
            let status = self.status().await;
            if status.name != StatusName::Pending || self.is_disconnected() {
                return status;
            }
            if generation.changed().await.is_err() {
                return self.status().await;
            }
        }
    }

    /// Wait until a structure analysis has settled: a refresh completed, the
    /// analysis failed or the worker went away.
    pub async fn wait_for_structure(&self) -> Option<Arc<StructureSnapshot>> {
        let mut generation = self.generation.subscribe();
        loop {
            {
                let state = self.state.lock().await;
                let settled = state.analysed_time.is_some() || state.status.is_error();
                if self.is_disconnected() || (settled && !state.is_loading()) {
                    return state.structure.clone();
                }
            }
            if generation.changed().await.is_err() {
                return self.structure().await;
            }
        }
    }
}

impl std::fmt::Debug for OpenedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedResource")
            .field("key", &self.key)
            .field("pid", &self.client.pid())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}
