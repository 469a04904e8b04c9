//! The supervisor: one worker process per [`ResourceKey`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Weak};
use std::time::Instant;

use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use super::events::SupervisorEvent;
use super::key::ResourceKey;
use super::resource::{ClosedResource, OpenedResource};
use super::{KeyedMutex, SupervisorError, SupervisorResult};
use crate::cache::ClosedResourceCache;
use crate::config::{ConnectionDescriptor, Settings};
use crate::crypto::MasterKey;
use crate::datastore::{Condition, DatastoreRegistry, StreamStats};
use crate::structure::StructureSnapshot;
use crate::tunnel::{TunnelForwarder, TunnelManager};
use crate::worker::protocol::{
    ControlMessage, DatabaseInfo, Operation, ResourceKind, Row, ServerVersion, Status,
    WorkerMessage,
};
use crate::worker::{WorkerClient, WorkerCommand, WorkerEvent, WORKER_EXITED};

/// Builds the command that starts a worker of the given kind.
pub type Launcher = Arc<dyn Fn(ResourceKind) -> WorkerCommand + Send + Sync>;

const EVENT_CAPACITY: usize = 256;

/// Configures and creates a [`Supervisor`].
pub struct SupervisorBuilder {
    settings: Settings,
    data_dir: Option<PathBuf>,
    worker_program: Option<PathBuf>,
    launcher: Option<Launcher>,
    master_key: Option<MasterKey>,
    forwarder: Option<Arc<dyn TunnelForwarder>>,
}

impl SupervisorBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            data_dir: None,
            worker_program: None,
            launcher: None,
            master_key: None,
            forwarder: None,
        }
    }

    /// Overrides `settings.data_dir`.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Overrides the worker binary lookup of [`Settings::worker_path`].
    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Replaces the whole worker command line, e.g. with a stand-in program.
    pub fn launcher(
        mut self,
        launcher: impl Fn(ResourceKind) -> WorkerCommand + Send + Sync + 'static,
    ) -> Self {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    pub fn master_key(mut self, key: MasterKey) -> Self {
        self.master_key = Some(key);
        self
    }

    pub fn forwarder(mut self, forwarder: Arc<dyn TunnelForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn build(self) -> SupervisorResult<Supervisor> {
        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => self.settings.data_dir()?,
        };

        let launcher = match self.launcher {
            Some(launcher) => launcher,
            None => {
                let program = self
                    .worker_program
                    .or_else(|| self.settings.worker_path())
                    .ok_or(SupervisorError::NoWorkerBinary)?;
                default_launcher(program, &self.settings, &data_dir)
            }
        };

        let tunnels = match self.forwarder {
            Some(forwarder) => TunnelManager::new(forwarder),
            None => TunnelManager::open_ssh(),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let closed = ClosedResourceCache::new(self.settings.supervisor.closed_cache_capacity);

        tracing::debug!(data_dir = %data_dir.display(), "supervisor created");

        Ok(Supervisor {
            inner: Arc::new(Inner {
                datastores: DatastoreRegistry::new(data_dir),
                settings: self.settings,
                launcher,
                master_key: self.master_key,
                resources: Mutex::new(HashMap::new()),
                closed: Mutex::new(closed),
                opening: KeyedMutex::new(),
                events,
                tunnels,
            }),
        })
    }
}

fn default_launcher(program: PathBuf, settings: &Settings, data_dir: &Path) -> Launcher {
    let worker = settings.worker.clone();
    let datastore = settings.datastore.clone();
    let level = settings.logging.level.clone();
    let data_dir = data_dir.to_path_buf();
    Arc::new(move |kind| {
        WorkerCommand::new(&program).args(worker.to_worker_args(kind, &data_dir, &level, &datastore))
    })
}

struct Inner {
    settings: Settings,
    launcher: Launcher,
    master_key: Option<MasterKey>,
    resources: Mutex<HashMap<ResourceKey, Arc<OpenedResource>>>,
    closed: Mutex<ClosedResourceCache<ResourceKey, ClosedResource>>,
    opening: KeyedMutex<ResourceKey>,
    events: broadcast::Sender<SupervisorEvent>,
    tunnels: TunnelManager,
    datastores: DatastoreRegistry,
}

/// Owner of every worker process and of the state they report.
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn builder(settings: Settings) -> SupervisorBuilder {
        SupervisorBuilder::new(settings)
    }

    /// The live resource for `key`, or a newly spawned one.
    ///
    /// Returns as soon as the worker has been told to connect; use
    /// [`Supervisor::wait_connected`] or [`Supervisor::wait_for_structure`]
    /// to wait for the outcome. Concurrent calls for one key spawn one worker.
    pub async fn ensure_open(
        &self,
        key: &ResourceKey,
        descriptor: &ConnectionDescriptor,
    ) -> SupervisorResult<Arc<OpenedResource>> {
        if let Some(resource) = self.resource(key).await {
            return Ok(resource);
        }

        let _opening = self.inner.opening.lock(key.clone()).await;
        if let Some(resource) = self.resource(key).await {
            return Ok(resource);
        }

        if descriptor.requires_interactive_credentials() {
            return Err(SupervisorError::MissingCredentials {
                conid: descriptor.id.clone(),
                mode: descriptor.password_mode,
            });
        }

        let connection = match &self.inner.master_key {
            Some(master_key) => descriptor.decrypt_passwords(master_key)?,
            None => descriptor.clone(),
        }
        .with_database(key.database_name());

        let kind = key.kind();
        let previous = match kind {
            ResourceKind::Database => self
                .inner
                .closed
                .lock()
                .await
                .get(key)
                .and_then(|closed| closed.structure.clone()),
            _ => None,
        };

        let command = (self.inner.launcher)(kind);
        let (client, worker_events) =
            WorkerClient::spawn(&command, self.inner.settings.supervisor.request_timeout())?;
        let resource = Arc::new(OpenedResource::new(key.clone(), client, previous.clone()));

        self.inner
            .resources
            .lock()
            .await
            .insert(key.clone(), resource.clone());
        tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            resource.clone(),
            worker_events,
        ));

        let auto_refresh_secs = match kind {
            ResourceKind::Database => self
                .inner
                .settings
                .structure
                .auto_refresh_interval()
                .map(|interval| interval.as_secs()),
            _ => None,
        };
        let connect = ControlMessage::Connect {
            connection,
            structure: previous.as_deref().cloned(),
            auto_refresh_secs,
        };
        if let Err(e) = resource.client().send(&connect).await {
            drop(_opening);
            self.close(key, true).await?;
            return Err(e.into());
        }

        tracing::info!(
            %key,
            pid = resource.pid(),
            incremental = previous.is_some(),
            "resource opened"
        );
        Ok(resource)
    }

    /// Close `key`: archive its state, then stop (or kill) its worker.
    ///
    /// Closing an unknown or already closed key is a no-op.
    pub async fn close(&self, key: &ResourceKey, force_kill: bool) -> SupervisorResult<()> {
        let _opening = self.inner.opening.lock(key.clone()).await;

        let Some(resource) = self.inner.resources.lock().await.remove(key) else {
            return Ok(());
        };
        resource.mark_disconnected();

        let closed = resource.archive().await;
        let status = closed.status.clone();
        self.inner.closed.lock().await.insert(key.clone(), closed);

        let stopped = if force_kill {
            resource.client().kill().await
        } else {
            resource.client().send(&ControlMessage::Close).await
        };
        if let Err(e) = stopped {
            tracing::debug!(%key, error = %e, "worker already gone on close");
        }
        resource.bump();

        self.inner.emit(SupervisorEvent::Closed {
            key: key.clone(),
            status,
        });
        tracing::info!(%key, force_kill, "resource closed");
        Ok(())
    }

    /// Send a typed operation and wait for the raw response payload.
    pub async fn send_request(
        &self,
        key: &ResourceKey,
        operation: Operation,
    ) -> SupervisorResult<serde_json::Value> {
        let resource = self.live(key).await?;
        Ok(resource.client().request_value(operation).await?)
    }

    /// Send a typed operation and deserialize its response.
    pub async fn request<R: DeserializeOwned>(
        &self,
        key: &ResourceKey,
        operation: Operation,
    ) -> SupervisorResult<R> {
        let resource = self.live(key).await?;
        Ok(resource.client().request(operation).await?)
    }

    /// Ask a database worker to re-analyse its structure, or a server worker
    /// to re-list its databases.
    pub async fn refresh(&self, key: &ResourceKey, full: bool) -> SupervisorResult<()> {
        let resource = self.live(key).await?;
        Ok(resource.client().send(&ControlMessage::Refresh { full }).await?)
    }

    /// Status of a live resource, else the last status of a closed one.
    pub async fn get_status(&self, key: &ResourceKey) -> Option<Status> {
        match self.resource(key).await {
            Some(resource) => Some(resource.status().await),
            None => self
                .inner
                .closed
                .lock()
                .await
                .get(key)
                .map(|closed| closed.status.clone()),
        }
    }

    pub async fn get_structure(&self, key: &ResourceKey) -> Option<Arc<StructureSnapshot>> {
        match self.resource(key).await {
            Some(resource) => resource.structure().await,
            None => self
                .inner
                .closed
                .lock()
                .await
                .get(key)
                .and_then(|closed| closed.structure.clone()),
        }
    }

    /// Wait until the structure of a live resource has been analysed.
    pub async fn wait_for_structure(
        &self,
        key: &ResourceKey,
    ) -> SupervisorResult<Option<Arc<StructureSnapshot>>> {
        let resource = self.live(key).await?;
        Ok(resource.wait_for_structure().await)
    }

    /// Wait for the connect outcome of a live resource.
    pub async fn wait_connected(&self, key: &ResourceKey) -> SupervisorResult<Status> {
        let resource = self.live(key).await?;
        let status = resource.wait_for_status().await;
        if status.is_error() {
            return Err(SupervisorError::ConnectionFailed {
                key: key.clone(),
                message: status.message.unwrap_or_else(|| WORKER_EXITED.to_string()),
            });
        }
        Ok(status)
    }

    pub async fn get_version(&self, key: &ResourceKey) -> Option<ServerVersion> {
        match self.resource(key).await {
            Some(resource) => resource.version().await,
            None => None,
        }
    }

    /// Database list last pushed by the server worker of `conid`.
    pub async fn get_databases(&self, conid: &str) -> Vec<DatabaseInfo> {
        match self.resource(&ResourceKey::server(conid)).await {
            Some(resource) => resource.databases().await,
            None => Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// The live, not yet disconnected resource for `key`.
    pub async fn resource(&self, key: &ResourceKey) -> Option<Arc<OpenedResource>> {
        self.inner
            .resources
            .lock()
            .await
            .get(key)
            .filter(|resource| !resource.is_disconnected())
            .cloned()
    }

    async fn live(&self, key: &ResourceKey) -> SupervisorResult<Arc<OpenedResource>> {
        self.resource(key)
            .await
            .ok_or_else(|| SupervisorError::NotOpen(key.clone()))
    }

    pub async fn live_count(&self) -> usize {
        self.inner.resources.lock().await.len()
    }

    pub fn datastores(&self) -> &DatastoreRegistry {
        &self.inner.datastores
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.inner.tunnels
    }

    pub async fn read_rows(
        &self,
        jslid: &str,
        offset: u64,
        limit: usize,
        filter: Option<&Condition>,
    ) -> SupervisorResult<Vec<Row>> {
        Ok(self
            .inner
            .datastores
            .read_rows(jslid, offset, limit, filter)
            .await?)
    }

    pub async fn notify_store_changed(&self, jslid: &str) -> SupervisorResult<()> {
        Ok(self.inner.datastores.notify_changed(jslid).await?)
    }

    pub fn stream_stats(&self, jslid: &str) -> SupervisorResult<Option<StreamStats>> {
        Ok(self.inner.datastores.stats(jslid)?)
    }

    /// Ping every live worker; kill those whose last echo is older than their
    /// ping timeout.
    pub async fn ping_all(&self) {
        let resources: Vec<_> = self
            .inner
            .resources
            .lock()
            .await
            .values()
            .cloned()
            .collect();

        for resource in resources {
            let timeout = self.inner.settings.worker.ping_timeout(resource.key().kind());
            let silent_for = {
                let mut state = resource.state.lock().await;
                let silent_for = state.last_pong.elapsed();
                if silent_for > timeout {
                    state.exit_reason =
                        Some(format!("no ping answer for {}s", silent_for.as_secs()));
                }
                silent_for
            };

            if silent_for > timeout {
                tracing::warn!(key = %resource.key(), pid = resource.pid(), "worker unresponsive, killing");
                if let Err(e) = resource.client().kill().await {
                    tracing::warn!(key = %resource.key(), error = %e, "failed to kill worker");
                }
            } else if let Err(e) = resource.client().send(&ControlMessage::Ping).await {
                tracing::debug!(key = %resource.key(), error = %e, "ping failed");
            }
        }
    }

    /// Run [`Supervisor::ping_all`] every `worker.ping_interval_secs` until the
    /// supervisor is dropped or the handle aborted.
    pub fn spawn_keepalive(&self) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let interval = self.inner.settings.worker.ping_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Supervisor { inner }.ping_all().await;
            }
        })
    }

    /// Close every live resource and drop all tunnels.
    pub async fn shutdown(&self) {
        let keys: Vec<_> = self.inner.resources.lock().await.keys().cloned().collect();
        let closing: Vec<_> = keys.iter().map(|key| self.close(key, false)).collect();
        let results = futures::future::join_all(closing).await;
        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(%key, error = %e, "close failed during shutdown");
            }
        }
        self.inner.tunnels.close_all().await;
    }
}

impl Inner {
    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn on_message(self: &Arc<Self>, resource: &Arc<OpenedResource>, message: WorkerMessage) {
        let key = resource.key().clone();
        tracing::trace!(%key, kind = message.kind(), "worker message");

        match message {
            WorkerMessage::Status { status } => {
                let changed = {
                    let mut state = resource.state.lock().await;
                    let changed = state.status != status;
                    state.status = status.clone();
                    changed
                };
                resource.bump();
                if changed {
                    self.emit(SupervisorEvent::StatusChanged { key, status });
                }
            }
            WorkerMessage::Structure { structure } => {
                let hash = structure.content_hash().ok();
                let snapshot = {
                    let mut state = resource.state.lock().await;
                    if hash.is_some() && hash == state.structure_hash {
                        None
                    } else {
                        let snapshot = Arc::new(structure);
                        state.structure = Some(snapshot.clone());
                        state.structure_hash = hash;
                        Some(snapshot)
                    }
                };
                if let Some(structure) = snapshot {
                    self.emit(SupervisorEvent::StructureChanged { key, structure });
                }
            }
            WorkerMessage::StructureTime { analysed_time } => {
                resource.state.lock().await.analysed_time = Some(analysed_time);
                resource.bump();
                self.emit(SupervisorEvent::StructureTime { key, analysed_time });
            }
            WorkerMessage::Version { version } => {
                let changed = {
                    let mut state = resource.state.lock().await;
                    let changed = state.version.as_ref() != Some(&version);
                    state.version = Some(version.clone());
                    changed
                };
                if changed {
                    self.emit(SupervisorEvent::VersionChanged { key, version });
                }
            }
            WorkerMessage::Databases { databases } => {
                let changed = {
                    let mut state = resource.state.lock().await;
                    let changed = state.databases != databases;
                    state.databases = databases.clone();
                    changed
                };
                if changed {
                    self.emit(SupervisorEvent::DatabasesChanged { key, databases });
                }
            }
            WorkerMessage::Response { msgid, .. } => {
                // The client routes responses to its correlator.
                tracing::warn!(%key, %msgid, "response outside the correlator ignored");
            }
            WorkerMessage::Progress { jslid, stats } => {
                self.store_changed(&jslid).await;
                self.emit(SupervisorEvent::Progress { key, jslid, stats });
            }
            WorkerMessage::Info { info } => {
                tracing::debug!(%key, severity = ?info.severity, message = %info.message, "worker info");
                self.emit(SupervisorEvent::Info { key, info });
            }
            WorkerMessage::Done { jslid } => {
                self.store_changed(&jslid).await;
                self.emit(SupervisorEvent::Done { key, jslid });
            }
            WorkerMessage::Ping => {
                resource.state.lock().await.last_pong = Instant::now();
            }
            WorkerMessage::TunnelRequest { msgid, key: tunnel } => {
                let inner = Arc::clone(self);
                let resource = Arc::clone(resource);
                tokio::spawn(async move {
                    let response = match inner.tunnels.get_or_create(&tunnel).await {
                        Ok(info) => ControlMessage::TunnelResponse {
                            msgid,
                            result: Some(info),
                            error_message: None,
                        },
                        Err(e) => {
                            tracing::warn!(key = %resource.key(), target = %tunnel.target(), error = %e, "tunnel request failed");
                            ControlMessage::TunnelResponse {
                                msgid,
                                result: None,
                                error_message: Some(e.to_string()),
                            }
                        }
                    };
                    if let Err(e) = resource.client().send(&response).await {
                        tracing::debug!(key = %resource.key(), error = %e, "tunnel response not delivered");
                    }
                });
            }
        }
    }

    async fn store_changed(&self, jslid: &str) {
        if let Err(e) = self.datastores.notify_changed(jslid).await {
            tracing::warn!(%jslid, error = %e, "invalid stream store in worker message");
        }
    }

    async fn on_exit(&self, resource: &Arc<OpenedResource>, exit: Option<ExitStatus>) {
        let key = resource.key().clone();

        if !resource.mark_disconnected() {
            tracing::debug!(%key, ?exit, "worker exited");
            resource.bump();
            return;
        }

        {
            let mut resources = self.resources.lock().await;
            if resources
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, resource))
            {
                resources.remove(&key);
            }
        }

        let (status, changed) = {
            let mut state = resource.state.lock().await;
            let reason = state.exit_reason.take();
            let changed = match reason {
                Some(reason) => {
                    state.status = Status::error(reason);
                    true
                }
                // Keep the more precise error a worker reported before exiting.
                None if state.status.is_error() => false,
                None => {
                    state.status = Status::error(match exit {
                        Some(exit) => format!("{WORKER_EXITED} ({exit})"),
                        None => WORKER_EXITED.to_string(),
                    });
                    true
                }
            };
            (state.status.clone(), changed)
        };

        tracing::error!(
            %key,
            pid = resource.pid(),
            ?exit,
            message = status.message.as_deref().unwrap_or_default(),
            "worker exited unexpectedly"
        );

        let closed = resource.archive().await;
        self.closed.lock().await.insert(key.clone(), closed);
        resource.bump();

        if changed {
            self.emit(SupervisorEvent::StatusChanged {
                key: key.clone(),
                status: status.clone(),
            });
        }
        self.emit(SupervisorEvent::Closed { key, status });
    }
}

/// Drains one worker's events until it exits.
async fn pump(
    inner: Weak<Inner>,
    resource: Arc<OpenedResource>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            WorkerEvent::Message(message) => inner.on_message(&resource, message).await,
            WorkerEvent::Exited { status } => {
                inner.on_exit(&resource, status).await;
                break;
            }
        }
    }
}
