use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::key::ResourceKey;
use crate::datastore::StreamStats;
use crate::structure::StructureSnapshot;
use crate::worker::protocol::{DatabaseInfo, InfoMessage, ServerVersion, Status};

/// Change notifications published by the supervisor.
///
/// State changes are only published when the new value differs from the
/// last known one.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StatusChanged {
        key: ResourceKey,
        status: Status,
    },
    StructureChanged {
        key: ResourceKey,
        structure: Arc<StructureSnapshot>,
    },
    /// A structure refresh completed, changed or not.
    StructureTime {
        key: ResourceKey,
        analysed_time: DateTime<Utc>,
    },
    VersionChanged {
        key: ResourceKey,
        version: ServerVersion,
    },
    DatabasesChanged {
        key: ResourceKey,
        databases: Vec<DatabaseInfo>,
    },
    /// The resource left the live table, explicitly or because its worker died.
    Closed {
        key: ResourceKey,
        status: Status,
    },
    Progress {
        key: ResourceKey,
        jslid: String,
        stats: StreamStats,
    },
    Done {
        key: ResourceKey,
        jslid: String,
    },
    Info {
        key: ResourceKey,
        info: InfoMessage,
    },
}

impl SupervisorEvent {
    pub fn key(&self) -> &ResourceKey {
        match self {
            SupervisorEvent::StatusChanged { key, .. }
            | SupervisorEvent::StructureChanged { key, .. }
            | SupervisorEvent::StructureTime { key, .. }
            | SupervisorEvent::VersionChanged { key, .. }
            | SupervisorEvent::DatabasesChanged { key, .. }
            | SupervisorEvent::Closed { key, .. }
            | SupervisorEvent::Progress { key, .. }
            | SupervisorEvent::Done { key, .. }
            | SupervisorEvent::Info { key, .. } => key,
        }
    }
}
