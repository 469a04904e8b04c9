//! Worker process supervision.
//!
//! A [`Supervisor`] owns one worker process per [`ResourceKey`] and keeps the
//! last state each worker reported. Resources move through
//!
//! ```text
//! absent ──ensure_open──▶ pending ──connect──▶ ok | error ──close / exit──▶ closed
//! ```
//!
//! Closed resources leave their final status and structure in a bounded
//! cache, so a reopened database worker starts from an incremental refresh.
//! A worker that exits without having been closed is an unexpected failure:
//! its resource is closed with `status=error` and observers are notified
//! through [`Supervisor::subscribe`].

mod control;
mod events;
mod key;
mod keyed_mutex;
mod resource;

pub use control::{Launcher, Supervisor, SupervisorBuilder};
pub use events::SupervisorEvent;
pub use key::ResourceKey;
pub use keyed_mutex::{KeyedGuard, KeyedMutex};
pub use resource::{ClosedResource, OpenedResource};

use thiserror::Error;

use crate::config::{ConnectionError, PasswordMode, SettingsError};
use crate::datastore::DatastoreError;
use crate::worker::WorkerError;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Raised before any worker is spawned; callers should prompt, not retry.
    #[error("connection {conid} needs interactive credentials ({mode:?})")]
    MissingCredentials { conid: String, mode: PasswordMode },

    #[error("connection failed for {key}: {message}")]
    ConnectionFailed { key: ResourceKey, message: String },

    #[error("no open resource for {0}")]
    NotOpen(ResourceKey),

    #[error("conduit-worker binary not found; set worker.path")]
    NoWorkerBinary,

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

impl SupervisorError {
    /// The worker went away while a request was outstanding.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Worker(e) if e.is_transport_failure())
    }
}
