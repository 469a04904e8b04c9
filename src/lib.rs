//! # Conduit
//!
//! Out-of-process database connection supervisor with a streaming result
//! store.
//!
//! ## Architecture
//!
//! Every live connection runs in its own `conduit-worker` process so that a
//! crashing or hanging driver never takes the host down:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Supervisor (host process)              │
//! │  ensure_open / close / send_request / status / events   │
//! │  closed-resource cache, keepalive, SSH tunnel cache     │
//! └─────────────────────────────────────────────────────────┘
//!              │ ControlMessage (NDJSON, stdin)   ▲ WorkerMessage (stdout)
//!              ▼                                  │
//! ┌─────────────────────────────────────────────────────────┐
//! │             conduit-worker (one per resource)           │
//! │  driver connection, structure scheduler, table writer   │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [TableWriter]
//! ┌─────────────────────────────────────────────────────────┐
//! │        <data_dir>/jsldata/<jslid>.jsonl (+ .stats)       │
//! │      paged by JsonLinesDatastore in the host process     │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod crypto;
pub mod datastore;
pub mod driver;
pub mod structure;
pub mod supervisor;
pub mod tunnel;
pub mod worker;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::config::{ConnectionDescriptor, Settings};
    pub use crate::datastore::{Condition, DatastoreRegistry, JsonLinesDatastore, TableWriter};
    pub use crate::structure::StructureSnapshot;
    pub use crate::supervisor::{ResourceKey, Supervisor, SupervisorError, SupervisorEvent};
    pub use crate::worker::protocol::{Operation, ResourceKind, Row, Status, StatusName};
    pub use crate::worker::WorkerError;
}
