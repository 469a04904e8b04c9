//! Worker processes and the protocol spoken with them.
//!
//! Every live database connection runs in its own `conduit-worker` process.
//! Supervisor and worker exchange NDJSON messages over the worker's
//! stdin/stdout; stderr is left to the worker's logs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── supervisor ────────────────────────────┐
//! │  WorkerClient                                                      │
//! │   - owns the child process (WorkerCommand::spawn)                  │
//! │   - stdin writer: ControlMessage lines                             │
//! │   - reader task: `response` -> Correlator, the rest -> WorkerEvent │
//! └────────────────────────────────────────────────────────────────────┘
//!            stdin (ControlMessage) │ ▲ stdout (WorkerMessage)
//!                                   ▼ │
//! ┌──────────────────────────── conduit-worker ────────────────────────┐
//! │  runtime::run                                                      │
//! │   - one DatabaseConnection (driver)                                │
//! │   - StructureScheduler (database workers)                          │
//! │   - TableWriter for streamed results                               │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! When the worker's stdout closes, every request still waiting on the
//! client is rejected with [`WorkerError::ConnectionClosed`]. A worker whose
//! stdin closes exits, so dropping the client never leaves orphans behind.

mod client;
mod correlator;
mod error;
mod process;
pub mod protocol;
pub mod runtime;

pub use client::{WorkerClient, WorkerEvent, WORKER_EXITED};
pub use correlator::Correlator;
pub use error::{WorkerError, WorkerResult};
pub use process::{SpawnedWorker, WorkerCommand};
