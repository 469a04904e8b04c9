//! Configuration module for conduit.
//!
//! Handles settings files, environment variables and connection descriptors.

mod connection;
mod settings;

pub use connection::{
    ConnectionDescriptor, ConnectionError, Engine, PasswordMode, SshSettings, ENCRYPTED_PREFIX,
};
pub use settings::{
    expand_env_vars, DatastoreSettings, LoggingSettings, Settings, SettingsError,
    StructureSettings, SupervisorSettings, WorkerSettings,
};
