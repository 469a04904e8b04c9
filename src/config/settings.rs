//! TOML-based configuration for conduit.
//!
//! Supports a config file (conduit.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! data_dir = "~/.conduit"
//!
//! [worker]
//! ping_interval_secs = 30
//! session_ping_timeout_secs = 60
//!
//! [supervisor]
//! closed_cache_capacity = 64
//!
//! [structure]
//! auto_refresh = true
//! auto_refresh_interval_secs = 60
//!
//! [datastore]
//! stats_batch_rows = 100
//!
//! [connections.local]
//! engine = "sqlite"
//! file = "${HOME}/data/app.db"
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::connection::ConnectionDescriptor;
use crate::worker::protocol::ResourceKind;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Failed to determine data directory")]
    NoDataDir,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding stream files (`<data_dir>/jsldata`).
    pub data_dir: Option<String>,

    /// Named database connections.
    pub connections: HashMap<String, ConnectionDescriptor>,

    pub worker: WorkerSettings,

    pub supervisor: SupervisorSettings,

    pub structure: StructureSettings,

    pub datastore: DatastoreSettings,

    pub logging: LoggingSettings,
}

/// Worker process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Path to the worker binary.
    pub path: Option<String>,

    /// Interval between supervisor pings.
    pub ping_interval_secs: u64,

    /// Self-termination window of database workers.
    pub database_ping_timeout_secs: u64,

    /// Self-termination window of server workers.
    pub server_ping_timeout_secs: u64,

    /// Self-termination window of session workers.
    pub session_ping_timeout_secs: u64,

    /// Arguments passed through to every worker verbatim.
    pub extra_args: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            path: None,
            ping_interval_secs: 30,
            database_ping_timeout_secs: 120,
            server_ping_timeout_secs: 120,
            session_ping_timeout_secs: 60,
            extra_args: Vec::new(),
        }
    }
}

impl WorkerSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    /// Window after which a worker of `kind` without pings terminates itself.
    pub fn ping_timeout(&self, kind: ResourceKind) -> Duration {
        let secs = match kind {
            ResourceKind::Database => self.database_ping_timeout_secs,
            ResourceKind::Server => self.server_ping_timeout_secs,
            ResourceKind::Session => self.session_ping_timeout_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    /// Convert to worker command-line arguments.
    ///
    /// `extra_args` follow a `--` so the worker passes them through untouched.
    pub fn to_worker_args(
        &self,
        kind: ResourceKind,
        data_dir: &Path,
        log_level: &str,
        datastore: &DatastoreSettings,
    ) -> Vec<String> {
        let mut args = vec![
            format!("--kind={}", kind.as_str()),
            format!("--ping-timeout-secs={}", self.ping_timeout(kind).as_secs()),
            format!("--data-dir={}", data_dir.display()),
            format!("--log-level={}", log_level),
            format!("--stats-batch-rows={}", datastore.stats_batch_rows),
            format!("--stats-flush-interval-ms={}", datastore.stats_flush_interval_ms),
        ];
        if !self.extra_args.is_empty() {
            args.push("--".to_string());
            args.extend(self.extra_args.iter().cloned());
        }
        args
    }
}

/// Supervisor bookkeeping configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Maximum number of closed resources remembered for reopen.
    pub closed_cache_capacity: usize,

    /// Request timeout in seconds, `0` waits until response or transport failure.
    pub request_timeout_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            closed_cache_capacity: 64,
            request_timeout_secs: 0,
        }
    }
}

impl SupervisorSettings {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// Structure analysis configuration, forwarded to database workers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StructureSettings {
    pub auto_refresh: bool,
    pub auto_refresh_interval_secs: u64,
}

impl Default for StructureSettings {
    fn default() -> Self {
        Self {
            auto_refresh: false,
            auto_refresh_interval_secs: 60,
        }
    }
}

impl StructureSettings {
    /// Auto-refresh interval, `None` when auto-refresh is disabled.
    pub fn auto_refresh_interval(&self) -> Option<Duration> {
        (self.auto_refresh && self.auto_refresh_interval_secs > 0)
            .then(|| Duration::from_secs(self.auto_refresh_interval_secs))
    }
}

/// Stream file writer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatastoreSettings {
    /// Rows appended between two side-car rewrites.
    pub stats_batch_rows: u64,

    /// Maximum delay before pending rows are reflected in the side-car.
    pub stats_flush_interval_ms: u64,
}

impl Default for DatastoreSettings {
    fn default() -> Self {
        Self {
            stats_batch_rows: 100,
            stats_flush_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `CONDUIT_CONFIG`
    /// 2. `./conduit.toml`
    /// 3. `~/.config/conduit/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("CONDUIT_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("conduit.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("conduit").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Get a connection by name, with its id filled in and env vars expanded.
    pub fn get_connection(&self, name: &str) -> Result<ConnectionDescriptor, SettingsError> {
        let mut conn = self
            .connections
            .get(name)
            .ok_or_else(|| SettingsError::ConnectionNotFound(name.to_string()))?
            .resolve_env()?;
        conn.id = name.to_string();
        Ok(conn)
    }

    /// Resolved data directory, defaulting to `~/.conduit`.
    pub fn data_dir(&self) -> Result<PathBuf, SettingsError> {
        match &self.data_dir {
            Some(dir) => {
                let expanded = expand_env_vars(dir)?;
                match expanded.strip_prefix("~/") {
                    Some(rest) => Ok(dirs::home_dir().ok_or(SettingsError::NoDataDir)?.join(rest)),
                    None => Ok(PathBuf::from(expanded)),
                }
            }
            None => Ok(dirs::home_dir()
                .ok_or(SettingsError::NoDataDir)?
                .join(".conduit")),
        }
    }

    /// Get the worker binary path.
    ///
    /// Uses the configured path, then a `conduit-worker` next to the current
    /// executable, then `PATH`.
    pub fn worker_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.worker.path {
            let expanded = expand_env_vars(path).ok()?;
            return Some(PathBuf::from(expanded));
        }

        if let Ok(exe) = env::current_exe() {
            if let Some(dir) = exe.parent() {
                let sibling = dir.join("conduit-worker");
                if sibling.exists() {
                    return Some(sibling);
                }
            }
        }

        if let Ok(output) = std::process::Command::new("which")
            .arg("conduit-worker")
            .output()
        {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(PathBuf::from(path));
                }
            }
        }

        None
    }
}

/// `$VAR` or `${VAR}` reference.
const ENV_VAR_PATTERN: &str = r"\$(?:\{([^}]*)\}|([A-Za-z0-9_]+))";

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax. A `$` not followed by a name is kept.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let pattern = Regex::new(ENV_VAR_PATTERN)?;
    let mut result = String::with_capacity(s.len());
    let mut last = 0;

    for caps in pattern.captures_iter(s) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1).or_else(|| caps.get(2))) else {
            continue;
        };
        let value = env::var(name.as_str())
            .map_err(|_| SettingsError::MissingEnvVar(name.as_str().to_string()))?;
        result.push_str(&s[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }
    result.push_str(&s[last..]);

    Ok(result)
}
