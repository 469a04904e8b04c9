//! Connection descriptors.
//!
//! A [`ConnectionDescriptor`] is what the supervisor sends to a worker in the
//! `connect` message. It is stored in `conduit.toml` under
//! `[connections.<id>]` and supports `${ENV_VAR}` expansion on its string
//! fields.

use serde::{Deserialize, Serialize};

use super::settings::{expand_env_vars, SettingsError};
use crate::crypto::{self, CryptoError, MasterKey};
use crate::tunnel::TunnelKey;

/// Prefix marking a password stored encrypted with the master key.
pub const ENCRYPTED_PREFIX: &str = "crypt:";

/// Error type for connection configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Unsupported engine: {0}. Supported: sqlite, postgres, mysql, mssql")]
    UnsupportedEngine(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to decrypt password for connection {conid}: {source}")]
    Decrypt {
        conid: String,
        #[source]
        source: CryptoError,
    },
}

/// Database engines known to the supervisor.
///
/// Only [`Engine::Sqlite`] has a driver built into `conduit-worker`; the others
/// are recognised so that tunnel targets get the right default port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Sqlite,
    Postgres,
    MySql,
    MsSql,
}

impl Engine {
    /// Parse engine from string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConnectionError> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Engine::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(Engine::Postgres),
            "mysql" | "mariadb" => Ok(Engine::MySql),
            "mssql" | "sqlserver" | "sql_server" => Ok(Engine::MsSql),
            other => Err(ConnectionError::UnsupportedEngine(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Sqlite => "sqlite",
            Engine::Postgres => "postgres",
            Engine::MySql => "mysql",
            Engine::MsSql => "mssql",
        }
    }

    /// Default server port, `0` for file-based engines.
    pub fn default_port(&self) -> u16 {
        match self {
            Engine::Sqlite => 0,
            Engine::Postgres => 5432,
            Engine::MySql => 3306,
            Engine::MsSql => 1433,
        }
    }
}

/// How the password of a connection is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordMode {
    /// Password (if any) is stored with the connection.
    #[default]
    Saved,
    /// Password must be typed in by the user before connecting.
    AskPassword,
    /// User name and password must be typed in before connecting.
    AskUser,
}

/// SSH tunnel settings of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSettings {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub login: String,
    /// Private key file used for authentication.
    #[serde(default)]
    pub key_file: Option<String>,
    /// Password authentication; only honoured when the forwarder supports it.
    #[serde(default)]
    pub password: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Connection descriptor passed to a worker in the `connect` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Connection id (`conid`). Filled from the config key when loaded from TOML.
    #[serde(default)]
    pub id: String,
    /// Engine name (sqlite, postgres, ...).
    pub engine: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_mode: PasswordMode,
    /// Default database; overridden per database-scoped resource.
    #[serde(default)]
    pub database: Option<String>,
    /// Database file for file-based engines.
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub ssh: Option<SshSettings>,
}

impl ConnectionDescriptor {
    /// Descriptor for a SQLite database file.
    pub fn sqlite(id: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            engine: Engine::Sqlite.as_str().to_string(),
            file: Some(file.into()),
            ..Default::default()
        }
    }

    pub fn engine_type(&self) -> Result<Engine, ConnectionError> {
        Engine::from_str(&self.engine)
    }

    /// Whether credentials have to be supplied interactively before a worker
    /// may be spawned for this connection.
    pub fn requires_interactive_credentials(&self) -> bool {
        match self.password_mode {
            PasswordMode::Saved => false,
            PasswordMode::AskPassword => self.password.is_none(),
            PasswordMode::AskUser => self.user.is_none() || self.password.is_none(),
        }
    }

    /// Copy of this descriptor scoped to one database.
    pub fn with_database(&self, database: Option<&str>) -> Self {
        let mut scoped = self.clone();
        if let Some(database) = database {
            scoped.database = Some(database.to_string());
        }
        scoped
    }

    /// Expand environment variables in every string field.
    pub fn resolve_env(&self) -> Result<Self, SettingsError> {
        let expand = |value: &Option<String>| -> Result<Option<String>, SettingsError> {
            value.as_deref().map(expand_env_vars).transpose()
        };

        let mut resolved = self.clone();
        resolved.server = expand(&self.server)?;
        resolved.user = expand(&self.user)?;
        resolved.password = expand(&self.password)?;
        resolved.database = expand(&self.database)?;
        resolved.file = expand(&self.file)?;
        if let Some(ssh) = &self.ssh {
            resolved.ssh = Some(SshSettings {
                host: expand_env_vars(&ssh.host)?,
                port: ssh.port,
                login: expand_env_vars(&ssh.login)?,
                key_file: expand(&ssh.key_file)?,
                password: expand(&ssh.password)?,
            });
        }
        Ok(resolved)
    }

    /// Replace `crypt:` passwords by their plaintext.
    pub fn decrypt_passwords(&self, key: &MasterKey) -> Result<Self, ConnectionError> {
        let decrypt = |value: &Option<String>| -> Result<Option<String>, ConnectionError> {
            match value.as_deref() {
                Some(stored) => match stored.strip_prefix(ENCRYPTED_PREFIX) {
                    Some(ciphertext) => {
                        let plain = crypto::decrypt(key.key(), ciphertext).map_err(|source| {
                            ConnectionError::Decrypt {
                                conid: self.id.clone(),
                                source,
                            }
                        })?;
                        Ok(Some(String::from_utf8_lossy(&plain).into_owned()))
                    }
                    None => Ok(Some(stored.to_string())),
                },
                None => Ok(None),
            }
        };

        let mut decrypted = self.clone();
        decrypted.password = decrypt(&self.password)?;
        if let Some(ssh) = &self.ssh {
            let mut ssh = ssh.clone();
            ssh.password = decrypt(&ssh.password)?;
            decrypted.ssh = Some(ssh);
        }
        Ok(decrypted)
    }

    /// Key of the SSH tunnel this connection needs, if any.
    pub fn tunnel_key(&self) -> Result<Option<TunnelKey>, ConnectionError> {
        let Some(ssh) = &self.ssh else {
            return Ok(None);
        };
        let engine = self.engine_type()?;
        let target_host = self
            .server
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        let target_port = self.port.unwrap_or_else(|| engine.default_port());
        if target_port == 0 {
            return Err(ConnectionError::InvalidConfig(format!(
                "engine {} cannot be reached through an SSH tunnel",
                engine.as_str()
            )));
        }

        Ok(Some(TunnelKey {
            ssh_host: ssh.host.clone(),
            ssh_port: ssh.port,
            ssh_login: ssh.login.clone(),
            credential: ssh
                .key_file
                .clone()
                .or_else(|| ssh.password.clone())
                .unwrap_or_default(),
            target_host,
            target_port,
        }))
    }
}
