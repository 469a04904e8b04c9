use std::fmt;

use serde::{Deserialize, Serialize};

use crate::worker::protocol::ResourceKind;

/// Identity of a supervised resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceKey {
    /// A connection to one database of a configured connection.
    Database {
        conid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        database: Option<String>,
    },
    /// A server-level connection (database list, server version).
    Server { conid: String },
    /// An interactive query session.
    Session { sesid: String },
}

impl ResourceKey {
    pub fn database(conid: impl Into<String>, database: Option<&str>) -> Self {
        ResourceKey::Database {
            conid: conid.into(),
            database: database.map(str::to_string),
        }
    }

    pub fn server(conid: impl Into<String>) -> Self {
        ResourceKey::Server {
            conid: conid.into(),
        }
    }

    pub fn session(sesid: impl Into<String>) -> Self {
        ResourceKey::Session {
            sesid: sesid.into(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceKey::Database { .. } => ResourceKind::Database,
            ResourceKey::Server { .. } => ResourceKind::Server,
            ResourceKey::Session { .. } => ResourceKind::Session,
        }
    }

    /// Connection id, for database and server resources.
    pub fn conid(&self) -> Option<&str> {
        match self {
            ResourceKey::Database { conid, .. } | ResourceKey::Server { conid } => Some(conid),
            ResourceKey::Session { .. } => None,
        }
    }

    pub fn database_name(&self) -> Option<&str> {
        match self {
            ResourceKey::Database { database, .. } => database.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Database {
                conid,
                database: Some(database),
            } => write!(f, "database:{conid}/{database}"),
            ResourceKey::Database {
                conid,
                database: None,
            } => write!(f, "database:{conid}"),
            ResourceKey::Server { conid } => write!(f, "server:{conid}"),
            ResourceKey::Session { sesid } => write!(f, "session:{sesid}"),
        }
    }
}
