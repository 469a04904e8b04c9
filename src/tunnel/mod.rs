//! SSH tunnels shared by all workers.
//!
//! Workers never open tunnels themselves. A worker that needs one sends a
//! `getsshtunnel-request` to the supervisor, which asks its [`TunnelManager`]
//! and answers with a `getsshtunnel-response` carrying the local endpoint.
//! The manager keeps at most one tunnel per [`TunnelKey`].

mod forwarder;

pub use forwarder::{OpenSshForwarder, OpenTunnel, TunnelForwarder};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::supervisor::KeyedMutex;

pub type TunnelResult<T> = Result<T, TunnelError>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to start ssh: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ssh exited before the tunnel was ready: {0}")]
    Exited(String),

    #[error("tunnel to {target} not ready after {secs}s")]
    Timeout { target: String, secs: u64 },

    #[error("no free local port: {0}")]
    NoLocalPort(#[source] std::io::Error),
}

/// Identity of a tunnel. Two connections with equal keys share one tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelKey {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_login: String,
    /// Key file path or password; part of the identity only.
    pub credential: String,
    pub target_host: String,
    pub target_port: u16,
}

impl TunnelKey {
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// Local end of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub local_host: String,
    pub local_port: u16,
}

/// Tunnel cache with single-flight creation per key.
pub struct TunnelManager {
    forwarder: Arc<dyn TunnelForwarder>,
    tunnels: Mutex<HashMap<TunnelKey, OpenTunnel>>,
    creating: KeyedMutex<TunnelKey>,
}

impl TunnelManager {
    pub fn new(forwarder: Arc<dyn TunnelForwarder>) -> Self {
        Self {
            forwarder,
            tunnels: Mutex::new(HashMap::new()),
            creating: KeyedMutex::new(),
        }
    }

    /// Tunnels opened with the system `ssh` client.
    pub fn open_ssh() -> Self {
        Self::new(Arc::new(OpenSshForwarder::default()))
    }

    /// The existing tunnel for `key`, or a new one.
    pub async fn get_or_create(&self, key: &TunnelKey) -> TunnelResult<TunnelInfo> {
        let _creating = self.creating.lock(key.clone()).await;

        {
            let mut tunnels = self.tunnels.lock().await;
            if let Some(tunnel) = tunnels.get_mut(key) {
                if tunnel.is_alive() {
                    return Ok(tunnel.info.clone());
                }
                tracing::warn!(target = %key.target(), "cached ssh tunnel died, reopening");
                tunnels.remove(key);
            }
        }

        let tunnel = self.forwarder.open(key).await?;
        let info = tunnel.info.clone();
        tracing::info!(
            ssh_host = %key.ssh_host,
            target = %key.target(),
            local_port = info.local_port,
            "ssh tunnel opened"
        );
        self.tunnels.lock().await.insert(key.clone(), tunnel);
        Ok(info)
    }

    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every tunnel (their processes are killed on drop).
    pub async fn close_all(&self) {
        self.tunnels.lock().await.clear();
    }
}
