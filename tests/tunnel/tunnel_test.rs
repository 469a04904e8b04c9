// tests/tunnel/tunnel_test.rs
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit::tunnel::{OpenTunnel, TunnelForwarder, TunnelInfo, TunnelKey, TunnelManager, TunnelResult};

/// Hands out increasing ports; `short_lived` tunnels are backed by a process
/// that exits at once.
struct CountingForwarder {
    opened: AtomicUsize,
    next_port: AtomicU16,
    short_lived: bool,
}

impl CountingForwarder {
    fn new(short_lived: bool) -> Self {
        Self {
            opened: AtomicUsize::new(0),
            next_port: AtomicU16::new(41_000),
            short_lived,
        }
    }
}

#[async_trait]
impl TunnelForwarder for CountingForwarder {
    async fn open(&self, _key: &TunnelKey) -> TunnelResult<OpenTunnel> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        // Slow enough for concurrent callers to pile up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = TunnelInfo {
            local_host: "127.0.0.1".to_string(),
            local_port: self.next_port.fetch_add(1, Ordering::SeqCst),
        };
        if self.short_lived {
            let child = tokio::process::Command::new("sh")
                .args(["-c", "exit 0"])
                .spawn()
                .unwrap();
            Ok(OpenTunnel::with_process(info, child))
        } else {
            Ok(OpenTunnel::new(info))
        }
    }
}

fn key(target_port: u16) -> TunnelKey {
    TunnelKey {
        ssh_host: "bastion.internal".to_string(),
        ssh_port: 22,
        ssh_login: "ops".to_string(),
        credential: "~/.ssh/id_ed25519".to_string(),
        target_host: "db.internal".to_string(),
        target_port,
    }
}

#[tokio::test]
async fn test_identical_requests_share_one_tunnel() {
    let forwarder = Arc::new(CountingForwarder::new(false));
    let manager = Arc::new(TunnelManager::new(forwarder.clone()));

    let first = manager.get_or_create(&key(5432)).await.unwrap();
    let second = manager.get_or_create(&key(5432)).await.unwrap();

    assert_eq!(first.local_port, second.local_port);
    assert_eq!(forwarder.opened.load(Ordering::SeqCst), 1);
    assert_eq!(manager.len().await, 1);
}

#[tokio::test]
async fn test_concurrent_requests_open_once() {
    let forwarder = Arc::new(CountingForwarder::new(false));
    let manager = Arc::new(TunnelManager::new(forwarder.clone()));

    let requests: Vec<_> = (0..6)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_or_create(&key(5432)).await })
        })
        .collect();

    let mut ports = Vec::new();
    for request in requests {
        ports.push(request.await.unwrap().unwrap().local_port);
    }
    ports.dedup();

    assert_eq!(ports.len(), 1);
    assert_eq!(forwarder.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_different_targets_get_different_tunnels() {
    let forwarder = Arc::new(CountingForwarder::new(false));
    let manager = TunnelManager::new(forwarder.clone());

    let pg = manager.get_or_create(&key(5432)).await.unwrap();
    let mysql = manager.get_or_create(&key(3306)).await.unwrap();

    assert_ne!(pg.local_port, mysql.local_port);
    assert_eq!(forwarder.opened.load(Ordering::SeqCst), 2);

    manager.close_all().await;
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn test_dead_tunnel_is_reopened() {
    let forwarder = Arc::new(CountingForwarder::new(true));
    let manager = TunnelManager::new(forwarder.clone());

    let first = manager.get_or_create(&key(5432)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = manager.get_or_create(&key(5432)).await.unwrap();

    assert_ne!(first.local_port, second.local_port);
    assert_eq!(forwarder.opened.load(Ordering::SeqCst), 2);
}
