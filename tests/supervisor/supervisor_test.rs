// tests/supervisor/supervisor_test.rs
//
// Supervisor behaviour with stand-in workers: `sh` scripts that speak just
// enough of the protocol for each scenario.
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit::config::{ConnectionDescriptor, PasswordMode, Settings};
use conduit::supervisor::{ResourceKey, Supervisor, SupervisorError, SupervisorEvent};
use conduit::tunnel::{OpenTunnel, TunnelForwarder, TunnelInfo, TunnelKey, TunnelResult};
use conduit::worker::protocol::{ControlMessage, Operation, StatusName};
use conduit::worker::WorkerCommand;
use tokio::sync::broadcast;

const SILENT: &str = "cat >/dev/null";

fn script_supervisor(dir: &Path, script: &'static str, spawned: Arc<AtomicUsize>) -> Supervisor {
    let log = dir.join("connect.log");
    Supervisor::builder(Settings::default())
        .data_dir(dir)
        .launcher(move |_| {
            spawned.fetch_add(1, Ordering::SeqCst);
            WorkerCommand::new("sh")
                .args(["-c", script])
                .env("CONNECT_LOG", log.display().to_string())
        })
        .build()
        .unwrap()
}

fn descriptor(conid: &str) -> ConnectionDescriptor {
    ConnectionDescriptor::sqlite(conid, "./unused.db")
}

async fn wait_closed(events: &mut broadcast::Receiver<SupervisorEvent>, key: &ResourceKey) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(SupervisorEvent::Closed { key: closed, .. }) if &closed == key => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_killed_worker_rejects_all_pending_requests() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = script_supervisor(dir.path(), SILENT, Arc::default());
    let mut events = supervisor.subscribe();
    let key = ResourceKey::database("db1", None);

    let resource = supervisor.ensure_open(&key, &descriptor("db1")).await.unwrap();

    let requests: Vec<_> = (0..3)
        .map(|i| {
            let supervisor = supervisor.clone();
            let key = key.clone();
            tokio::spawn(async move {
                supervisor
                    .send_request(
                        &key,
                        Operation::Query {
                            sql: format!("select {i}"),
                            limit: None,
                        },
                    )
                    .await
            })
        })
        .collect();

    while resource.client().pending_requests().await < 3 {
        tokio::task::yield_now().await;
    }
    resource.client().kill().await.unwrap();

    for request in requests {
        let err = request.await.unwrap().unwrap_err();
        assert!(err.is_transport_failure(), "unexpected error: {err}");
    }

    wait_closed(&mut events, &key).await;
    let status = supervisor.get_status(&key).await.unwrap();
    assert_eq!(status.name, StatusName::Error);
    assert!(supervisor.resource(&key).await.is_none());
    assert_eq!(supervisor.live_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_ensure_open_spawns_one_worker() {
    let dir = tempfile::tempdir().unwrap();
    let spawned = Arc::new(AtomicUsize::new(0));
    let supervisor = script_supervisor(dir.path(), SILENT, spawned.clone());
    let key = ResourceKey::server("server1");

    let opens: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = supervisor.clone();
            let key = key.clone();
            tokio::spawn(async move { supervisor.ensure_open(&key, &descriptor("server1")).await })
        })
        .collect();

    let mut pids = Vec::new();
    for open in opens {
        pids.push(open.await.unwrap().unwrap().pid());
    }
    pids.dedup();

    assert_eq!(spawned.load(Ordering::SeqCst), 1);
    assert_eq!(pids.len(), 1);
    assert_eq!(supervisor.live_count().await, 1);

    supervisor.close(&key, true).await.unwrap();
}

#[tokio::test]
async fn test_reopen_gets_new_worker_with_previous_structure() {
    // Logs its connect line, reports a structure, then idles.
    const SCRIPT: &str = r#"read -r line
printf '%s\n' "$line" >> "$CONNECT_LOG"
echo '{"kind":"structure","structure":{"engine":"sqlite","schema_version":3,"tables":[{"pure_name":"users","columns":[]}]}}'
echo '{"kind":"structureTime","analysed_time":"2026-01-01T00:00:00Z"}'
echo '{"kind":"status","status":{"name":"ok"}}'
cat >/dev/null"#;

    let dir = tempfile::tempdir().unwrap();
    let spawned = Arc::new(AtomicUsize::new(0));
    let supervisor = script_supervisor(dir.path(), SCRIPT, spawned.clone());
    let key = ResourceKey::database("c1", Some("main"));

    let first = supervisor.ensure_open(&key, &descriptor("c1")).await.unwrap();
    let structure = supervisor.wait_for_structure(&key).await.unwrap().unwrap();
    assert!(structure.table("users").is_some());

    supervisor.close(&key, true).await.unwrap();
    assert!(supervisor.get_structure(&key).await.is_some());

    let second = supervisor.ensure_open(&key, &descriptor("c1")).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(first.pid(), second.pid());
    assert_eq!(spawned.load(Ordering::SeqCst), 2);
    supervisor.wait_for_structure(&key).await.unwrap();
    supervisor.close(&key, true).await.unwrap();

    let log = std::fs::read_to_string(dir.path().join("connect.log")).unwrap();
    let connects: Vec<ControlMessage> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(connects.len(), 2);
    match (&connects[0], &connects[1]) {
        (
            ControlMessage::Connect {
                connection,
                structure: None,
                ..
            },
            ControlMessage::Connect {
                structure: Some(previous),
                ..
            },
        ) => {
            assert_eq!(connection.database.as_deref(), Some("main"));
            assert_eq!(previous.schema_version, Some(3));
        }
        other => panic!("unexpected connect messages: {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_credentials_spawns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let spawned = Arc::new(AtomicUsize::new(0));
    let supervisor = script_supervisor(dir.path(), SILENT, spawned.clone());

    let mut conn = descriptor("secure");
    conn.password_mode = PasswordMode::AskPassword;

    let err = supervisor
        .ensure_open(&ResourceKey::server("secure"), &conn)
        .await
        .unwrap_err();
    match err {
        SupervisorError::MissingCredentials { conid, mode } => {
            assert_eq!(conid, "secure");
            assert_eq!(mode, PasswordMode::AskPassword);
        }
        other => panic!("expected MissingCredentials, got {other}"),
    }
    assert_eq!(spawned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connect_error_surfaces_as_connection_failed() {
    const SCRIPT: &str = r#"read -r line
echo '{"kind":"status","status":{"name":"error","message":"unable to open database file"}}'"#;

    let dir = tempfile::tempdir().unwrap();
    let supervisor = script_supervisor(dir.path(), SCRIPT, Arc::default());
    let mut events = supervisor.subscribe();
    let key = ResourceKey::database("broken", None);

    supervisor.ensure_open(&key, &descriptor("broken")).await.unwrap();
    match supervisor.wait_connected(&key).await {
        Err(SupervisorError::ConnectionFailed { message, .. }) => {
            assert_eq!(message, "unable to open database file")
        }
        // The worker may already be gone by the time we look.
        Err(SupervisorError::NotOpen(_)) => {}
        other => panic!("expected connection failure, got {other:?}"),
    }

    wait_closed(&mut events, &key).await;
    let status = supervisor.get_status(&key).await.unwrap();
    assert_eq!(status.message.as_deref(), Some("unable to open database file"));
}

struct FixedForwarder {
    opened: AtomicUsize,
}

#[async_trait]
impl TunnelForwarder for FixedForwarder {
    async fn open(&self, _key: &TunnelKey) -> TunnelResult<OpenTunnel> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(OpenTunnel::new(TunnelInfo {
            local_host: "127.0.0.1".to_string(),
            local_port: 40_000,
        }))
    }
}

#[tokio::test]
async fn test_worker_tunnel_requests_are_answered_by_supervisor() {
    // Asks for a tunnel, logs the answer, then idles.
    const SCRIPT: &str = r#"read -r line
echo '{"kind":"getsshtunnel-request","msgid":"t1","key":{"ssh_host":"bastion","ssh_port":22,"ssh_login":"ops","credential":"id","target_host":"db","target_port":5432}}'
read -r answer
printf '%s\n' "$answer" >> "$CONNECT_LOG"
cat >/dev/null"#;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("connect.log");
    let forwarder = Arc::new(FixedForwarder {
        opened: AtomicUsize::new(0),
    });
    let supervisor = Supervisor::builder(Settings::default())
        .data_dir(dir.path())
        .forwarder(forwarder.clone())
        .launcher({
            let log = log.clone();
            move |_| {
                WorkerCommand::new("sh")
                    .args(["-c", SCRIPT])
                    .env("CONNECT_LOG", log.display().to_string())
            }
        })
        .build()
        .unwrap();

    let first = ResourceKey::database("pg", Some("a"));
    let second = ResourceKey::database("pg", Some("b"));
    supervisor.ensure_open(&first, &descriptor("pg")).await.unwrap();
    supervisor.ensure_open(&second, &descriptor("pg")).await.unwrap();

    let answers = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let content = std::fs::read_to_string(&log).unwrap_or_default();
            if content.lines().count() == 2 && content.ends_with('\n') {
                return content;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    for line in answers.lines() {
        match serde_json::from_str::<ControlMessage>(line).unwrap() {
            ControlMessage::TunnelResponse {
                msgid,
                result: Some(info),
                error_message: None,
            } => {
                assert_eq!(msgid, "t1");
                assert_eq!(info.local_port, 40_000);
            }
            other => panic!("unexpected answer: {other:?}"),
        }
    }
    assert_eq!(forwarder.opened.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.tunnels().len().await, 1);

    supervisor.close(&first, true).await.unwrap();
    supervisor.close(&second, true).await.unwrap();
}

#[tokio::test]
async fn test_unresponsive_worker_is_killed_by_keepalive() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.worker.server_ping_timeout_secs = 1;
    let supervisor = Supervisor::builder(settings)
        .data_dir(dir.path())
        .launcher(|_| WorkerCommand::new("sh").args(["-c", SILENT]))
        .build()
        .unwrap();
    let mut events = supervisor.subscribe();
    let key = ResourceKey::server("quiet");

    supervisor.ensure_open(&key, &descriptor("quiet")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    supervisor.ping_all().await;

    wait_closed(&mut events, &key).await;
    let status = supervisor.get_status(&key).await.unwrap();
    assert!(status.is_error());
    assert!(status.message.unwrap().contains("no ping answer"));
}
