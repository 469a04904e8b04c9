//! Tunnel creation backends.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use super::{TunnelError, TunnelInfo, TunnelKey, TunnelResult};

const LOCAL_HOST: &str = "127.0.0.1";

/// An open tunnel. Dropping it tears the tunnel down.
pub struct OpenTunnel {
    pub info: TunnelInfo,
    process: Option<Child>,
}

impl OpenTunnel {
    /// A tunnel with no process behind it (in-process or test forwarders).
    pub fn new(info: TunnelInfo) -> Self {
        Self {
            info,
            process: None,
        }
    }

    pub fn with_process(info: TunnelInfo, process: Child) -> Self {
        Self {
            info,
            process: Some(process),
        }
    }

    pub fn is_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }
}

#[async_trait]
pub trait TunnelForwarder: Send + Sync {
    async fn open(&self, key: &TunnelKey) -> TunnelResult<OpenTunnel>;
}

/// Local port forwarding through the system `ssh` binary (`ssh -N -L`).
///
/// Authenticates with the key file named by the credential when it exists,
/// otherwise with whatever the ssh agent offers. Password prompts are
/// disabled.
pub struct OpenSshForwarder {
    program: PathBuf,
    ready_timeout: Duration,
}

impl Default for OpenSshForwarder {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            ready_timeout: Duration::from_secs(15),
        }
    }
}

impl OpenSshForwarder {
    pub fn new(program: impl Into<PathBuf>, ready_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            ready_timeout,
        }
    }

    fn free_local_port() -> TunnelResult<u16> {
        let listener =
            std::net::TcpListener::bind((LOCAL_HOST, 0)).map_err(TunnelError::NoLocalPort)?;
        let port = listener
            .local_addr()
            .map_err(TunnelError::NoLocalPort)?
            .port();
        Ok(port)
    }

    fn key_file(credential: &str) -> Option<PathBuf> {
        if credential.is_empty() {
            return None;
        }
        let path = match credential.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()?.join(rest),
            None => PathBuf::from(credential),
        };
        path.is_file().then_some(path)
    }

    /// Arguments for `ssh`, without the program name.
    pub fn ssh_args(key: &TunnelKey, local_port: u16) -> Vec<String> {
        let mut args = vec![
            "-N".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-L".to_string(),
            format!(
                "{LOCAL_HOST}:{local_port}:{}:{}",
                key.target_host, key.target_port
            ),
            "-p".to_string(),
            key.ssh_port.to_string(),
        ];
        if let Some(key_file) = Self::key_file(&key.credential) {
            args.push("-i".to_string());
            args.push(key_file.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{}", key.ssh_login, key.ssh_host));
        args
    }
}

#[async_trait]
impl TunnelForwarder for OpenSshForwarder {
    async fn open(&self, key: &TunnelKey) -> TunnelResult<OpenTunnel> {
        let local_port = Self::free_local_port()?;
        let mut child = Command::new(&self.program)
            .args(Self::ssh_args(key, local_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(TunnelError::Spawn)?;

        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(TunnelError::Exited(status.to_string()));
            }
            if TcpStream::connect((LOCAL_HOST, local_port)).await.is_ok() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(TunnelError::Timeout {
                    target: key.target(),
                    secs: self.ready_timeout.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Ok(OpenTunnel::with_process(
            TunnelInfo {
                local_host: LOCAL_HOST.to_string(),
                local_port,
            },
            child,
        ))
    }
}
