//! Supervisor-side handle of one worker process.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex};

use super::correlator::Correlator;
use super::error::{WorkerError, WorkerResult};
use super::process::WorkerCommand;
use super::protocol::{decode_line, encode_line, ControlMessage, Operation, WorkerMessage};

/// How long to wait for a worker to exit after its stdout closed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

const REAP_POLL: Duration = Duration::from_millis(20);

/// Reason attached to requests rejected because the worker went away.
pub const WORKER_EXITED: &str = "worker process exited";

/// Events delivered to the owner of a [`WorkerClient`], in channel order.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Any message that is not a `response`.
    Message(WorkerMessage),
    /// The worker's stdout closed; all pending requests have been rejected.
    /// Always the last event.
    Exited { status: Option<ExitStatus> },
}

/// Async client for one worker process.
///
/// The client owns the worker's stdin (the only writer to it) and a reader
/// task draining its stdout. `response` messages are routed to the
/// [`Correlator`]; everything else is forwarded as [`WorkerEvent`]s.
pub struct WorkerClient {
    stdin: Mutex<BufWriter<ChildStdin>>,
    correlator: Arc<Correlator<serde_json::Value>>,
    child: Arc<Mutex<Child>>,
    pid: Option<u32>,
    reader_task: tokio::task::JoinHandle<()>,
    timeout: Option<Duration>,
}

impl WorkerClient {
    /// Spawn a worker and start routing its output.
    pub fn spawn(
        command: &WorkerCommand,
        timeout: Option<Duration>,
    ) -> WorkerResult<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        let spawned = command.spawn()?;
        let pid = spawned.child.id();
        let child = Arc::new(Mutex::new(spawned.child));
        let correlator = Arc::new(Correlator::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader_task =
            Self::spawn_reader_task(spawned.stdout, correlator.clone(), child.clone(), events_tx);

        tracing::debug!(pid, program = %command.program().display(), "worker spawned");

        Ok((
            Self {
                stdin: Mutex::new(BufWriter::new(spawned.stdin)),
                correlator,
                child,
                pid,
                reader_task,
                timeout,
            },
            events_rx,
        ))
    }

    /// Spawn the background task that reads messages from the worker.
    fn spawn_reader_task(
        stdout: ChildStdout,
        correlator: Arc<Correlator<serde_json::Value>>,
        child: Arc<Mutex<Child>>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) if line.trim().is_empty() => continue,
                    Ok(_) => match decode_line::<WorkerMessage>(&line) {
                        Ok(WorkerMessage::Response {
                            msgid,
                            result,
                            error_message,
                        }) => {
                            let outcome = match error_message {
                                Some(message) => Err(WorkerError::operation(message)),
                                None => Ok(result.unwrap_or(serde_json::Value::Null)),
                            };
                            if !correlator.resolve(&msgid, outcome).await {
                                tracing::warn!(%msgid, "response for unknown request ignored");
                            }
                        }
                        Ok(message) => {
                            let _ = events.send(WorkerEvent::Message(message));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "unparseable worker message ignored");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "worker read error");
                        break;
                    }
                }
            }

            let rejected = correlator.reject_all(WORKER_EXITED).await;
            if rejected > 0 {
                tracing::debug!(rejected, "pending requests rejected after worker exit");
            }

            let status = reap(&child).await;
            let _ = events.send(WorkerEvent::Exited { status });
        })
    }

    /// Send a message without awaiting any answer.
    pub async fn send(&self, message: &ControlMessage) -> WorkerResult<()> {
        let line = encode_line(message).map_err(WorkerError::SerializeFailed)?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(WorkerError::WriteFailed)?;
        stdin.flush().await.map_err(WorkerError::WriteFailed)
    }

    /// Send a typed operation and wait for its raw response payload.
    ///
    /// Fails with a transport failure if the worker exits first, or with
    /// [`WorkerError::Operation`] carrying the worker's message verbatim.
    pub async fn request_value(&self, operation: Operation) -> WorkerResult<serde_json::Value> {
        let (msgid, rx) = self.correlator.register().await?;

        let message = ControlMessage::Request {
            msgid: msgid.clone(),
            operation,
        };
        if let Err(e) = self.send(&message).await {
            self.correlator.forget(&msgid).await;
            return Err(e);
        }

        match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(result) => result?,
                Err(_) => {
                    self.correlator.forget(&msgid).await;
                    Err(WorkerError::Timeout(timeout.as_secs()))
                }
            },
            None => rx.await?,
        }
    }

    /// Send a typed operation and deserialize its response.
    pub async fn request<R: DeserializeOwned>(&self, operation: Operation) -> WorkerResult<R> {
        let value = self.request_value(operation).await?;
        serde_json::from_value(value).map_err(WorkerError::DeserializeFailed)
    }

    /// Forcefully terminate the worker process.
    pub async fn kill(&self) -> WorkerResult<()> {
        let mut child = self.child.lock().await;
        match child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(WorkerError::WriteFailed(e)),
        }
    }

    /// `false` once the worker's stdout has closed.
    pub fn is_alive(&self) -> bool {
        !self.reader_task.is_finished()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn pending_requests(&self) -> usize {
        self.correlator.pending_count().await
    }
}

/// Wait for a worker whose stdout closed, killing it after [`EXIT_GRACE`].
///
/// The child lock is only held for each `try_wait`, so [`WorkerClient::kill`]
/// never waits on the reaper.
async fn reap(child: &Mutex<Child>) -> Option<ExitStatus> {
    let deadline = tokio::time::Instant::now() + EXIT_GRACE;
    let mut killed = false;
    loop {
        {
            let mut child = child.lock().await;
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to reap worker");
                    return None;
                }
            }
            if !killed && tokio::time::Instant::now() >= deadline {
                tracing::warn!("worker did not exit after closing stdout, killing");
                let _ = child.start_kill();
                killed = true;
            }
        }
        tokio::time::sleep(REAP_POLL).await;
    }
}
