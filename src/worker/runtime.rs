//! Worker-side message loop.
//!
//! Runs inside `conduit-worker`. Reads [`ControlMessage`]s from stdin, hosts
//! one database connection and writes [`WorkerMessage`]s to stdout:
//!
//! ```text
//! connect  -> [getsshtunnel-request] -> version, status ok,
//!             databases (server) | checkStructure.. structure.. ok (database)
//! request  -> response (same msgid), progress/done for streamed results
//! ping     -> ping
//! refresh  -> structure refresh (database) | databases (server)
//! close / stdin EOF / no ping within the timeout -> exit
//! ```
//!
//! Requests run as separate tasks: a slow query does not hold back pings or
//! other requests. A failed or panicking request only fails its own
//! response, unless the driver reports the connection itself as lost, in
//! which case the worker exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use super::correlator::Correlator;
use super::error::{WorkerError, WorkerResult};
use super::protocol::{
    decode_line, encode_line, ControlMessage, InfoMessage, Operation, ResourceKind, Severity,
    Status, StreamResult, WorkerMessage,
};
use crate::config::ConnectionDescriptor;
use crate::datastore::WriterOptions;
use crate::driver::{
    connector_for, ConnectionAnalyser, DatabaseConnection, DriverError, DriverResult,
    StreamTarget,
};
use crate::structure::{StructureScheduler, StructureSnapshot};
use crate::tunnel::{TunnelInfo, TunnelKey};

/// How long buffered output may take to drain on exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub kind: ResourceKind,
    /// Exit when no `ping` arrived for this long.
    pub ping_timeout: Duration,
    /// Stream files go to `<data_dir>/jsldata`.
    pub data_dir: PathBuf,
    pub writer: WriterOptions,
}

struct Connected {
    connection: Arc<dyn DatabaseConnection>,
    scheduler: Option<Arc<StructureScheduler>>,
    auto_refresh: Option<JoinHandle<()>>,
}

impl Drop for Connected {
    fn drop(&mut self) {
        if let Some(task) = self.auto_refresh.take() {
            task.abort();
        }
    }
}

/// Shared by all handler tasks.
#[derive(Clone)]
struct Context {
    kind: ResourceKind,
    out: mpsc::UnboundedSender<WorkerMessage>,
    fatal: mpsc::UnboundedSender<String>,
    ready: watch::Receiver<Option<Arc<Connected>>>,
    target: StreamTarget,
    tunnels: Arc<Correlator<TunnelInfo>>,
}

impl Context {
    fn emit(&self, message: WorkerMessage) {
        let _ = self.out.send(message);
    }

    fn report(&self, error: &DriverError) {
        if error.is_fatal() {
            let _ = self.fatal.send(error.to_string());
        }
    }

    fn current(&self) -> Option<Arc<Connected>> {
        self.ready.borrow().clone()
    }
}

enum Flow {
    Continue,
    Exit,
}

struct Worker {
    ctx: Context,
    ready: Arc<watch::Sender<Option<Arc<Connected>>>>,
    tasks: JoinSet<()>,
    last_ping: Instant,
    connecting: bool,
}

impl Worker {
    fn handle(&mut self, message: ControlMessage) -> Flow {
        match message {
            ControlMessage::Connect {
                connection,
                structure,
                auto_refresh_secs,
            } => {
                if self.connecting {
                    tracing::warn!("duplicate connect ignored");
                } else {
                    self.connecting = true;
                    let auto_refresh = auto_refresh_secs
                        .filter(|secs| *secs > 0)
                        .map(Duration::from_secs);
                    self.tasks.spawn(connect(
                        self.ctx.clone(),
                        self.ready.clone(),
                        connection,
                        structure,
                        auto_refresh,
                    ));
                }
            }
            ControlMessage::Request { msgid, operation } => {
                self.tasks
                    .spawn(serve_request(self.ctx.clone(), msgid, operation));
            }
            ControlMessage::Ping => {
                self.last_ping = Instant::now();
                self.ctx.emit(WorkerMessage::Ping);
            }
            ControlMessage::Refresh { full } => {
                self.tasks.spawn(refresh(self.ctx.clone(), full));
            }
            ControlMessage::Close => {
                tracing::info!("close requested");
                return Flow::Exit;
            }
            ControlMessage::TunnelResponse {
                msgid,
                result,
                error_message,
            } => {
                let outcome = match (result, error_message) {
                    (_, Some(message)) => Err(WorkerError::operation(message)),
                    (Some(info), None) => Ok(info),
                    (None, None) => Err(WorkerError::operation("empty tunnel response")),
                };
                let tunnels = self.ctx.tunnels.clone();
                self.tasks.spawn(async move {
                    if !tunnels.resolve(&msgid, outcome).await {
                        tracing::warn!(%msgid, "tunnel response for unknown request ignored");
                    }
                });
            }
        }
        Flow::Continue
    }
}

/// Run the worker until it is closed, loses its parent or its connection.
pub async fn run<R, W>(options: RuntimeOptions, input: R, output: W) -> WorkerResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_messages(output, out_rx));
    let (fatal, mut fatal_rx) = mpsc::unbounded_channel();
    let (ready, ready_rx) = watch::channel(None);

    let mut worker = Worker {
        ctx: Context {
            kind: options.kind,
            target: StreamTarget::new(&options.data_dir, options.writer).with_progress(out.clone()),
            out,
            fatal,
            ready: ready_rx,
            tunnels: Arc::new(Correlator::new()),
        },
        ready: Arc::new(ready),
        tasks: JoinSet::new(),
        last_ping: Instant::now(),
        connecting: false,
    };

    tracing::info!(kind = %options.kind, ping_timeout = ?options.ping_timeout, "worker started");

    let check_period = (options.ping_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut ping_check = tokio::time::interval(check_period);
    let mut lines = BufReader::new(input).lines();

    let result = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match decode_line::<ControlMessage>(&line) {
                    Ok(message) => {
                        if let Flow::Exit = worker.handle(message) {
                            break Ok(());
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "unparseable control message ignored"),
                },
                Ok(None) => {
                    tracing::info!("stdin closed, exiting");
                    break Ok(());
                }
                Err(e) => break Err(WorkerError::ReadFailed(e)),
            },
            _ = ping_check.tick() => {
                if worker.last_ping.elapsed() > options.ping_timeout {
                    tracing::warn!(timeout = ?options.ping_timeout, "no ping from supervisor, exiting");
                    break Err(WorkerError::Timeout(options.ping_timeout.as_secs()));
                }
            }
            Some(reason) = fatal_rx.recv() => {
                tracing::error!(%reason, "connection unusable, exiting");
                break Err(WorkerError::closed(reason));
            }
            Some(joined) = worker.tasks.join_next(), if !worker.tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "worker task failed");
                }
            }
        }
    };

    worker.ctx.tunnels.reject_all("worker exiting").await;
    worker.tasks.abort_all();
    worker.ready.send_replace(None);
    drop(worker);
    if tokio::time::timeout(DRAIN_TIMEOUT, writer).await.is_err() {
        tracing::warn!("output not drained before exit");
    }
    result
}

async fn write_messages<W>(output: W, mut messages: mpsc::UnboundedReceiver<WorkerMessage>)
where
    W: AsyncWrite + Unpin,
{
    let mut output = BufWriter::new(output);
    while let Some(message) = messages.recv().await {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, kind = message.kind(), "failed to encode message");
                continue;
            }
        };
        let written = async {
            output.write_all(line.as_bytes()).await?;
            output.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(error = %e, "stdout closed");
            break;
        }
    }
}

async fn connect(
    ctx: Context,
    ready: Arc<watch::Sender<Option<Arc<Connected>>>>,
    descriptor: ConnectionDescriptor,
    structure: Option<StructureSnapshot>,
    auto_refresh: Option<Duration>,
) {
    let connection = match establish(&ctx, descriptor).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::error!(error = %e, "connect failed");
            ctx.emit(WorkerMessage::Status {
                status: Status::error(e.to_string()),
            });
            let _ = ctx.fatal.send(e.to_string());
            return;
        }
    };

    match connection.server_version().await {
        Ok(version) => ctx.emit(WorkerMessage::Version { version }),
        Err(e) => tracing::warn!(error = %e, "server version unavailable"),
    }
    ctx.emit(WorkerMessage::Status {
        status: Status::ok(),
    });

    let scheduler = (ctx.kind == ResourceKind::Database).then(|| {
        Arc::new(StructureScheduler::new(
            Arc::new(ConnectionAnalyser(connection.clone())),
            ctx.out.clone(),
            structure,
        ))
    });
    let auto_refresh = match (&scheduler, auto_refresh) {
        (Some(scheduler), Some(interval)) => Some(scheduler.spawn_auto_refresh(interval)),
        _ => None,
    };
    ready.send_replace(Some(Arc::new(Connected {
        connection: connection.clone(),
        scheduler: scheduler.clone(),
        auto_refresh,
    })));

    match (ctx.kind, scheduler) {
        (ResourceKind::Database, Some(scheduler)) => {
            if let Err(e) = scheduler.incremental_refresh().await {
                ctx.report(&e);
            }
        }
        (ResourceKind::Server, _) => send_databases(&ctx, connection.as_ref()).await,
        _ => {}
    }
}

/// Open the connection, through an SSH tunnel owned by the supervisor if the
/// descriptor asks for one.
async fn establish(
    ctx: &Context,
    descriptor: ConnectionDescriptor,
) -> DriverResult<Arc<dyn DatabaseConnection>> {
    let engine = descriptor
        .engine_type()
        .map_err(|e| DriverError::Connect(e.to_string()))?;
    let tunnel = descriptor
        .tunnel_key()
        .map_err(|e| DriverError::Connect(e.to_string()))?;

    let descriptor = match tunnel {
        Some(key) => {
            let info = request_tunnel(ctx, key).await?;
            ConnectionDescriptor {
                server: Some(info.local_host),
                port: Some(info.local_port),
                ssh: None,
                ..descriptor
            }
        }
        None => descriptor,
    };

    connector_for(engine)?.connect(&descriptor).await
}

async fn request_tunnel(ctx: &Context, key: TunnelKey) -> DriverResult<TunnelInfo> {
    let tunnel_error = |e: WorkerError| DriverError::Connect(format!("ssh tunnel: {e}"));
    let (msgid, rx) = ctx.tunnels.register().await.map_err(tunnel_error)?;
    tracing::debug!(%msgid, ssh_host = %key.ssh_host, "requesting ssh tunnel");
    ctx.emit(WorkerMessage::TunnelRequest { msgid, key });
    rx.await
        .map_err(WorkerError::from)
        .and_then(|result| result)
        .map_err(tunnel_error)
}

async fn send_databases(ctx: &Context, connection: &dyn DatabaseConnection) {
    match connection.list_databases().await {
        Ok(databases) => ctx.emit(WorkerMessage::Databases { databases }),
        Err(e) => {
            tracing::warn!(error = %e, "failed to list databases");
            ctx.report(&e);
        }
    }
}

async fn refresh(ctx: Context, full: bool) {
    let Some(connected) = ctx.current() else {
        tracing::debug!("refresh before connect ignored");
        return;
    };
    if let Some(scheduler) = &connected.scheduler {
        let result = if full {
            scheduler.full_refresh().await
        } else {
            scheduler.incremental_refresh().await
        };
        if let Err(e) = result {
            ctx.report(&e);
        }
    } else if ctx.kind == ResourceKind::Server {
        send_databases(&ctx, connected.connection.as_ref()).await;
    }
}

async fn serve_request(ctx: Context, msgid: String, operation: Operation) {
    let mut ready = ctx.ready.clone();
    let connected = match ready.wait_for(Option::is_some).await {
        Ok(connected) => connected.clone(),
        Err(_) => None,
    };
    let Some(connected) = connected else {
        ctx.emit(WorkerMessage::failure(msgid, "worker is not connected"));
        return;
    };

    let name = operation.name();
    tracing::debug!(%msgid, operation = name, "request");

    // Run on its own task so a panic fails only this request.
    let task = tokio::spawn(execute(
        connected.connection.clone(),
        operation,
        ctx.target.clone(),
        ctx.out.clone(),
    ));
    match task.await {
        Ok(Ok(result)) => ctx.emit(WorkerMessage::success(msgid, result)),
        Ok(Err(e)) => {
            tracing::debug!(%msgid, operation = name, error = %e, "request failed");
            ctx.emit(WorkerMessage::failure(msgid, e.to_string()));
            ctx.report(&e);
        }
        Err(e) => {
            tracing::error!(%msgid, operation = name, error = %e, "request handler crashed");
            ctx.emit(WorkerMessage::failure(msgid, format!("{name} failed: {e}")));
        }
    }
}

async fn execute(
    connection: Arc<dyn DatabaseConnection>,
    operation: Operation,
    target: StreamTarget,
    out: mpsc::UnboundedSender<WorkerMessage>,
) -> DriverResult<serde_json::Value> {
    let value = match operation {
        Operation::Query { sql, limit } => serde_json::to_value(connection.query(&sql, limit).await?)?,
        Operation::RunScript { sql } => serde_json::to_value(connection.run_script(&sql).await?)?,
        Operation::StreamQuery { sql, jslid } => {
            let streamed = connection.stream_query(&sql, &jslid, &target).await;
            if let Err(e) = &streamed {
                let mut info = InfoMessage::new(Severity::Error, e.to_string());
                info.jslid = Some(jslid.clone());
                let _ = out.send(WorkerMessage::Info { info });
            }
            let _ = out.send(WorkerMessage::Done {
                jslid: jslid.clone(),
            });
            serde_json::to_value(StreamResult {
                row_count: streamed?.row_count,
                jslid,
            })?
        }
        Operation::ExecuteQuery { sql } => {
            let result = connection.execute_query(&sql, &target).await?;
            for recordset in &result.recordsets {
                let _ = out.send(WorkerMessage::Done {
                    jslid: recordset.jslid.clone(),
                });
            }
            serde_json::to_value(result)?
        }
        Operation::ListDatabases => serde_json::to_value(connection.list_databases().await?)?,
        Operation::ServerVersion => serde_json::to_value(connection.server_version().await?)?,
    };
    Ok(value)
}
