//! conduit-worker - hosts one database connection for the supervisor
//!
//! Speaks NDJSON on stdin/stdout; logs go to stderr. Not meant to be started
//! by hand: the supervisor builds its command line from `[worker]` settings.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use conduit::config::DatastoreSettings;
use conduit::datastore::WriterOptions;
use conduit::worker::protocol::ResourceKind;
use conduit::worker::runtime::{self, RuntimeOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conduit-worker")]
#[command(about = "Conduit worker process (spawned by the supervisor)")]
#[command(version)]
struct Args {
    /// Resource kind hosted by this worker
    #[arg(long)]
    kind: ResourceKind,

    /// Exit when no ping arrived for this many seconds
    #[arg(long, default_value_t = 120)]
    ping_timeout_secs: u64,

    /// Directory holding stream files
    #[arg(long)]
    data_dir: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value_t = 100)]
    stats_batch_rows: u64,

    #[arg(long, default_value_t = 250)]
    stats_flush_interval_ms: u64,

    /// Pass-through arguments from `worker.extra_args`
    #[arg(last = true)]
    extra: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if !args.extra.is_empty() {
        tracing::debug!(extra = ?args.extra, "pass-through arguments");
    }

    let options = RuntimeOptions {
        kind: args.kind,
        ping_timeout: Duration::from_secs(args.ping_timeout_secs.max(1)),
        data_dir: args.data_dir,
        writer: WriterOptions::from(&DatastoreSettings {
            stats_batch_rows: args.stats_batch_rows,
            stats_flush_interval_ms: args.stats_flush_interval_ms,
        }),
    };

    tracing::info!(kind = %options.kind, pid = std::process::id(), "worker started");

    match runtime::run(options, tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(()) => {
            tracing::info!("worker finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "worker stopped");
            ExitCode::FAILURE
        }
    }
}
