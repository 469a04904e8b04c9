//! Conduit CLI - inspect stream files and run queries through worker processes
//!
//! Usage:
//!   conduit rows <file.jsonl> [--offset N] [--limit N] [--filter <json>]
//!   conduit stats <file.jsonl>
//!   conduit query <connection> <sql> [--limit N]
//!   conduit structure <connection> [--database <name>]
//!   conduit databases <connection>
//!   conduit encrypt-password <password>
//!
//! Examples:
//!   conduit rows ~/.conduit/jsldata/0190c1a2.jsonl --offset 100 --limit 20
//!   conduit rows out.jsonl --filter '{"conditionType":"isNotNull","expr":{"exprType":"column","columnName":"email"}}'
//!   conduit query local "select * from users"

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use conduit::config::Settings;
use conduit::crypto::{self, MasterKey};
use conduit::datastore::{new_store_id, Condition, JsonLinesDatastore, StreamStats};
use conduit::supervisor::{ResourceKey, Supervisor};
use conduit::worker::protocol::{DatabaseInfo, Operation, StreamResult};
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Conduit - out-of-process database connections with streamed results")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $CONDUIT_CONFIG, ./conduit.toml, ~/.config/conduit/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print rows of a stream file
    Rows {
        /// Path to the .jsonl stream file
        file: PathBuf,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// Filter condition as JSON
        #[arg(long)]
        filter: Option<String>,
    },

    /// Print the side-car statistics of a stream file
    Stats {
        /// Path to the .jsonl stream file
        file: PathBuf,
    },

    /// Run a query in a worker, stream it to a store and print the rows
    Query {
        /// Connection name from the config file
        connection: String,

        sql: String,

        #[arg(long)]
        database: Option<String>,

        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Print the analysed structure of a database
    Structure {
        /// Connection name from the config file
        connection: String,

        #[arg(long)]
        database: Option<String>,
    },

    /// List the databases of a server connection
    Databases {
        /// Connection name from the config file
        connection: String,
    },

    /// Encrypt a password with the master key ($CONDUIT_MASTER_KEY)
    EncryptPassword { password: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Rows {
            file,
            offset,
            limit,
            filter,
        } => cmd_rows(file, offset, limit, filter).await,
        Commands::Stats { file } => cmd_stats(file),
        Commands::Query {
            connection,
            sql,
            database,
            limit,
        } => cmd_query(settings, connection, sql, database, limit).await,
        Commands::Structure {
            connection,
            database,
        } => cmd_structure(settings, connection, database).await,
        Commands::Databases { connection } => cmd_databases(settings, connection).await,
        Commands::EncryptPassword { password } => cmd_encrypt_password(&password),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_rows(file: PathBuf, offset: u64, limit: usize, filter: Option<String>) -> CliResult {
    let filter: Option<Condition> = filter.as_deref().map(serde_json::from_str).transpose()?;
    let store = JsonLinesDatastore::new(file);
    for row in store.get_rows(offset, limit, filter.as_ref()).await? {
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}

fn cmd_stats(file: PathBuf) -> CliResult {
    match StreamStats::read(&file)? {
        Some(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
        None => println!("No statistics for {}", file.display()),
    }
    Ok(())
}

fn open_supervisor(settings: Settings) -> Result<Supervisor, Box<dyn Error>> {
    Ok(Supervisor::builder(settings)
        .master_key(MasterKey::from_env()?)
        .build()?)
}

async fn cmd_query(
    settings: Settings,
    connection: String,
    sql: String,
    database: Option<String>,
    limit: usize,
) -> CliResult {
    let descriptor = settings.get_connection(&connection)?;
    let supervisor = open_supervisor(settings)?;
    let key = ResourceKey::database(&connection, database.as_deref());

    let result = async {
        supervisor.ensure_open(&key, &descriptor).await?;
        supervisor.wait_connected(&key).await?;

        let jslid = new_store_id();
        let streamed: StreamResult = supervisor
            .request(&key, Operation::StreamQuery { sql, jslid })
            .await?;
        for row in supervisor.read_rows(&streamed.jslid, 0, limit, None).await? {
            println!("{}", serde_json::to_string(&row)?);
        }
        eprintln!(
            "{} row(s) in {}",
            streamed.row_count,
            supervisor.datastores().path(&streamed.jslid)?.display()
        );
        Ok::<_, Box<dyn Error>>(())
    }
    .await;

    supervisor.shutdown().await;
    result
}

async fn cmd_structure(
    settings: Settings,
    connection: String,
    database: Option<String>,
) -> CliResult {
    let descriptor = settings.get_connection(&connection)?;
    let supervisor = open_supervisor(settings)?;
    let key = ResourceKey::database(&connection, database.as_deref());

    let result = async {
        supervisor.ensure_open(&key, &descriptor).await?;
        supervisor.wait_connected(&key).await?;
        match supervisor.wait_for_structure(&key).await? {
            Some(structure) => println!("{}", serde_json::to_string_pretty(&*structure)?),
            None => {
                let status = supervisor.get_status(&key).await.unwrap_or_default();
                return Err(format!(
                    "structure analysis failed: {}",
                    status.message.unwrap_or_default()
                )
                .into());
            }
        }
        Ok::<_, Box<dyn Error>>(())
    }
    .await;

    supervisor.shutdown().await;
    result
}

async fn cmd_databases(settings: Settings, connection: String) -> CliResult {
    let descriptor = settings.get_connection(&connection)?;
    let supervisor = open_supervisor(settings)?;
    let key = ResourceKey::server(&connection);

    let result = async {
        supervisor.ensure_open(&key, &descriptor).await?;
        supervisor.wait_connected(&key).await?;
        let databases: Vec<DatabaseInfo> =
            supervisor.request(&key, Operation::ListDatabases).await?;
        for database in databases {
            println!("{}", database.name);
        }
        Ok::<_, Box<dyn Error>>(())
    }
    .await;

    supervisor.shutdown().await;
    result
}

fn cmd_encrypt_password(password: &str) -> CliResult {
    let key = MasterKey::from_env()?;
    if !key.is_persistent() {
        eprintln!("Warning: {} is not set; this value only decrypts in this run", crypto::MASTER_KEY_ENV);
    }
    println!("{}", crypto::encrypt_password(&key, password)?);
    Ok(())
}
