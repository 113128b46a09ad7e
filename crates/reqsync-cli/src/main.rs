//! reqsync - command line front end for the requisitions sync cache.
//!
//! Lists requisitions, watches the collection for changes, and changes a
//! requisition's status through the intercepted client so the cache picks
//! the change up on its own.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reqsync_core::{
    ApiClient, CollectionHandle, Config, InvalidationBus, MutationInterceptor, RecordId,
    RecordSource, RecordStore, Requisition, RequisitionStatus, RequisitionsApi, StableView,
    Subscription,
};

#[derive(Parser, Debug)]
#[command(name = "reqsync")]
#[command(about = "Keep a local, self-refreshing view of console requisitions")]
#[command(version)]
struct Args {
    /// Path to config file (default: $XDG_CONFIG_HOME/reqsync/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL, overriding config and environment
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the collection and print it
    List {
        /// Only show requisitions with this status (wire value, e.g. to_accept)
        #[arg(long)]
        status: Option<String>,

        /// Ask the server for one requisition type only (material, hr)
        #[arg(long = "type")]
        requisition_type: Option<String>,

        /// Print raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print one requisition as JSON
    Show { id: String },
    /// Print the collection every time it changes, until Ctrl-C
    Watch,
    /// Change a requisition's status
    SetStatus {
        id: String,
        /// New status (wire value, e.g. accepted)
        status: String,
    },
}

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). When a log file is
/// configured, events are also written there; the returned guard flushes it.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match args.config.as_deref() {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(ref url) = args.base_url {
        config.base_url = url.clone();
    }
    Ok(config)
}

/// Client, bus and store wired together for one collection.
///
/// The store is not attached to the bus here. Commands that want the store
/// itself to follow invalidations call `attach`; `watch` leaves that to its
/// `StableView`.
struct Session {
    config: Config,
    api: RequisitionsApi,
    bus: InvalidationBus,
    store: RecordStore<Requisition>,
}

impl Session {
    fn connect(config: Config) -> Result<Self> {
        let client = ApiClient::new(&config)?;
        let bus = InvalidationBus::new();
        let interceptor = MutationInterceptor::from_config(&config, bus.clone());
        if !client.install_interceptor(Arc::new(interceptor)) {
            warn!(collection = %config.collection_path, "Invalidation interceptor was already installed");
        }

        let api = RequisitionsApi::new(client, &config.collection_path);
        let source: Arc<dyn RecordSource<Requisition>> = Arc::new(api.clone());
        let store = RecordStore::new("requisitions", source, config.sync);

        info!(base_url = %config.base_url, collection = %api.collection_path(), "Session ready");
        Ok(Self {
            config,
            api,
            bus,
            store,
        })
    }

    fn attach(&self) -> Subscription {
        self.store.attach(&self.bus)
    }

    /// Forced refresh; fails if the fetch failed.
    async fn load(&self) -> Result<Arc<Vec<Requisition>>> {
        self.store.request_refresh(true);
        let view = self.store.settled().await;
        if let Some(error) = view.error {
            anyhow::bail!(error);
        }
        Ok(view.records)
    }
}

fn parse_id(raw: &str) -> RecordId {
    match raw.parse::<i64>() {
        Ok(id) => RecordId::Int(id),
        Err(_) => RecordId::Str(raw.to_string()),
    }
}

fn print_table(records: &[Requisition]) {
    println!(
        "{:<8} {:<16} {:<10} {:<12} {:<20} {:<11} {}",
        "ID", "NUMBER", "TYPE", "STATUS", "PROJECT", "DEADLINE", "UPDATED"
    );
    for record in records {
        let id = record.id.as_ref().map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
        let project: String = record.project_name().unwrap_or("-").chars().take(20).collect();
        println!(
            "{:<8} {:<16} {:<10} {:<12} {:<20} {:<11} {}",
            id,
            record.number().unwrap_or("-"),
            record.requisition_type().unwrap_or("-"),
            record.status_display(),
            project,
            record.deadline().unwrap_or("-"),
            record.formatted_updated_at(),
        );
    }
}

async fn list(
    session: &Session,
    status: Option<String>,
    requisition_type: Option<String>,
    json: bool,
) -> Result<()> {
    // A filtered listing is not the cached collection, so it bypasses the store.
    let (records, age) = match requisition_type {
        Some(kind) => (Arc::new(session.api.list_by_type(&kind).await?), "just now".to_string()),
        None => {
            let records = session.load().await?;
            (records, session.store.snapshot().age_display())
        }
    };
    let wanted = status.map(RequisitionStatus::from);
    let shown: Vec<Requisition> = records
        .iter()
        .filter(|r| wanted.is_none() || r.status == wanted)
        .cloned()
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
    } else {
        print_table(&shown);
        eprintln!("{} of {} requisitions, fetched {}", shown.len(), records.len(), age);
    }
    Ok(())
}

async fn show(session: &Session, id: &str) -> Result<()> {
    let record = session.api.get(&parse_id(id)).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn watch(session: &Session) -> Result<()> {
    let view = StableView::mount(session.store.clone(), &session.bus, session.config.sync.stable_throttle())?;
    let mut updates = view.subscribe();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    eprintln!("Watching {} (Ctrl-C to stop)", session.api.collection_path());
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = updates.borrow_and_update().clone();
                if let Some(ref error) = current.error {
                    warn!(error = %error, "Refresh failed, showing last good data");
                    eprintln!("refresh failed: {}", error);
                }
                println!();
                print_table(&current.records);
                let age = view.store().snapshot().age_display();
                eprintln!("{} requisitions, fetched {}", current.records.len(), age);
            }
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }
    Ok(())
}

async fn set_status(session: &Session, id: &str, status: &str) -> Result<()> {
    let id = parse_id(id);
    let status = RequisitionStatus::from(status);
    if !status.is_known() {
        warn!(status = %status.as_str(), "Sending a status the console does not know about");
    }

    let _attached = session.attach();
    session.load().await?;

    let updated = session.api.update_status(&id, &status).await?;
    if !session.store.merge_record(updated) {
        warn!(id = %id, "Server response had no id, not merged");
    }

    // The interceptor invalidates after the settle delay; wait for that refresh.
    let timings = session.config.sync;
    tokio::time::sleep(timings.settle_delay() + timings.debounce()).await;
    let view = session.store.settled().await;
    if let Some(ref error) = view.error {
        eprintln!("refresh failed: {}", error);
    }

    let key = id.to_string();
    match view
        .records
        .iter()
        .find(|r| r.id.as_ref().map(RecordId::to_string).as_deref() == Some(key.as_str()))
    {
        Some(record) => println!(
            "{} {} ({})",
            key,
            record.status_display(),
            record.formatted_updated_at()
        ),
        None => println!("{} not present after refresh", key),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let config = load_config(&args)?;
    let _guard = init_tracing(config.log_file.as_deref())?;
    info!("reqsync starting");

    let session = Session::connect(config)?;
    match args.command {
        Command::List {
            status,
            requisition_type,
            json,
        } => list(&session, status, requisition_type, json).await,
        Command::Show { id } => show(&session, &id).await,
        Command::Watch => watch(&session).await,
        Command::SetStatus { id, status } => set_status(&session, &id, &status).await,
    }
}
