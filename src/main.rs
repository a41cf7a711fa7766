use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};

use hearthkeep_lib::{
    config::AppConfig,
    db, entities, ledger, logging, migrate,
    store::{self, ListOptions},
    sync::{self, MemoryRemote, RemoteEndpoint, SyncOutcome, SyncProgress},
    time::to_rfc3339,
    AppState,
};

#[derive(Debug, Parser)]
#[command(name = "hearthkeep", about = "Hearthkeep local store and sync", version)]
struct Cli {
    /// Database file; defaults to the data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending schema migrations.
    Migrate,
    /// Show schema version, outstanding changes and last sync.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List the syncable tables.
    Tables,
    /// List records in a table.
    List {
        table: String,
        #[arg(long)]
        order_by: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
        /// Hide records whose `is_active` flag is false.
        #[arg(long)]
        active_only: bool,
    },
    /// Print one record.
    Get { table: String, id: String },
    /// Create a record from a JSON object; an `id` key is kept if present.
    Add { table: String, json: String },
    /// Merge a JSON object into a record.
    Update {
        table: String,
        id: String,
        json: String,
    },
    /// Delete a record. Deleting a missing record is not an error.
    Delete { table: String, id: String },
    /// Push outstanding changes and pull remote ones.
    Sync {
        /// Sync server base URL; defaults to the configured one.
        #[arg(long)]
        remote: Option<String>,
        /// Ignore the debounce window.
        #[arg(long)]
        force: bool,
    },
    /// Sync now, then again every `sync.interval_secs` until interrupted.
    Watch,
    /// Two in-memory devices editing the same record against an in-process remote.
    Demo,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    };

    let log_dir = config.log.file.then(|| config.log_dir());
    let guard = match logging::init(&config.log, log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Warning: file logging disabled: {err:#}");
            logging::init(&config.log, None).ok().flatten()
        }
    };

    let code = match run(cli, config).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    // flush the file writer before exiting
    drop(guard);
    process::exit(code);
}

async fn run(cli: Cli, mut config: AppConfig) -> Result<i32> {
    config.db_file = cli.db;
    let db_path = config.db_path();
    match cli.command {
        Command::Migrate => migrate_cmd(&db_path).await,
        Command::Status { json } => status_cmd(&db_path, &config, json).await,
        Command::Tables => {
            for table in store::table_names() {
                println!("{table}");
            }
            Ok(0)
        }
        Command::List {
            table,
            order_by,
            limit,
            offset,
            active_only,
        } => {
            let state = AppState::open(&config).await?;
            let options = ListOptions {
                order_by,
                limit,
                offset,
                active_only,
            };
            let records = state.mutator.list(&table, &options).await?;
            print_json(&Value::Array(records.iter().map(|r| r.to_value()).collect()))?;
            Ok(0)
        }
        Command::Get { table, id } => {
            let state = AppState::open(&config).await?;
            match state.mutator.get(&table, &id).await? {
                Some(record) => {
                    print_json(&record.to_value())?;
                    Ok(0)
                }
                None => {
                    eprintln!("{table}/{id} not found");
                    Ok(1)
                }
            }
        }
        Command::Add { table, json } => {
            let state = AppState::open(&config).await?;
            let fields = parse_object(&json)?;
            let record = entities::record_for(&table, fields)?;
            let created = state.mutator.create_with_sync(&table, record).await?;
            print_json(&created.to_value())?;
            Ok(0)
        }
        Command::Update { table, id, json } => {
            let state = AppState::open(&config).await?;
            let patch = parse_object(&json)?;
            let updated = state.mutator.update_with_sync(&table, &id, patch).await?;
            print_json(&updated.to_value())?;
            Ok(0)
        }
        Command::Delete { table, id } => {
            let state = AppState::open(&config).await?;
            let deleted = state.mutator.delete_with_sync(&table, &id).await?;
            print_json(&json!({ "deleted": deleted }))?;
            Ok(0)
        }
        Command::Sync { remote, force } => {
            if remote.is_some() {
                config.sync.remote_url = remote;
            }
            if config.sync.remote_url.is_none() {
                bail!("no sync server configured; pass --remote or set HEARTHKEEP_REMOTE_URL");
            }
            let state = AppState::open(&config).await?;
            let outcome = state.perform_sync(force, print_progress).await;
            print_json(&serde_json::to_value(&outcome)?)?;
            Ok(if outcome.success { 0 } else { 1 })
        }
        Command::Watch => watch_cmd(&config).await,
        Command::Demo => demo().await,
    }
}

async fn watch_cmd(config: &AppConfig) -> Result<i32> {
    if config.sync.remote_url.is_none() {
        bail!("no sync server configured; set HEARTHKEEP_REMOTE_URL");
    }
    let state = AppState::open(config).await?;
    let Some(timer) = state.spawn_keep_fresh(Duration::from_secs(config.sync.interval_secs)) else {
        bail!("keep-fresh is disabled; set sync.interval_secs above 0");
    };

    let outcome = state.perform_sync(true, print_progress).await;
    report("sync", &outcome);
    println!(
        "syncing every {}s; press Ctrl-C to stop",
        config.sync.interval_secs
    );
    let waited = tokio::signal::ctrl_c().await;
    timer.abort();
    waited.context("wait for Ctrl-C")?;
    Ok(0)
}

async fn migrate_cmd(db_path: &std::path::Path) -> Result<i32> {
    let pool = db::open_sqlite_pool(db_path).await?;
    let applied = migrate::apply_migrations(&pool)
        .await
        .context("apply migrations")?;
    if applied.is_empty() {
        println!("schema is current ({})", migrate::latest_version());
    } else {
        for version in applied {
            println!("applied {version}");
        }
    }
    pool.close().await;
    Ok(0)
}

async fn status_cmd(db_path: &std::path::Path, config: &AppConfig, as_json: bool) -> Result<i32> {
    let state = AppState::open(config).await?;
    let pool = &state.pool;
    let version = migrate::current_version(pool).await?;
    let outstanding = ledger::outstanding_by_table(pool).await?;
    let deferred = ledger::deferred(pool).await?;
    let stalled = ledger::stalled_count(pool).await?;
    let last_sync_at = sync::last_sync_at(pool).await?;
    let watermark = sync::watermark(pool).await?;

    let mut pending = Map::new();
    for (table, entries) in &outstanding {
        pending.insert(table.clone(), Value::from(entries.len()));
    }
    let report = json!({
        "db_path": db_path.display().to_string(),
        "schema_version": version,
        "pending": pending,
        "pending_total": outstanding.values().map(Vec::len).sum::<usize>(),
        "deferred": deferred.len(),
        "stalled": stalled,
        "last_sync_at": last_sync_at,
        "watermark": watermark,
        "remote_url": config.sync.remote_url,
    });

    if as_json {
        print_json(&report)?;
        return Ok(0);
    }

    println!("database:   {}", db_path.display());
    println!("schema:     {}", version.as_deref().unwrap_or("none"));
    println!(
        "last sync:  {}",
        last_sync_at.map(to_rfc3339).unwrap_or_else(|| "never".into())
    );
    println!("deferred:   {}", deferred.len());
    println!("stalled:    {stalled}");
    if outstanding.is_empty() {
        println!("pending:    none");
    } else {
        println!("pending:");
        for (table, entries) in &outstanding {
            println!("  {table:<20} {}", entries.len());
        }
    }
    Ok(0)
}

async fn demo() -> Result<i32> {
    let remote = MemoryRemote::new();
    let laptop = demo_device(&remote).await?;
    let phone = demo_device(&remote).await?;

    let fields = parse_object(r#"{"id": "task-demo", "title": "Buy milk"}"#)?;
    entities::tasks_create(&laptop.mutator, fields).await?;
    report("laptop sync", &laptop.perform_sync(true, |_| {}).await);
    report("phone sync", &phone.perform_sync(true, |_| {}).await);

    entities::tasks_update(&laptop.mutator, "task-demo", parse_object(r#"{"title": "Buy oat milk"}"#)?)
        .await?;
    entities::tasks_update(&phone.mutator, "task-demo", parse_object(r#"{"done": true}"#)?).await?;
    report("laptop sync", &laptop.perform_sync(true, |_| {}).await);
    report("phone sync", &phone.perform_sync(true, |_| {}).await);
    report("laptop sync", &laptop.perform_sync(true, |_| {}).await);

    let at_remote = remote.record("tasks", "task-demo").unwrap_or(Value::Null);
    let on_laptop = entities::tasks_get(&laptop.mutator, "task-demo").await?;
    println!("remote: {at_remote}");
    println!(
        "laptop: {}",
        on_laptop.map(|r| r.to_value()).unwrap_or(Value::Null)
    );
    Ok(0)
}

async fn demo_device(remote: &MemoryRemote) -> Result<AppState> {
    let pool = db::open_memory_pool().await?;
    let remote: Arc<dyn RemoteEndpoint> = Arc::new(remote.clone());
    Ok(AppState::from_pool(pool, &Default::default(), Some(remote)).await?)
}

fn report(label: &str, outcome: &SyncOutcome) {
    println!(
        "{label:<12} success={} pushed={} pulled={} deferred={}",
        outcome.success, outcome.pushed, outcome.pulled, outcome.deferred
    );
}

fn print_progress(progress: SyncProgress) {
    println!(
        "[{:>3}%] {}: {}",
        progress.percent,
        progress.step.as_str(),
        progress.message
    );
}

fn parse_object(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("parse JSON argument")? {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, got {other}"),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
