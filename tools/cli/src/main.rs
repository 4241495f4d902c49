//! ShowSync CLI - Command line interface for the offline mutation queue.
//!
//! Local state (queue and audit trail) lives in the data directory; the
//! remote side is a directory of JSON entity files, so the whole pipeline
//! can be driven from a shell.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use showsync_common::{ActorId, EntityId, EntityKind, FieldMap, Operation};
use showsync_storage::{FileDurableStore, FileRemoteStore};
use showsync_sync::{
    AuditAction, AuditFilter, ExportFormat, MutationId, MutationRecord, SyncConfig, SyncEngine,
};

#[derive(Parser)]
#[command(name = "showsync")]
#[command(about = "ShowSync - Offline-first mutation queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the local queue and audit trail.
    #[arg(short, long, default_value = ".showsync")]
    data_dir: PathBuf,

    /// Directory acting as the remote store (default: <data-dir>/remote).
    #[arg(short, long)]
    remote: Option<PathBuf>,

    /// JSON file with sync settings.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Attribute local edits to this actor.
    #[arg(short, long)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OperationArg {
    Create,
    Update,
    Delete,
}

impl From<OperationArg> for Operation {
    fn from(op: OperationArg) -> Self {
        match op {
            OperationArg::Create => Operation::Create,
            OperationArg::Update => Operation::Update,
            OperationArg::Delete => Operation::Delete,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Csv,
}

impl From<FormatArg> for ExportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Json => ExportFormat::Json,
            FormatArg::Csv => ExportFormat::Csv,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a local edit.
    Enqueue {
        /// Entity kind: "show", "finance", or "travel".
        #[arg(short, long)]
        kind: String,

        /// Entity identifier.
        #[arg(short, long)]
        id: String,

        /// Kind of write.
        #[arg(short, long, value_enum, default_value = "update")]
        op: OperationArg,

        /// Field assignment as name=value; values are parsed as JSON when possible.
        #[arg(short, long = "set")]
        fields: Vec<String>,
    },

    /// Show queue and connectivity status.
    Status,

    /// List queued mutations.
    List,

    /// List mutations waiting for a retry or discard decision.
    Failed,

    /// Put a failed mutation back in line.
    Retry {
        /// Mutation id.
        id: MutationId,
    },

    /// Drop a failed mutation for good.
    Discard {
        /// Mutation id.
        id: MutationId,
    },

    /// Withdraw a mutation that has not been sent.
    Cancel {
        /// Mutation id.
        id: MutationId,
    },

    /// Drop every queued mutation.
    Clear {
        /// Confirm dropping unsent edits.
        #[arg(long)]
        yes: bool,
    },

    /// Show an entity as the app would render it.
    Show {
        /// Entity kind.
        #[arg(short, long)]
        kind: String,

        /// Entity identifier.
        #[arg(short, long)]
        id: String,

        /// Use local state only.
        #[arg(long)]
        offline: bool,
    },

    /// Drain the queue against the remote store.
    Sync,

    /// Export the audit trail.
    Audit {
        /// Output format.
        #[arg(short, long, value_enum, default_value = "json")]
        format: FormatArg,

        /// Only events of this entity.
        #[arg(short, long)]
        entity: Option<String>,

        /// Only events of this action (e.g. "dead-lettered").
        #[arg(long)]
        action: Option<String>,

        /// Only events at or after this RFC 3339 time.
        #[arg(long)]
        since: Option<String>,

        /// Keep at most this many events, newest first.
        #[arg(short, long)]
        limit: Option<usize>,

        /// Write to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = open_engine(&cli).await?;

    match cli.command {
        Commands::Enqueue {
            kind,
            id,
            op,
            fields,
        } => cmd_enqueue(&engine, &kind, &id, op.into(), &fields).await,

        Commands::Status => cmd_status(&engine).await,

        Commands::List => cmd_list(&engine).await,

        Commands::Failed => cmd_failed(&engine).await,

        Commands::Retry { id } => cmd_retry(&engine, id).await,

        Commands::Discard { id } => cmd_discard(&engine, id).await,

        Commands::Cancel { id } => cmd_cancel(&engine, id).await,

        Commands::Clear { yes } => cmd_clear(&engine, yes).await,

        Commands::Show { kind, id, offline } => cmd_show(&engine, &kind, &id, offline).await,

        Commands::Sync => cmd_sync(&engine).await,

        Commands::Audit {
            format,
            entity,
            action,
            since,
            limit,
            output,
        } => {
            let filter = audit_filter(entity, action, since, limit)?;
            cmd_audit(&engine, format.into(), &filter, output.as_deref()).await
        }
    }
}

/// Load settings from the config file, then apply flag overrides.
async fn load_config(path: Option<&Path>, actor: Option<&str>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            parse_config(&content)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        }
        None => SyncConfig::default(),
    };
    if let Some(actor) = actor {
        config.actor = ActorId::new(actor);
    }
    Ok(config)
}

fn parse_config(content: &str) -> Result<SyncConfig> {
    Ok(serde_json::from_str(content)?)
}

async fn open_engine(cli: &Cli) -> Result<SyncEngine> {
    let config = load_config(cli.config.as_deref(), cli.actor.as_deref()).await?;
    let remote_dir = cli
        .remote
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("remote"));

    let durable = FileDurableStore::new(cli.data_dir.join("local"))
        .await
        .context("Failed to open local state")?;
    let remote = FileRemoteStore::new(&remote_dir)
        .await
        .context("Failed to open remote store")?;

    SyncEngine::open(Arc::new(remote), Arc::new(durable), config)
        .await
        .context("Failed to open mutation queue")
}

/// Parse `name=value` assignments into a payload.
fn parse_fields(assignments: &[String]) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for assignment in assignments {
        let (name, raw) = assignment
            .split_once('=')
            .with_context(|| format!("Expected name=value, got '{}'", assignment))?;
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        fields.insert(name.trim().to_string(), value);
    }
    Ok(fields)
}

fn audit_filter(
    entity: Option<String>,
    action: Option<String>,
    since: Option<String>,
    limit: Option<usize>,
) -> Result<AuditFilter> {
    let entity_id = entity
        .map(EntityId::new)
        .transpose()
        .context("Invalid entity id")?;
    let action = action
        .as_deref()
        .map(AuditAction::parse)
        .transpose()
        .context("Invalid audit action")?;
    let since = since
        .as_deref()
        .map(|s| DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)))
        .transpose()
        .context("Invalid --since time, expected RFC 3339")?;

    Ok(AuditFilter {
        entity_id,
        action,
        since,
        limit,
        ..Default::default()
    })
}

fn print_record(record: &MutationRecord) {
    println!(
        "  #{} {} {} {} (base v{}, {}, {} attempts)",
        record.id,
        record.operation,
        record.kind,
        record.entity_id,
        record.base_version,
        record.status,
        record.attempts
    );
    if let Some(error) = &record.last_error {
        println!("      last error: {}", error.message);
    }
}

/// Queue a local edit.
async fn cmd_enqueue(
    engine: &SyncEngine,
    kind: &str,
    id: &str,
    operation: Operation,
    assignments: &[String],
) -> Result<()> {
    let kind = EntityKind::parse(kind).context("Invalid entity kind")?;
    let entity_id = EntityId::new(id).context("Invalid entity id")?;
    let fields = parse_fields(assignments)?;

    info!("Queueing {} of {} {}", operation, kind, entity_id);

    let record = engine
        .enqueue(operation, kind, entity_id, fields)
        .await
        .context("Failed to queue mutation")?;

    println!("Mutation queued: #{}", record.id);
    println!("  Entity: {} {}", record.kind, record.entity_id);
    println!("  Base version: {}", record.base_version);

    Ok(())
}

/// Show queue status.
async fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let stats = engine.stats().await;

    println!("Queue Status:");
    println!("  Pending: {}", stats.queued_count);
    println!("  Needs attention: {}", stats.failed_count);
    println!("  Online: {}", stats.is_online);
    match stats.last_sync_at {
        Some(at) => println!("  Last sync: {}", at),
        None => println!("  Last sync: never (this session)"),
    }

    Ok(())
}

/// List queued mutations.
async fn cmd_list(engine: &SyncEngine) -> Result<()> {
    let records = engine.mutations().await;

    if records.is_empty() {
        println!("Queue is empty.");
    } else {
        println!("Queued mutations:");
        for record in &records {
            print_record(record);
        }
    }

    Ok(())
}

/// List failed mutations.
async fn cmd_failed(engine: &SyncEngine) -> Result<()> {
    let records = engine.failed_operations().await;

    if records.is_empty() {
        println!("No failed mutations.");
    } else {
        println!("Failed mutations (retry or discard):");
        for record in &records {
            print_record(record);
        }
    }

    Ok(())
}

async fn cmd_retry(engine: &SyncEngine, id: MutationId) -> Result<()> {
    let record = engine
        .retry_operation(id)
        .await
        .context("Failed to requeue mutation")?;
    println!("Mutation #{} requeued.", record.id);
    Ok(())
}

async fn cmd_discard(engine: &SyncEngine, id: MutationId) -> Result<()> {
    let record = engine
        .discard_operation(id)
        .await
        .context("Failed to discard mutation")?;
    println!(
        "Mutation #{} discarded ({} of {}).",
        record.id, record.operation, record.entity_id
    );
    Ok(())
}

async fn cmd_cancel(engine: &SyncEngine, id: MutationId) -> Result<()> {
    let record = engine
        .cancel_operation(id)
        .await
        .context("Failed to cancel mutation")?;
    println!("Mutation #{} cancelled.", record.id);
    Ok(())
}

async fn cmd_clear(engine: &SyncEngine, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Clearing drops unsent edits; pass --yes to confirm");
    }
    let dropped = engine.clear_queue().await.context("Failed to clear queue")?;
    println!("Dropped {} mutations.", dropped);
    Ok(())
}

/// Show an entity with pending edits applied.
async fn cmd_show(engine: &SyncEngine, kind: &str, id: &str, offline: bool) -> Result<()> {
    let kind = EntityKind::parse(kind).context("Invalid entity kind")?;
    let entity_id = EntityId::new(id).context("Invalid entity id")?;

    if offline {
        engine.set_online(false).await;
    }

    let entity = engine
        .read_entity(kind, &entity_id)
        .await
        .context("Failed to read entity")?;

    println!("{} {} (v{}):", entity.kind, entity.id, entity.version);
    if entity.deleted {
        println!("  [deleted]");
    }
    for (name, value) in &entity.fields {
        println!("  {}: {}", name, value);
    }
    println!(
        "  Last modified: {} by {}",
        entity.modified_at, entity.modified_by
    );

    Ok(())
}

/// Drain the queue once.
async fn cmd_sync(engine: &SyncEngine) -> Result<()> {
    let seen = engine.conflict_reports().await.len();
    let report = engine.sync_now().await.context("Sync failed")?;

    if report.skipped {
        println!("Sync skipped.");
        return Ok(());
    }

    println!("Sync completed in {:?}:", report.duration);
    println!("  Succeeded: {}", report.succeeded);
    println!("  Merged: {}", report.merged);
    println!("  Failed (will retry): {}", report.failed);
    println!("  Dead-lettered: {}", report.dead_lettered);
    println!("  Unresolved: {}", report.unresolved);

    for conflict in engine.conflict_reports().await.iter().skip(seen) {
        println!(
            "  Conflict on {}: {} ({} field diffs)",
            conflict.entity_id,
            conflict.resolution,
            conflict.field_diffs.len()
        );
    }

    Ok(())
}

/// Export the audit trail.
async fn cmd_audit(
    engine: &SyncEngine,
    format: ExportFormat,
    filter: &AuditFilter,
    output: Option<&Path>,
) -> Result<()> {
    let exported = engine
        .export_audit(format, filter)
        .await
        .context("Failed to export audit trail")?;

    match output {
        Some(path) => {
            tokio::fs::write(path, &exported)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Audit trail written to {}", path.display());
        }
        None => println!("{}", exported),
    }

    Ok(())
}
