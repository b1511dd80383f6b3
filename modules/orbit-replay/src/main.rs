use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use orbit_common::StoreConfig;
use orbit_events::{DatabaseBackend, EntityQuery, PgStore};
use orbit_ingest::{IngestibleSource, Reconciler};
use orbit_world::EntityId;

#[derive(Parser)]
#[command(name = "orbit-replay", about = "Maintenance for the Orbit task store")]
struct Cli {
    /// Overrides DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Re-fold entities from the event log and rewrite their derived rows
    Rebuild {
        /// Only this entity
        #[arg(long)]
        entity: Option<String>,
    },
    /// Print components due for review as JSON lines
    Due {
        /// Cutoff in epoch millis (default: now)
        #[arg(long)]
        before: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print an entity's event log as JSON lines
    Events { entity: String },
    /// Reconcile a JSON file of sources against the store
    Ingest {
        file: PathBuf,
        /// Print the events instead of storing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the JSON schema of the ingest file format
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("orbit=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Schema = cli.command {
        let schema = schemars::schema_for!(Vec<IngestibleSource>);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = StoreConfig::from_env()?;
    config.log_redacted();

    let url = cli
        .database_url
        .or_else(|| config.database_url.clone())
        .context("DATABASE_URL is not set (or pass --database-url)")?;
    let store = PgStore::connect(&url).await?;
    store.migrate().await?;
    let backend = DatabaseBackend::new(store, &config)?;

    match cli.command {
        Command::Rebuild { entity: Some(id) } => {
            let id = EntityId::new(id);
            match backend.rebuild_entity(&id).await? {
                Some(record) => info!(entity_id = %id, last_event_id = %record.last_event_id, "Rebuilt"),
                None => warn!(entity_id = %id, "No events for entity"),
            }
        }
        Command::Rebuild { entity: None } => {
            let query = EntityQuery::builder().include_deleted(true).build();
            let ids: Vec<EntityId> = backend
                .entity_stream(&query)
                .map_ok(|entity| entity.id().clone())
                .try_collect()
                .await?;
            info!(entities = ids.len(), "Rebuilding all entities");
            for id in &ids {
                backend.rebuild_entity(id).await?;
            }
            info!(entities = ids.len(), "Rebuild complete");
        }
        Command::Due { before, limit } => {
            let before = before.unwrap_or_else(|| Utc::now().timestamp_millis());
            for row in backend.list_due_components(before, limit).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Command::Events { entity } => {
            for event in backend.list_events(&EntityId::new(entity)).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::Ingest { file, dry_run } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Cannot read {}", file.display()))?;
            let sources: Vec<IngestibleSource> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a list of sources", file.display()))?;

            let events = Reconciler::new(&backend)
                .reconcile(&sources, Utc::now().timestamp_millis())
                .await?;
            if dry_run {
                for event in &events {
                    println!("{}", serde_json::to_string(event)?);
                }
            } else {
                let stored = backend.put_events(events).await?;
                info!(file = %file.display(), stored, "Ingested");
            }
        }
        Command::Schema => {}
    }

    Ok(())
}
