//! Binary entry point for versioned-kg.
//!
//! A thin CLI over the library: ingest change records, inspect the ontology
//! and read entity states.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow printing in the binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use versioned_kg::ingest::{AofSource, Connector};
use versioned_kg::models::{EntityId, parse_timestamp};
use versioned_kg::storage::{EntityIndex, SqliteEntityIndex};
use versioned_kg::{KgConfig, VersionedGraph, observability};

/// vkg - A bitemporally versioned knowledge graph.
#[derive(Parser)]
#[command(name = "vkg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Ingest change records.
    Ingest {
        /// Record source.
        #[command(subcommand)]
        source: IngestSource,
    },

    /// Inspect the ontology.
    Ontology {
        /// Ontology subcommand.
        #[command(subcommand)]
        action: OntologyAction,
    },

    /// Read entities.
    Entity {
        /// Entity subcommand.
        #[command(subcommand)]
        action: EntityAction,
    },
}

/// Ingestion sources.
#[derive(Subcommand)]
enum IngestSource {
    /// Read an append-only file once.
    Aof {
        /// Path to the AOF file.
        file: PathBuf,

        /// Clear the graph, the ontology and the index first.
        #[arg(long)]
        fresh: bool,

        /// Index record titles for this user.
        #[arg(long)]
        index_user: Option<String>,
    },

    /// Poll a Redis server for new records.
    #[cfg(feature = "redis")]
    Redis {
        /// Redis URL; defaults to the configured one.
        #[arg(long)]
        url: Option<String>,

        /// Index record titles for this user.
        #[arg(long)]
        index_user: Option<String>,
    },
}

/// Ontology subcommands.
#[derive(Subcommand)]
enum OntologyAction {
    /// Print the kind tree and the relationship model.
    Show {
        /// Include property declarations.
        #[arg(long)]
        properties: bool,
    },
}

/// Entity subcommands.
#[derive(Subcommand)]
enum EntityAction {
    /// Print the current state, or the state valid at a date.
    Show {
        /// Entity id.
        id: String,

        /// Instant to read at, e.g. `2022-03-01T10:00:00`.
        #[arg(long)]
        at: Option<String>,
    },

    /// Print every state, newest first.
    History {
        /// Entity id.
        id: String,
    },
}

/// Main entry point.
fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    if let Err(e) = observability::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run_command(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<KgConfig> {
    if let Some(path) = path {
        return KgConfig::load_from_file(path)
            .with_context(|| format!("reading {}", path.display()));
    }
    if let Ok(path) = std::env::var("VKG_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return KgConfig::load_from_file(Path::new(&path))
                .with_context(|| format!("reading {path}"));
        }
    }
    Ok(KgConfig::load_default())
}

/// Runs the selected command.
fn run_command(command: Commands, config: KgConfig) -> Result<()> {
    let graph = Arc::new(VersionedGraph::open(&config).context("opening the graph")?);

    match command {
        Commands::Ingest { source } => run_ingest(source, graph, &config),
        Commands::Ontology {
            action: OntologyAction::Show { properties },
        } => {
            println!("{}", graph.ontology().render_hierarchy(properties));
            println!("{}", graph.ontology().render_data_model());
            Ok(())
        },
        Commands::Entity { action } => run_entity(action, &graph),
    }
}

fn open_index(config: &KgConfig) -> Result<Arc<dyn EntityIndex>> {
    let index = match &config.index.path {
        Some(path) => SqliteEntityIndex::new(path),
        None => SqliteEntityIndex::in_memory(),
    }
    .context("opening the entity index")?;
    Ok(Arc::new(index))
}

fn connector(
    graph: Arc<VersionedGraph>,
    config: &KgConfig,
    index_user: Option<String>,
) -> Result<Connector> {
    let connector = Connector::new(graph, config.ingest.clone());
    Ok(match index_user {
        Some(user) => connector.with_entity_index(open_index(config)?, user),
        None => connector,
    })
}

fn run_ingest(source: IngestSource, graph: Arc<VersionedGraph>, config: &KgConfig) -> Result<()> {
    match source {
        IngestSource::Aof {
            file,
            fresh,
            index_user,
        } => {
            if fresh {
                graph.drop_database().context("clearing the graph")?;
                open_index(config)?.drop_index()?;
            }
            let connector = connector(graph, config, index_user)?;
            let mut source = AofSource::new(&file);
            let report = connector
                .ingest_source(&mut source)
                .with_context(|| format!("ingesting {}", file.display()))?;
            println!("{report}");
            Ok(())
        },
        #[cfg(feature = "redis")]
        IngestSource::Redis { url, index_user } => {
            let url = url
                .or_else(|| config.ingest.redis_url.clone())
                .context("no Redis URL given or configured")?;
            let connector = connector(graph, config, index_user)?;
            let mut source = versioned_kg::ingest::RedisSource::connect(&url)
                .with_context(|| format!("connecting to {url}"))?;
            let report = connector.run_polling(&mut source);
            println!("{report}");
            Ok(())
        },
    }
}

fn run_entity(action: EntityAction, graph: &VersionedGraph) -> Result<()> {
    match action {
        EntityAction::Show { id, at } => {
            let id = EntityId::new(id);
            let state = match at {
                Some(at) => graph.get_entity_by_date(&id, parse_timestamp(&at)?)?,
                None => graph.get_current_state(&id)?,
            };
            println!("{}", serde_json::to_string_pretty(&state)?);
        },
        EntityAction::History { id } => {
            let history = graph.history(&EntityId::new(id))?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        },
    }
    Ok(())
}
