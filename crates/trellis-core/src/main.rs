use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trellis_core::models::{ChangeSet, DefinitionKind};
use trellis_core::query::graph::{entry_point_candidates, graph_stats};
use trellis_core::{
    find_dead_code, open_store, Coordinator, DeadCodeOptions, IndexConfig, JsonAstProvider,
    ResolutionStrategyKind,
};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Incremental code knowledge graph")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a change set and print the run report as JSON.
    Index {
        #[arg(long)]
        db: PathBuf,
        /// Change set JSON file.
        #[arg(long)]
        changeset: PathBuf,
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides `resolution_strategy` from the configuration.
        #[arg(long)]
        strategy: Option<ResolutionStrategyKind>,
        /// Directory holding unified AST JSON for files the change set
        /// carries no content for.
        #[arg(long)]
        ast_root: Option<PathBuf>,
        #[arg(long)]
        full: bool,
        #[arg(long)]
        immediate: bool,
    },
    /// List definitions unreachable from the entry points.
    DeadCode {
        #[arg(long)]
        db: PathBuf,
        /// Entry point ids or qualified names. Defaults to the public
        /// top-level functions and classes plus `main`.
        #[arg(long = "entry")]
        entries: Vec<String>,
        /// Kinds to report (function, method, class, ...).
        #[arg(long = "kind")]
        kinds: Vec<String>,
    },
    /// Print graph statistics.
    Stats {
        #[arg(long)]
        db: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Index {
            db,
            changeset,
            config,
            strategy,
            ast_root,
            full,
            immediate,
        } => {
            let mut config = match config {
                Some(path) => IndexConfig::from_path(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => IndexConfig::default(),
            };
            if let Some(strategy) = strategy {
                config.resolution_strategy = strategy;
            }
            config.full_reindex |= full;
            config.immediate_resolution |= immediate;
            config.validate()?;

            let text = std::fs::read_to_string(&changeset)
                .with_context(|| format!("reading {}", changeset.display()))?;
            let changes: ChangeSet = serde_json::from_str(&text)?;
            let provider = match ast_root {
                Some(root) => JsonAstProvider::with_root(root),
                None => JsonAstProvider::new(),
            };

            let store = open_store(&db, &config)?;
            let coordinator = Coordinator::new(&store, &provider, config)?;
            let report = coordinator.run(&changes)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::DeadCode { db, entries, kinds } => {
            let store = open_store(&db, &IndexConfig::default())?;
            let entries = if entries.is_empty() {
                entry_point_candidates(&store)?
                    .into_iter()
                    .map(|d| d.id)
                    .collect()
            } else {
                entries
            };
            let mut options = DeadCodeOptions::new(entries);
            if !kinds.is_empty() {
                options.kinds = kinds
                    .iter()
                    .map(|k| k.parse::<DefinitionKind>())
                    .collect::<Result<Vec<_>, _>>()?;
            }
            let report = find_dead_code(&store, &options)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Stats { db } => {
            let store = open_store(&db, &IndexConfig::default())?;
            println!("{}", serde_json::to_string_pretty(&graph_stats(&store)?)?);
        }
    }

    Ok(())
}
