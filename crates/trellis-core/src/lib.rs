//! Trellis core library: incremental construction of a repository knowledge
//! graph.
//!
//! Per-file extraction over a unified AST feeds a SQLite graph store through
//! placeholder references; after every merge of a run, one of three
//! interchangeable strategies (join, hashmap, sharded) resolves them across
//! files. Successive change sets update only what changed, and a dead-code
//! pass walks the resolved call graph.

pub mod config;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod query;
pub mod resolution;
pub mod store;

pub use config::{AliasPrecedence, IndexConfig, ResolutionStrategyKind};
pub use errors::{TrellisError, TrellisResult};
pub use indexer::cancel::CancelToken;
pub use indexer::coordinator::Coordinator;
pub use indexer::pipeline::{AstProvider, JsonAstProvider};
pub use indexer::report::RunReport;
pub use query::dead_code::{find_dead_code, DeadCodeOptions, DeadCodeReport};
pub use store::database::GraphStore;

/// Open (and initialise) a store with the write policy of `config`.
pub fn open_store(
    db_path: impl AsRef<std::path::Path>,
    config: &IndexConfig,
) -> TrellisResult<GraphStore> {
    let store = GraphStore::open(db_path)?.with_write_policy(config.write_policy());
    store.init_schema()?;
    Ok(store)
}
