//! Cross-file reference resolution.
//!
//! A strategy prepares a [`ResolutionSession`] against the live definitions
//! once the merge phase is over, then resolves pending references in
//! batches. All strategies feed the same [`callgraph::decide`] ranking, so
//! they differ only in how candidate keys are looked up.
//!
//! [`callgraph::decide`]: crate::indexer::callgraph::decide

pub mod hashmap;
pub mod index;
pub mod join;

use serde::{Deserialize, Serialize};

use crate::config::{AliasPrecedence, IndexConfig, ResolutionStrategyKind};
use crate::errors::TrellisResult;
use crate::indexer::callgraph::{Decision, TieBreakRule};
use crate::models::Reference;
use crate::store::database::GraphStore;
use crate::store::sharding::resolver::ShardedStrategy;

pub use hashmap::HashmapStrategy;
pub use index::DefinitionIndex;
pub use join::JoinStrategy;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Resolved { target_id: String },
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityCandidate {
    pub id: String,
    pub qualified_name: String,
    pub file_path: String,
}

/// A resolution that had more than one candidate, with the rule that
/// picked the winner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityEntry {
    pub reference_id: String,
    pub file_path: String,
    pub raw_name: String,
    pub candidates: Vec<AmbiguityCandidate>,
    pub chosen: String,
    pub decided_by: TieBreakRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub reference_id: String,
    pub verdict: Verdict,
    pub ambiguity: Option<AmbiguityEntry>,
}

impl ResolutionOutcome {
    /// Turn a ranking into a verdict. No candidate means ExternalUnresolved.
    pub fn from_decision(reference: &Reference, decision: Decision) -> Self {
        let winner = match decision.winner() {
            Some(winner) => winner.id.clone(),
            None => {
                return Self {
                    reference_id: reference.id.clone(),
                    verdict: Verdict::External,
                    ambiguity: None,
                }
            }
        };
        let ambiguity = decision.decided_by.map(|decided_by| AmbiguityEntry {
            reference_id: reference.id.clone(),
            file_path: reference.file_path.clone(),
            raw_name: reference.raw_name.clone(),
            candidates: decision
                .ranked
                .iter()
                .map(|r| AmbiguityCandidate {
                    id: r.candidate.id.clone(),
                    qualified_name: r.candidate.qualified_name.clone(),
                    file_path: r.candidate.file_path.clone(),
                })
                .collect(),
            chosen: winner.clone(),
            decided_by,
        });
        Self {
            reference_id: reference.id.clone(),
            verdict: Verdict::Resolved { target_id: winner },
            ambiguity,
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        match &self.verdict {
            Verdict::Resolved { target_id } => Some(target_id),
            Verdict::External => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy seam
// ---------------------------------------------------------------------------

/// Lookup state prepared once per resolution phase.
pub trait ResolutionSession {
    /// Resolve a batch. The returned outcomes follow the order of `pending`.
    fn resolve_batch(
        &mut self,
        pending: &[Reference],
        precedence: AliasPrecedence,
    ) -> TrellisResult<Vec<ResolutionOutcome>>;
}

pub trait ResolutionStrategy: Send + Sync {
    fn kind(&self) -> ResolutionStrategyKind;

    /// Snapshot the live definitions the session will resolve against.
    fn prepare<'s>(
        &'s self,
        store: &'s GraphStore,
    ) -> TrellisResult<Box<dyn ResolutionSession + 's>>;
}

/// Build the strategy selected by `config`.
pub fn build_strategy(config: &IndexConfig) -> Box<dyn ResolutionStrategy> {
    match config.resolution_strategy {
        ResolutionStrategyKind::Join => Box::new(JoinStrategy),
        ResolutionStrategyKind::Hashmap => Box::new(HashmapStrategy),
        ResolutionStrategyKind::Sharded => {
            Box::new(ShardedStrategy::new(config.effective_shard_count()))
        }
    }
}
