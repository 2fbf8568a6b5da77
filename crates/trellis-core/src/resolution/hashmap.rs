//! Hashmap strategy: one in-memory index built from the live definitions.

use tracing::debug;

use crate::config::{AliasPrecedence, ResolutionStrategyKind};
use crate::errors::TrellisResult;
use crate::indexer::callgraph::{candidate_plan, decide};
use crate::models::Reference;
use crate::resolution::{
    DefinitionIndex, ResolutionOutcome, ResolutionSession, ResolutionStrategy,
};
use crate::store::database::GraphStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct HashmapStrategy;

pub struct HashmapSession {
    index: DefinitionIndex,
}

impl HashmapSession {
    pub fn new(index: DefinitionIndex) -> Self {
        Self { index }
    }
}

impl ResolutionSession for HashmapSession {
    fn resolve_batch(
        &mut self,
        pending: &[Reference],
        precedence: AliasPrecedence,
    ) -> TrellisResult<Vec<ResolutionOutcome>> {
        Ok(pending
            .iter()
            .map(|reference| {
                let plan = candidate_plan(reference, precedence);
                let hits = self.index.hits_for(&plan);
                ResolutionOutcome::from_decision(reference, decide(reference, &plan, hits))
            })
            .collect())
    }
}

impl ResolutionStrategy for HashmapStrategy {
    fn kind(&self) -> ResolutionStrategyKind {
        ResolutionStrategyKind::Hashmap
    }

    fn prepare<'s>(
        &'s self,
        store: &'s GraphStore,
    ) -> TrellisResult<Box<dyn ResolutionSession + 's>> {
        let index = DefinitionIndex::from_definitions(store.live_definitions()?);
        debug!("Hashmap index built with {} definitions", index.qualified_len());
        Ok(Box::new(HashmapSession::new(index)))
    }
}
