//! In-memory definition index keyed by qualified name and simple name.

use std::collections::HashMap;

use crate::indexer::callgraph::{CandidateHits, CandidatePlan, DefinitionCandidate};

#[derive(Debug, Default)]
pub struct DefinitionIndex {
    by_qualified: HashMap<String, Vec<DefinitionCandidate>>,
    by_name: HashMap<String, Vec<DefinitionCandidate>>,
}

impl DefinitionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: impl IntoIterator<Item = DefinitionCandidate>) -> Self {
        let mut index = Self::new();
        for def in definitions {
            index.insert(def);
        }
        index
    }

    pub fn insert(&mut self, def: DefinitionCandidate) {
        self.insert_qualified(def.clone());
        self.insert_named(def);
    }

    pub fn insert_qualified(&mut self, def: DefinitionCandidate) {
        self.by_qualified
            .entry(def.qualified_name.clone())
            .or_default()
            .push(def);
    }

    pub fn insert_named(&mut self, def: DefinitionCandidate) {
        self.by_name.entry(def.name.clone()).or_default().push(def);
    }

    pub fn qualified(&self, key: &str) -> &[DefinitionCandidate] {
        self.by_qualified.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn named(&self, name: &str) -> &[DefinitionCandidate] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn qualified_len(&self) -> usize {
        self.by_qualified.values().map(Vec::len).sum()
    }

    pub fn named_len(&self) -> usize {
        self.by_name.values().map(Vec::len).sum()
    }

    /// Probe every key of `plan`. The global tier is only fetched when no
    /// exact key matched.
    pub fn hits_for(&self, plan: &CandidatePlan) -> CandidateHits {
        let mut hits = CandidateHits::default();
        for key in &plan.exact {
            for def in self.qualified(&key.key) {
                hits.exact.push((def.clone(), key.distance));
            }
        }
        if hits.exact.is_empty() {
            if let Some(name) = plan.global_name() {
                hits.global.extend(self.named(name).iter().cloned());
            }
        }
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::callgraph::CandidateKey;

    fn def(id: &str, qname: &str) -> DefinitionCandidate {
        DefinitionCandidate {
            id: id.into(),
            qualified_name: qname.into(),
            name: qname.rsplit('.').next().unwrap_or(qname).into(),
            file_path: "x.py".into(),
            indexed_seq: 1,
        }
    }

    #[test]
    fn test_hits_skip_global_when_exact_matches() {
        let index = DefinitionIndex::from_definitions([def("1", "a.foo"), def("2", "b.foo")]);
        let plan = CandidatePlan {
            exact: vec![CandidateKey {
                key: "a.foo".into(),
                distance: 0,
            }],
            global_suffix: Some("foo".into()),
        };
        let hits = index.hits_for(&plan);
        assert_eq!(hits.exact.len(), 1);
        assert!(hits.global.is_empty());

        let miss = CandidatePlan {
            exact: vec![CandidateKey {
                key: "c.foo".into(),
                distance: 0,
            }],
            global_suffix: Some("foo".into()),
        };
        assert_eq!(index.hits_for(&miss).global.len(), 2);
        assert_eq!(index.qualified_len(), 2);
        assert_eq!(index.named_len(), 2);
    }
}
