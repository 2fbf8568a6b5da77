//! Shard catalog: partitions the live definitions across shards and keeps
//! per-shard statistics.

use serde::{Deserialize, Serialize};

use crate::indexer::callgraph::DefinitionCandidate;
use crate::resolution::DefinitionIndex;
use crate::store::sharding::router::{KeySpace, ShardRouter};

/// Definitions owned by one shard. A definition appears in the shard owning
/// its qualified name and in the shard owning its simple name.
#[derive(Debug, Default)]
pub struct ShardPartition {
    pub shard: usize,
    pub index: DefinitionIndex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStats {
    pub shard: usize,
    pub qualified_keys: usize,
    pub named_keys: usize,
}

pub struct ShardCatalog {
    router: ShardRouter,
    partitions: Vec<ShardPartition>,
}

impl ShardCatalog {
    pub fn build(router: ShardRouter, definitions: Vec<DefinitionCandidate>) -> Self {
        let mut partitions: Vec<ShardPartition> = (0..router.shard_count())
            .map(|shard| ShardPartition {
                shard,
                index: DefinitionIndex::new(),
            })
            .collect();
        for def in definitions {
            let by_qualified = router.route(KeySpace::Qualified, &def.qualified_name);
            let by_name = router.route(KeySpace::Named, &def.name);
            partitions[by_name].index.insert_named(def.clone());
            partitions[by_qualified].index.insert_qualified(def);
        }
        Self { router, partitions }
    }

    pub fn router(&self) -> ShardRouter {
        self.router
    }

    pub fn stats(&self) -> Vec<ShardStats> {
        self.partitions
            .iter()
            .map(|p| ShardStats {
                shard: p.shard,
                qualified_keys: p.index.qualified_len(),
                named_keys: p.index.named_len(),
            })
            .collect()
    }

    /// Hand the partitions to their workers.
    pub fn into_partitions(self) -> (ShardRouter, Vec<ShardPartition>) {
        (self.router, self.partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, qname: &str) -> DefinitionCandidate {
        DefinitionCandidate {
            id: id.into(),
            qualified_name: qname.into(),
            name: qname.rsplit('.').next().unwrap_or(qname).into(),
            file_path: "f.py".into(),
            indexed_seq: 1,
        }
    }

    #[test]
    fn test_every_definition_lands_once_per_key_space() {
        let defs: Vec<_> = (0..50).map(|i| def(&i.to_string(), &format!("m{i}.f{i}"))).collect();
        let catalog = ShardCatalog::build(ShardRouter::new(4), defs);
        let stats = catalog.stats();
        assert_eq!(stats.len(), 4);
        assert_eq!(stats.iter().map(|s| s.qualified_keys).sum::<usize>(), 50);
        assert_eq!(stats.iter().map(|s| s.named_keys).sum::<usize>(), 50);
    }

    #[test]
    fn test_lookup_finds_definition_in_routed_shard() {
        let router = ShardRouter::new(3);
        let catalog = ShardCatalog::build(router, vec![def("1", "a.foo")]);
        let (router, partitions) = catalog.into_partitions();
        let q = router.route(KeySpace::Qualified, "a.foo");
        let n = router.route(KeySpace::Named, "foo");
        assert_eq!(partitions[q].index.qualified("a.foo").len(), 1);
        assert_eq!(partitions[n].index.named("foo").len(), 1);
    }
}
