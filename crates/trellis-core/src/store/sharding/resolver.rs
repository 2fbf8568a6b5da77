//! Sharded resolution strategy.
//!
//! Live definitions are partitioned across shard workers, each owning its
//! slice of the qualified-name and simple-name indexes. The aggregator
//! routes each probe to the shard owning its key, waits until every routed
//! shard has answered, then ranks with the shared rules. The global tier is
//! probed in a second round only for references the exact tier missed.

use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::config::{AliasPrecedence, ResolutionStrategyKind};
use crate::errors::{TrellisError, TrellisResult};
use crate::indexer::callgraph::{
    candidate_plan, decide, CandidateHits, CandidatePlan, DefinitionCandidate,
};
use crate::models::Reference;
use crate::resolution::{ResolutionOutcome, ResolutionSession, ResolutionStrategy};
use crate::store::database::GraphStore;
use crate::store::sharding::catalog::{ShardCatalog, ShardPartition};
use crate::store::sharding::router::{KeySpace, ShardRouter};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Probe {
    slot: usize,
    space: KeySpace,
    key: String,
    distance: u32,
}

#[derive(Debug)]
struct ProbeHit {
    slot: usize,
    space: KeySpace,
    distance: u32,
    candidate: DefinitionCandidate,
}

enum ShardRequest {
    Lookup {
        probes: Vec<Probe>,
        reply: Sender<ShardReply>,
    },
}

struct ShardReply {
    shard: usize,
    hits: Vec<ProbeHit>,
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

fn run_worker(partition: ShardPartition, requests: Receiver<ShardRequest>) {
    // Exits once every sender has been dropped.
    for request in requests.iter() {
        match request {
            ShardRequest::Lookup { probes, reply } => {
                let mut hits = Vec::new();
                for probe in probes {
                    let found = match probe.space {
                        KeySpace::Qualified => partition.index.qualified(&probe.key),
                        KeySpace::Named => partition.index.named(&probe.key),
                    };
                    hits.extend(found.iter().map(|candidate| ProbeHit {
                        slot: probe.slot,
                        space: probe.space,
                        distance: probe.distance,
                        candidate: candidate.clone(),
                    }));
                }
                if reply
                    .send(ShardReply {
                        shard: partition.shard,
                        hits,
                    })
                    .is_err()
                {
                    warn!("Shard {} reply dropped by aggregator", partition.shard);
                }
            }
        }
    }
}

struct ShardWorker {
    requests: Option<Sender<ShardRequest>>,
    handle: Option<JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// Strategy / session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ShardedStrategy {
    shard_count: usize,
}

impl ShardedStrategy {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }
}

pub struct ShardedSession {
    router: ShardRouter,
    workers: Vec<ShardWorker>,
}

impl ShardedSession {
    pub fn spawn(catalog: ShardCatalog) -> TrellisResult<Self> {
        let (router, partitions) = catalog.into_partitions();
        let mut workers = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let (tx, rx) = unbounded();
            let handle = thread::Builder::new()
                .name(format!("trellis-shard-{}", partition.shard))
                .spawn(move || run_worker(partition, rx))?;
            workers.push(ShardWorker {
                requests: Some(tx),
                handle: Some(handle),
            });
        }
        Ok(Self { router, workers })
    }

    /// Send each shard its probes and block until all of them replied.
    fn dispatch(&self, probes: Vec<Probe>) -> TrellisResult<Vec<ProbeHit>> {
        let mut by_shard: BTreeMap<usize, Vec<Probe>> = BTreeMap::new();
        for probe in probes {
            let shard = self.router.route(probe.space, &probe.key);
            by_shard.entry(shard).or_default().push(probe);
        }

        let (reply_tx, reply_rx) = unbounded();
        let mut expected = 0usize;
        for (shard, probes) in by_shard {
            let sender = self
                .workers
                .get(shard)
                .and_then(|w| w.requests.as_ref())
                .ok_or_else(|| TrellisError::Database(format!("shard {shard} has no worker")))?;
            sender
                .send(ShardRequest::Lookup {
                    probes,
                    reply: reply_tx.clone(),
                })
                .map_err(|_| TrellisError::Database(format!("shard {shard} worker stopped")))?;
            expected += 1;
        }
        drop(reply_tx);

        let mut hits = Vec::new();
        for _ in 0..expected {
            let reply = reply_rx.recv().map_err(|_| {
                TrellisError::Database("shard worker exited before replying".to_string())
            })?;
            debug!("Shard {} returned {} hits", reply.shard, reply.hits.len());
            hits.extend(reply.hits);
        }
        Ok(hits)
    }
}

impl ResolutionSession for ShardedSession {
    fn resolve_batch(
        &mut self,
        pending: &[Reference],
        precedence: AliasPrecedence,
    ) -> TrellisResult<Vec<ResolutionOutcome>> {
        let plans: Vec<CandidatePlan> = pending
            .iter()
            .map(|reference| candidate_plan(reference, precedence))
            .collect();
        let mut hits: Vec<CandidateHits> = vec![CandidateHits::default(); pending.len()];

        let exact: Vec<Probe> = plans
            .iter()
            .enumerate()
            .flat_map(|(slot, plan)| {
                plan.exact.iter().map(move |key| Probe {
                    slot,
                    space: KeySpace::Qualified,
                    key: key.key.clone(),
                    distance: key.distance,
                })
            })
            .collect();
        for hit in self.dispatch(exact)? {
            hits[hit.slot].exact.push((hit.candidate, hit.distance));
        }

        let global: Vec<Probe> = plans
            .iter()
            .enumerate()
            .filter(|(slot, _)| hits[*slot].exact.is_empty())
            .filter_map(|(slot, plan)| {
                plan.global_name().map(|name| Probe {
                    slot,
                    space: KeySpace::Named,
                    key: name.to_string(),
                    distance: 0,
                })
            })
            .collect();
        for hit in self.dispatch(global)? {
            if hit.space == KeySpace::Named {
                hits[hit.slot].global.push(hit.candidate);
            }
        }

        Ok(pending
            .iter()
            .zip(plans.iter())
            .zip(hits)
            .map(|((reference, plan), slot_hits)| {
                ResolutionOutcome::from_decision(reference, decide(reference, plan, slot_hits))
            })
            .collect())
    }
}

impl Drop for ShardedSession {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.requests.take();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!("Shard worker panicked");
                }
            }
        }
    }
}

impl ResolutionStrategy for ShardedStrategy {
    fn kind(&self) -> ResolutionStrategyKind {
        ResolutionStrategyKind::Sharded
    }

    fn prepare<'s>(
        &'s self,
        store: &'s GraphStore,
    ) -> TrellisResult<Box<dyn ResolutionSession + 's>> {
        let catalog = ShardCatalog::build(
            ShardRouter::new(self.shard_count),
            store.live_definitions()?,
        );
        for stats in catalog.stats() {
            debug!(
                "Shard {}: {} qualified keys, {} named keys",
                stats.shard, stats.qualified_keys, stats.named_keys
            );
        }
        Ok(Box::new(ShardedSession::spawn(catalog)?))
    }
}
