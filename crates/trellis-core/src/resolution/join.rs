//! Join strategy: the batch's candidate keys are loaded into a TEMP table
//! and matched against `definitions` with one set-oriented query.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::config::{AliasPrecedence, ResolutionStrategyKind};
use crate::errors::TrellisResult;
use crate::indexer::callgraph::{candidate_plan, decide, CandidateHits, DefinitionCandidate};
use crate::models::Reference;
use crate::resolution::{ResolutionOutcome, ResolutionSession, ResolutionStrategy};
use crate::store::database::GraphStore;

const CREATE_KEYS_SQL: &str = "CREATE TEMP TABLE IF NOT EXISTS pending_keys (
    slot INTEGER NOT NULL,
    tier TEXT NOT NULL,
    lookup TEXT NOT NULL,
    distance INTEGER NOT NULL,
    suffix TEXT
);";

/// Exact keys match on qualified name. Global keys match on simple name plus
/// a segment-aligned suffix test, and only for slots with no exact match.
const MATCH_SQL: &str = "
SELECT k.slot, 'exact', k.distance, d.id, d.qualified_name, d.name, d.file_path, d.indexed_seq
FROM pending_keys k
JOIN definitions d ON d.qualified_name = k.lookup AND d.tombstoned = 0
WHERE k.tier = 'exact'
UNION ALL
SELECT k.slot, 'global', 0, d.id, d.qualified_name, d.name, d.file_path, d.indexed_seq
FROM pending_keys k
JOIN definitions d ON d.name = k.lookup AND d.tombstoned = 0
WHERE k.tier = 'global'
  AND (d.qualified_name = k.suffix
       OR substr(d.qualified_name, -(length(k.suffix) + 1)) = '.' || k.suffix)
  AND NOT EXISTS (
      SELECT 1 FROM pending_keys e
      JOIN definitions d2 ON d2.qualified_name = e.lookup AND d2.tombstoned = 0
      WHERE e.slot = k.slot AND e.tier = 'exact'
  );";

#[derive(Debug, Clone, Copy, Default)]
pub struct JoinStrategy;

pub struct JoinSession {
    conn: Connection,
}

impl JoinSession {
    pub fn new(conn: Connection) -> TrellisResult<Self> {
        conn.execute_batch(CREATE_KEYS_SQL)?;
        Ok(Self { conn })
    }
}

impl ResolutionSession for JoinSession {
    fn resolve_batch(
        &mut self,
        pending: &[Reference],
        precedence: AliasPrecedence,
    ) -> TrellisResult<Vec<ResolutionOutcome>> {
        let plans: Vec<_> = pending
            .iter()
            .map(|reference| candidate_plan(reference, precedence))
            .collect();

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM pending_keys;", [])?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO pending_keys (slot, tier, lookup, distance, suffix) \
                 VALUES (?1, ?2, ?3, ?4, ?5);",
            )?;
            for (slot, plan) in plans.iter().enumerate() {
                for key in &plan.exact {
                    insert.execute(params![
                        slot as i64,
                        "exact",
                        key.key,
                        key.distance,
                        Option::<String>::None
                    ])?;
                }
                if let (Some(name), Some(suffix)) =
                    (plan.global_name(), plan.global_suffix.as_deref())
                {
                    insert.execute(params![slot as i64, "global", name, 0u32, suffix])?;
                }
            }
        }

        let mut hits: Vec<CandidateHits> = vec![CandidateHits::default(); pending.len()];
        {
            let mut stmt = tx.prepare_cached(MATCH_SQL)?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    DefinitionCandidate {
                        id: row.get(3)?,
                        qualified_name: row.get(4)?,
                        name: row.get(5)?,
                        file_path: row.get(6)?,
                        indexed_seq: row.get(7)?,
                    },
                ))
            })?;
            for row in rows {
                let (slot, tier, distance, candidate) = row?;
                let Some(slot_hits) = hits.get_mut(slot as usize) else {
                    continue;
                };
                if tier == "exact" {
                    slot_hits.exact.push((candidate, distance));
                } else {
                    slot_hits.global.push(candidate);
                }
            }
        }
        tx.execute("DELETE FROM pending_keys;", [])?;
        tx.commit()?;

        debug!("Join strategy matched a batch of {}", pending.len());
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

impl ResolutionStrategy for JoinStrategy {
    fn kind(&self) -> ResolutionStrategyKind {
        ResolutionStrategyKind::Join
    }

    fn prepare<'s>(
        &'s self,
        store: &'s GraphStore,
    ) -> TrellisResult<Box<dyn ResolutionSession + 's>> {
        Ok(Box::new(JoinSession::new(store.connect_internal()?)?))
    }
}
