//! Call graph resolution rules shared by every resolution strategy.
//!
//! Candidate generation turns one reference into an ordered list of
//! qualified-name keys (alias-expanded, local, then the enclosing chain
//! outward) plus an optional global suffix fallback. Ranking is total:
//! same file > nearest scope > most recent > identifier order. Strategies
//! differ only in how they look keys up, never in how they choose.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::AliasPrecedence;
use crate::models::{last_segment, parent_scope, Reference};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One exact qualified-name key with its scope distance (0 = innermost).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateKey {
    pub key: String,
    pub distance: u32,
}

/// Keys to probe for one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePlan {
    pub exact: Vec<CandidateKey>,
    /// Consulted only when no exact key matched: definitions whose qualified
    /// name equals this or ends with `.` + this.
    pub global_suffix: Option<String>,
}

impl CandidatePlan {
    /// Simple name used to look up global-tier candidates.
    pub fn global_name(&self) -> Option<&str> {
        self.global_suffix.as_deref().map(last_segment)
    }
}

/// The slice of a definition that resolution needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionCandidate {
    pub id: String,
    pub qualified_name: String,
    pub name: String,
    pub file_path: String,
    pub indexed_seq: i64,
}

/// Raw lookup results for one reference, in any order.
#[derive(Debug, Clone, Default)]
pub struct CandidateHits {
    pub exact: Vec<(DefinitionCandidate, u32)>,
    pub global: Vec<DefinitionCandidate>,
}

/// Rule that separated the winner from the runner-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakRule {
    SameFile,
    ScopeDistance,
    Recency,
    IdentifierOrder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedCandidate {
    pub candidate: DefinitionCandidate,
    pub same_file: bool,
    pub distance: u32,
}

impl RankedCandidate {
    fn sort_key(&self) -> (bool, u32, Reverse<i64>, &str) {
        (
            !self.same_file,
            self.distance,
            Reverse(self.candidate.indexed_seq),
            self.candidate.id.as_str(),
        )
    }
}

/// Outcome of ranking. `ranked` is best-first; `decided_by` is set only
/// when more than one candidate was considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub ranked: Vec<RankedCandidate>,
    pub decided_by: Option<TieBreakRule>,
}

impl Decision {
    pub fn winner(&self) -> Option<&DefinitionCandidate> {
        self.ranked.first().map(|r| &r.candidate)
    }
}

// ---------------------------------------------------------------------------
// Candidate generation
// ---------------------------------------------------------------------------

/// Build the probe plan for a reference.
///
/// A leading segment bound as an import alias is replaced by its target; a
/// leading segment bound locally is qualified by its declaring scope and
/// never falls back to the global tier. Under [`AliasPrecedence::LocalFirst`]
/// a local binding shadows an alias of the same name.
pub fn candidate_plan(reference: &Reference, precedence: AliasPrecedence) -> CandidatePlan {
    let raw = reference.raw_name.trim();
    let (head, rest) = match raw.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (raw, None),
    };
    let scope = &reference.scope;
    let local = scope.locals.get(head);
    let alias = scope.aliases.get(head);

    let use_alias = match (local, alias, precedence) {
        (_, Some(_), AliasPrecedence::AliasFirst) => true,
        (None, Some(_), AliasPrecedence::LocalFirst) => true,
        _ => false,
    };

    let mut exact: Vec<CandidateKey> = Vec::new();
    let mut push = |key: String, distance: u32| {
        if !exact.iter().any(|k| k.key == key) {
            exact.push(CandidateKey { key, distance });
        }
    };

    if use_alias {
        let target = alias.map(String::as_str).unwrap_or(head);
        let expanded = match rest {
            Some(rest) => format!("{target}.{rest}"),
            None => target.to_string(),
        };
        push(expanded.clone(), 0);
        return CandidatePlan {
            exact,
            global_suffix: Some(expanded),
        };
    }

    if let Some(declaring) = local {
        push(format!("{declaring}.{raw}"), 0);
        return CandidatePlan {
            exact,
            global_suffix: None,
        };
    }

    for (distance, enclosing) in scope.enclosing.iter().rev().enumerate() {
        push(format!("{enclosing}.{raw}"), distance as u32);
    }
    push(raw.to_string(), scope.enclosing.len() as u32);
    CandidatePlan {
        exact,
        global_suffix: Some(raw.to_string()),
    }
}

/// True when `qualified_name` is `suffix` or ends with `.` + `suffix`.
pub fn suffix_matches(qualified_name: &str, suffix: &str) -> bool {
    if qualified_name == suffix {
        return true;
    }
    qualified_name.len() > suffix.len()
        && qualified_name.ends_with(suffix)
        && qualified_name.as_bytes()[qualified_name.len() - suffix.len() - 1] == b'.'
}

/// Scope distance for a global-tier candidate: how many scopes one climbs
/// from the mention before sharing a prefix with the candidate's scope.
pub fn global_distance(reference: &Reference, candidate_qualified_name: &str) -> u32 {
    let innermost: Vec<&str> = reference
        .scope
        .innermost()
        .map(|s| s.split('.').collect())
        .unwrap_or_default();
    let candidate_scope: Vec<&str> = parent_scope(candidate_qualified_name)
        .map(|s| s.split('.').collect())
        .unwrap_or_default();
    let common = innermost
        .iter()
        .zip(candidate_scope.iter())
        .take_while(|(a, b)| a == b)
        .count();
    (innermost.len() - common) as u32
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

fn separating_rule(best: &RankedCandidate, second: &RankedCandidate) -> TieBreakRule {
    if best.same_file != second.same_file {
        TieBreakRule::SameFile
    } else if best.distance != second.distance {
        TieBreakRule::ScopeDistance
    } else if best.candidate.indexed_seq != second.candidate.indexed_seq {
        TieBreakRule::Recency
    } else {
        TieBreakRule::IdentifierOrder
    }
}

/// Rank lookup hits for a reference. Exact-tier hits shadow the global
/// tier entirely. Global hits are re-filtered by suffix here so every
/// strategy applies the identical predicate.
pub fn decide(reference: &Reference, plan: &CandidatePlan, hits: CandidateHits) -> Decision {
    let mut by_id: BTreeMap<String, RankedCandidate> = BTreeMap::new();
    let mut admit = |candidate: DefinitionCandidate, distance: u32| {
        let same_file = candidate.file_path == reference.file_path;
        match by_id.get_mut(&candidate.id) {
            Some(existing) if existing.distance <= distance => {}
            Some(existing) => existing.distance = distance,
            None => {
                by_id.insert(
                    candidate.id.clone(),
                    RankedCandidate {
                        candidate,
                        same_file,
                        distance,
                    },
                );
            }
        }
    };

    if !hits.exact.is_empty() {
        for (candidate, distance) in hits.exact {
            admit(candidate, distance);
        }
    } else if let Some(suffix) = plan.global_suffix.as_deref() {
        for candidate in hits.global {
            if suffix_matches(&candidate.qualified_name, suffix) {
                let distance = global_distance(reference, &candidate.qualified_name);
                admit(candidate, distance);
            }
        }
    }

    let mut ranked: Vec<RankedCandidate> = by_id.into_values().collect();
    ranked.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    let decided_by = if ranked.len() > 1 {
        Some(separating_rule(&ranked[0], &ranked[1]))
    } else {
        None
    };
    Decision { ranked, decided_by }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
