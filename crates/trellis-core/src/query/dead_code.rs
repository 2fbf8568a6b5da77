//! Dead-code analysis: reachability over CALLS edges from entry points.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{TrellisError, TrellisResult};
use crate::models::{Definition, DefinitionKind, EdgeKind, RunPhase};
use crate::query::graph::live_definitions_full;
use crate::query::guards::MAX_ENTRY_POINTS;
use crate::store::database::GraphStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadCodeOptions {
    /// Definition ids or qualified names.
    pub entry_points: Vec<String>,
    /// Kinds reported when unreachable.
    pub kinds: Vec<DefinitionKind>,
}

impl DeadCodeOptions {
    pub fn new(entry_points: Vec<String>) -> Self {
        Self {
            entry_points,
            kinds: vec![
                DefinitionKind::Function,
                DefinitionKind::Method,
                DefinitionKind::Class,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadDefinition {
    pub id: String,
    pub qualified_name: String,
    pub kind: DefinitionKind,
    pub file_path: String,
    pub start_line: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadCodeReport {
    pub entry_points: Vec<String>,
    pub unknown_entry_points: Vec<String>,
    pub analyzed: usize,
    pub reachable: usize,
    pub dead: Vec<DeadDefinition>,
}

/// Traversal state over the live graph.
struct CallGraph<'d> {
    by_id: HashMap<&'d str, &'d Definition>,
    calls: HashMap<String, Vec<String>>,
    /// base class id -> direct subclass ids
    subclasses: HashMap<String, Vec<String>>,
    /// (type id, method name) -> method ids
    methods: HashMap<(&'d str, &'d str), Vec<&'d str>>,
}

impl<'d> CallGraph<'d> {
    fn load(store: &GraphStore, definitions: &'d [Definition]) -> TrellisResult<Self> {
        let by_id: HashMap<&str, &Definition> =
            definitions.iter().map(|d| (d.id.as_str(), d)).collect();

        let mut calls: HashMap<String, Vec<String>> = HashMap::new();
        for (source, target) in store.edges_of_kind(EdgeKind::Calls)? {
            calls.entry(source).or_default().push(target);
        }
        let mut subclasses: HashMap<String, Vec<String>> = HashMap::new();
        for (sub, base) in store.edges_of_kind(EdgeKind::Extends)? {
            subclasses.entry(base).or_default().push(sub);
        }
        let mut methods: HashMap<(&str, &str), Vec<&str>> = HashMap::new();
        for def in definitions {
            if def.kind != DefinitionKind::Method {
                continue;
            }
            if let Some(parent) = def.parent_id.as_deref() {
                methods
                    .entry((parent, def.name.as_str()))
                    .or_default()
                    .push(def.id.as_str());
            }
        }
        Ok(Self {
            by_id,
            calls,
            subclasses,
            methods,
        })
    }

    /// Methods in transitive subclasses of `method`'s type that share its
    /// simple name.
    fn overrides_of(&self, method: &Definition) -> Vec<String> {
        let Some(owner) = method.parent_id.as_deref() else {
            return Vec::new();
        };
        if !self
            .by_id
            .get(owner)
            .map(|d| d.kind.is_type_like())
            .unwrap_or(false)
        {
            return Vec::new();
        }

        let mut found = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut seen: HashSet<&str> = HashSet::new();
        queue.push_back(owner);
        seen.insert(owner);
        while let Some(current) = queue.pop_front() {
            for sub in self.subclasses.get(current).into_iter().flatten() {
                if !seen.insert(sub.as_str()) {
                    continue;
                }
                if let Some(ids) = self.methods.get(&(sub.as_str(), method.name.as_str())) {
                    found.extend(ids.iter().map(|id| id.to_string()));
                }
                queue.push_back(sub.as_str());
            }
        }
        found
    }

    fn reachable_from(&self, entries: &[String]) -> HashSet<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for entry in entries {
            if visited.insert(entry.clone()) {
                queue.push_back(entry.clone());
            }
        }

        while let Some(current) = queue.pop_front() {
            let mut next: Vec<String> = self.calls.get(&current).cloned().unwrap_or_default();
            if let Some(def) = self.by_id.get(current.as_str()) {
                if def.kind == DefinitionKind::Method {
                    next.extend(self.overrides_of(def));
                }
            }
            for id in next {
                if visited.insert(id.clone()) {
                    queue.push_back(id);
                }
            }
        }
        visited
    }
}

/// Report analyzed definitions that no entry point reaches.
///
/// Refuses to run while an indexing run is in progress.
pub fn find_dead_code(store: &GraphStore, options: &DeadCodeOptions) -> TrellisResult<DeadCodeReport> {
    let phase = store.run_phase()?;
    if phase != RunPhase::Idle.as_str() {
        return Err(TrellisError::RunInProgress(phase));
    }
    if options.entry_points.len() as i64 > MAX_ENTRY_POINTS {
        return Err(TrellisError::Config(format!(
            "at most {MAX_ENTRY_POINTS} entry points are supported, got {}",
            options.entry_points.len()
        )));
    }

    let definitions = live_definitions_full(store)?;
    let graph = CallGraph::load(store, &definitions)?;

    let mut entries: Vec<String> = Vec::new();
    let mut unknown: Vec<String> = Vec::new();
    for entry in &options.entry_points {
        if graph.by_id.contains_key(entry.as_str()) {
            entries.push(entry.clone());
            continue;
        }
        let matched: Vec<String> = definitions
            .iter()
            .filter(|d| &d.qualified_name == entry)
            .map(|d| d.id.clone())
            .collect();
        if matched.is_empty() {
            unknown.push(entry.clone());
        } else {
            entries.extend(matched);
        }
    }
    entries.sort();
    entries.dedup();

    let reachable = graph.reachable_from(&entries);
    let analyzed: Vec<&Definition> = definitions
        .iter()
        .filter(|d| options.kinds.contains(&d.kind))
        .collect();
    let mut dead: Vec<DeadDefinition> = analyzed
        .iter()
        .filter(|d| !reachable.contains(&d.id))
        .map(|d| DeadDefinition {
            id: d.id.clone(),
            qualified_name: d.qualified_name.clone(),
            kind: d.kind,
            file_path: d.file_path.clone(),
            start_line: d.start_line,
        })
        .collect();
    dead.sort_by(|a, b| {
        (a.file_path.as_str(), a.start_line, a.id.as_str())
            .cmp(&(b.file_path.as_str(), b.start_line, b.id.as_str()))
    });

    debug!(
        "Dead-code pass: {} entry points, {} reachable, {} dead",
        entries.len(),
        reachable.len(),
        dead.len()
    );
    Ok(DeadCodeReport {
        entry_points: entries,
        unknown_entry_points: unknown,
        analyzed: analyzed.len(),
        reachable: reachable.len(),
        dead,
    })
}
