//! Read API over the stored graph.

use std::collections::BTreeMap;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::errors::TrellisResult;
use crate::models::{Definition, DefinitionKind, EdgeKind, EdgeRecord, Reference, ReferenceState};
use crate::store::database::{
    definition_from_row, edge_from_row, reference_from_row, GraphStore, DEFINITION_COLUMNS,
    EDGE_COLUMNS, REFERENCE_COLUMNS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub files: usize,
    pub failed_files: usize,
    pub definitions: usize,
    pub definitions_by_kind: BTreeMap<String, usize>,
    pub references_by_state: BTreeMap<String, usize>,
    pub edges_by_kind: BTreeMap<String, usize>,
}

/// Live definition by id.
pub fn get_definition(store: &GraphStore, id: &str) -> TrellisResult<Option<Definition>> {
    let conn = store.connect_internal()?;
    let sql =
        format!("SELECT {DEFINITION_COLUMNS} FROM definitions WHERE id = ?1 AND tombstoned = 0;");
    match conn.query_row(&sql, params![id], definition_from_row) {
        Ok(def) => Ok(Some(def)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Live definitions with this qualified name, one per owning file at most.
pub fn definitions_by_qualified_name(
    store: &GraphStore,
    qualified_name: &str,
) -> TrellisResult<Vec<Definition>> {
    let conn = store.connect_internal()?;
    let sql = format!(
        "SELECT {DEFINITION_COLUMNS} FROM definitions \
         WHERE qualified_name = ?1 AND tombstoned = 0 ORDER BY file_path, id;"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![qualified_name], definition_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn live_definitions_full(store: &GraphStore) -> TrellisResult<Vec<Definition>> {
    let conn = store.connect_internal()?;
    let sql =
        format!("SELECT {DEFINITION_COLUMNS} FROM definitions WHERE tombstoned = 0 ORDER BY id;");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], definition_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Edges touching `node_id`, optionally of one kind.
pub fn edges(
    store: &GraphStore,
    node_id: &str,
    direction: Direction,
    kind: Option<EdgeKind>,
) -> TrellisResult<Vec<EdgeRecord>> {
    let conn = store.connect_internal()?;
    let endpoint = match direction {
        Direction::Outgoing => "source_id",
        Direction::Incoming => "target_id",
    };
    let kind_filter = if kind.is_some() { "AND kind = ?2" } else { "" };
    let sql = format!(
        "SELECT {EDGE_COLUMNS} FROM edges WHERE {endpoint} = ?1 {kind_filter} \
         ORDER BY kind, source_id, target_id, reference_id;"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = match kind {
        Some(kind) => stmt
            .query_map(params![node_id, kind.as_str()], edge_from_row)?
            .collect::<Result<Vec<_>, _>>()?,
        None => stmt
            .query_map(params![node_id], edge_from_row)?
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(rows)
}

pub fn references_by_state(
    store: &GraphStore,
    state: ReferenceState,
) -> TrellisResult<Vec<Reference>> {
    let conn = store.connect_internal()?;
    let sql = format!("SELECT {REFERENCE_COLUMNS} FROM refs WHERE state = ?1 ORDER BY id;");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![state.as_str()], reference_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Public top-level functions and classes, plus anything named `main`.
pub fn entry_point_candidates(store: &GraphStore) -> TrellisResult<Vec<Definition>> {
    Ok(live_definitions_full(store)?
        .into_iter()
        .filter(|def| {
            let top_level = def.scope_chain.len() == 1
                && matches!(def.kind, DefinitionKind::Function | DefinitionKind::Class)
                && def.visibility == "public";
            top_level || (def.name == "main" && def.kind != DefinitionKind::Module)
        })
        .collect())
}

fn grouped_counts(
    conn: &rusqlite::Connection,
    sql: &str,
) -> TrellisResult<BTreeMap<String, usize>> {
    let mut stmt = conn.prepare(sql)?;
    let rows: BTreeMap<String, usize> = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .map(|row| row.map(|(key, count)| (key, count as usize)))
        .collect::<Result<_, _>>()?;
    Ok(rows)
}

pub fn graph_stats(store: &GraphStore) -> TrellisResult<GraphStats> {
    let conn = store.connect_internal()?;
    let files: i64 = conn.query_row(
        "SELECT COUNT(*) FROM files WHERE status != 'deleted';",
        [],
        |row| row.get(0),
    )?;
    let failed_files: i64 = conn.query_row(
        "SELECT COUNT(*) FROM files WHERE status = 'extraction_failed';",
        [],
        |row| row.get(0),
    )?;
    let definitions_by_kind = grouped_counts(
        &conn,
        "SELECT kind, COUNT(*) FROM definitions WHERE tombstoned = 0 GROUP BY kind;",
    )?;
    Ok(GraphStats {
        files: files as usize,
        failed_files: failed_files as usize,
        definitions: definitions_by_kind.values().sum(),
        definitions_by_kind,
        references_by_state: grouped_counts(
            &conn,
            "SELECT state, COUNT(*) FROM refs GROUP BY state;",
        )?,
        edges_by_kind: grouped_counts(&conn, "SELECT kind, COUNT(*) FROM edges GROUP BY kind;")?,
    })
}
