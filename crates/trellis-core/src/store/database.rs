//! SQLite graph store.
//!
//! Each public method opens its own connection, so the store can be shared
//! across worker threads by reference. `merge_file` and `tombstone_file`
//! run inside one IMMEDIATE transaction each: a file's view is either fully
//! old or fully new. Operations on the same file are additionally
//! serialized through a per-file lock; distinct files proceed concurrently
//! and SQLite orders their write transactions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{TrellisError, TrellisResult};
use crate::indexer::callgraph::DefinitionCandidate;
use crate::indexer::pipeline::ExtractionJob;
use crate::indexer::symbols::FileExtraction;
use crate::models::{
    file_node_id, last_segment, ChangeKind, Definition, EdgeKind, EdgeRecord, FileNode, FileStatus,
    Reference, ReferenceState,
};
use crate::query::guards::{MAX_RETRY_BACKOFF_MS, SQL_IN_CHUNK};
use crate::resolution::{ResolutionOutcome, Verdict};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Helper: tilde expansion
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if text == "~" || text.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if text.len() > 2 {
                expanded.push(&text[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

// ---------------------------------------------------------------------------
// Helper: typed column decoding
// ---------------------------------------------------------------------------

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = TrellisError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) const DEFINITION_COLUMNS: &str = "id, kind, name, qualified_name, file_path, language, \
     start_line, end_line, content_hash, scope_chain, parent_id, visibility, indexed_seq";

pub(crate) const REFERENCE_COLUMNS: &str =
    "id, file_path, source_id, raw_name, kind, scope_json, lookup_name, line, state, target_id";

pub(crate) const FILE_COLUMNS: &str =
    "path, language, content_hash, last_commit, status, failure_message";

pub(crate) const EDGE_COLUMNS: &str =
    "source_id, target_id, kind, file_path, reference_id, created_seq";

pub(crate) fn definition_from_row(row: &Row<'_>) -> rusqlite::Result<Definition> {
    Ok(Definition {
        id: row.get(0)?,
        kind: parse_column(row, 1)?,
        name: row.get(2)?,
        qualified_name: row.get(3)?,
        file_path: row.get(4)?,
        language: row.get(5)?,
        start_line: row.get(6)?,
        end_line: row.get(7)?,
        content_hash: row.get(8)?,
        scope_chain: json_column(row, 9)?,
        parent_id: row.get(10)?,
        visibility: row.get(11)?,
        indexed_seq: row.get(12)?,
    })
}

pub(crate) fn reference_from_row(row: &Row<'_>) -> rusqlite::Result<Reference> {
    Ok(Reference {
        id: row.get(0)?,
        file_path: row.get(1)?,
        source_id: row.get(2)?,
        raw_name: row.get(3)?,
        kind: parse_column(row, 4)?,
        scope: json_column(row, 5)?,
        lookup_name: row.get(6)?,
        line: row.get(7)?,
        state: parse_column(row, 8)?,
        target_id: row.get(9)?,
    })
}

pub(crate) fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileNode> {
    Ok(FileNode {
        path: row.get(0)?,
        language: row.get(1)?,
        content_hash: row.get(2)?,
        last_commit: row.get(3)?,
        status: parse_column(row, 4)?,
        failure_message: row.get(5)?,
    })
}

pub(crate) fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<EdgeRecord> {
    let reference_id: String = row.get(4)?;
    Ok(EdgeRecord {
        source_id: row.get(0)?,
        target_id: row.get(1)?,
        kind: parse_column(row, 2)?,
        file_path: row.get(3)?,
        reference_id: if reference_id.is_empty() {
            None
        } else {
            Some(reference_id)
        },
        created_seq: row.get(5)?,
    })
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

// ---------------------------------------------------------------------------
// Store outcomes
// ---------------------------------------------------------------------------

/// What one `merge_file` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub path: String,
    /// The file's own references, now Unresolved placeholders.
    pub pending: Vec<String>,
    /// References in other files whose target was removed.
    pub reflagged: Vec<String>,
    pub removed_definitions: Vec<String>,
    /// Simple names of definitions that were not live before this merge.
    pub added_names: BTreeSet<String>,
    pub tombstoned_references: usize,
}

/// What one `tombstone_file` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TombstoneOutcome {
    pub path: String,
    pub reflagged: Vec<String>,
    pub removed_definitions: Vec<String>,
    pub tombstoned_references: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedCounts {
    pub resolved: usize,
    pub external_unresolved: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    pub definitions: usize,
    pub references: usize,
    pub files: usize,
    pub edges: usize,
}

/// A file change a run could not apply, kept for the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredChange {
    pub path: String,
    pub change_kind: ChangeKind,
    /// Unified AST content for upserts; `None` for deletions.
    pub content: Option<String>,
    pub commit_hash: Option<String>,
    pub reason: String,
    pub deferred_seq: i64,
}

impl DeferredChange {
    pub fn upsert(job: &ExtractionJob, reason: &str, seq: i64) -> Self {
        Self {
            path: job.file.path.clone(),
            change_kind: ChangeKind::Modified,
            content: Some(job.content.clone()),
            commit_hash: job.file.last_commit.clone(),
            reason: reason.to_string(),
            deferred_seq: seq,
        }
    }

    pub fn deletion(path: &str, reason: &str, seq: i64) -> Self {
        Self {
            path: path.to_string(),
            change_kind: ChangeKind::Deleted,
            content: None,
            commit_hash: None,
            reason: reason.to_string(),
            deferred_seq: seq,
        }
    }
}

/// Deterministic dump of the graph tables, ordered by natural keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub files: Vec<FileNode>,
    pub definitions: Vec<Definition>,
    pub references: Vec<Reference>,
    pub edges: Vec<EdgeRecord>,
}

/// Retry policy for SQLITE_BUSY / SQLITE_LOCKED write conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub busy_timeout_ms: u64,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_ms: 10,
            busy_timeout_ms: 5000,
        }
    }
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

/// SQLite-backed authoritative node/edge repository.
pub struct GraphStore {
    db_path: PathBuf,
    policy: WritePolicy,
    file_locks: Vec<Mutex<()>>,
}

/// Per-file write locks are striped so their number stays fixed.
const FILE_LOCK_STRIPES: usize = 64;

impl GraphStore {
    /// Create a store handle. The path is expanded and parent directories
    /// are created if they do not already exist.
    pub fn open(db_path: impl AsRef<Path>) -> TrellisResult<Self> {
        let expanded = expand_tilde(db_path.as_ref());
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(&expanded)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            db_path: resolved,
            policy: WritePolicy::default(),
            file_locks: (0..FILE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a new SQLite connection, enable `foreign_keys`, and apply the
    /// busy timeout.
    fn connect(&self) -> TrellisResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_millis(self.policy.busy_timeout_ms))?;
        Ok(conn)
    }

    /// Public alias for internal connect, used by query engines and the
    /// join strategy.
    pub fn connect_internal(&self) -> TrellisResult<Connection> {
        self.connect()
    }

    /// Lock serializing writes to `path`. Distinct paths may share a
    /// stripe; the same path always maps to the same one.
    fn file_lock(&self, path: &str) -> &Mutex<()> {
        let stripe = crc32fast::hash(path.as_bytes()) as usize % self.file_locks.len();
        &self.file_locks[stripe]
    }

    /// Run `op`, retrying busy/locked failures with exponential backoff.
    /// Exhausted retries surface as [`TrellisError::WriteConflict`].
    fn with_retry<T>(
        &self,
        path: &str,
        mut op: impl FnMut() -> TrellisResult<T>,
    ) -> TrellisResult<T> {
        let attempts = self.policy.attempts.max(1);
        let mut delay = self.policy.backoff_ms;
        for attempt in 1..=attempts {
            match op() {
                Err(e) if e.is_busy() => {
                    if attempt == attempts {
                        break;
                    }
                    warn!("Write conflict on {path} (attempt {attempt}/{attempts}): {e}");
                    std::thread::sleep(Duration::from_millis(delay));
                    delay = (delay.max(1) * 2).min(MAX_RETRY_BACKOFF_MS as u64);
                }
                other => return other,
            }
        }
        Err(TrellisError::WriteConflict {
            path: path.to_string(),
            attempts,
        })
    }

    // -- private helpers -----------------------------------------------------

    fn _set_repo_meta(conn: &Connection, key: &str, value: &str) -> TrellisResult<()> {
        conn.execute(
            "INSERT INTO repo_meta(key, value) VALUES(?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    fn _get_repo_meta(conn: &Connection, key: &str) -> TrellisResult<Option<String>> {
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM repo_meta WHERE key = ?1 LIMIT 1;",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn _query_ids(conn: &Connection, sql: &str, key: &str) -> TrellisResult<Vec<String>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let ids: Vec<String> = stmt
            .query_map(params![key], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    fn _insert_placeholder(conn: &Connection, reference: &Reference) -> TrellisResult<()> {
        let scope_json = serde_json::to_string(&reference.scope)?;
        conn.execute(
            "DELETE FROM edges WHERE reference_id = ?1;",
            params![reference.id],
        )?;
        conn.prepare_cached(
            "INSERT INTO refs (id, file_path, source_id, raw_name, raw_tail, kind, scope_json, \
                 lookup_name, line, state, target_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'unresolved', NULL) \
             ON CONFLICT(id) DO UPDATE SET \
                 file_path = excluded.file_path, \
                 source_id = excluded.source_id, \
                 raw_name = excluded.raw_name, \
                 raw_tail = excluded.raw_tail, \
                 kind = excluded.kind, \
                 scope_json = excluded.scope_json, \
                 lookup_name = excluded.lookup_name, \
                 line = excluded.line, \
                 state = 'unresolved', \
                 target_id = NULL;",
        )?
        .execute(params![
            reference.id,
            reference.file_path,
            reference.source_id,
            reference.raw_name,
            last_segment(&reference.raw_name),
            reference.kind.as_str(),
            scope_json,
            reference.lookup_name,
            reference.line,
        ])?;
        Ok(())
    }

    /// Reset resolved references that targeted any of `definition_ids`,
    /// skipping those owned by `except_file`. Returns their ids.
    fn _reflag_targeting(
        conn: &Connection,
        definition_ids: &[String],
        except_file: &str,
    ) -> TrellisResult<Vec<String>> {
        let mut reflagged = Vec::new();
        for chunk in definition_ids.chunks(SQL_IN_CHUNK) {
            let sql = format!(
                "SELECT id FROM refs WHERE state = 'resolved' AND file_path != ? \
                 AND target_id IN ({}) ORDER BY id;",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let bind = std::iter::once(except_file.to_string()).chain(chunk.iter().cloned());
            let ids: Vec<String> = stmt
                .query_map(params_from_iter(bind), |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            reflagged.extend(ids);
        }
        let mut reset = conn.prepare_cached(
            "UPDATE refs SET state = 'unresolved', target_id = NULL WHERE id = ?1;",
        )?;
        let mut drop_edge = conn.prepare_cached("DELETE FROM edges WHERE reference_id = ?1;")?;
        for id in &reflagged {
            reset.execute(params![id])?;
            drop_edge.execute(params![id])?;
        }
        Ok(reflagged)
    }

    fn _materialize(
        conn: &Connection,
        reference_id: &str,
        target_id: &str,
        seq: i64,
    ) -> TrellisResult<()> {
        let row = conn.query_row(
            "SELECT state, source_id, kind, file_path FROM refs WHERE id = ?1;",
            params![reference_id],
            |row| {
                Ok((
                    parse_column::<ReferenceState>(row, 0)?,
                    row.get::<_, String>(1)?,
                    parse_column::<crate::models::ReferenceKind>(row, 2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        );
        let (state, source_id, kind, file_path) = match row {
            Ok(v) => v,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(TrellisError::NotFound(format!("reference {reference_id}")))
            }
            Err(e) => return Err(e.into()),
        };
        if state != ReferenceState::Unresolved {
            return Err(TrellisError::InvalidTransition {
                reference_id: reference_id.to_string(),
                from: state.to_string(),
                to: ReferenceState::Resolved.to_string(),
            });
        }
        let live: bool = conn
            .prepare_cached("SELECT 1 FROM definitions WHERE id = ?1 AND tombstoned = 0;")?
            .exists(params![target_id])?;
        if !live {
            return Err(TrellisError::NotFound(format!("definition {target_id}")));
        }
        conn.prepare_cached(
            "UPDATE refs SET state = 'resolved', target_id = ?2 WHERE id = ?1;",
        )?
        .execute(params![reference_id, target_id])?;
        conn.prepare_cached(
            "INSERT INTO edges (source_id, target_id, kind, file_path, reference_id, created_seq) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(source_id, target_id, kind, reference_id) DO NOTHING;",
        )?
        .execute(params![
            source_id,
            target_id,
            kind.edge_kind().as_str(),
            file_path,
            reference_id,
            seq
        ])?;
        Ok(())
    }

    fn _mark_external(conn: &Connection, reference_id: &str) -> TrellisResult<()> {
        let state: Result<ReferenceState, _> = conn.query_row(
            "SELECT state FROM refs WHERE id = ?1;",
            params![reference_id],
            |row| parse_column(row, 0),
        );
        match state {
            Ok(ReferenceState::Unresolved) => {}
            Ok(other) => {
                return Err(TrellisError::InvalidTransition {
                    reference_id: reference_id.to_string(),
                    from: other.to_string(),
                    to: ReferenceState::ExternalUnresolved.to_string(),
                })
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(TrellisError::NotFound(format!("reference {reference_id}")))
            }
            Err(e) => return Err(e.into()),
        }
        conn.prepare_cached(
            "UPDATE refs SET state = 'external_unresolved', target_id = NULL WHERE id = ?1;",
        )?
        .execute(params![reference_id])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Schema / meta
    // -----------------------------------------------------------------------

    /// Initialise the database schema: set WAL mode, create all tables and
    /// indexes, then run pending migrations.
    pub fn init_schema(&self) -> TrellisResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    /// Get a single repo_meta value by key, or `None`.
    pub fn get_repo_meta(&self, key: &str) -> TrellisResult<Option<String>> {
        let conn = self.connect()?;
        Self::_get_repo_meta(&conn, key)
    }

    /// Upsert a single repo_meta key/value pair.
    pub fn set_repo_meta(&self, key: &str, value: &str) -> TrellisResult<()> {
        let conn = self.connect()?;
        Self::_set_repo_meta(&conn, key, value)
    }

    // -----------------------------------------------------------------------
    // Run bookkeeping
    // -----------------------------------------------------------------------

    /// Allocate the next run sequence number and open its history row.
    pub fn begin_run(&self, commit_hash: &str, strategy: &str) -> TrellisResult<i64> {
        self.with_retry("<run>", || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = Self::_get_repo_meta(&tx, "run_seq")?
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            let next = current + 1;
            Self::_set_repo_meta(&tx, "run_seq", &next.to_string())?;
            tx.execute(
                "INSERT INTO run_history (seq, commit_hash, strategy) VALUES (?1, ?2, ?3);",
                params![next, commit_hash, strategy],
            )?;
            tx.commit()?;
            Ok(next)
        })
    }

    pub fn finish_run(&self, seq: i64, status: &str, report_json: &str) -> TrellisResult<()> {
        self.with_retry("<run>", || {
            let conn = self.connect()?;
            conn.execute(
                "UPDATE run_history SET status = ?2, report_json = ?3, \
                     finished_at = CURRENT_TIMESTAMP WHERE seq = ?1;",
                params![seq, status, report_json],
            )?;
            Ok(())
        })
    }

    /// Report JSON of the most recent finished run.
    pub fn last_report_json(&self) -> TrellisResult<Option<String>> {
        let conn = self.connect()?;
        let result = conn.query_row(
            "SELECT report_json FROM run_history WHERE report_json IS NOT NULL \
             ORDER BY seq DESC LIMIT 1;",
            [],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn run_phase(&self) -> TrellisResult<String> {
        Ok(self
            .get_repo_meta("run_phase")?
            .unwrap_or_else(|| "idle".to_string()))
    }

    pub fn set_run_phase(&self, phase: &str) -> TrellisResult<()> {
        self.with_retry("<run>", || self.set_repo_meta("run_phase", phase))
    }

    /// Persist names whose ExternalUnresolved references must be re-checked
    /// by the next run.
    pub fn add_recheck_names(&self, names: &BTreeSet<String>, seq: i64) -> TrellisResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.with_retry("<recheck>", || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO pending_recheck (name, added_seq) VALUES (?1, ?2) \
                     ON CONFLICT(name) DO UPDATE SET added_seq = excluded.added_seq;",
                )?;
                for name in names {
                    stmt.execute(params![name, seq])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Drain the persisted re-check names.
    pub fn take_recheck_names(&self) -> TrellisResult<BTreeSet<String>> {
        self.with_retry("<recheck>", || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let names: BTreeSet<String> = {
                let mut stmt = tx.prepare("SELECT name FROM pending_recheck ORDER BY name;")?;
                let rows: BTreeSet<String> = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                rows
            };
            tx.execute("DELETE FROM pending_recheck;", [])?;
            tx.commit()?;
            Ok(names)
        })
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    pub fn get_file(&self, path: &str) -> TrellisResult<Option<FileNode>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?1;");
        match conn.query_row(&sql, params![path], file_from_row) {
            Ok(file) => Ok(Some(file)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_files(&self, status: Option<FileStatus>) -> TrellisResult<Vec<FileNode>> {
        let conn = self.connect()?;
        let files = match status {
            Some(status) => {
                let sql =
                    format!("SELECT {FILE_COLUMNS} FROM files WHERE status = ?1 ORDER BY path;");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![status.as_str()], file_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!("SELECT {FILE_COLUMNS} FROM files ORDER BY path;");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], file_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(files)
    }

    /// Files that failed extraction, with the content kept for retry.
    pub fn failed_files(&self) -> TrellisResult<Vec<(FileNode, Option<String>)>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {FILE_COLUMNS}, pending_content FROM files \
             WHERE status = 'extraction_failed' ORDER BY path;"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((file_from_row(row)?, row.get::<_, Option<String>>(6)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record an extraction failure. A previously indexed version keeps its
    /// definitions and content hash; the new content is kept for retry.
    pub fn mark_extraction_failed(
        &self,
        file: &FileNode,
        message: &str,
        content: Option<&str>,
        seq: i64,
    ) -> TrellisResult<()> {
        let lock = self.file_lock(&file.path);
        let _guard = lock.lock();
        self.with_retry(&file.path, || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO files (path, language, content_hash, last_commit, status, \
                     failure_message, pending_content, indexed_seq) \
                 VALUES (?1, ?2, ?3, ?4, 'extraction_failed', ?5, ?6, ?7) \
                 ON CONFLICT(path) DO UPDATE SET \
                     status = 'extraction_failed', \
                     failure_message = excluded.failure_message, \
                     pending_content = excluded.pending_content;",
                params![
                    file.path,
                    file.language,
                    file.content_hash,
                    file.last_commit,
                    message,
                    content,
                    seq
                ],
            )?;
            Self::_clear_deferred(&tx, &file.path)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Keep a change this run could not apply. A later change to the same
    /// path replaces it.
    pub fn defer_change(&self, change: &DeferredChange) -> TrellisResult<()> {
        self.with_retry(&change.path, || {
            let conn = self.connect()?;
            conn.execute(
                "INSERT INTO deferred_changes \
                     (path, change_kind, content, commit_hash, reason, deferred_seq) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(path) DO UPDATE SET \
                     change_kind = excluded.change_kind, \
                     content = excluded.content, \
                     commit_hash = excluded.commit_hash, \
                     reason = excluded.reason, \
                     deferred_seq = excluded.deferred_seq;",
                params![
                    change.path,
                    change.change_kind.as_str(),
                    change.content,
                    change.commit_hash,
                    change.reason,
                    change.deferred_seq
                ],
            )?;
            Ok(())
        })
    }

    /// Changes deferred by earlier runs, ordered by path.
    pub fn deferred_changes(&self) -> TrellisResult<Vec<DeferredChange>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT path, change_kind, content, commit_hash, reason, deferred_seq \
             FROM deferred_changes ORDER BY path;",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DeferredChange {
                    path: row.get(0)?,
                    change_kind: parse_column(row, 1)?,
                    content: row.get(2)?,
                    commit_hash: row.get(3)?,
                    reason: row.get(4)?,
                    deferred_seq: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop a deferred change whose file already matches the store.
    pub fn clear_deferred(&self, path: &str) -> TrellisResult<()> {
        self.with_retry(path, || {
            let conn = self.connect()?;
            Self::_clear_deferred(&conn, path)
        })
    }

    fn _clear_deferred(conn: &Connection, path: &str) -> TrellisResult<()> {
        conn.execute("DELETE FROM deferred_changes WHERE path = ?1;", params![path])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Graph mutations
    // -----------------------------------------------------------------------

    /// Transactionally replace everything `extraction.file` owns.
    ///
    /// Kept definitions are updated in place (recency only moves when the
    /// content hash changed), removed ones are tombstoned and references
    /// from other files that pointed at them return to Unresolved. The
    /// file's own references become fresh placeholders.
    pub fn merge_file(&self, extraction: &FileExtraction, seq: i64) -> TrellisResult<MergeOutcome> {
        let path = extraction.file.path.clone();
        let lock = self.file_lock(&path);
        let _guard = lock.lock();
        self.with_retry(&path, || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = Self::_merge_file(&tx, extraction, seq)?;
            tx.commit()?;
            Ok(outcome)
        })
    }

    fn _merge_file(
        conn: &Connection,
        extraction: &FileExtraction,
        seq: i64,
    ) -> TrellisResult<MergeOutcome> {
        let file = &extraction.file;
        let path = file.path.as_str();
        let mut outcome = MergeOutcome {
            path: path.to_string(),
            ..MergeOutcome::default()
        };

        conn.execute(
            "INSERT INTO files (path, language, content_hash, last_commit, status, \
                 failure_message, pending_content, indexed_seq) \
             VALUES (?1, ?2, ?3, ?4, 'indexed', NULL, NULL, ?5) \
             ON CONFLICT(path) DO UPDATE SET \
                 language = excluded.language, \
                 content_hash = excluded.content_hash, \
                 last_commit = excluded.last_commit, \
                 status = 'indexed', \
                 failure_message = NULL, \
                 pending_content = NULL, \
                 indexed_seq = excluded.indexed_seq;",
            params![file.path, file.language, file.content_hash, file.last_commit, seq],
        )?;
        Self::_clear_deferred(conn, path)?;

        // -- definitions ------------------------------------------------------
        let old_live: HashSet<String> = Self::_query_ids(
            conn,
            "SELECT id FROM definitions WHERE file_path = ?1 AND tombstoned = 0;",
            path,
        )?
        .into_iter()
        .collect();
        let new_ids: HashSet<&str> = extraction
            .definitions
            .iter()
            .map(|d| d.id.as_str())
            .collect();

        {
            let mut upsert = conn.prepare_cached(
                "INSERT INTO definitions (id, kind, name, qualified_name, file_path, language, \
                     start_line, end_line, content_hash, scope_chain, parent_id, visibility, \
                     indexed_seq, tombstoned) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0) \
                 ON CONFLICT(id) DO UPDATE SET \
                     kind = excluded.kind, \
                     name = excluded.name, \
                     qualified_name = excluded.qualified_name, \
                     language = excluded.language, \
                     start_line = excluded.start_line, \
                     end_line = excluded.end_line, \
                     scope_chain = excluded.scope_chain, \
                     parent_id = excluded.parent_id, \
                     visibility = excluded.visibility, \
                     indexed_seq = CASE \
                         WHEN definitions.content_hash = excluded.content_hash \
                              AND definitions.tombstoned = 0 \
                         THEN definitions.indexed_seq ELSE excluded.indexed_seq END, \
                     content_hash = excluded.content_hash, \
                     tombstoned = 0;",
            )?;
            for def in &extraction.definitions {
                upsert.execute(params![
                    def.id,
                    def.kind.as_str(),
                    def.name,
                    def.qualified_name,
                    def.file_path,
                    def.language,
                    def.start_line,
                    def.end_line,
                    def.content_hash,
                    serde_json::to_string(&def.scope_chain)?,
                    def.parent_id,
                    def.visibility,
                    seq,
                ])?;
                if !old_live.contains(&def.id) {
                    outcome.added_names.insert(def.name.clone());
                }
            }
        }

        let mut removed: Vec<String> = old_live
            .iter()
            .filter(|id| !new_ids.contains(id.as_str()))
            .cloned()
            .collect();
        removed.sort();
        if !removed.is_empty() {
            let mut tombstone =
                conn.prepare_cached("UPDATE definitions SET tombstoned = 1 WHERE id = ?1;")?;
            let mut drop_edges = conn.prepare_cached(
                "DELETE FROM edges WHERE source_id = ?1 OR target_id = ?1;",
            )?;
            for id in &removed {
                tombstone.execute(params![id])?;
                drop_edges.execute(params![id])?;
            }
            outcome.reflagged = Self::_reflag_targeting(conn, &removed, path)?;
        }
        outcome.removed_definitions = removed;

        // -- references -------------------------------------------------------
        let old_refs: Vec<String> = Self::_query_ids(
            conn,
            "SELECT id FROM refs WHERE file_path = ?1 AND state != 'tombstoned';",
            path,
        )?;
        conn.execute(
            "DELETE FROM edges WHERE file_path = ?1 AND kind != 'CONTAINS';",
            params![path],
        )?;
        let mut new_ref_ids: HashSet<&str> = HashSet::new();
        for reference in &extraction.references {
            Self::_insert_placeholder(conn, reference)?;
            new_ref_ids.insert(reference.id.as_str());
            outcome.pending.push(reference.id.clone());
        }
        {
            let mut retire = conn.prepare_cached(
                "UPDATE refs SET state = 'tombstoned', target_id = NULL WHERE id = ?1;",
            )?;
            for id in old_refs.iter().filter(|id| !new_ref_ids.contains(id.as_str())) {
                retire.execute(params![id])?;
                outcome.tombstoned_references += 1;
            }
        }

        // -- CONTAINS edges ---------------------------------------------------
        let existing: HashSet<(String, String)> = {
            let mut stmt = conn.prepare_cached(
                "SELECT source_id, target_id FROM edges \
                 WHERE file_path = ?1 AND kind = 'CONTAINS';",
            )?;
            let rows: HashSet<(String, String)> = stmt
                .query_map(params![path], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;
            rows
        };
        let wanted: HashSet<(String, String)> = extraction.contains.iter().cloned().collect();
        {
            let mut delete = conn.prepare_cached(
                "DELETE FROM edges WHERE source_id = ?1 AND target_id = ?2 AND kind = 'CONTAINS';",
            )?;
            for (source, target) in existing.difference(&wanted) {
                delete.execute(params![source, target])?;
            }
            let mut insert = conn.prepare_cached(
                "INSERT INTO edges (source_id, target_id, kind, file_path, reference_id, created_seq) \
                 VALUES (?1, ?2, 'CONTAINS', ?3, '', ?4) \
                 ON CONFLICT(source_id, target_id, kind, reference_id) DO NOTHING;",
            )?;
            for (source, target) in &extraction.contains {
                insert.execute(params![source, target, path, seq])?;
            }
        }

        debug!(
            "Merged {path}: {} definitions ({} removed), {} references ({} re-flagged elsewhere)",
            extraction.definitions.len(),
            outcome.removed_definitions.len(),
            outcome.pending.len(),
            outcome.reflagged.len()
        );
        Ok(outcome)
    }

    /// Record one Unresolved reference even though its target is unknown.
    pub fn create_placeholder(&self, reference: &Reference) -> TrellisResult<()> {
        let lock = self.file_lock(&reference.file_path);
        let _guard = lock.lock();
        self.with_retry(&reference.file_path, || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            Self::_insert_placeholder(&tx, reference)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Transition an Unresolved reference to Resolved and add its typed edge.
    pub fn materialize_edge(
        &self,
        reference_id: &str,
        target_id: &str,
        seq: i64,
    ) -> TrellisResult<()> {
        self.with_retry(reference_id, || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            Self::_materialize(&tx, reference_id, target_id, seq)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Transition an Unresolved reference to ExternalUnresolved.
    pub fn mark_external(&self, reference_id: &str) -> TrellisResult<()> {
        self.with_retry(reference_id, || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            Self::_mark_external(&tx, reference_id)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Apply a batch of resolution verdicts in one transaction.
    pub fn apply_outcomes(
        &self,
        outcomes: &[ResolutionOutcome],
        seq: i64,
    ) -> TrellisResult<AppliedCounts> {
        if outcomes.is_empty() {
            return Ok(AppliedCounts::default());
        }
        self.with_retry("<resolution>", || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut counts = AppliedCounts::default();
            for outcome in outcomes {
                match &outcome.verdict {
                    Verdict::Resolved { target_id } => {
                        Self::_materialize(&tx, &outcome.reference_id, target_id, seq)?;
                        counts.resolved += 1;
                    }
                    Verdict::External => {
                        Self::_mark_external(&tx, &outcome.reference_id)?;
                        counts.external_unresolved += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(counts)
        })
    }

    /// Remove a file's definitions and references, cascade to dependent
    /// edges, and re-flag references from other files that pointed into it.
    pub fn tombstone_file(&self, path: &str) -> TrellisResult<TombstoneOutcome> {
        let lock = self.file_lock(path);
        let _guard = lock.lock();
        self.with_retry(path, || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = Self::_tombstone_file(&tx, path)?;
            tx.commit()?;
            Ok(outcome)
        })
    }

    fn _tombstone_file(conn: &Connection, path: &str) -> TrellisResult<TombstoneOutcome> {
        let mut outcome = TombstoneOutcome {
            path: path.to_string(),
            ..TombstoneOutcome::default()
        };
        let definitions = Self::_query_ids(
            conn,
            "SELECT id FROM definitions WHERE file_path = ?1 AND tombstoned = 0 ORDER BY id;",
            path,
        )?;
        conn.execute(
            "UPDATE definitions SET tombstoned = 1 WHERE file_path = ?1;",
            params![path],
        )?;
        outcome.tombstoned_references = conn.execute(
            "UPDATE refs SET state = 'tombstoned', target_id = NULL \
             WHERE file_path = ?1 AND state != 'tombstoned';",
            params![path],
        )?;
        outcome.reflagged = Self::_reflag_targeting(conn, &definitions, path)?;
        conn.execute(
            "DELETE FROM edges WHERE file_path = ?1 OR source_id = ?2 \
                 OR source_id IN (SELECT id FROM definitions WHERE file_path = ?1) \
                 OR target_id IN (SELECT id FROM definitions WHERE file_path = ?1);",
            params![path, file_node_id(path)],
        )?;
        conn.execute(
            "UPDATE files SET status = 'deleted', pending_content = NULL WHERE path = ?1;",
            params![path],
        )?;
        Self::_clear_deferred(conn, path)?;
        outcome.removed_definitions = definitions;
        debug!(
            "Tombstoned {path}: {} definitions, {} references, {} re-flagged",
            outcome.removed_definitions.len(),
            outcome.tombstoned_references,
            outcome.reflagged.len()
        );
        Ok(outcome)
    }

    /// Physically delete tombstoned rows and any edge whose endpoint is no
    /// longer a live node.
    pub fn sweep_tombstones(&self) -> TrellisResult<SweepStats> {
        self.with_retry("<sweep>", || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let references = tx.execute("DELETE FROM refs WHERE state = 'tombstoned';", [])?;
            let edges = tx.execute(
                "DELETE FROM edges WHERE \
                     target_id NOT IN (SELECT id FROM definitions WHERE tombstoned = 0) \
                     OR (source_id NOT IN (SELECT id FROM definitions WHERE tombstoned = 0) \
                         AND source_id NOT IN \
                             (SELECT 'file:' || path FROM files WHERE status != 'deleted'));",
                [],
            )?;
            let definitions = tx.execute("DELETE FROM definitions WHERE tombstoned = 1;", [])?;
            let files = tx.execute("DELETE FROM files WHERE status = 'deleted';", [])?;
            tx.commit()?;
            Ok(SweepStats {
                definitions,
                references,
                files,
                edges,
            })
        })
    }

    /// Return ExternalUnresolved references that may match one of `names`
    /// to Unresolved, and report their ids.
    pub fn requeue_external_matching(
        &self,
        names: &BTreeSet<String>,
    ) -> TrellisResult<Vec<String>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<String> = names.iter().cloned().collect();
        self.with_retry("<requeue>", || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut ids: Vec<String> = Vec::new();
            for chunk in names.chunks(SQL_IN_CHUNK / 2) {
                let marks = placeholders(chunk.len());
                let sql = format!(
                    "SELECT id FROM refs WHERE state = 'external_unresolved' \
                     AND (lookup_name IN ({marks}) OR raw_tail IN ({marks})) ORDER BY id;"
                );
                let mut stmt = tx.prepare(&sql)?;
                let bind = chunk.iter().chain(chunk.iter());
                let found: Vec<String> = stmt
                    .query_map(params_from_iter(bind), |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                ids.extend(found);
            }
            ids.sort();
            ids.dedup();
            {
                let mut reset = tx.prepare_cached(
                    "UPDATE refs SET state = 'unresolved', target_id = NULL WHERE id = ?1;",
                )?;
                for id in &ids {
                    reset.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(ids)
        })
    }

    /// Discard every resolution: all live references return to Unresolved
    /// and every non-CONTAINS edge is removed.
    pub fn reset_resolutions(&self) -> TrellisResult<Vec<String>> {
        self.with_retry("<reset>", || {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM refs WHERE state IN ('resolved', 'external_unresolved') \
                     ORDER BY id;",
                )?;
                let rows: Vec<String> = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                rows
            };
            tx.execute(
                "UPDATE refs SET state = 'unresolved', target_id = NULL \
                 WHERE state IN ('resolved', 'external_unresolved');",
                [],
            )?;
            tx.execute("DELETE FROM edges WHERE kind != 'CONTAINS';", [])?;
            tx.commit()?;
            Ok(ids)
        })
    }

    // -----------------------------------------------------------------------
    // Reads used by resolution
    // -----------------------------------------------------------------------

    pub fn unresolved_reference_ids(&self) -> TrellisResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT id FROM refs WHERE state = 'unresolved' ORDER BY id;")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Load references by id, preserving the order of `ids` and skipping
    /// ids that no longer exist.
    pub fn load_references(&self, ids: &[String]) -> TrellisResult<Vec<Reference>> {
        let conn = self.connect()?;
        let mut found: HashMap<String, Reference> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(SQL_IN_CHUNK) {
            let sql = format!(
                "SELECT {REFERENCE_COLUMNS} FROM refs WHERE id IN ({});",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), reference_from_row)?;
            for row in rows {
                let reference = row?;
                found.insert(reference.id.clone(), reference);
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// Every live definition, ordered by id.
    pub fn live_definitions(&self) -> TrellisResult<Vec<DefinitionCandidate>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, qualified_name, name, file_path, indexed_seq FROM definitions \
             WHERE tombstoned = 0 ORDER BY id;",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DefinitionCandidate {
                    id: row.get(0)?,
                    qualified_name: row.get(1)?,
                    name: row.get(2)?,
                    file_path: row.get(3)?,
                    indexed_seq: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deterministic dump of files, definitions, references, and edges.
    pub fn snapshot(&self) -> TrellisResult<GraphSnapshot> {
        let conn = self.connect()?;
        let files = {
            let sql = format!("SELECT {FILE_COLUMNS} FROM files ORDER BY path;");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], file_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let definitions = {
            let sql = format!("SELECT {DEFINITION_COLUMNS} FROM definitions ORDER BY id;");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], definition_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let references = {
            let sql = format!("SELECT {REFERENCE_COLUMNS} FROM refs ORDER BY id;");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], reference_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let edges = {
            let sql = format!(
                "SELECT {EDGE_COLUMNS} FROM edges \
                 ORDER BY source_id, target_id, kind, reference_id;"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], edge_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        Ok(GraphSnapshot {
            files,
            definitions,
            references,
            edges,
        })
    }

    /// Live edges of one kind, used by the dead-code pass.
    pub fn edges_of_kind(&self, kind: EdgeKind) -> TrellisResult<Vec<(String, String)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id FROM edges WHERE kind = ?1 \
             ORDER BY source_id, target_id;",
        )?;
        let rows = stmt
            .query_map(params![kind.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
