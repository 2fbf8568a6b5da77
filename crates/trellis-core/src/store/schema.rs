//! SQLite schema DDL and migrations for the graph store.
//!
//! Tables are created with `CREATE … IF NOT EXISTS` so replaying them on an
//! initialised database is harmless; later changes arrive as numbered
//! migrations, each applied in its own transaction.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::errors::{TrellisError, TrellisResult};

/// Version reached once every migration has run.
pub const SCHEMA_VERSION: i32 = 4;

/// Core DDL statements: 7 CREATE TABLE + 9 CREATE INDEX.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (7) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS repo_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        language TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        last_commit TEXT,
        status TEXT NOT NULL DEFAULT 'indexed',
        failure_message TEXT,
        pending_content TEXT,
        indexed_seq INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE TABLE IF NOT EXISTS definitions (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        qualified_name TEXT NOT NULL,
        file_path TEXT NOT NULL REFERENCES files(path),
        language TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        scope_chain TEXT NOT NULL DEFAULT '[]',
        parent_id TEXT,
        visibility TEXT NOT NULL DEFAULT 'public',
        indexed_seq INTEGER NOT NULL DEFAULT 0,
        tombstoned INTEGER NOT NULL DEFAULT 0,
        UNIQUE(file_path, qualified_name)
    );",
    "CREATE TABLE IF NOT EXISTS refs (
        id TEXT PRIMARY KEY,
        file_path TEXT NOT NULL,
        source_id TEXT NOT NULL,
        raw_name TEXT NOT NULL,
        raw_tail TEXT NOT NULL,
        kind TEXT NOT NULL,
        scope_json TEXT NOT NULL,
        lookup_name TEXT NOT NULL,
        line INTEGER NOT NULL,
        state TEXT NOT NULL DEFAULT 'unresolved',
        target_id TEXT
    );",
    "CREATE TABLE IF NOT EXISTS edges (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        file_path TEXT NOT NULL,
        reference_id TEXT NOT NULL DEFAULT '',
        created_seq INTEGER NOT NULL,
        UNIQUE(source_id, target_id, kind, reference_id)
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS run_history (
        seq INTEGER PRIMARY KEY,
        commit_hash TEXT,
        strategy TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'running',
        report_json TEXT,
        started_at TEXT DEFAULT CURRENT_TIMESTAMP,
        finished_at TEXT
    );",
    // ── indexes (9) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_definitions_qualified ON definitions(qualified_name, tombstoned);",
    "CREATE INDEX IF NOT EXISTS idx_definitions_name ON definitions(name, tombstoned);",
    "CREATE INDEX IF NOT EXISTS idx_definitions_file ON definitions(file_path);",
    "CREATE INDEX IF NOT EXISTS idx_refs_file ON refs(file_path);",
    "CREATE INDEX IF NOT EXISTS idx_refs_state ON refs(state);",
    "CREATE INDEX IF NOT EXISTS idx_refs_target ON refs(target_id);",
    "CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id, kind);",
    "CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id, kind);",
    "CREATE INDEX IF NOT EXISTS idx_edges_file ON edges(file_path, kind);",
];

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

struct Migration {
    version: i32,
    summary: &'static str,
    statements: &'static [&'static str],
}

/// Ordered steps; `version` of the last entry equals [`SCHEMA_VERSION`].
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        summary: "baseline tables",
        statements: &[],
    },
    Migration {
        version: 2,
        summary: "lookup indexes for re-checking external references",
        statements: &[
            "CREATE INDEX IF NOT EXISTS idx_refs_lookup_state ON refs(lookup_name, state);",
            "CREATE INDEX IF NOT EXISTS idx_refs_tail_state ON refs(raw_tail, state);",
        ],
    },
    Migration {
        version: 3,
        summary: "names awaiting an external re-check",
        statements: &["CREATE TABLE IF NOT EXISTS pending_recheck (
            name TEXT PRIMARY KEY,
            added_seq INTEGER NOT NULL
        );"],
    },
    Migration {
        version: 4,
        summary: "file changes deferred by a cancelled or conflicted run",
        statements: &["CREATE TABLE IF NOT EXISTS deferred_changes (
            path TEXT PRIMARY KEY,
            change_kind TEXT NOT NULL,
            content TEXT,
            commit_hash TEXT,
            reason TEXT NOT NULL,
            deferred_seq INTEGER NOT NULL
        );"],
    },
];

/// Apply every step above the stored version. A failing step is rolled back
/// on its own and logged to `migration_history` before the error returns.
pub fn migrate_schema(conn: &Connection) -> TrellisResult<()> {
    let start = get_schema_version(conn);
    let mut version = start;
    for migration in MIGRATIONS.iter().filter(|m| m.version > start) {
        apply_migration(conn, version, migration)?;
        version = migration.version;
    }
    Ok(())
}

fn apply_migration(conn: &Connection, from: i32, migration: &Migration) -> TrellisResult<()> {
    let tx = conn.unchecked_transaction()?;
    let applied = migration
        .statements
        .iter()
        .try_for_each(|sql| tx.execute_batch(sql))
        .map_err(TrellisError::from)
        .and_then(|()| write_schema_version(&tx, migration.version));

    match applied {
        Ok(()) => {
            log_migration(&tx, from, migration.version, None)?;
            tx.commit()?;
            debug!("Schema migrated to v{} ({})", migration.version, migration.summary);
            Ok(())
        }
        Err(e) => {
            drop(tx);
            warn!("Schema migration to v{} failed: {e}", migration.version);
            if let Err(log_err) = log_migration(conn, from, migration.version, Some(&e.to_string())) {
                warn!("Could not record failed migration to v{}: {log_err}", migration.version);
            }
            Err(e)
        }
    }
}

/// Stored schema version; 0 for a database that has never been migrated.
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM repo_meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .ok()
    .flatten()
    .and_then(|raw| raw.parse().ok())
    .unwrap_or(0)
}

fn write_schema_version(conn: &Connection, version: i32) -> TrellisResult<()> {
    conn.execute(
        "INSERT INTO repo_meta(key, value) VALUES ('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![version.to_string()],
    )?;
    Ok(())
}

fn log_migration(
    conn: &Connection,
    from: i32,
    to: i32,
    failure: Option<&str>,
) -> TrellisResult<()> {
    let status = if failure.is_some() { "failed" } else { "success" };
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        params![from, to, status, failure],
    )?;
    Ok(())
}
