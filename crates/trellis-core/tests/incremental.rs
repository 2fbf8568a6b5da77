mod common;

use anyhow::Result;
use tempfile::TempDir;

use common::{change_set, delete, function, make_store, mention, raw, upsert};
use trellis_core::indexer::callgraph::TieBreakRule;
use trellis_core::models::{definition_id, EdgeKind, FileStatus, ReferenceState};
use trellis_core::{
    find_dead_code, CancelToken, Coordinator, DeadCodeOptions, GraphStore, IndexConfig,
    JsonAstProvider, TrellisError,
};

fn calls_edges(store: &GraphStore) -> Result<Vec<(String, String)>> {
    let mut edges = store.edges_of_kind(EdgeKind::Calls)?;
    edges.sort();
    Ok(edges)
}

fn states_in(store: &GraphStore, path: &str) -> Result<Vec<ReferenceState>> {
    Ok(store
        .snapshot()?
        .references
        .into_iter()
        .filter(|r| r.file_path == path)
        .map(|r| r.state)
        .collect())
}

#[test]
fn test_deleting_target_file_flips_references_to_external() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;

    let first = coordinator.run(&change_set(
        "c1",
        vec![
            upsert("a.py", vec![function("foo", 1, vec![])]),
            upsert(
                "b.py",
                vec![
                    mention("import", "a.foo", 1),
                    function("bar", 3, vec![mention("call", "foo", 4)]),
                ],
            ),
        ],
    ))?;
    assert_eq!(first.counts.resolved, 2);
    assert_eq!(first.counts.external_unresolved, 0);

    let foo = definition_id("a.py", "a.foo");
    let bar = definition_id("b.py", "b.bar");
    assert_eq!(calls_edges(&store)?, vec![(bar.clone(), foo.clone())]);
    assert_eq!(
        store.edges_of_kind(EdgeKind::Imports)?,
        vec![(definition_id("b.py", "b"), foo.clone())]
    );

    let second = coordinator.run(&change_set("c2", vec![delete("a.py")]))?;
    assert_eq!(second.deleted, vec!["a.py"]);
    assert_eq!(second.counts.external_unresolved, 2);
    assert!(calls_edges(&store)?.is_empty());
    assert!(store.edges_of_kind(EdgeKind::Imports)?.is_empty());

    let snapshot = store.snapshot()?;
    assert!(snapshot.definitions.iter().all(|d| d.file_path != "a.py"));
    assert!(snapshot.files.iter().all(|f| f.path != "a.py"));
    assert!(snapshot.edges.iter().all(|e| e.target_id != foo));
    for reference in snapshot.references.iter().filter(|r| r.file_path == "b.py") {
        assert_eq!(reference.state, ReferenceState::ExternalUnresolved);
        assert_eq!(reference.target_id, None);
    }
    Ok(())
}

#[test]
fn test_same_file_candidate_wins_global_tie() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;

    let report = coordinator.run(&change_set(
        "c1",
        vec![
            upsert("p/util.py", vec![function("run", 1, vec![])]),
            upsert(
                "q/util.py",
                vec![
                    function("run", 1, vec![]),
                    function(
                        "main",
                        5,
                        vec![mention("call", "util.run", 6), mention("call", "run", 7)],
                    ),
                ],
            ),
        ],
    ))?;

    let local_run = definition_id("q/util.py", "q.util.run");
    let mut edges = calls_edges(&store)?;
    assert_eq!(edges.len(), 2);
    edges.dedup();
    assert_eq!(
        edges,
        vec![(definition_id("q/util.py", "q.util.main"), local_run.clone())]
    );
    // The bare `run` is settled by scope alone; only `util.run` was contested.
    assert_eq!(report.counts.ambiguous, 1);
    let entry = &report.ambiguities[0];
    assert_eq!(entry.chosen, local_run);
    assert_eq!(entry.decided_by, TieBreakRule::SameFile);
    assert_eq!(entry.candidates.len(), 2);
    Ok(())
}

#[test]
fn test_rerun_of_same_change_set_is_idempotent() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;
    let changes = change_set(
        "c1",
        vec![
            upsert("a.py", vec![function("foo", 1, vec![mention("call", "bar", 2)])]),
            upsert("b.py", vec![function("bar", 1, vec![mention("call", "missing", 2)])]),
        ],
    );

    coordinator.run(&changes)?;
    let before = store.snapshot()?;
    let again = coordinator.run(&changes)?;
    assert_eq!(again.skipped_unchanged, vec!["a.py", "b.py"]);
    assert!(again.succeeded.is_empty());
    assert_eq!(store.snapshot()?, before);
    Ok(())
}

#[test]
fn test_unchanged_files_keep_their_edges() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;

    let first = coordinator.run(&change_set(
        "c1",
        vec![
            upsert("a.py", vec![function("foo", 1, vec![])]),
            upsert("b.py", vec![function("bar", 1, vec![mention("call", "foo", 2)])]),
            upsert("c.py", vec![function("baz", 1, vec![mention("call", "foo", 2)])]),
        ],
    ))?;
    let second = coordinator.run(&change_set(
        "c2",
        vec![upsert(
            "c.py",
            vec![
                function("baz", 1, vec![mention("call", "foo", 2)]),
                function("qux", 6, vec![]),
            ],
        )],
    ))?;
    assert_eq!(second.succeeded, vec!["c.py"]);

    let snapshot = store.snapshot()?;
    let bar = definition_id("b.py", "b.bar");
    let baz = definition_id("c.py", "c.baz");
    let edge_seq = |source: &str| {
        snapshot
            .edges
            .iter()
            .find(|e| e.kind == EdgeKind::Calls && e.source_id == source)
            .map(|e| e.created_seq)
    };
    assert_eq!(edge_seq(&bar), Some(first.seq));
    assert_eq!(edge_seq(&baz), Some(second.seq));

    for def in snapshot.definitions.iter().filter(|d| d.file_path != "c.py") {
        assert_eq!(def.indexed_seq, first.seq, "{} was re-indexed", def.qualified_name);
    }
    Ok(())
}

#[test]
fn test_immediate_mode_catches_forward_reference_next_run() -> Result<()> {
    let config = IndexConfig {
        immediate_resolution: true,
        ..IndexConfig::default()
    };
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;

    // b.py merges first, so its call has no candidate yet.
    let first = coordinator.run(&change_set(
        "c1",
        vec![
            upsert("b.py", vec![function("bar", 1, vec![mention("call", "foo", 2)])]),
            upsert("a.py", vec![function("foo", 1, vec![])]),
        ],
    ))?;
    assert!(first.immediate);
    assert_eq!(first.counts.external_unresolved, 1);
    assert_eq!(states_in(&store, "b.py")?, vec![ReferenceState::ExternalUnresolved]);

    let second = coordinator.run(&change_set("c2", vec![]))?;
    assert_eq!(second.counts.resolved, 1);
    assert_eq!(
        calls_edges(&store)?,
        vec![(definition_id("b.py", "b.bar"), definition_id("a.py", "a.foo"))]
    );
    Ok(())
}

#[test]
fn test_batch_mode_resolves_forward_reference_in_same_run() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;

    let report = coordinator.run(&change_set(
        "c1",
        vec![
            upsert("b.py", vec![function("bar", 1, vec![mention("call", "foo", 2)])]),
            upsert("a.py", vec![function("foo", 1, vec![])]),
        ],
    ))?;
    assert_eq!(report.counts.resolved, 1);
    assert_eq!(states_in(&store, "b.py")?, vec![ReferenceState::Resolved]);
    Ok(())
}

#[test]
fn test_failed_extraction_keeps_previous_version_and_retries() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;

    let good_a = upsert("a.py", vec![function("foo", 1, vec![])]);
    coordinator.run(&change_set(
        "c1",
        vec![
            good_a.clone(),
            upsert("b.py", vec![function("bar", 1, vec![mention("call", "foo", 2)])]),
        ],
    ))?;

    let broken = coordinator.run(&change_set("c2", vec![raw("a.py", "{ not an ast")]))?;
    assert_eq!(broken.failed_paths(), vec!["a.py"]);
    assert_eq!(broken.failed[0].stage, "parse");
    let file = store.get_file("a.py")?.expect("file row kept");
    assert_eq!(file.status, FileStatus::ExtractionFailed);
    assert!(file.failure_message.is_some());
    // The previous definitions and the edge into them survive.
    assert_eq!(calls_edges(&store)?.len(), 1);

    // Retried with the kept content on a run that does not mention it.
    let retried = coordinator.run(&change_set("c3", vec![]))?;
    assert_eq!(retried.failed_paths(), vec!["a.py"]);

    let fixed = coordinator.run(&change_set("c4", vec![good_a]))?;
    assert_eq!(fixed.succeeded, vec!["a.py"]);
    assert!(fixed.failed.is_empty());
    assert_eq!(store.get_file("a.py")?.map(|f| f.status), Some(FileStatus::Indexed));
    assert_eq!(calls_edges(&store)?.len(), 1);
    Ok(())
}

#[test]
fn test_invalid_config_leaves_store_untouched() -> Result<()> {
    let (_dir, store) = make_store(&IndexConfig::default())?;
    let provider = JsonAstProvider::new();

    let parsed = IndexConfig::from_toml_str("resolution_strategy = \"bogus\"\n");
    assert!(matches!(parsed, Err(TrellisError::Config(_))));

    let config = IndexConfig {
        shard_count: 0,
        ..IndexConfig::default()
    };
    assert!(matches!(
        Coordinator::new(&store, &provider, config),
        Err(TrellisError::Config(_))
    ));
    assert_eq!(store.get_repo_meta("run_seq")?, None);
    assert!(store.snapshot()?.files.is_empty());
    Ok(())
}

#[test]
fn test_cancelled_run_merges_nothing() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;
    let changes = change_set(
        "c1",
        vec![upsert("a.py", vec![function("foo", 1, vec![mention("call", "foo", 2)])])],
    );

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = coordinator.run_with_cancel(&changes, cancel)?;
    assert!(report.cancelled);
    assert!(report.succeeded.is_empty());
    assert_eq!(report.failed[0].stage, "cancelled");
    assert_eq!(report.deferred, vec!["a.py"]);
    assert!(store.snapshot()?.files.is_empty());
    assert_eq!(store.run_phase()?, "idle");

    let report = coordinator.run(&changes)?;
    assert!(!report.cancelled);
    assert_eq!(report.succeeded, vec!["a.py"]);
    assert_eq!(report.counts.resolved, 1);
    assert!(store.deferred_changes()?.is_empty());
    Ok(())
}

#[test]
fn test_cancelled_changes_are_applied_by_the_next_run() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;
    coordinator.run(&change_set(
        "c1",
        vec![
            upsert("a.py", vec![function("foo", 1, vec![])]),
            upsert("b.py", vec![function("bar", 1, vec![mention("call", "foo", 2)])]),
        ],
    ))?;

    let cancel = CancelToken::new();
    cancel.cancel();
    let cancelled = coordinator.run_with_cancel(
        &change_set(
            "c2",
            vec![delete("a.py"), upsert("c.py", vec![function("baz", 1, vec![])])],
        ),
        cancel,
    )?;
    assert!(cancelled.cancelled);
    assert_eq!(cancelled.deferred, vec!["a.py", "c.py"]);
    assert_eq!(calls_edges(&store)?.len(), 1);
    assert_eq!(store.get_file("c.py")?, None);

    let resumed = coordinator.run(&change_set("c3", vec![]))?;
    assert_eq!(resumed.deleted, vec!["a.py"]);
    assert_eq!(resumed.succeeded, vec!["c.py"]);
    assert!(resumed.deferred.is_empty());
    assert!(store.deferred_changes()?.is_empty());
    assert!(calls_edges(&store)?.is_empty());
    assert_eq!(states_in(&store, "b.py")?, vec![ReferenceState::ExternalUnresolved]);

    let snapshot = store.snapshot()?;
    assert!(snapshot.definitions.iter().all(|d| d.file_path != "a.py"));
    let c = store.get_file("c.py")?.expect("c.py indexed");
    assert_eq!(c.status, FileStatus::Indexed);
    assert_eq!(c.last_commit.as_deref(), Some("c2"));
    Ok(())
}

#[test]
fn test_newer_change_replaces_deferred_one() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;
    coordinator.run(&change_set("c1", vec![upsert("a.py", vec![function("foo", 1, vec![])])]))?;

    let cancel = CancelToken::new();
    cancel.cancel();
    coordinator.run_with_cancel(&change_set("c2", vec![delete("a.py")]), cancel)?;
    assert_eq!(store.deferred_changes()?.len(), 1);

    // The file comes back unchanged, so the deferred deletion is dropped.
    let report = coordinator.run(&change_set(
        "c3",
        vec![upsert("a.py", vec![function("foo", 1, vec![])])],
    ))?;
    assert_eq!(report.skipped_unchanged, vec!["a.py"]);
    assert!(report.deleted.is_empty());
    assert!(store.deferred_changes()?.is_empty());
    assert_eq!(store.get_file("a.py")?.map(|f| f.status), Some(FileStatus::Indexed));
    Ok(())
}

#[test]
fn test_failed_merge_is_deferred_and_retried() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;
    store.connect_internal()?.execute_batch(
        "CREATE TRIGGER reject_c BEFORE INSERT ON definitions WHEN NEW.file_path = 'c.py' \
         BEGIN SELECT RAISE(ABORT, 'c.py rejected'); END;",
    )?;

    let first = coordinator.run(&change_set(
        "c1",
        vec![
            upsert("a.py", vec![function("foo", 1, vec![mention("call", "baz", 2)])]),
            upsert("c.py", vec![function("baz", 1, vec![])]),
        ],
    ))?;
    assert_eq!(first.succeeded, vec!["a.py"]);
    assert_eq!(first.failed_paths(), vec!["c.py"]);
    assert_eq!(first.failed[0].stage, "merge");
    assert_eq!(first.deferred, vec!["c.py"]);
    assert_eq!(store.get_file("c.py")?, None);
    assert_eq!(states_in(&store, "a.py")?, vec![ReferenceState::ExternalUnresolved]);

    store
        .connect_internal()?
        .execute_batch("DROP TRIGGER reject_c;")?;
    let retried = coordinator.run(&change_set("c2", vec![]))?;
    assert_eq!(retried.succeeded, vec!["c.py"]);
    assert!(store.deferred_changes()?.is_empty());
    assert_eq!(
        calls_edges(&store)?,
        vec![(definition_id("a.py", "a.foo"), definition_id("c.py", "c.baz"))]
    );
    Ok(())
}

#[test]
fn test_failed_run_returns_phase_to_idle() -> Result<()> {
    let config = IndexConfig::default();
    let (_dir, store) = make_store(&config)?;
    let provider = JsonAstProvider::new();
    let coordinator = Coordinator::new(&store, &provider, config)?;
    store.connect_internal()?.execute_batch(
        "CREATE TRIGGER reject_external BEFORE UPDATE OF state ON refs \
         WHEN NEW.state = 'external_unresolved' \
         BEGIN SELECT RAISE(ABORT, 'external rejected'); END;",
    )?;

    let run = coordinator.run(&change_set(
        "c1",
        vec![upsert("a.py", vec![function("foo", 1, vec![mention("call", "missing", 2)])])],
    ));
    assert!(run.is_err());
    assert_eq!(store.run_phase()?, "idle");
    assert!(find_dead_code(&store, &DeadCodeOptions::new(vec!["a.foo".into()])).is_ok());
    Ok(())
}

#[test]
fn test_full_reindex_refetches_known_files() -> Result<()> {
    let root = TempDir::new()?;
    let ast = |children| serde_json::to_string(&common::module(children)).expect("AST serializes");
    std::fs::write(root.path().join("a.py"), ast(vec![function("foo", 1, vec![])]))?;
    std::fs::write(
        root.path().join("b.py"),
        ast(vec![function("bar", 1, vec![mention("call", "foo", 2)])]),
    )?;
    let provider = JsonAstProvider::with_root(root.path());

    let (_dir, store) = make_store(&IndexConfig::default())?;
    let mut fetched_a = upsert("a.py", vec![]);
    fetched_a.content = None;
    let mut fetched_b = upsert("b.py", vec![]);
    fetched_b.content = None;
    let first = Coordinator::new(&store, &provider, IndexConfig::default())?
        .run(&change_set("c1", vec![fetched_a, fetched_b]))?;
    assert_eq!(first.succeeded, vec!["a.py", "b.py"]);
    let edges = calls_edges(&store)?;
    assert_eq!(edges.len(), 1);

    let full = IndexConfig {
        full_reindex: true,
        ..IndexConfig::default()
    };
    let second = Coordinator::new(&store, &provider, full)?.run(&change_set("c2", vec![]))?;
    assert_eq!(second.succeeded, vec!["a.py", "b.py"]);
    assert_eq!(second.counts.resolved, 1);
    assert_eq!(calls_edges(&store)?, edges);
    Ok(())
}
