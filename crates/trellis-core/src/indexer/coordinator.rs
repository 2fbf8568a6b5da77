//! Incremental coordinator.
//!
//! One run walks `Idle -> Extracting -> Merging -> Resolving -> Finalizing
//! -> Idle`, persisting the phase in the store. Extraction and batch-mode
//! merges run on a bounded Rayon pool; resolution starts only once every
//! merge of the run has finished. All run-scoped state lives in a
//! [`RunContext`] created per run.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::errors::{TrellisError, TrellisResult};
use crate::indexer::cancel::CancelToken;
use crate::indexer::filesystem::{language_or_unknown, normalize_path};
use crate::indexer::pipeline::{parallel_extract, AstProvider, ExtractionJob, ExtractionResult};
use crate::indexer::report::RunReport;
use crate::indexer::symbols::FileExtraction;
use crate::models::{
    ChangeKind, ChangeSet, FileChange, FileNode, FileStatus, Reference, ReferenceState, RunPhase,
};
use crate::resolution::{build_strategy, ResolutionOutcome, ResolutionStrategy};
use crate::store::database::{AppliedCounts, DeferredChange, GraphStore, MergeOutcome};

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

/// State owned by a single run.
pub struct RunContext {
    pub seq: i64,
    pub cancel: CancelToken,
    pending: IndexSet<String>,
    added_names: BTreeSet<String>,
    outcomes: Vec<ResolutionOutcome>,
    report: RunReport,
    started: Instant,
}

impl RunContext {
    fn new(seq: i64, cancel: CancelToken, report: RunReport) -> Self {
        Self {
            seq,
            cancel,
            pending: IndexSet::new(),
            added_names: BTreeSet::new(),
            outcomes: Vec::new(),
            report,
            started: Instant::now(),
        }
    }

    fn enqueue(&mut self, ids: impl IntoIterator<Item = String>) {
        self.pending.extend(ids);
    }

    fn record_cancelled(&mut self, path: &str, phase: &str) {
        self.report.cancelled = true;
        self.report
            .record_failure(path, "cancelled", format!("run cancelled during {phase}"));
    }

    fn record_applied(&mut self, outcomes: &[ResolutionOutcome], applied: AppliedCounts) {
        self.report.counts.resolved += applied.resolved;
        self.report.counts.external_unresolved += applied.external_unresolved;
        self.report
            .ambiguities
            .extend(outcomes.iter().filter_map(|o| o.ambiguity.clone()));
    }
}

/// Extraction work derived from a change set.
#[derive(Default)]
struct ExtractionPlan {
    jobs: Vec<ExtractionJob>,
    deletions: Vec<String>,
    /// Changed files whose content could not be obtained.
    unavailable: Vec<(FileNode, String)>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator<'a> {
    store: &'a GraphStore,
    provider: &'a dyn AstProvider,
    config: IndexConfig,
    strategy: Box<dyn ResolutionStrategy>,
}

impl<'a> Coordinator<'a> {
    /// Validates `config`; an invalid configuration never reaches the store.
    pub fn new(
        store: &'a GraphStore,
        provider: &'a dyn AstProvider,
        config: IndexConfig,
    ) -> TrellisResult<Self> {
        config.validate()?;
        let strategy = build_strategy(&config);
        Ok(Self {
            store,
            provider,
            config,
            strategy,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Run with the configured deadline, if any.
    pub fn run(&self, changes: &ChangeSet) -> TrellisResult<RunReport> {
        let cancel = match self.config.timeout_ms {
            Some(ms) => CancelToken::with_timeout(Duration::from_millis(ms)),
            None => CancelToken::new(),
        };
        self.run_with_cancel(changes, cancel)
    }

    pub fn run_with_cancel(
        &self,
        changes: &ChangeSet,
        cancel: CancelToken,
    ) -> TrellisResult<RunReport> {
        self.config.validate()?;
        let previous = self.store.run_phase()?;
        if previous != RunPhase::Idle.as_str() {
            warn!("Previous run stopped during {previous}; picking up its unresolved references");
        }

        let strategy = self.strategy.kind();
        let seq = self.store.begin_run(&changes.commit_hash, strategy.as_str())?;
        let report = RunReport::new(
            seq,
            &changes.commit_hash,
            strategy.as_str(),
            self.config.immediate_resolution,
        );
        let mut ctx = RunContext::new(seq, cancel, report);
        info!(
            "Run {seq} started: {} changes, strategy {strategy}",
            changes.files.len()
        );

        if let Err(e) = self.drive(&mut ctx, changes) {
            warn!("Run {seq} failed: {e}");
            let failure = serde_json::json!({ "error": e.to_string() }).to_string();
            if let Err(finish_err) = self.store.finish_run(seq, "failed", &failure) {
                warn!("Run {seq}: could not record the failure: {finish_err}");
            }
            if let Err(phase_err) = self.store.set_run_phase(RunPhase::Idle.as_str()) {
                warn!("Run {seq}: could not reset the run phase to idle: {phase_err}");
            }
            return Err(e);
        }
        Ok(ctx.report)
    }

    fn enter(&self, ctx: &RunContext, phase: RunPhase) -> TrellisResult<()> {
        debug!("Run {} entering {phase}", ctx.seq);
        self.store.set_run_phase(phase.as_str())
    }

    fn drive(&self, ctx: &mut RunContext, changes: &ChangeSet) -> TrellisResult<()> {
        self.enter(ctx, RunPhase::Extracting)?;
        let plan = self.plan_extraction(ctx, changes)?;
        let results = parallel_extract(
            self.provider,
            &plan.jobs,
            self.config.effective_workers(),
            &ctx.cancel,
        );

        self.enter(ctx, RunPhase::Merging)?;
        self.merge(ctx, plan, results)?;

        self.enter(ctx, RunPhase::Resolving)?;
        self.resolve_pending(ctx)?;

        self.enter(ctx, RunPhase::Finalizing)?;
        self.finalize(ctx)?;

        self.enter(ctx, RunPhase::Idle)
    }

    // -----------------------------------------------------------------------
    // Extracting
    // -----------------------------------------------------------------------

    fn plan_extraction(
        &self,
        ctx: &mut RunContext,
        changes: &ChangeSet,
    ) -> TrellisResult<ExtractionPlan> {
        let commit = Some(changes.commit_hash.as_str());
        let mut plan = ExtractionPlan::default();
        let mut seen: HashSet<String> = HashSet::new();

        // Changes deferred by earlier runs; a change to the same path in
        // this change set replaces its deferred one.
        let mut planned: IndexMap<String, (FileChange, Option<String>)> = IndexMap::new();
        for deferred in self.store.deferred_changes()? {
            let change = FileChange {
                path: deferred.path.clone(),
                change_kind: deferred.change_kind,
                content: deferred.content,
            };
            planned.insert(deferred.path, (change, deferred.commit_hash));
        }
        let deferred_paths: HashSet<String> = planned.keys().cloned().collect();
        if !deferred_paths.is_empty() {
            info!("Run {}: resuming {} deferred changes", ctx.seq, deferred_paths.len());
        }
        for change in changes.normalized() {
            let path = normalize_path(&change.path);
            planned.shift_remove(&path);
            planned.insert(path, (change, commit.map(str::to_string)));
        }

        for (path, (change, change_commit)) in planned {
            seen.insert(path.clone());
            let change_commit = change_commit.as_deref();
            if change.change_kind == ChangeKind::Deleted {
                plan.deletions.push(path);
                continue;
            }
            let content = match change.content {
                Some(content) => content,
                None => match self.provider.fetch(&path) {
                    Ok(content) => content,
                    Err(message) => {
                        let file =
                            FileNode::new(&path, &language_or_unknown(&path), "", change_commit);
                        plan.unavailable.push((file, message));
                        continue;
                    }
                },
            };
            let job = ExtractionJob::new(&path, content, change_commit);
            if !self.config.full_reindex && self.is_unchanged(&job.file)? {
                if deferred_paths.contains(&path) {
                    self.store.clear_deferred(&path)?;
                }
                ctx.report.skipped_unchanged.push(path);
                continue;
            }
            plan.jobs.push(job);
        }

        // Files that failed last time are retried with their kept content.
        for (file, content) in self.store.failed_files()? {
            if seen.contains(&file.path) {
                continue;
            }
            let content = match content {
                Some(content) => content,
                None => match self.provider.fetch(&file.path) {
                    Ok(content) => content,
                    Err(_) => {
                        debug!("No content to retry {}", file.path);
                        continue;
                    }
                },
            };
            seen.insert(file.path.clone());
            plan.jobs.push(ExtractionJob::new(&file.path, content, commit));
        }

        if self.config.full_reindex {
            for file in self.store.list_files(Some(FileStatus::Indexed))? {
                if seen.contains(&file.path) {
                    continue;
                }
                match self.provider.fetch(&file.path) {
                    Ok(content) => {
                        plan.jobs
                            .push(ExtractionJob::new(&file.path, content, file.last_commit.as_deref()));
                    }
                    Err(message) => {
                        warn!("Full reindex keeps {}: {message}", file.path);
                        ctx.report.record_failure(&file.path, "fetch", message);
                    }
                }
            }
        }

        info!(
            "Run {}: {} files to extract, {} deletions, {} unchanged",
            ctx.seq,
            plan.jobs.len(),
            plan.deletions.len(),
            ctx.report.skipped_unchanged.len()
        );
        Ok(plan)
    }

    fn is_unchanged(&self, file: &FileNode) -> TrellisResult<bool> {
        Ok(matches!(
            self.store.get_file(&file.path)?,
            Some(existing)
                if existing.status == FileStatus::Indexed
                    && existing.content_hash == file.content_hash
        ))
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    fn merge(
        &self,
        ctx: &mut RunContext,
        plan: ExtractionPlan,
        results: Vec<ExtractionResult>,
    ) -> TrellisResult<()> {
        let ExtractionPlan {
            jobs,
            deletions,
            unavailable,
        } = plan;
        let jobs: HashMap<String, ExtractionJob> = jobs
            .into_iter()
            .map(|job| (job.file.path.clone(), job))
            .collect();
        let seq = ctx.seq;

        if self.config.full_reindex {
            let reset = self.store.reset_resolutions()?;
            debug!("Full reindex reset {} resolutions", reset.len());
            ctx.enqueue(reset);
        }
        let recheck = self.store.take_recheck_names()?;
        if !recheck.is_empty() {
            let requeued = self.store.requeue_external_matching(&recheck)?;
            debug!("Re-checking {} external references from the previous run", requeued.len());
            ctx.enqueue(requeued);
        }

        for path in deletions {
            if ctx.cancel.is_cancelled() {
                ctx.record_cancelled(&path, "merging");
                self.defer(ctx, DeferredChange::deletion(&path, "cancelled", seq));
                continue;
            }
            match self.store.tombstone_file(&path) {
                Ok(outcome) => {
                    ctx.report.counts.tombstoned += outcome.tombstoned_references;
                    ctx.report.deleted.push(path);
                    ctx.enqueue(outcome.reflagged);
                }
                Err(e) => {
                    warn!("Failed to tombstone {path}: {e}");
                    ctx.report.record_failure(&path, "merge", e.to_string());
                    self.defer(ctx, DeferredChange::deletion(&path, &e.to_string(), seq));
                }
            }
        }

        for (file, message) in unavailable {
            self.record_extraction_failure(ctx, &file, "fetch", &message, None);
        }

        let mut extractions: Vec<FileExtraction> = Vec::new();
        for result in results {
            match result {
                ExtractionResult::Extracted(extraction) => extractions.push(extraction),
                ExtractionResult::Failed {
                    file,
                    stage,
                    message,
                    content,
                } => self.record_extraction_failure(ctx, &file, &stage, &message, Some(&content)),
                ExtractionResult::Cancelled(path) => {
                    ctx.record_cancelled(&path, "extracting");
                    self.defer_upsert(ctx, &jobs, &path, "cancelled");
                }
            }
        }

        if self.config.immediate_resolution {
            for extraction in &extractions {
                let path = extraction.file.path.as_str();
                if ctx.cancel.is_cancelled() {
                    ctx.record_cancelled(path, "merging");
                    self.defer_upsert(ctx, &jobs, path, "cancelled");
                    continue;
                }
                let merged = self.store.merge_file(extraction, ctx.seq);
                if let Some(outcome) = self.absorb_merge(ctx, &jobs, path, merged) {
                    let mut ids = outcome.pending;
                    ids.extend(outcome.reflagged);
                    self.resolve_immediately(ctx, &ids)?;
                }
            }
        } else {
            for (path, merged) in self.parallel_merge(&extractions, ctx) {
                if let Some(outcome) = self.absorb_merge(ctx, &jobs, &path, merged) {
                    ctx.enqueue(outcome.pending);
                    ctx.enqueue(outcome.reflagged);
                }
            }
            if !ctx.added_names.is_empty() {
                let requeued = self.store.requeue_external_matching(&ctx.added_names)?;
                ctx.enqueue(requeued);
            }
        }

        // References left Unresolved by an abandoned or cancelled run.
        ctx.enqueue(self.store.unresolved_reference_ids()?);
        Ok(())
    }

    fn record_extraction_failure(
        &self,
        ctx: &mut RunContext,
        file: &FileNode,
        stage: &str,
        message: &str,
        content: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .mark_extraction_failed(file, message, content, ctx.seq)
        {
            warn!("Failed to record extraction failure for {}: {e}", file.path);
        }
        ctx.report.record_failure(&file.path, stage, message);
    }

    fn parallel_merge(
        &self,
        extractions: &[FileExtraction],
        ctx: &RunContext,
    ) -> Vec<(String, TrellisResult<MergeOutcome>)> {
        let seq = ctx.seq;
        let cancel = &ctx.cancel;
        let store = self.store;
        let merge_one = |extraction: &FileExtraction| {
            let path = extraction.file.path.clone();
            if cancel.is_cancelled() {
                return (path, Err(TrellisError::Cancelled("merging".to_string())));
            }
            let merged = store.merge_file(extraction, seq);
            (path, merged)
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.effective_workers())
            .build();
        match pool {
            Ok(pool) => pool.install(|| extractions.par_iter().map(merge_one).collect()),
            Err(_) => extractions.iter().map(merge_one).collect(),
        }
    }

    /// Keep a change this run could not apply for the next run.
    fn defer(&self, ctx: &mut RunContext, change: DeferredChange) {
        match self.store.defer_change(&change) {
            Ok(()) => {
                debug!("Deferred {} ({})", change.path, change.reason);
                ctx.report.deferred.push(change.path);
            }
            Err(e) => warn!("Could not defer {}: {e}", change.path),
        }
    }

    fn defer_upsert(
        &self,
        ctx: &mut RunContext,
        jobs: &HashMap<String, ExtractionJob>,
        path: &str,
        reason: &str,
    ) {
        match jobs.get(path) {
            Some(job) => {
                let change = DeferredChange::upsert(job, reason, ctx.seq);
                self.defer(ctx, change);
            }
            None => warn!("No extraction job kept for {path}; its change cannot be deferred"),
        }
    }

    fn absorb_merge(
        &self,
        ctx: &mut RunContext,
        jobs: &HashMap<String, ExtractionJob>,
        path: &str,
        merged: TrellisResult<MergeOutcome>,
    ) -> Option<MergeOutcome> {
        match merged {
            Ok(outcome) => {
                ctx.report.succeeded.push(path.to_string());
                ctx.report.counts.tombstoned += outcome.tombstoned_references;
                ctx.added_names.extend(outcome.added_names.iter().cloned());
                Some(outcome)
            }
            Err(TrellisError::Cancelled(phase)) => {
                ctx.record_cancelled(path, &phase);
                self.defer_upsert(ctx, jobs, path, "cancelled");
                None
            }
            Err(e) => {
                warn!("Failed to merge {path}: {e}");
                ctx.report.record_failure(path, "merge", e.to_string());
                self.defer_upsert(ctx, jobs, path, &e.to_string());
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Resolving
    // -----------------------------------------------------------------------

    fn load_unresolved(&self, ids: &[String]) -> TrellisResult<Vec<Reference>> {
        Ok(self
            .store
            .load_references(ids)?
            .into_iter()
            .filter(|r| r.state == ReferenceState::Unresolved)
            .collect())
    }

    fn resolve_immediately(&self, ctx: &mut RunContext, ids: &[String]) -> TrellisResult<()> {
        if ctx.cancel.is_cancelled() {
            ctx.report.cancelled = true;
            return Ok(());
        }
        let pending = self.load_unresolved(ids)?;
        if pending.is_empty() {
            return Ok(());
        }
        let mut session = self.strategy.prepare(self.store)?;
        let outcomes = session.resolve_batch(&pending, self.config.alias_precedence)?;
        let applied = self.store.apply_outcomes(&outcomes, ctx.seq)?;
        ctx.record_applied(&outcomes, applied);
        Ok(())
    }

    /// Resolve the whole pending queue against the post-merge definitions.
    /// Cancellation discards every outcome of the phase.
    fn resolve_pending(&self, ctx: &mut RunContext) -> TrellisResult<()> {
        let mut ids: Vec<String> = ctx.pending.drain(..).collect();
        ids.sort();
        if ids.is_empty() {
            return Ok(());
        }
        if ctx.cancel.is_cancelled() {
            info!("Run {} cancelled; {} references stay unresolved", ctx.seq, ids.len());
            ctx.report.cancelled = true;
            return Ok(());
        }

        let mut session = self.strategy.prepare(self.store)?;
        for chunk in ids.chunks(self.config.effective_batch_size()) {
            if ctx.cancel.check("resolving").is_err() {
                info!("Run {} cancelled; {} references stay unresolved", ctx.seq, ids.len());
                ctx.report.cancelled = true;
                ctx.outcomes.clear();
                return Ok(());
            }
            let pending = self.load_unresolved(chunk)?;
            if pending.is_empty() {
                continue;
            }
            let outcomes = session.resolve_batch(&pending, self.config.alias_precedence)?;
            ctx.outcomes.extend(outcomes);
        }
        debug!("Run {} resolved {} references", ctx.seq, ctx.outcomes.len());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finalizing
    // -----------------------------------------------------------------------

    fn finalize(&self, ctx: &mut RunContext) -> TrellisResult<()> {
        let outcomes = std::mem::take(&mut ctx.outcomes);
        for chunk in outcomes.chunks(self.config.effective_batch_size()) {
            let applied = self.store.apply_outcomes(chunk, ctx.seq)?;
            ctx.record_applied(chunk, applied);
        }

        if self.config.immediate_resolution {
            self.store.add_recheck_names(&ctx.added_names, ctx.seq)?;
        }

        ctx.report.swept = self.store.sweep_tombstones()?;
        ctx.report.normalize();
        ctx.report.elapsed_ms = ctx.started.elapsed().as_millis() as u64;

        let status = if ctx.report.cancelled {
            "cancelled"
        } else {
            "completed"
        };
        let json = serde_json::to_string(&ctx.report)?;
        self.store.finish_run(ctx.seq, status, &json)?;
        info!(
            "Run {} {status}: {} resolved, {} external, {} ambiguous, {} failed files",
            ctx.seq,
            ctx.report.counts.resolved,
            ctx.report.counts.external_unresolved,
            ctx.report.counts.ambiguous,
            ctx.report.failed.len()
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::pipeline::JsonAstProvider;
    use crate::models::{AstNode, FileChange};

    fn make_store() -> (tempfile::TempDir, GraphStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.db")).unwrap();
        store.init_schema().unwrap();
        (dir, store)
    }

    fn change(path: &str, children: Vec<AstNode>) -> FileChange {
        let ast = AstNode::new("module", None, 1, 40).with_children(children);
        FileChange {
            path: path.to_string(),
            change_kind: ChangeKind::Added,
            content: Some(serde_json::to_string(&ast).unwrap()),
        }
    }

    fn calls(caller: &str, callee: &str) -> AstNode {
        AstNode::new("function", Some(caller), 1, 3)
            .with_children(vec![AstNode::new("call", Some(callee), 2, 2)])
    }

    #[test]
    fn test_invalid_config_rejected_before_run() {
        let (_dir, store) = make_store();
        let provider = JsonAstProvider::new();
        let config = IndexConfig {
            write_retry_attempts: 0,
            ..IndexConfig::default()
        };
        assert!(matches!(
            Coordinator::new(&store, &provider, config),
            Err(TrellisError::Config(_))
        ));
        assert_eq!(store.get_repo_meta("run_seq").unwrap(), None);
    }

    #[test]
    fn test_cancelled_resolution_leaves_references_unresolved() {
        let (_dir, store) = make_store();
        let provider = JsonAstProvider::new();
        let coordinator = Coordinator::new(&store, &provider, IndexConfig::default()).unwrap();
        let changes = ChangeSet {
            commit_hash: "c1".into(),
            parent_hash: None,
            files: vec![change("a.py", vec![calls("foo", "bar")]), change("b.py", vec![calls("bar", "foo")])],
        };

        let cancel = CancelToken::new();
        let seq = store.begin_run("c1", "join").unwrap();
        let mut ctx = RunContext::new(seq, cancel.clone(), RunReport::new(seq, "c1", "join", false));
        let plan = coordinator.plan_extraction(&mut ctx, &changes).unwrap();
        let results = parallel_extract(&provider, &plan.jobs, 2, &ctx.cancel);
        coordinator.merge(&mut ctx, plan, results).unwrap();
        assert_eq!(ctx.report.succeeded.len(), 2);

        cancel.cancel();
        coordinator.resolve_pending(&mut ctx).unwrap();
        coordinator.finalize(&mut ctx).unwrap();
        assert!(ctx.report.cancelled);
        assert_eq!(ctx.report.counts.resolved, 0);
        assert_eq!(store.unresolved_reference_ids().unwrap().len(), 2);

        // the next run picks the leftovers up
        let report = coordinator.run(&changes).unwrap();
        assert_eq!(report.skipped_unchanged.len(), 2);
        assert_eq!(report.counts.resolved, 2);
        assert!(store.unresolved_reference_ids().unwrap().is_empty());
    }

    #[test]
    fn test_phase_returns_to_idle() {
        let (_dir, store) = make_store();
        let provider = JsonAstProvider::new();
        let coordinator = Coordinator::new(&store, &provider, IndexConfig::default()).unwrap();
        let changes = ChangeSet {
            commit_hash: "c1".into(),
            parent_hash: None,
            files: vec![change("a.py", vec![calls("foo", "missing")])],
        };
        let report = coordinator.run(&changes).unwrap();
        assert_eq!(report.counts.external_unresolved, 1);
        assert_eq!(store.run_phase().unwrap(), "idle");
        assert!(store.last_report_json().unwrap().is_some());
    }
}
