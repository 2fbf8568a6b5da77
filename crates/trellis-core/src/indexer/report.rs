//! Per-run resolution report.

use serde::{Deserialize, Serialize};

use crate::resolution::AmbiguityEntry;
use crate::store::database::SweepStats;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: String,
    /// `fetch`, `parse`, `extract`, `merge`, or `cancelled`.
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub resolved: usize,
    pub external_unresolved: usize,
    pub tombstoned: usize,
    pub ambiguous: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub seq: i64,
    pub commit_hash: String,
    pub strategy: String,
    pub immediate: bool,
    pub succeeded: Vec<String>,
    pub deleted: Vec<String>,
    pub skipped_unchanged: Vec<String>,
    pub failed: Vec<FailedFile>,
    /// Changes kept for the next run after a cancellation or write failure.
    #[serde(default)]
    pub deferred: Vec<String>,
    pub counts: RunCounts,
    pub ambiguities: Vec<AmbiguityEntry>,
    pub swept: SweepStats,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn new(seq: i64, commit_hash: &str, strategy: &str, immediate: bool) -> Self {
        Self {
            seq,
            commit_hash: commit_hash.to_string(),
            strategy: strategy.to_string(),
            immediate,
            succeeded: Vec::new(),
            deleted: Vec::new(),
            skipped_unchanged: Vec::new(),
            failed: Vec::new(),
            deferred: Vec::new(),
            counts: RunCounts::default(),
            ambiguities: Vec::new(),
            swept: SweepStats::default(),
            cancelled: false,
            elapsed_ms: 0,
        }
    }

    pub fn record_failure(&mut self, path: &str, stage: &str, message: impl Into<String>) {
        self.failed.push(FailedFile {
            path: path.to_string(),
            stage: stage.to_string(),
            message: message.into(),
        });
    }

    pub fn failed_paths(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.path.as_str()).collect()
    }

    /// Order every list so two runs over the same input compare equal.
    pub fn normalize(&mut self) {
        self.succeeded.sort();
        self.deleted.sort();
        self.skipped_unchanged.sort();
        self.deferred.sort();
        self.failed.sort_by(|a, b| a.path.cmp(&b.path).then(a.stage.cmp(&b.stage)));
        self.ambiguities
            .sort_by(|a, b| a.reference_id.cmp(&b.reference_id));
        self.counts.ambiguous = self.ambiguities.len();
    }
}
