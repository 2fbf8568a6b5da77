//! Extraction pipeline with Rayon-based parallelism.

use std::path::PathBuf;

use rayon::prelude::*;
use tracing::warn;

use crate::indexer::cancel::CancelToken;
use crate::indexer::filesystem::{compute_content_hash, language_or_unknown, normalize_path};
use crate::indexer::symbols::{extract_file, FileExtraction};
use crate::models::{AstNode, FileNode};

// ---------------------------------------------------------------------------
// Parser collaborator
// ---------------------------------------------------------------------------

/// Produces the unified AST for a file. Grammars live outside this crate.
pub trait AstProvider: Sync {
    fn parse(&self, path: &str, language: &str, content: &str) -> Result<AstNode, String>;

    /// Current content of a file the change set did not carry (full
    /// reindex, or a change without a content blob).
    fn fetch(&self, path: &str) -> Result<String, String> {
        Err(format!("no content available for {path}"))
    }
}

/// Reads content blobs that are JSON-serialized unified ASTs. With a root
/// directory, missing content is read from `root/<path>`.
#[derive(Debug, Clone, Default)]
pub struct JsonAstProvider {
    root: Option<PathBuf>,
}

impl JsonAstProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

impl AstProvider for JsonAstProvider {
    fn parse(&self, _path: &str, _language: &str, content: &str) -> Result<AstNode, String> {
        serde_json::from_str(content).map_err(|e| format!("invalid unified AST: {e}"))
    }

    fn fetch(&self, path: &str) -> Result<String, String> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| format!("no content available for {path}"))?;
        std::fs::read_to_string(root.join(path)).map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub struct ExtractionJob {
    pub file: FileNode,
    pub content: String,
}

impl ExtractionJob {
    /// Build a job, hashing the content and detecting the language.
    pub fn new(path: &str, content: String, commit: Option<&str>) -> Self {
        let path = normalize_path(path);
        let language = language_or_unknown(&path);
        let hash = compute_content_hash(content.as_bytes());
        Self {
            file: FileNode::new(&path, &language, &hash, commit),
            content,
        }
    }
}

#[derive(Debug)]
pub enum ExtractionResult {
    Extracted(FileExtraction),
    Failed {
        file: FileNode,
        stage: String,
        message: String,
        content: String,
    },
    Cancelled(String),
}

impl ExtractionResult {
    pub fn path(&self) -> &str {
        match self {
            ExtractionResult::Extracted(extraction) => &extraction.file.path,
            ExtractionResult::Failed { file, .. } => &file.path,
            ExtractionResult::Cancelled(path) => path,
        }
    }
}

fn extract_file_worker(
    provider: &dyn AstProvider,
    job: &ExtractionJob,
    cancel: &CancelToken,
) -> ExtractionResult {
    if cancel.is_cancelled() {
        return ExtractionResult::Cancelled(job.file.path.clone());
    }
    let failed = |stage: &str, message: String| {
        warn!("Extraction failed for {} ({stage}): {message}", job.file.path);
        ExtractionResult::Failed {
            file: job.file.clone(),
            stage: stage.to_string(),
            message,
            content: job.content.clone(),
        }
    };
    let ast = match provider.parse(&job.file.path, &job.file.language, &job.content) {
        Ok(ast) => ast,
        Err(message) => return failed("parse", message),
    };
    match extract_file(&job.file, &ast) {
        Ok(extraction) => ExtractionResult::Extracted(extraction),
        Err(e) => failed("extract", e.to_string()),
    }
}

/// Extract every job on a bounded pool. Results follow the order of `jobs`.
pub fn parallel_extract(
    provider: &dyn AstProvider,
    jobs: &[ExtractionJob],
    workers: usize,
    cancel: &CancelToken,
) -> Vec<ExtractionResult> {
    if jobs.is_empty() {
        return vec![];
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();

    match pool {
        Ok(pool) => pool.install(|| {
            jobs.par_iter()
                .map(|job| extract_file_worker(provider, job, cancel))
                .collect()
        }),
        Err(_) => {
            // Fallback to sequential
            jobs.iter()
                .map(|job| extract_file_worker(provider, job, cancel))
                .collect()
        }
    }
}
