#![allow(dead_code)]

use anyhow::Result;
use tempfile::TempDir;

use trellis_core::models::{AstNode, ChangeKind, ChangeSet, FileChange};
use trellis_core::{open_store, GraphStore, IndexConfig};

pub fn make_store(config: &IndexConfig) -> Result<(TempDir, GraphStore)> {
    let dir = TempDir::new()?;
    let store = open_store(dir.path().join("graph.db"), config)?;
    Ok((dir, store))
}

pub fn module(children: Vec<AstNode>) -> AstNode {
    AstNode::new("module", None, 1, 200).with_children(children)
}

pub fn function(name: &str, start: i64, children: Vec<AstNode>) -> AstNode {
    AstNode::new("function", Some(name), start, start + 3).with_children(children)
}

pub fn method(name: &str, start: i64, children: Vec<AstNode>) -> AstNode {
    AstNode::new("method", Some(name), start, start + 3).with_children(children)
}

pub fn class(name: &str, start: i64, children: Vec<AstNode>) -> AstNode {
    AstNode::new("class", Some(name), start, start + 20).with_children(children)
}

pub fn mention(kind: &str, name: &str, line: i64) -> AstNode {
    AstNode::new(kind, Some(name), line, line)
}

pub fn upsert(path: &str, children: Vec<AstNode>) -> FileChange {
    FileChange {
        path: path.to_string(),
        change_kind: ChangeKind::Modified,
        content: Some(serde_json::to_string(&module(children)).expect("AST serializes")),
    }
}

pub fn raw(path: &str, content: &str) -> FileChange {
    FileChange {
        path: path.to_string(),
        change_kind: ChangeKind::Modified,
        content: Some(content.to_string()),
    }
}

pub fn delete(path: &str) -> FileChange {
    FileChange {
        path: path.to_string(),
        change_kind: ChangeKind::Deleted,
        content: None,
    }
}

pub fn change_set(commit: &str, files: Vec<FileChange>) -> ChangeSet {
    ChangeSet {
        commit_hash: commit.to_string(),
        parent_hash: None,
        files,
    }
}
