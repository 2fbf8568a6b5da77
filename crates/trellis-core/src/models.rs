//! Shared typed models used across extraction, storage, and resolution layers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::TrellisError;

// ---------------------------------------------------------------------------
// Identifier helpers
// ---------------------------------------------------------------------------

/// First 16 hex chars of the SHA-256 digest over the given parts, each
/// separated by a NUL byte so that `("ab", "c")` and `("a", "bc")` differ.
fn short_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Stable definition identifier derived from owning file and qualified name.
pub fn definition_id(file_path: &str, qualified_name: &str) -> String {
    short_digest(&[file_path, qualified_name])
}

/// Stable reference identifier. `ordinal` disambiguates identical mentions
/// on the same line inside the same source definition.
pub fn reference_id(
    file_path: &str,
    source_qualified_name: &str,
    raw_name: &str,
    kind: ReferenceKind,
    line: i64,
    ordinal: usize,
) -> String {
    short_digest(&[
        file_path,
        source_qualified_name,
        raw_name,
        kind.as_str(),
        &line.to_string(),
        &ordinal.to_string(),
    ])
}

/// Node identifier used for file nodes in the edge table.
pub fn file_node_id(path: &str) -> String {
    format!("file:{path}")
}

/// Last dotted segment of a name (`"a.b.c"` -> `"c"`).
pub fn last_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Everything before the last dotted segment (`"a.b.c"` -> `"a.b"`).
pub fn parent_scope(qualified_name: &str) -> Option<&str> {
    qualified_name.rsplit_once('.').map(|(parent, _)| parent)
}

// ---------------------------------------------------------------------------
// Closed kind enumerations
// ---------------------------------------------------------------------------

macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = TrellisError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(TrellisError::Database(format!(
                        "unknown {} '{}'",
                        $label, other
                    ))),
                }
            }
        }
    };
}

/// Kind of a named code entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    Module,
    Class,
    Interface,
    Function,
    Method,
    Variable,
    Constant,
    Enum,
    TypeAlias,
}

string_enum!(DefinitionKind, "definition kind", {
    Module => "module",
    Class => "class",
    Interface => "interface",
    Function => "function",
    Method => "method",
    Variable => "variable",
    Constant => "constant",
    Enum => "enum",
    TypeAlias => "type_alias",
});

impl DefinitionKind {
    /// Kinds whose bodies may contain method definitions.
    pub fn is_type_like(&self) -> bool {
        matches!(
            self,
            DefinitionKind::Class | DefinitionKind::Interface | DefinitionKind::Enum
        )
    }
}

/// Kind of a raw mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Call,
    Import,
    Inherit,
    Instantiate,
    Reference,
}

string_enum!(ReferenceKind, "reference kind", {
    Call => "call",
    Import => "import",
    Inherit => "inherit",
    Instantiate => "instantiate",
    Reference => "reference",
});

impl ReferenceKind {
    /// Edge type materialized once a reference of this kind resolves.
    pub fn edge_kind(&self) -> EdgeKind {
        match self {
            ReferenceKind::Call | ReferenceKind::Instantiate => EdgeKind::Calls,
            ReferenceKind::Import => EdgeKind::Imports,
            ReferenceKind::Inherit => EdgeKind::Extends,
            ReferenceKind::Reference => EdgeKind::References,
        }
    }
}

/// Directed, typed relationship between two node identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Contains,
    Calls,
    Imports,
    Extends,
    References,
}

string_enum!(EdgeKind, "edge kind", {
    Contains => "CONTAINS",
    Calls => "CALLS",
    Imports => "IMPORTS",
    Extends => "EXTENDS",
    References => "REFERENCES",
});

/// Lifecycle state of a reference. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceState {
    Unresolved,
    Resolved,
    ExternalUnresolved,
    Tombstoned,
}

string_enum!(ReferenceState, "reference state", {
    Unresolved => "unresolved",
    Resolved => "resolved",
    ExternalUnresolved => "external_unresolved",
    Tombstoned => "tombstoned",
});

/// Indexing status of a file node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Indexed,
    ExtractionFailed,
    Deleted,
}

string_enum!(FileStatus, "file status", {
    Indexed => "indexed",
    ExtractionFailed => "extraction_failed",
    Deleted => "deleted",
});

/// Persisted phase of the incremental coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Extracting,
    Merging,
    Resolving,
    Finalizing,
}

string_enum!(RunPhase, "run phase", {
    Idle => "idle",
    Extracting => "extracting",
    Merging => "merging",
    Resolving => "resolving",
    Finalizing => "finalizing",
});

/// Kind of a file-level change in a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

string_enum!(ChangeKind, "change kind", {
    Added => "added",
    Modified => "modified",
    Deleted => "deleted",
});

// ---------------------------------------------------------------------------
// Graph records
// ---------------------------------------------------------------------------

/// A named code entity owned by exactly one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub id: String,
    pub kind: DefinitionKind,
    pub name: String,
    pub qualified_name: String,
    pub file_path: String,
    pub language: String,
    pub start_line: i64,
    pub end_line: i64,
    pub content_hash: String,
    /// Ancestor qualified names, outermost first.
    pub scope_chain: Vec<String>,
    pub parent_id: Option<String>,
    pub visibility: String,
    /// Run sequence at which the content hash last changed.
    #[serde(default)]
    pub indexed_seq: i64,
}

/// Lexical context captured at a mention site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeContext {
    /// Import alias -> imported qualified name.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Local binding -> qualified name of the declaring scope.
    #[serde(default)]
    pub locals: BTreeMap<String, String>,
    /// Enclosing scope qualified names, outermost first.
    #[serde(default)]
    pub enclosing: Vec<String>,
}

impl ScopeContext {
    /// Innermost enclosing scope, if any.
    pub fn innermost(&self) -> Option<&str> {
        self.enclosing.last().map(String::as_str)
    }
}

/// A raw mention of a name that may target a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    pub file_path: String,
    /// Innermost enclosing definition (the file's module for top-level mentions).
    pub source_id: String,
    pub raw_name: String,
    pub kind: ReferenceKind,
    pub scope: ScopeContext,
    /// Last segment of the alias-expanded name, used for re-checking
    /// external references when new definitions appear.
    pub lookup_name: String,
    pub line: i64,
    pub state: ReferenceState,
    pub target_id: Option<String>,
}

/// A stored edge. `reference_id` is `None` for CONTAINS edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub source_id: String,
    pub target_id: String,
    pub kind: EdgeKind,
    pub file_path: String,
    pub reference_id: Option<String>,
    pub created_seq: i64,
}

/// File node: owns its definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub path: String,
    pub language: String,
    pub content_hash: String,
    pub last_commit: Option<String>,
    pub status: FileStatus,
    pub failure_message: Option<String>,
}

impl FileNode {
    pub fn new(path: &str, language: &str, content_hash: &str, commit: Option<&str>) -> Self {
        Self {
            path: path.to_string(),
            language: language.to_string(),
            content_hash: content_hash.to_string(),
            last_commit: commit.map(str::to_string),
            status: FileStatus::Indexed,
            failure_message: None,
        }
    }

    pub fn node_id(&self) -> String {
        file_node_id(&self.path)
    }
}

// ---------------------------------------------------------------------------
// Collaborator inputs
// ---------------------------------------------------------------------------

/// One file-level change. `content` carries the serialized unified AST when
/// the change-set provider supplies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    #[serde(alias = "change_kind")]
    pub change_kind: ChangeKind,
    #[serde(default, rename = "contentBlob", alias = "content_blob", alias = "content")]
    pub content: Option<String>,
}

/// File-level changes between two repository states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    #[serde(alias = "commit_hash")]
    pub commit_hash: String,
    #[serde(default, alias = "parent_hash")]
    pub parent_hash: Option<String>,
    #[serde(default)]
    pub files: Vec<FileChange>,
}

impl ChangeSet {
    /// Collapse repeated paths so the last listed change wins, preserving
    /// the order of each path's final appearance.
    pub fn normalized(&self) -> Vec<FileChange> {
        let mut last: indexmap::IndexMap<&str, &FileChange> = indexmap::IndexMap::new();
        for change in &self.files {
            last.shift_remove(change.path.as_str());
            last.insert(change.path.as_str(), change);
        }
        last.into_values().cloned().collect()
    }
}

/// Node of the language-agnostic unified AST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AstNode {
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Import alias (`import x.y as z` carries `z`).
    #[serde(default)]
    pub alias: Option<String>,
    /// Names of the enclosing definitions below the module, outermost first.
    #[serde(default, alias = "qualified_scope_path")]
    pub qualified_scope_path: Option<Vec<String>>,
    #[serde(alias = "start_line")]
    pub start_line: i64,
    #[serde(alias = "end_line")]
    pub end_line: i64,
    #[serde(default)]
    pub children: Vec<AstNode>,
}

impl AstNode {
    pub fn new(kind: &str, name: Option<&str>, start_line: i64, end_line: i64) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.map(str::to_string),
            alias: None,
            qualified_scope_path: None,
            start_line,
            end_line,
            children: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn with_children(mut self, children: Vec<AstNode>) -> Self {
        self.children = children;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_id_deterministic() {
        let a = definition_id("a.py", "a.foo");
        assert_eq!(a, definition_id("a.py", "a.foo"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, definition_id("b.py", "a.foo"));
    }

    #[test]
    fn test_digest_separates_parts() {
        assert_ne!(definition_id("ab", "c"), definition_id("a", "bc"));
    }

    #[test]
    fn test_reference_kind_edge_mapping() {
        assert_eq!(ReferenceKind::Call.edge_kind(), EdgeKind::Calls);
        assert_eq!(ReferenceKind::Instantiate.edge_kind(), EdgeKind::Calls);
        assert_eq!(ReferenceKind::Import.edge_kind(), EdgeKind::Imports);
        assert_eq!(ReferenceKind::Inherit.edge_kind(), EdgeKind::Extends);
        assert_eq!(ReferenceKind::Reference.edge_kind(), EdgeKind::References);
    }

    #[test]
    fn test_kind_round_trip_strings() {
        for kind in DefinitionKind::ALL {
            assert_eq!(kind.as_str().parse::<DefinitionKind>().unwrap(), *kind);
        }
        assert!("struct".parse::<DefinitionKind>().is_err());
        assert_eq!(EdgeKind::Calls.to_string(), "CALLS");
    }

    #[test]
    fn test_segments() {
        assert_eq!(last_segment("a.b.c"), "c");
        assert_eq!(last_segment("c"), "c");
        assert_eq!(parent_scope("a.b.c"), Some("a.b"));
        assert_eq!(parent_scope("c"), None);
    }

    #[test]
    fn test_changeset_last_entry_wins() {
        let cs = ChangeSet {
            commit_hash: "c1".into(),
            parent_hash: None,
            files: vec![
                FileChange {
                    path: "a.py".into(),
                    change_kind: ChangeKind::Added,
                    content: Some("1".into()),
                },
                FileChange {
                    path: "b.py".into(),
                    change_kind: ChangeKind::Added,
                    content: None,
                },
                FileChange {
                    path: "a.py".into(),
                    change_kind: ChangeKind::Deleted,
                    content: None,
                },
            ],
        };
        let normalized = cs.normalized();
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].path, "b.py");
        assert_eq!(normalized[1].change_kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_ast_deserializes_with_defaults() {
        let node: AstNode = serde_json::from_str(
            r#"{"kind":"module","startLine":1,"endLine":9,"children":[{"kind":"call","name":"foo","startLine":3,"endLine":3}]}"#,
        )
        .unwrap();
        assert_eq!(node.children[0].name.as_deref(), Some("foo"));
        assert_eq!(node.children[0].start_line, 3);
        assert!(node.qualified_scope_path.is_none());
    }

    #[test]
    fn test_ast_wire_field_names() {
        let node: AstNode = serde_json::from_str(
            r#"{"kind":"call","name":"bar","qualifiedScopePath":["x"],"startLine":5,"endLine":9}"#,
        )
        .unwrap();
        assert_eq!((node.start_line, node.end_line), (5, 9));
        assert_eq!(node.qualified_scope_path, Some(vec!["x".to_string()]));

        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["startLine"], 5);
        assert_eq!(json["qualifiedScopePath"][0], "x");
    }

    #[test]
    fn test_ast_node_without_span_is_rejected() {
        let missing = serde_json::from_str::<AstNode>(r#"{"kind":"call","name":"bar"}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn test_change_set_wire_format() {
        let cs: ChangeSet = serde_json::from_str(
            r#"{
                "commitHash": "c2",
                "parentHash": "c1",
                "files": [
                    {"path": "a.py", "changeKind": "deleted"},
                    {"path": "b.py", "changeKind": "added", "contentBlob": "{}"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(cs.commit_hash, "c2");
        assert_eq!(cs.parent_hash.as_deref(), Some("c1"));
        assert_eq!(cs.files[0].change_kind, ChangeKind::Deleted);
        assert_eq!(cs.files[0].content, None);
        assert_eq!(cs.files[1].content.as_deref(), Some("{}"));

        let json = serde_json::to_value(&cs).unwrap();
        assert_eq!(json["commitHash"], "c2");
        assert_eq!(json["files"][1]["changeKind"], "added");
        assert_eq!(json["files"][1]["contentBlob"], "{}");
    }
}
