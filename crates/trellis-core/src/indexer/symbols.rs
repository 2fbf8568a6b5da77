//! Definition and reference extraction from the unified AST.
//!
//! Extraction is a pure function of one file's AST: it emits the file's
//! definitions, its raw (unresolved) references with the lexical context at
//! each mention, and the CONTAINS hierarchy `file -> module -> ... -> leaf`.
//! Nothing here looks outside the file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use tracing::debug;

use crate::errors::{TrellisError, TrellisResult};
use crate::indexer::filesystem::compute_content_hash;
use crate::models::{
    definition_id, last_segment, reference_id, AstNode, Definition, DefinitionKind, FileNode,
    Reference, ReferenceKind, ReferenceState, ScopeContext,
};

/// Nesting limit for AST traversal; deeper trees are rejected as malformed.
pub const MAX_AST_DEPTH: usize = 1024;

// ---------------------------------------------------------------------------
// Extracted types
// ---------------------------------------------------------------------------

/// Everything one file contributes to the graph.
#[derive(Clone, Debug)]
pub struct FileExtraction {
    pub file: FileNode,
    pub definitions: Vec<Definition>,
    pub references: Vec<Reference>,
    /// CONTAINS pairs `(parent node id, child definition id)`.
    pub contains: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

/// Convert a file path to a dotted module name.
///
/// Strips the file extension and joins path components with dots,
/// skipping any leading `/` or `.` segments.
pub fn to_module_name(path: &str) -> String {
    let p = Path::new(path);
    let without_ext = p.with_extension("");
    let parts: Vec<&str> = without_ext
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(os) => os.to_str(),
            _ => None,
        })
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    parts.join(".")
}

/// Determine visibility from a name: "private" if it starts with `_`, else "public".
pub fn visibility(name: &str) -> &'static str {
    if name.starts_with('_') {
        "private"
    } else {
        "public"
    }
}

enum NodeRole {
    Definition(DefinitionKind),
    Reference(ReferenceKind),
    Binding,
    Transparent,
}

fn classify(kind: &str) -> NodeRole {
    if let Ok(def_kind) = kind.parse::<DefinitionKind>() {
        return NodeRole::Definition(def_kind);
    }
    if let Ok(ref_kind) = kind.parse::<ReferenceKind>() {
        return NodeRole::Reference(ref_kind);
    }
    match kind {
        "local" | "parameter" => NodeRole::Binding,
        _ => NodeRole::Transparent,
    }
}

/// Hash of a definition subtree with lines made relative to its start, so
/// moving an unchanged definition within the file keeps its hash.
fn subtree_hash(node: &AstNode) -> String {
    fn write_canonical(node: &AstNode, base: i64, out: &mut String) {
        out.push('(');
        out.push_str(&node.kind);
        out.push('|');
        out.push_str(node.name.as_deref().unwrap_or(""));
        out.push('|');
        out.push_str(node.alias.as_deref().unwrap_or(""));
        out.push('|');
        out.push_str(&(node.start_line - base).to_string());
        out.push(':');
        out.push_str(&(node.end_line - base).to_string());
        for child in &node.children {
            write_canonical(child, base, out);
        }
        out.push(')');
    }
    let mut canonical = String::new();
    write_canonical(node, node.start_line, &mut canonical);
    compute_content_hash(canonical.as_bytes())
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

struct Frame {
    qualified_name: String,
    definition_id: String,
    /// Definition names below the module, outermost first.
    relative_path: Vec<String>,
    aliases: BTreeMap<String, String>,
    locals: BTreeMap<String, String>,
}

struct Extractor<'a> {
    file: &'a FileNode,
    frames: Vec<Frame>,
    definitions: Vec<Definition>,
    references: Vec<Reference>,
    contains: Vec<(String, String)>,
    seen_qualified: HashSet<String>,
    ordinals: HashMap<(String, String, ReferenceKind, i64), usize>,
}

impl<'a> Extractor<'a> {
    fn fail(&self, message: String) -> TrellisError {
        TrellisError::Extraction {
            path: self.file.path.clone(),
            message,
        }
    }

    fn current(&self) -> TrellisResult<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| self.fail("traversal lost its module scope".to_string()))
    }

    fn current_mut(&mut self) -> TrellisResult<&mut Frame> {
        let path = self.file.path.clone();
        self.frames.last_mut().ok_or(TrellisError::Extraction {
            path,
            message: "traversal lost its module scope".to_string(),
        })
    }

    fn validate(&self, node: &AstNode) -> TrellisResult<()> {
        if node.end_line < node.start_line {
            return Err(self.fail(format!(
                "node '{}' ends (line {}) before it starts (line {})",
                node.kind, node.end_line, node.start_line
            )));
        }
        if let Some(declared) = &node.qualified_scope_path {
            let actual = &self.current()?.relative_path;
            if declared != actual {
                return Err(self.fail(format!(
                    "node '{}' declares scope {:?} but is nested in {:?}",
                    node.kind, declared, actual
                )));
            }
        }
        Ok(())
    }

    fn required_name<'n>(&self, node: &'n AstNode) -> TrellisResult<&'n str> {
        match node.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(self.fail(format!(
                "'{}' node at line {} has no name",
                node.kind, node.start_line
            ))),
        }
    }

    /// Merge bindings visible at this point, inner frames overriding outer.
    fn scope_snapshot(&self) -> ScopeContext {
        let mut context = ScopeContext::default();
        for frame in &self.frames {
            for (alias, target) in &frame.aliases {
                context.aliases.insert(alias.clone(), target.clone());
            }
            for (local, scope) in &frame.locals {
                context.locals.insert(local.clone(), scope.clone());
            }
            context.enclosing.push(frame.qualified_name.clone());
        }
        context
    }

    fn visit_children(&mut self, node: &AstNode, depth: usize) -> TrellisResult<()> {
        for child in &node.children {
            self.visit(child, depth + 1)?;
        }
        Ok(())
    }

    fn visit(&mut self, node: &AstNode, depth: usize) -> TrellisResult<()> {
        if depth > MAX_AST_DEPTH {
            return Err(self.fail(format!("AST nesting exceeds {MAX_AST_DEPTH} levels")));
        }
        self.validate(node)?;
        match classify(&node.kind) {
            NodeRole::Definition(kind) => self.visit_definition(node, kind, depth),
            NodeRole::Reference(kind) => self.visit_reference(node, kind, depth),
            NodeRole::Binding => {
                let name = self.required_name(node)?.to_string();
                let frame = self.current_mut()?;
                let scope = frame.qualified_name.clone();
                frame.locals.insert(name, scope);
                self.visit_children(node, depth)
            }
            NodeRole::Transparent => self.visit_children(node, depth),
        }
    }

    fn visit_definition(
        &mut self,
        node: &AstNode,
        kind: DefinitionKind,
        depth: usize,
    ) -> TrellisResult<()> {
        let name = self.required_name(node)?.to_string();
        let parent = self.current()?;
        let qualified_name = format!("{}.{}", parent.qualified_name, name);
        let parent_id = parent.definition_id.clone();
        let mut relative_path = parent.relative_path.clone();
        relative_path.push(name.clone());
        let id = definition_id(&self.file.path, &qualified_name);
        if !self.seen_qualified.insert(qualified_name.clone()) {
            // The first definition wins; references in the duplicate's body
            // belong to it.
            debug!(
                "Folding duplicate definition {qualified_name} in {} into the first",
                self.file.path
            );
            return self.visit_in_frame(node, depth, qualified_name, id, relative_path);
        }

        let scope_chain: Vec<String> = self
            .frames
            .iter()
            .map(|f| f.qualified_name.clone())
            .collect();

        self.definitions.push(Definition {
            id: id.clone(),
            kind,
            name: name.clone(),
            qualified_name: qualified_name.clone(),
            file_path: self.file.path.clone(),
            language: self.file.language.clone(),
            start_line: node.start_line,
            end_line: node.end_line,
            content_hash: subtree_hash(node),
            scope_chain,
            parent_id: Some(parent_id.clone()),
            visibility: visibility(&name).to_string(),
            indexed_seq: 0,
        });
        self.contains.push((parent_id, id.clone()));
        self.visit_in_frame(node, depth, qualified_name, id, relative_path)
    }

    fn visit_in_frame(
        &mut self,
        node: &AstNode,
        depth: usize,
        qualified_name: String,
        definition_id: String,
        relative_path: Vec<String>,
    ) -> TrellisResult<()> {
        self.frames.push(Frame {
            qualified_name,
            definition_id,
            relative_path,
            aliases: BTreeMap::new(),
            locals: BTreeMap::new(),
        });
        let result = self.visit_children(node, depth);
        self.frames.pop();
        result
    }

    fn visit_reference(
        &mut self,
        node: &AstNode,
        kind: ReferenceKind,
        depth: usize,
    ) -> TrellisResult<()> {
        let raw_name = self.required_name(node)?.to_string();
        // The mention sees bindings declared before it, not its own alias.
        let scope = self.scope_snapshot();
        let frame = self.current()?;
        let source_id = frame.definition_id.clone();
        let source_qualified = frame.qualified_name.clone();

        let ordinal_key = (source_qualified.clone(), raw_name.clone(), kind, node.start_line);
        let ordinal = self.ordinals.entry(ordinal_key).or_insert(0);
        let id = reference_id(
            &self.file.path,
            &source_qualified,
            &raw_name,
            kind,
            node.start_line,
            *ordinal,
        );
        *ordinal += 1;

        let lookup_name = lookup_name_for(&raw_name, &scope);
        self.references.push(Reference {
            id,
            file_path: self.file.path.clone(),
            source_id,
            raw_name: raw_name.clone(),
            kind,
            scope,
            lookup_name,
            line: node.start_line,
            state: ReferenceState::Unresolved,
            target_id: None,
        });

        if kind == ReferenceKind::Import {
            let bound = match node.alias.as_deref().map(str::trim) {
                Some(alias) if !alias.is_empty() => Some(alias.to_string()),
                _ if raw_name.contains('.') => Some(last_segment(&raw_name).to_string()),
                _ => None,
            };
            if let Some(bound) = bound {
                self.current_mut()?.aliases.insert(bound, raw_name);
            }
        }
        self.visit_children(node, depth)
    }
}

/// Last segment of the name after expanding a leading import alias.
pub fn lookup_name_for(raw_name: &str, scope: &ScopeContext) -> String {
    let (head, rest) = match raw_name.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (raw_name, None),
    };
    match (scope.aliases.get(head), rest) {
        (Some(_), Some(rest)) => last_segment(rest).to_string(),
        (Some(target), None) => last_segment(target).to_string(),
        (None, _) => last_segment(raw_name).to_string(),
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Extract definitions, references, and CONTAINS pairs from one file's AST.
///
/// The module definition is the AST root when its kind is `module`;
/// otherwise one is synthesized around the root. Any malformed node fails
/// the whole file with [`TrellisError::Extraction`].
pub fn extract_file(file: &FileNode, ast: &AstNode) -> TrellisResult<FileExtraction> {
    let module_name = to_module_name(&file.path);
    if module_name.is_empty() {
        return Err(TrellisError::Extraction {
            path: file.path.clone(),
            message: "path does not yield a module name".to_string(),
        });
    }
    if ast.end_line < ast.start_line {
        return Err(TrellisError::Extraction {
            path: file.path.clone(),
            message: format!(
                "root ends (line {}) before it starts (line {})",
                ast.end_line, ast.start_line
            ),
        });
    }

    let module_id = definition_id(&file.path, &module_name);
    let module = Definition {
        id: module_id.clone(),
        kind: DefinitionKind::Module,
        name: last_segment(&module_name).to_string(),
        qualified_name: module_name.clone(),
        file_path: file.path.clone(),
        language: file.language.clone(),
        start_line: ast.start_line,
        end_line: ast.end_line,
        content_hash: subtree_hash(ast),
        scope_chain: Vec::new(),
        parent_id: None,
        visibility: "public".to_string(),
        indexed_seq: 0,
    };

    let mut extractor = Extractor {
        file,
        frames: vec![Frame {
            qualified_name: module_name.clone(),
            definition_id: module_id.clone(),
            relative_path: Vec::new(),
            aliases: BTreeMap::new(),
            locals: BTreeMap::new(),
        }],
        definitions: vec![module],
        references: Vec::new(),
        contains: vec![(file.node_id(), module_id)],
        seen_qualified: HashSet::from([module_name]),
        ordinals: HashMap::new(),
    };

    if ast.kind == "module" {
        if let Some(declared) = &ast.qualified_scope_path {
            if !declared.is_empty() {
                return Err(extractor.fail(format!(
                    "module root declares non-empty scope {declared:?}"
                )));
            }
        }
        extractor.visit_children(ast, 0)?;
    } else {
        extractor.visit(ast, 0)?;
    }

    let Extractor {
        definitions,
        references,
        contains,
        ..
    } = extractor;
    Ok(FileExtraction {
        file: file.clone(),
        definitions,
        references,
        contains,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
