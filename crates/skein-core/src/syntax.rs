//! Parsing helpers shared by the analyzer, the transformer and the bundler.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use ast_grep_core::tree_sitter::StrDoc;
use ast_grep_core::{AstGrep, Node};
use ast_grep_language::{LanguageExt, SupportLang};
use ignore::WalkBuilder;

use crate::error::AnalysisError;

pub type SyntaxTree = AstGrep<StrDoc<SupportLang>>;
pub type SyntaxNode<'r> = Node<'r, StrDoc<SupportLang>>;

/// Tag that marks a function as safe to run without suspension.
pub const DIRECT_TAG: &str = "@direct";

const SCRIPT_EXTENSIONS: &[&str] = &["js", "mjs"];

pub fn is_script_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SCRIPT_EXTENSIONS.contains(&ext))
}

/// A file below a code directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// `/`-separated path relative to the code directory.
    pub relative: String,
    pub absolute: PathBuf,
}

/// Lists every file below `code_dir`, sorted by relative path. Hidden
/// entries are skipped, `node_modules` only when `include_packages` is false.
pub fn walk_code_dir(
    code_dir: &Path,
    include_packages: bool,
) -> Result<Vec<SourceFile>, AnalysisError> {
    let metadata = std::fs::metadata(code_dir).map_err(|source| AnalysisError::Io {
        path: code_dir.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(AnalysisError::NotADirectory(code_dir.to_path_buf()));
    }

    let mut walker = WalkBuilder::new(code_dir);
    walker.standard_filters(false);
    walker.hidden(true);
    walker.sort_by_file_path(|a, b| a.cmp(b));
    if !include_packages {
        walker.filter_entry(|entry| entry.file_name() != "node_modules");
    }

    let mut files = Vec::new();
    for result in walker.build() {
        let entry = result?;
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let absolute = entry.path().to_path_buf();
        let Ok(relative) = absolute.strip_prefix(code_dir) else {
            continue;
        };
        files.push(SourceFile {
            relative: to_module_path(relative),
            absolute,
        });
    }
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// Module files of a code directory, excluding installed packages.
pub fn discover_modules(code_dir: &Path) -> Result<Vec<SourceFile>, AnalysisError> {
    Ok(walk_code_dir(code_dir, false)?
        .into_iter()
        .filter(|file| is_script_file(&file.absolute))
        .collect())
}

pub fn to_module_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Parses a module and rejects it if tree-sitter had to recover from an error.
pub fn parse_module(path: &str, source: &str) -> Result<SyntaxTree, AnalysisError> {
    let tree = SupportLang::JavaScript.ast_grep(source);
    if let Some(error) = first_error(&tree.root()) {
        let (line, column) = position(&error);
        return Err(AnalysisError::Syntax {
            path: path.to_string(),
            line,
            column,
        });
    }
    Ok(tree)
}

fn first_error<'r>(node: &SyntaxNode<'r>) -> Option<SyntaxNode<'r>> {
    if node.is_error() || node.is_missing() {
        return Some(node.clone());
    }
    node.children().find_map(|child| first_error(&child))
}

/// 1-based line and column of a node's first character.
pub fn position(node: &SyntaxNode<'_>) -> (usize, usize) {
    let start = node.start_pos();
    (start.line() + 1, start.column(node) + 1)
}

/// Contents of a string literal node, quotes removed.
pub fn string_value(node: &SyntaxNode<'_>) -> String {
    unquote(&node.text())
}

/// Strips one pair of surrounding quotes from a string literal.
pub fn unquote(literal: &str) -> String {
    literal
        .strip_prefix(['"', '\''])
        .and_then(|t| t.strip_suffix(['"', '\'']))
        .unwrap_or(literal)
        .to_string()
}

pub fn is_relative_specifier(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
}

/// Package name of a bare specifier, `@scope/pkg/sub` -> `@scope/pkg`.
pub fn package_name(specifier: &str) -> Option<String> {
    if is_relative_specifier(specifier) || specifier.contains(':') || specifier.is_empty() {
        return None;
    }
    let mut parts = specifier.split('/');
    let first = parts.next()?;
    if first.starts_with('@') {
        let second = parts.next()?;
        Some(format!("{first}/{second}"))
    } else {
        Some(first.to_string())
    }
}

/// Resolves a relative specifier imported by `from_module` to a module path.
///
/// Candidates are tried in order: the path itself, with `.js`, with `.mjs`,
/// then `index.js` below it. Bare specifiers resolve to `None`.
pub fn resolve_specifier(
    from_module: &str,
    specifier: &str,
    exists: impl Fn(&str) -> bool,
) -> Option<String> {
    if !is_relative_specifier(specifier) {
        return None;
    }
    let mut parts: Vec<&str> = if specifier.starts_with('/') {
        Vec::new()
    } else {
        let mut base: Vec<&str> = from_module.split('/').collect();
        base.pop();
        base
    };
    for segment in specifier.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if joined.is_empty() {
        return None;
    }
    [
        joined.clone(),
        format!("{joined}.js"),
        format!("{joined}.mjs"),
        format!("{joined}/index.js"),
    ]
    .into_iter()
    .find(|candidate| exists(candidate))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFunction {
    pub name: String,
    pub direct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalExport {
    pub exported: String,
    pub local: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReExport {
    pub specifier: String,
    pub imported: String,
    pub exported: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportKind {
    Named(String),
    Default,
    Namespace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    pub local: String,
    pub specifier: String,
    pub kind: ImportKind,
}

impl ImportBinding {
    /// Name of the export this binding refers to, if it names one.
    pub fn imported_name(&self) -> Option<&str> {
        match &self.kind {
            ImportKind::Named(name) => Some(name),
            ImportKind::Default => Some("default"),
            ImportKind::Namespace => None,
        }
    }
}

/// Top-level declarations of one module that matter for call classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub functions: Vec<LocalFunction>,
    pub exports: Vec<LocalExport>,
    pub reexports: Vec<ReExport>,
    pub star_exports: Vec<String>,
    pub imports: Vec<ImportBinding>,
}

impl ModuleInfo {
    pub fn extract(root: &SyntaxNode<'_>) -> Self {
        let mut info = ModuleInfo::default();
        for statement in root.children() {
            match &*statement.kind() {
                "import_statement" => info.collect_import(&statement),
                "export_statement" => info.collect_export(&statement),
                _ => {
                    let direct = has_direct_tag(&statement);
                    info.collect_declaration(&statement, direct, None);
                }
            }
        }
        info
    }

    pub fn function(&self, name: &str) -> Option<&LocalFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn import(&self, local: &str) -> Option<&ImportBinding> {
        self.imports.iter().find(|i| i.local == local)
    }

    pub fn is_exported(&self, local: &str) -> bool {
        self.exports.iter().any(|e| e.local == local)
    }

    /// Every specifier this module pulls in statically.
    pub fn specifiers(&self) -> impl Iterator<Item = &str> {
        self.imports
            .iter()
            .map(|i| i.specifier.as_str())
            .chain(self.reexports.iter().map(|r| r.specifier.as_str()))
            .chain(self.star_exports.iter().map(String::as_str))
    }

    fn collect_import(&mut self, statement: &SyntaxNode<'_>) {
        let Some(source) = statement.field("source") else {
            return;
        };
        let specifier = string_value(&source);
        let Some(clause) = statement
            .children()
            .find(|c| c.kind() == "import_clause")
        else {
            return;
        };
        for part in clause.children() {
            match &*part.kind() {
                "identifier" => self.imports.push(ImportBinding {
                    local: part.text().to_string(),
                    specifier: specifier.clone(),
                    kind: ImportKind::Default,
                }),
                "namespace_import" => {
                    if let Some(ident) = part.children().find(|c| c.kind() == "identifier") {
                        self.imports.push(ImportBinding {
                            local: ident.text().to_string(),
                            specifier: specifier.clone(),
                            kind: ImportKind::Namespace,
                        });
                    }
                }
                "named_imports" => {
                    for spec in part.children().filter(|c| c.kind() == "import_specifier") {
                        let Some(name) = spec.field("name") else {
                            continue;
                        };
                        let imported = specifier_name(&name);
                        let local = spec
                            .field("alias")
                            .map(|a| a.text().to_string())
                            .unwrap_or_else(|| imported.clone());
                        let kind = if imported == "default" {
                            ImportKind::Default
                        } else {
                            ImportKind::Named(imported)
                        };
                        self.imports.push(ImportBinding {
                            local,
                            specifier: specifier.clone(),
                            kind,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    fn collect_export(&mut self, statement: &SyntaxNode<'_>) {
        let direct = has_direct_tag(statement);
        let is_default = statement.children().any(|c| c.kind() == "default");

        if let Some(source) = statement.field("source") {
            let specifier = string_value(&source);
            if let Some(clause) = statement.children().find(|c| c.kind() == "export_clause") {
                for (imported, exported) in export_clause_names(&clause) {
                    self.reexports.push(ReExport {
                        specifier: specifier.clone(),
                        imported,
                        exported,
                    });
                }
            } else if statement.children().any(|c| c.kind() == "*") {
                self.star_exports.push(specifier);
            }
            return;
        }

        if let Some(clause) = statement.children().find(|c| c.kind() == "export_clause") {
            for (local, exported) in export_clause_names(&clause) {
                self.exports.push(LocalExport { exported, local });
            }
            return;
        }

        if let Some(declaration) = statement.field("declaration") {
            let exported = if is_default { Some("default") } else { None };
            for name in self.collect_declaration(&declaration, direct, exported) {
                let exported = if is_default {
                    "default".to_string()
                } else {
                    name.clone()
                };
                self.exports.push(LocalExport {
                    exported,
                    local: name,
                });
            }
            return;
        }

        if is_default && let Some(value) = statement.field("value") {
            let value = unparenthesize(value);
            if is_function_value(&value) {
                self.functions.push(LocalFunction {
                    name: "default".to_string(),
                    direct,
                });
                self.exports.push(LocalExport {
                    exported: "default".to_string(),
                    local: "default".to_string(),
                });
            } else if value.kind() == "identifier" {
                self.exports.push(LocalExport {
                    exported: "default".to_string(),
                    local: value.text().to_string(),
                });
            }
        }
    }

    /// Records top-level function declarations and returns their local names.
    /// A default-exported declaration may be anonymous and is then named
    /// after `anonymous_as`.
    fn collect_declaration(
        &mut self,
        declaration: &SyntaxNode<'_>,
        direct: bool,
        anonymous_as: Option<&str>,
    ) -> Vec<String> {
        let mut names = Vec::new();
        match &*declaration.kind() {
            "function_declaration" | "generator_function_declaration" => {
                let name = declaration
                    .field("name")
                    .map(|n| n.text().to_string())
                    .or_else(|| anonymous_as.map(str::to_string));
                if let Some(name) = name {
                    self.functions.push(LocalFunction {
                        name: name.clone(),
                        direct,
                    });
                    names.push(name);
                }
            }
            "lexical_declaration" | "variable_declaration" => {
                for declarator in declaration
                    .children()
                    .filter(|c| c.kind() == "variable_declarator")
                {
                    let (Some(name), Some(value)) =
                        (declarator.field("name"), declarator.field("value"))
                    else {
                        continue;
                    };
                    if name.kind() != "identifier" || !is_function_value(&unparenthesize(value)) {
                        continue;
                    }
                    let name = name.text().to_string();
                    self.functions.push(LocalFunction {
                        name: name.clone(),
                        direct,
                    });
                    names.push(name);
                }
            }
            _ => {}
        }
        names
    }
}

fn specifier_name(node: &SyntaxNode<'_>) -> String {
    if node.kind() == "string" {
        string_value(node)
    } else {
        node.text().to_string()
    }
}

/// `(source name, exported name)` pairs of an `export { .. }` clause.
fn export_clause_names(clause: &SyntaxNode<'_>) -> Vec<(String, String)> {
    clause
        .children()
        .filter(|c| c.kind() == "export_specifier")
        .filter_map(|spec| {
            let name = specifier_name(&spec.field("name")?);
            let exported = spec
                .field("alias")
                .map(|a| specifier_name(&a))
                .unwrap_or_else(|| name.clone());
            Some((name, exported))
        })
        .collect()
}

pub fn is_function_value(node: &SyntaxNode<'_>) -> bool {
    matches!(
        &*node.kind(),
        "arrow_function" | "function_expression" | "function" | "generator_function"
    )
}

pub fn unparenthesize<'r>(mut node: SyntaxNode<'r>) -> SyntaxNode<'r> {
    while node.kind() == "parenthesized_expression" {
        let found = node.children().find(|c| c.is_named() && c.kind() != "comment");
        match found {
            Some(inner) => node = inner,
            None => break,
        }
    }
    node
}

/// True when the comment block directly above `node` carries [`DIRECT_TAG`].
pub fn has_direct_tag(node: &SyntaxNode<'_>) -> bool {
    let mut current = node.prev();
    while let Some(sibling) = current {
        if sibling.kind() != "comment" {
            return false;
        }
        if sibling.text().contains(DIRECT_TAG) {
            return true;
        }
        current = sibling.prev();
    }
    false
}

/// Names of all files in `files`, for use with [`resolve_specifier`].
pub fn module_set(files: &[SourceFile]) -> HashSet<String> {
    files.iter().map(|f| f.relative.clone()).collect()
}
