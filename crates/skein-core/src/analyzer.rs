//! Export discovery over a code directory's module graph.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tracing::debug;

use crate::error::AnalysisError;
use crate::manifest::{ExportDescriptor, Manifest};
use crate::syntax::{self, ModuleInfo};

/// Parsed module graph of a code directory, keyed by module path.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: BTreeMap<String, ModuleInfo>,
}

impl ModuleGraph {
    pub fn load(code_dir: &Path) -> Result<Self, AnalysisError> {
        let mut modules = BTreeMap::new();
        for file in syntax::discover_modules(code_dir)? {
            let source =
                std::fs::read_to_string(&file.absolute).map_err(|source| AnalysisError::Io {
                    path: file.absolute.clone(),
                    source,
                })?;
            let tree = syntax::parse_module(&file.relative, &source)?;
            modules.insert(file.relative, ModuleInfo::extract(&tree.root()));
        }
        Ok(Self { modules })
    }

    pub fn from_modules(modules: impl IntoIterator<Item = (String, ModuleInfo)>) -> Self {
        Self {
            modules: modules.into_iter().collect(),
        }
    }

    pub fn get(&self, module_path: &str) -> Option<&ModuleInfo> {
        self.modules.get(module_path)
    }

    pub fn module_paths(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn resolve(&self, from_module: &str, specifier: &str) -> Option<String> {
        syntax::resolve_specifier(from_module, specifier, |candidate| {
            self.modules.contains_key(candidate)
        })
    }

    /// Direct flag of export `name` of `module`, following re-exports.
    /// `None` when the name is not an exported function.
    pub fn resolve_export(&self, module: &str, name: &str) -> Option<bool> {
        self.resolve_export_inner(module, name, &mut HashSet::new())
    }

    fn resolve_export_inner(
        &self,
        module: &str,
        name: &str,
        visited: &mut HashSet<(String, String)>,
    ) -> Option<bool> {
        if !visited.insert((module.to_string(), name.to_string())) {
            return None;
        }
        let info = self.modules.get(module)?;

        if let Some(export) = info.exports.iter().find(|e| e.exported == name) {
            return self.resolve_local(module, info, &export.local, visited);
        }
        if let Some(reexport) = info.reexports.iter().find(|r| r.exported == name) {
            let target = self.resolve(module, &reexport.specifier)?;
            return self.resolve_export_inner(&target, &reexport.imported, visited);
        }
        if name == "default" {
            return None;
        }
        info.star_exports.iter().find_map(|specifier| {
            let target = self.resolve(module, specifier)?;
            self.resolve_export_inner(&target, name, visited)
        })
    }

    /// A local name is either a function declared here or an imported binding
    /// that is exported again.
    fn resolve_local(
        &self,
        module: &str,
        info: &ModuleInfo,
        local: &str,
        visited: &mut HashSet<(String, String)>,
    ) -> Option<bool> {
        if let Some(function) = info.function(local) {
            return Some(function.direct);
        }
        let binding = info.import(local)?;
        let imported = binding.imported_name()?;
        let target = self.resolve(module, &binding.specifier)?;
        self.resolve_export_inner(&target, imported, visited)
    }

    /// Exported functions of `module` in listing order.
    fn module_exports(&self, module: &str, stack: &mut Vec<String>) -> Vec<(String, bool)> {
        if stack.iter().any(|m| m == module) {
            return Vec::new();
        }
        let Some(info) = self.modules.get(module) else {
            return Vec::new();
        };
        stack.push(module.to_string());

        let mut listed: Vec<(String, bool)> = Vec::new();
        let mut seen = HashSet::new();
        for export in &info.exports {
            if let Some(direct) = self.resolve_local(module, info, &export.local, &mut HashSet::new())
                && seen.insert(export.exported.clone())
            {
                listed.push((export.exported.clone(), direct));
            }
        }
        for reexport in &info.reexports {
            let Some(target) = self.resolve(module, &reexport.specifier) else {
                continue;
            };
            if let Some(direct) = self.resolve_export(&target, &reexport.imported)
                && seen.insert(reexport.exported.clone())
            {
                listed.push((reexport.exported.clone(), direct));
            }
        }
        for specifier in &info.star_exports {
            let Some(target) = self.resolve(module, specifier) else {
                continue;
            };
            for (name, direct) in self.module_exports(&target, stack) {
                if name != "default" && seen.insert(name.clone()) {
                    listed.push((name, direct));
                }
            }
        }

        stack.pop();
        listed
    }

    pub fn manifest(&self) -> Manifest {
        let mut exports = Vec::new();
        for module in self.modules.keys() {
            for (symbol, direct) in self.module_exports(module, &mut Vec::new()) {
                exports.push(ExportDescriptor::new(module.clone(), symbol, direct));
            }
        }
        Manifest::new(exports)
    }
}

/// Produces the export manifest of `code_dir`.
pub fn analyze(code_dir: &Path) -> Result<Manifest, AnalysisError> {
    let graph = ModuleGraph::load(code_dir)?;
    let manifest = graph.manifest();
    debug!(
        code_dir = %code_dir.display(),
        modules = graph.modules.len(),
        exports = manifest.len(),
        "analyzed code directory"
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, path: &str, contents: &str) {
        let full = dir.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, contents).unwrap();
    }

    fn names(manifest: &Manifest) -> Vec<(String, String, bool)> {
        manifest
            .exports()
            .iter()
            .map(|e| (e.module_path.clone(), e.symbol_name.clone(), e.is_direct_call))
            .collect()
    }

    #[test]
    fn test_direct_and_durable_exports() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "lib.js",
            r#"
/** @direct */
export function greet(name) {
  return "hello " + name;
}

export async function fetchRemote(id) {
  return { id };
}

export const VERSION = "1";
"#,
        );

        let manifest = analyze(dir.path()).unwrap();
        assert_eq!(
            names(&manifest),
            vec![
                ("lib.js".into(), "greet".into(), true),
                ("lib.js".into(), "fetchRemote".into(), false),
            ]
        );
    }

    #[test]
    fn test_nested_reexports_inherit_direct_flag() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "util/math.js",
            "// @direct\nexport const add = (a, b) => a + b;\nexport function slow() {}\nexport default function () {}\n",
        );
        write(&dir, "util/index.js", "export * from './math.js';\n");
        write(
            &dir,
            "main.js",
            "export { add as plus } from './util';\nexport * from './util/index.js';\nexport function main() {}\n",
        );

        let manifest = analyze(dir.path()).unwrap();
        assert_eq!(
            names(&manifest),
            vec![
                ("main.js".into(), "main".into(), false),
                ("main.js".into(), "plus".into(), true),
                ("main.js".into(), "add".into(), true),
                ("main.js".into(), "slow".into(), false),
                ("util/index.js".into(), "add".into(), true),
                ("util/index.js".into(), "slow".into(), false),
                ("util/math.js".into(), "add".into(), true),
                ("util/math.js".into(), "slow".into(), false),
                ("util/math.js".into(), "default".into(), false),
            ]
        );
    }

    #[test]
    fn test_reexport_cycles_terminate() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.js", "export * from './b.js';\nexport function fromA() {}\n");
        write(&dir, "b.js", "export * from './a.js';\nexport function fromB() {}\n");

        let manifest = analyze(dir.path()).unwrap();
        assert_eq!(
            names(&manifest),
            vec![
                ("a.js".into(), "fromA".into(), false),
                ("a.js".into(), "fromB".into(), false),
                ("b.js".into(), "fromB".into(), false),
                ("b.js".into(), "fromA".into(), false),
            ]
        );
    }

    #[test]
    fn test_node_modules_and_hidden_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(&dir, "main.js", "export function main() {}\n");
        write(&dir, "node_modules/pkg/index.js", "export function leaked() {}\n");
        write(&dir, ".cache/x.js", "export function hidden() {}\n");
        write(&dir, "notes.txt", "export function notCode() {}\n");

        let manifest = analyze(dir.path()).unwrap();
        assert_eq!(names(&manifest), vec![("main.js".into(), "main".into(), false)]);
    }

    #[test]
    fn test_syntax_error_yields_no_manifest() {
        let dir = TempDir::new().unwrap();
        write(&dir, "good.js", "export function ok() {}\n");
        write(&dir, "bad.js", "export function broken( {\n  return )(;\n");

        let err = analyze(dir.path()).unwrap_err();
        assert!(matches!(err, AnalysisError::Syntax { ref path, .. } if path == "bad.js"));
    }

    #[test]
    fn test_unclosed_body_or_parameters_yield_no_manifest() {
        for source in [
            "export function f() {\n  return 1;\n",
            "export function f(a {\n  return a;\n}\n",
        ] {
            let dir = TempDir::new().unwrap();
            write(&dir, "bad.js", source);
            let err = analyze(dir.path()).unwrap_err();
            assert!(matches!(err, AnalysisError::Syntax { .. }), "{source:?}: {err:?}");
        }
    }

    #[test]
    fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        let err = analyze(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, AnalysisError::Io { .. }));

        write(&dir, "file.js", "");
        let err = analyze(&dir.path().join("file.js")).unwrap_err();
        assert!(matches!(err, AnalysisError::NotADirectory(_)));
    }
}
