//! Rewrites qualifying call expressions into calls through the interception hook.
//!
//! A wrapped free-function call `f(a, b)` becomes
//! `__skein_call("<site>", "function", f, a, b)` and a wrapped method call
//! `obj.m(a)` becomes `__skein_call("<site>", "method", obj, "m", a)`, where
//! `<site>` is `<module>:<line>:<column>` of the original call. All source
//! text outside wrapped call sites is kept byte for byte.
//!
//! Classification only looks at top-level bindings. A local variable that
//! shadows an import or a top-level function is classified as the binding it
//! shadows.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::TransformError;
use crate::manifest::Manifest;
use crate::syntax::{self, ImportKind, ModuleInfo, SyntaxNode};
use crate::target::CallTarget;

/// Global injected by the sandbox before any user code runs.
pub const HOOK_NAME: &str = "__skein_call";

/// Globals provided by the sandbox prelude. Calls on them are never wrapped.
pub const SDK_GLOBALS: &[&str] = &["skein", "console"];

/// `Function.prototype` members that invoke or capture their receiver.
const FUNCTION_PROTOTYPE_CALLS: &[&str] = &["call", "apply", "bind"];

/// One rewritten call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub site: String,
    pub target: CallTarget,
    pub awaited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedModule {
    pub code: String,
    pub call_sites: Vec<CallSite>,
}

/// Rewrites one module against `manifest`. Relative imports resolve against
/// the modules the manifest knows about.
pub fn transform_module(
    module_path: &str,
    source: &str,
    manifest: &Manifest,
) -> Result<String, TransformError> {
    let known: HashSet<String> = manifest
        .exports()
        .iter()
        .map(|e| e.module_path.clone())
        .collect();
    Ok(Transformer::new(manifest, &known)
        .transform(module_path, source)?
        .code)
}

pub struct Transformer<'a> {
    manifest: &'a Manifest,
    known_modules: &'a HashSet<String>,
}

impl<'a> Transformer<'a> {
    pub fn new(manifest: &'a Manifest, known_modules: &'a HashSet<String>) -> Self {
        Self {
            manifest,
            known_modules,
        }
    }

    pub fn transform(
        &self,
        module_path: &str,
        source: &str,
    ) -> Result<TransformedModule, TransformError> {
        let tree = syntax::parse_module(module_path, source)?;
        let root = tree.root();
        let info = ModuleInfo::extract(&root);

        let imports = info
            .imports
            .iter()
            .map(|binding| {
                let module = syntax::resolve_specifier(module_path, &binding.specifier, |c| {
                    self.known_modules.contains(c)
                });
                (binding.local.clone(), (module, binding.kind.clone()))
            })
            .collect();

        let mut rewriter = Rewriter {
            module_path,
            source,
            info: &info,
            imports,
            manifest: self.manifest,
            call_sites: Vec::new(),
        };
        let span = root.range();
        let code = match rewriter.render(&root)? {
            Some(body) => format!("{}{body}{}", &source[..span.start], &source[span.end..]),
            None => source.to_string(),
        };
        trace!(module = module_path, sites = rewriter.call_sites.len(), "transformed module");
        Ok(TransformedModule {
            code,
            call_sites: rewriter.call_sites,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    /// An export flagged `@direct`.
    DirectExport,
    /// Any other export.
    DurableExport,
    /// Part of the module's direct-call set.
    Local,
    Unknown,
}

enum Wrap<'r> {
    Function {
        callee: SyntaxNode<'r>,
    },
    Method {
        receiver: SyntaxNode<'r>,
        /// JS string literal naming the method.
        name: String,
    },
}

struct Rewriter<'a> {
    module_path: &'a str,
    source: &'a str,
    info: &'a ModuleInfo,
    imports: HashMap<String, (Option<String>, ImportKind)>,
    manifest: &'a Manifest,
    call_sites: Vec<CallSite>,
}

impl<'a> Rewriter<'a> {
    /// Rewritten text of `node`, or `None` when nothing inside it changes.
    fn render(&mut self, node: &SyntaxNode<'_>) -> Result<Option<String>, TransformError> {
        if node.kind() == "call_expression"
            && let Some(wrap) = self.classify(node)?
        {
            return self.render_wrapped(node, wrap).map(Some);
        }
        self.render_children(node)
    }

    fn render_children(&mut self, node: &SyntaxNode<'_>) -> Result<Option<String>, TransformError> {
        let range = node.range();
        let mut out = String::new();
        let mut cursor = range.start;
        let mut changed = false;
        for child in node.children() {
            if let Some(text) = self.render(&child)? {
                let child_range = child.range();
                out.push_str(&self.source[cursor..child_range.start]);
                out.push_str(&text);
                cursor = child_range.end;
                changed = true;
            }
        }
        if !changed {
            return Ok(None);
        }
        out.push_str(&self.source[cursor..range.end]);
        Ok(Some(out))
    }

    fn text(&mut self, node: &SyntaxNode<'_>) -> Result<String, TransformError> {
        Ok(match self.render(node)? {
            Some(text) => text,
            None => self.source[node.range()].to_string(),
        })
    }

    fn render_wrapped(
        &mut self,
        call: &SyntaxNode<'_>,
        wrap: Wrap<'_>,
    ) -> Result<String, TransformError> {
        let (line, column) = syntax::position(call);
        let site = format!("{}:{}:{}", self.module_path, line, column);
        let site_literal = serde_json::Value::String(site.clone()).to_string();

        let arguments = match call.field("arguments") {
            Some(args) => self.text(&args)?,
            None => "()".to_string(),
        };
        let inner = arguments
            .strip_prefix('(')
            .and_then(|a| a.strip_suffix(')'))
            .unwrap_or("");
        let separator = if inner.trim().is_empty() { "" } else { ", " };
        let inner = if separator.is_empty() { "" } else { inner };

        let (code, target) = match wrap {
            Wrap::Function { callee } => {
                let callee_text = self.text(&callee)?;
                let target = CallTarget::function(callee.text().to_string());
                (
                    format!("{HOOK_NAME}({site_literal}, \"function\", {callee_text}{separator}{inner})"),
                    target,
                )
            }
            Wrap::Method { receiver, name } => {
                let receiver_text = self.text(&receiver)?;
                let method = syntax::unquote(&name);
                let target = CallTarget::method(receiver.text().to_string(), method);
                (
                    format!(
                        "{HOOK_NAME}({site_literal}, \"method\", {receiver_text}, {name}{separator}{inner})"
                    ),
                    target,
                )
            }
        };

        self.call_sites.push(CallSite {
            site,
            target,
            awaited: is_awaited(call),
        });
        Ok(code)
    }

    fn binding(&self, name: &str) -> Binding {
        if name == HOOK_NAME || SDK_GLOBALS.contains(&name) {
            return Binding::Local;
        }
        if let Some((module, kind)) = self.imports.get(name) {
            let imported = match kind {
                ImportKind::Named(imported) => imported.as_str(),
                ImportKind::Default => "default",
                ImportKind::Namespace => return Binding::Unknown,
            };
            return match module {
                Some(module) => self.export_binding(module, imported),
                None => Binding::Unknown,
            };
        }
        if let Some(function) = self.info.function(name) {
            return match (self.info.is_exported(name), function.direct) {
                (_, true) => Binding::DirectExport,
                (true, false) => Binding::DurableExport,
                (false, false) => Binding::Local,
            };
        }
        Binding::Unknown
    }

    fn export_binding(&self, module: &str, symbol: &str) -> Binding {
        match self.manifest.lookup(module, symbol) {
            Some(export) if export.is_direct_call => Binding::DirectExport,
            Some(_) => Binding::DurableExport,
            None => Binding::Unknown,
        }
    }

    /// Binding of `ns.member` when `ns` is a namespace import.
    fn namespace_member(&self, object: &SyntaxNode<'_>, member: &str) -> Option<Binding> {
        if object.kind() != "identifier" {
            return None;
        }
        match self.imports.get(&*object.text()) {
            Some((Some(module), ImportKind::Namespace)) => Some(self.export_binding(module, member)),
            _ => None,
        }
    }

    /// True when `node` names a durable export, directly or through a namespace.
    fn is_durable_value(&self, node: &SyntaxNode<'_>) -> bool {
        match &*node.kind() {
            "identifier" => self.binding(&node.text()) == Binding::DurableExport,
            "member_expression" => {
                let (Some(object), Some(property)) = (node.field("object"), node.field("property"))
                else {
                    return false;
                };
                let object = syntax::unparenthesize(object);
                self.namespace_member(&object, &property.text()) == Some(Binding::DurableExport)
            }
            _ => false,
        }
    }

    fn unresolvable(&self, call: &SyntaxNode<'_>) -> TransformError {
        let (line, column) = syntax::position(call);
        let snippet: String = call.text().chars().take(80).collect();
        TransformError::UnresolvableTarget {
            module: self.module_path.to_string(),
            line,
            column,
            snippet,
        }
    }

    fn classify<'r>(&self, call: &SyntaxNode<'r>) -> Result<Option<Wrap<'r>>, TransformError> {
        let Some(callee) = call.field("function") else {
            return Ok(None);
        };
        let awaited = is_awaited(call);
        let tagged = call
            .field("arguments")
            .is_some_and(|args| args.kind() == "template_string");
        let optional_call = has_optional_chain(call);
        let callee = syntax::unparenthesize(callee);

        match &*callee.kind() {
            "import" | "super" => Ok(None),
            "identifier" => {
                let must_wrap = match self.binding(&callee.text()) {
                    Binding::DirectExport | Binding::Local => false,
                    Binding::DurableExport => true,
                    Binding::Unknown => awaited,
                };
                if !must_wrap {
                    return Ok(None);
                }
                if tagged || optional_call {
                    return Err(self.unresolvable(call));
                }
                Ok(Some(Wrap::Function { callee }))
            }
            "member_expression" => {
                let (Some(object), Some(property)) =
                    (callee.field("object"), callee.field("property"))
                else {
                    return Err(self.unresolvable(call));
                };
                let object_inner = syntax::unparenthesize(object.clone());
                if object_inner.kind() == "identifier"
                    && SDK_GLOBALS.contains(&&*object_inner.text())
                {
                    return Ok(None);
                }
                if FUNCTION_PROTOTYPE_CALLS.contains(&&*property.text())
                    && self.is_durable_value(&object_inner)
                {
                    return Err(self.unresolvable(call));
                }
                let must_wrap = match self.namespace_member(&object_inner, &property.text()) {
                    Some(Binding::DirectExport) => false,
                    Some(Binding::DurableExport) => true,
                    _ => awaited,
                };
                if !must_wrap {
                    return Ok(None);
                }
                if tagged
                    || optional_call
                    || has_optional_chain(&callee)
                    || property.kind() != "property_identifier"
                    || object_inner.kind() == "super"
                {
                    return Err(self.unresolvable(call));
                }
                let name = serde_json::Value::String(property.text().to_string()).to_string();
                Ok(Some(Wrap::Method {
                    receiver: object,
                    name,
                }))
            }
            "subscript_expression" => {
                let (Some(object), Some(index)) = (callee.field("object"), callee.field("index"))
                else {
                    return Err(self.unresolvable(call));
                };
                let object_inner = syntax::unparenthesize(object.clone());
                let key = (index.kind() == "string").then(|| syntax::string_value(&index));
                if object_inner.kind() == "identifier"
                    && SDK_GLOBALS.contains(&&*object_inner.text())
                    && key.is_some()
                {
                    return Ok(None);
                }
                let namespace = key
                    .as_deref()
                    .and_then(|key| self.namespace_member(&object_inner, key));
                let must_wrap = match namespace {
                    Some(Binding::DirectExport) => false,
                    Some(Binding::DurableExport) => true,
                    _ => awaited,
                };
                if !must_wrap {
                    return Ok(None);
                }
                if key.is_none()
                    || tagged
                    || optional_call
                    || has_optional_chain(&callee)
                    || object_inner.kind() == "super"
                {
                    return Err(self.unresolvable(call));
                }
                Ok(Some(Wrap::Method {
                    receiver: object,
                    name: index.text().to_string(),
                }))
            }
            _ if syntax::is_function_value(&callee) => Ok(None),
            _ if awaited => Err(self.unresolvable(call)),
            _ => Ok(None),
        }
    }
}

fn is_awaited(call: &SyntaxNode<'_>) -> bool {
    let mut current = call.parent();
    while let Some(parent) = current {
        match &*parent.kind() {
            "parenthesized_expression" => current = parent.parent(),
            "await_expression" => return true,
            _ => return false,
        }
    }
    false
}

fn has_optional_chain(node: &SyntaxNode<'_>) -> bool {
    node.children().any(|c| c.kind() == "optional_chain")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ExportDescriptor;

    fn manifest() -> Manifest {
        Manifest::new(vec![
            ExportDescriptor::new("lib.js", "greet", true),
            ExportDescriptor::new("lib.js", "fetchRemote", false),
        ])
    }

    fn transform(source: &str) -> TransformedModule {
        let manifest = manifest();
        let known = ["lib.js".to_string()].into_iter().collect();
        Transformer::new(&manifest, &known)
            .transform("main.js", source)
            .unwrap()
    }

    #[test]
    fn test_durable_export_is_wrapped_and_direct_is_kept() {
        let source = r#"import { greet, fetchRemote } from "./lib.js";

export async function main() {
  const message = greet("a");
  const data = await fetchRemote(1);
  return { message, data };
}
"#;
        let out = transform(source);
        assert!(out.code.contains(r#"const message = greet("a");"#));
        assert!(out.code.contains(
            r#"await __skein_call("main.js:5:22", "function", fetchRemote, 1);"#
        ));
        assert_eq!(
            out.call_sites,
            vec![CallSite {
                site: "main.js:5:22".into(),
                target: CallTarget::function("fetchRemote"),
                awaited: true,
            }]
        );
    }

    #[test]
    fn test_unawaited_durable_call_is_wrapped() {
        let out = transform("import { fetchRemote } from './lib.js';\nconst p = fetchRemote();\n");
        assert_eq!(
            out.code,
            "import { fetchRemote } from './lib.js';\nconst p = __skein_call(\"main.js:2:11\", \"function\", fetchRemote);\n"
        );
    }

    #[test]
    fn test_awaited_unknown_calls_are_wrapped_local_ones_are_not() {
        let source = "function helper() {}\nasync function run(client) {\n  await helper();\n  await fetch(\"u\");\n  await client.get(1, 2);\n  await skein.sleep(10);\n  await (async () => 1)();\n}\n";
        let out = transform(source);
        assert!(out.code.contains("  await helper();\n"));
        assert!(out.code.contains("await __skein_call(\"main.js:4:9\", \"function\", fetch, \"u\");"));
        assert!(out.code.contains(
            "await __skein_call(\"main.js:5:9\", \"method\", client, \"get\", 1, 2);"
        ));
        assert!(out.code.contains("await skein.sleep(10);"));
        assert!(out.code.contains("await (async () => 1)();"));
        assert_eq!(out.call_sites.len(), 2);
    }

    #[test]
    fn test_namespace_member_is_method_capture() {
        let out = transform("import * as lib from './lib.js';\nlib.fetchRemote(1);\nlib.greet('x');\n");
        assert!(out.code.contains("__skein_call(\"main.js:2:1\", \"method\", lib, \"fetchRemote\", 1);"));
        assert!(out.code.contains("lib.greet('x');"));
        assert_eq!(out.call_sites[0].target, CallTarget::method("lib", "fetchRemote"));
    }

    #[test]
    fn test_string_subscript_is_method_call() {
        let out = transform("async function f(o) { return await o['load'](); }\n");
        assert!(out.code.contains("await __skein_call(\"main.js:1:36\", \"method\", o, 'load')"));
        assert_eq!(out.call_sites[0].target, CallTarget::method("o", "load"));
    }

    #[test]
    fn test_nested_calls_are_rewritten_recursively() {
        let source = "import { fetchRemote } from './lib.js';\nasync function f(api) {\n  await api.send(await fetchRemote(2));\n}\n";
        let out = transform(source);
        assert!(out.code.contains(
            "await __skein_call(\"main.js:3:9\", \"method\", api, \"send\", await __skein_call(\"main.js:3:24\", \"function\", fetchRemote, 2));"
        ));
        assert_eq!(out.call_sites.len(), 2);
    }

    #[test]
    fn test_import_and_super_are_never_wrapped() {
        let source = "class A extends B { constructor() { super(); } }\nasync function f() { return await import('./lib.js'); }\n";
        let out = transform(source);
        assert_eq!(out.code, source);
        assert!(out.call_sites.is_empty());
    }

    #[test]
    fn test_untouched_module_is_byte_identical() {
        let source = "// header\nimport { greet } from './lib.js';\n\nexport function hi() {\n    return greet(  'x'  ); /* keep */\n}\n";
        let out = transform(source);
        assert_eq!(out.code, source);
    }

    #[test]
    fn test_unresolvable_targets_are_reported() {
        for source in [
            "async function f(o, k) { await o[k](); }",
            "async function f(g) { await g()(); }",
            "async function f(a, b, c) { await (a ? b : c)(); }",
            "async function f(o) { await o?.run(); }",
            "async function f(tag) { await tag`x`; }",
        ] {
            let manifest = manifest();
            let err = transform_module("main.js", source, &manifest).unwrap_err();
            assert!(
                matches!(err, TransformError::UnresolvableTarget { ref module, line: 1, .. } if module == "main.js"),
                "{source}: {err:?}"
            );
        }
    }

    #[test]
    fn test_indirect_invocation_of_durable_export_is_rejected() {
        for source in [
            "import { fetchRemote } from './lib.js';\nconst p = fetchRemote.call(null, 1);\n",
            "import { fetchRemote } from './lib.js';\nasync function f() { await fetchRemote.apply(null, [1]); }\n",
            "import * as lib from './lib.js';\nconst g = lib.fetchRemote.bind(null);\n",
        ] {
            let manifest = manifest();
            let err = transform_module("main.js", source, &manifest).unwrap_err();
            assert!(
                matches!(err, TransformError::UnresolvableTarget { line: 2, .. }),
                "{source}: {err:?}"
            );
        }
    }

    #[test]
    fn test_indirect_invocation_of_direct_export_is_kept() {
        let source = "import { greet } from './lib.js';\nconst s = greet.call(null, 'x');\n";
        let manifest = manifest();
        assert_eq!(transform_module("main.js", source, &manifest).unwrap(), source);
    }

    #[test]
    fn test_unawaited_dynamic_calls_are_left_alone() {
        let source = "function f(o, k) { return o[k](); }\n";
        let manifest = manifest();
        assert_eq!(transform_module("main.js", source, &manifest).unwrap(), source);
    }

    #[test]
    fn test_local_durable_export_is_wrapped_in_its_own_module() {
        let manifest = manifest();
        let source = "/** @direct */\nexport function greet(n) { return n; }\nexport async function fetchRemote(id) { return id; }\nexport async function both() { greet(1); return fetchRemote(2); }\n";
        let out = transform_module("lib.js", source, &manifest).unwrap();
        assert!(out.contains("greet(1);"));
        assert!(out.contains("return __skein_call(\"lib.js:4:49\", \"function\", fetchRemote, 2);"));
    }
}
