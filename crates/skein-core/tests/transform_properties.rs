use std::fs;

use proptest::prelude::*;
use skein_core::transform::Transformer;
use skein_core::{CallTarget, ExportDescriptor, Manifest, analyze, transform_module};
use tempfile::TempDir;

fn manifest() -> Manifest {
    Manifest::new(vec![
        ExportDescriptor::new("lib.js", "greet", true),
        ExportDescriptor::new("lib.js", "fetchRemote", false),
    ])
}

#[derive(Debug, Clone)]
enum Line {
    Greet(u32),
    AwaitFetch(u32),
    Fetch(u32),
}

impl Line {
    fn render(&self) -> String {
        match self {
            Line::Greet(n) => format!("  greet(\"user-{n}\");"),
            Line::AwaitFetch(n) => format!("  await fetchRemote({n});"),
            Line::Fetch(n) => format!("  fetchRemote({n}).then(() => {{}});"),
        }
    }
}

fn line() -> impl Strategy<Value = Line> {
    prop_oneof![
        any::<u32>().prop_map(Line::Greet),
        any::<u32>().prop_map(Line::AwaitFetch),
        any::<u32>().prop_map(Line::Fetch),
    ]
}

proptest! {
    #[test]
    fn durable_calls_never_survive_and_direct_calls_are_untouched(lines in prop::collection::vec(line(), 1..20)) {
        let body: Vec<String> = lines.iter().map(Line::render).collect();
        let source = format!(
            "import {{ greet, fetchRemote }} from \"./lib.js\";\n\nexport async function main() {{\n{}\n}}\n",
            body.join("\n")
        );

        let out = transform_module("main.js", &source, &manifest()).unwrap();

        prop_assert!(!out.contains("fetchRemote("));
        let durable = lines.iter().filter(|l| !matches!(l, Line::Greet(_))).count();
        prop_assert_eq!(out.matches("\"function\", fetchRemote").count(), durable);

        for line in &lines {
            if let Line::Greet(_) = line {
                let needle = format!("{}\n", line.render());
                prop_assert!(out.contains(&needle));
            }
        }
    }
}

#[test]
fn test_greet_fetch_remote_scenario() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("lib.js"),
        "/** @direct */\nexport function greet(name) { return `hello ${name}`; }\n\nexport async function fetchRemote(id) { return { id }; }\n",
    )
    .unwrap();

    let manifest = analyze(dir.path()).unwrap();
    let flags: Vec<(&str, bool)> = manifest
        .exports()
        .iter()
        .map(|e| (e.symbol_name.as_str(), e.is_direct_call))
        .collect();
    assert_eq!(flags, vec![("greet", true), ("fetchRemote", false)]);

    let known = ["lib.js".to_string()].into_iter().collect();
    let caller = "import { greet, fetchRemote } from './lib.js';\nexport async function run() {\n  greet(\"a\");\n  return await fetchRemote(1);\n}\n";
    let out = Transformer::new(&manifest, &known)
        .transform("caller.js", caller)
        .unwrap();

    assert!(out.code.contains("  greet(\"a\");\n"));
    assert!(out.code.contains("await __skein_call(\"caller.js:4:16\", \"function\", fetchRemote, 1)"));
    assert_eq!(out.call_sites.len(), 1);
    assert_eq!(out.call_sites[0].target, CallTarget::function("fetchRemote"));
    assert_eq!(out.call_sites[0].site, "caller.js:4:16");
}
