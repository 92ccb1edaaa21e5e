//! Module resolution confined to a bundle directory.

use std::path::{Path, PathBuf};

use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Error, Module};
use serde::Deserialize;
use skein_core::syntax::{is_relative_specifier, package_name, resolve_specifier};
use tracing::trace;

pub struct BundleResolver {
    root: PathBuf,
}

impl BundleResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Resolver for BundleResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        match resolve_module(&self.root, base, name) {
            Some(resolved) => {
                trace!(base, name, resolved = %resolved, "resolved module");
                Ok(resolved)
            }
            None => Err(Error::new_resolving_message(
                base,
                name,
                "module not found inside the bundle",
            )),
        }
    }
}

pub struct BundleLoader {
    root: PathBuf,
}

impl BundleLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Loader for BundleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let path = self.root.join(name);
        let source = std::fs::read_to_string(&path)
            .map_err(|e| Error::new_loading_message(name, e.to_string()))?;
        Module::declare(ctx.clone(), name, source)
    }
}

#[derive(Deserialize)]
struct PackageManifest {
    module: Option<String>,
    main: Option<String>,
}

/// Maps an import of `name` from module `base` to a bundle-relative path.
///
/// `base` is a bundle-relative module path, or a script name with no
/// directory part when the import comes from evaluated code. Returns `None`
/// for modules outside the bundle.
pub fn resolve_module(root: &Path, base: &str, name: &str) -> Option<String> {
    let exists = |candidate: &str| root.join(candidate).is_file();

    if is_relative_specifier(name) {
        return resolve_specifier(base, name, exists);
    }
    if !name.contains("..") && exists(name) {
        return Some(name.to_string());
    }
    resolve_package(root, name)
}

fn resolve_package(root: &Path, specifier: &str) -> Option<String> {
    let package = package_name(specifier)?;
    let package_dir = format!("node_modules/{package}");
    let exists = |candidate: &str| root.join(candidate).is_file();

    if specifier != package {
        let subpath = &specifier[package.len()..];
        return resolve_specifier(&format!("{package_dir}/package.json"), &format!(".{subpath}"), exists);
    }

    let manifest_path = root.join(&package_dir).join("package.json");
    if let Ok(raw) = std::fs::read_to_string(&manifest_path)
        && let Ok(manifest) = serde_json::from_str::<PackageManifest>(&raw)
        && let Some(entry) = manifest.module.or(manifest.main)
    {
        let entry = if is_relative_specifier(&entry) {
            entry
        } else {
            format!("./{entry}")
        };
        if let Some(resolved) =
            resolve_specifier(&format!("{package_dir}/package.json"), &entry, exists)
        {
            return Some(resolved);
        }
    }
    resolve_specifier(&format!("{package_dir}/package.json"), "./index.js", exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn bundle() -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, contents) in [
            ("main.js", ""),
            ("lib/util.js", ""),
            ("node_modules/left-pad/package.json", r#"{"main": "lib/pad.js"}"#),
            ("node_modules/left-pad/lib/pad.js", ""),
            ("node_modules/@acme/kit/index.js", ""),
            ("node_modules/@acme/kit/extra.mjs", ""),
        ] {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, contents).unwrap();
        }
        dir
    }

    #[test]
    fn test_relative_and_root_paths() {
        let dir = bundle();
        assert_eq!(resolve_module(dir.path(), "main.js", "./lib/util.js"), Some("lib/util.js".into()));
        assert_eq!(resolve_module(dir.path(), "lib/util.js", "../main"), Some("main.js".into()));
        assert_eq!(resolve_module(dir.path(), "eval_script", "main.js"), Some("main.js".into()));
    }

    #[test]
    fn test_packages() {
        let dir = bundle();
        assert_eq!(
            resolve_module(dir.path(), "main.js", "left-pad"),
            Some("node_modules/left-pad/lib/pad.js".into())
        );
        assert_eq!(
            resolve_module(dir.path(), "main.js", "@acme/kit"),
            Some("node_modules/@acme/kit/index.js".into())
        );
        assert_eq!(
            resolve_module(dir.path(), "main.js", "@acme/kit/extra"),
            Some("node_modules/@acme/kit/extra.mjs".into())
        );
        assert_eq!(resolve_module(dir.path(), "main.js", "missing"), None);
    }

    #[test]
    fn test_escaping_the_bundle_is_rejected() {
        let dir = bundle();
        assert_eq!(resolve_module(dir.path(), "main.js", "../outside.js"), None);
        assert_eq!(resolve_module(dir.path(), "lib/util.js", "../../etc/passwd"), None);
        assert_eq!(resolve_module(dir.path(), "main.js", "node:fs"), None);
    }
}
