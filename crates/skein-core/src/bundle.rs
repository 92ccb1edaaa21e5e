use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analyzer::ModuleGraph;
use crate::error::BuildError;
use crate::manifest::Manifest;
use crate::syntax;
use crate::transform::{CallSite, Transformer};

/// File written at the bundle root.
pub const BUNDLE_MANIFEST: &str = "skein.bundle.json";

/// Version requirement recorded for packages imported without a
/// `package.json` entry.
pub const UNPINNED: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundledModule {
    pub path: String,
    pub call_sites: Vec<CallSite>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub exports: Manifest,
    /// Rewritten modules.
    pub modules: Vec<BundledModule>,
    /// Files copied unchanged, including installed packages.
    pub copied: Vec<String>,
    /// Third-party package name to version requirement.
    pub packages: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PackageJson {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BuildError + '_ {
    move |source| BuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Builds a standalone bundle of `code_dir` at `out_dir`.
///
/// The bundle is assembled next to `out_dir` and renamed into place once
/// complete, replacing any previous bundle. On failure nothing is left behind.
pub fn build_bundle(code_dir: &Path, out_dir: &Path) -> Result<BundleManifest, BuildError> {
    let staging = staging_dir(out_dir);
    let result = write_bundle(code_dir, &staging).and_then(|manifest| {
        if out_dir.exists() {
            fs::remove_dir_all(out_dir).map_err(io_error(out_dir))?;
        }
        fs::rename(&staging, out_dir).map_err(io_error(out_dir))?;
        Ok(manifest)
    });

    if result.is_err()
        && staging.exists()
        && let Err(e) = fs::remove_dir_all(&staging)
    {
        warn!(staging = %staging.display(), error = %e, "failed to clean up bundle staging directory");
    }

    if let Ok(manifest) = &result {
        info!(
            code_dir = %code_dir.display(),
            out_dir = %out_dir.display(),
            modules = manifest.modules.len(),
            exports = manifest.exports.len(),
            "bundle built"
        );
    }
    result
}

fn staging_dir(out_dir: &Path) -> PathBuf {
    let name = out_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_string());
    out_dir.with_file_name(format!(".{name}.staging-{}", uuid::Uuid::new_v4()))
}

fn write_bundle(code_dir: &Path, staging: &Path) -> Result<BundleManifest, BuildError> {
    let graph = ModuleGraph::load(code_dir)?;
    let exports = graph.manifest();
    let known: HashSet<String> = graph.module_paths().map(str::to_string).collect();
    let transformer = Transformer::new(&exports, &known);

    fs::create_dir_all(staging).map_err(io_error(staging))?;

    let mut modules = Vec::new();
    let mut copied = Vec::new();
    for file in syntax::walk_code_dir(code_dir, true)? {
        let destination = staging.join(&file.relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        if known.contains(&file.relative) {
            let source = fs::read_to_string(&file.absolute).map_err(io_error(&file.absolute))?;
            let transformed = transformer.transform(&file.relative, &source)?;
            fs::write(&destination, transformed.code).map_err(io_error(&destination))?;
            debug!(module = %file.relative, sites = transformed.call_sites.len(), "bundled module");
            modules.push(BundledModule {
                path: file.relative,
                call_sites: transformed.call_sites,
            });
        } else {
            fs::copy(&file.absolute, &destination).map_err(io_error(&destination))?;
            copied.push(file.relative);
        }
    }

    let packages = package_requirements(code_dir, &graph)?;
    let manifest = BundleManifest {
        exports,
        modules,
        copied,
        packages,
    };

    let manifest_path = staging.join(BUNDLE_MANIFEST);
    let json = serde_json::to_vec_pretty(&manifest)?;
    fs::write(&manifest_path, json).map_err(io_error(&manifest_path))?;
    Ok(manifest)
}

/// `package.json` dependencies plus any bare specifier imported by a module.
fn package_requirements(
    code_dir: &Path,
    graph: &ModuleGraph,
) -> Result<BTreeMap<String, String>, BuildError> {
    let package_json = code_dir.join("package.json");
    let mut packages = if package_json.is_file() {
        let raw = fs::read_to_string(&package_json).map_err(io_error(&package_json))?;
        serde_json::from_str::<PackageJson>(&raw)?.dependencies
    } else {
        BTreeMap::new()
    };

    for module in graph.module_paths() {
        let Some(info) = graph.get(module) else {
            continue;
        };
        for name in info.specifiers().filter_map(syntax::package_name) {
            packages.entry(name).or_insert_with(|| UNPINNED.to_string());
        }
    }
    Ok(packages)
}

pub fn load_bundle_manifest(bundle_dir: &Path) -> Result<BundleManifest, BuildError> {
    let path = bundle_dir.join(BUNDLE_MANIFEST);
    let raw = fs::read_to_string(&path).map_err(io_error(&path))?;
    Ok(serde_json::from_str(&raw)?)
}
