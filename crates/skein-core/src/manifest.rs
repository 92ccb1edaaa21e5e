use serde::{Deserialize, Serialize};

/// One invocable top-level function of a code directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportDescriptor {
    /// `/`-separated path relative to the code directory.
    pub module_path: String,
    pub symbol_name: String,
    /// Flagged by the author as safe to run without suspension.
    pub is_direct_call: bool,
}

impl ExportDescriptor {
    pub fn new(
        module_path: impl Into<String>,
        symbol_name: impl Into<String>,
        is_direct_call: bool,
    ) -> Self {
        Self {
            module_path: module_path.into(),
            symbol_name: symbol_name.into(),
            is_direct_call,
        }
    }

    /// Entry point string accepted by the sandbox, `<module>:<symbol>`.
    pub fn entry_point(&self) -> String {
        format!("{}:{}", self.module_path, self.symbol_name)
    }
}

/// Ordered export set produced by the analyzer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    exports: Vec<ExportDescriptor>,
}

impl Manifest {
    pub fn new(exports: Vec<ExportDescriptor>) -> Self {
        Self { exports }
    }

    pub fn exports(&self) -> &[ExportDescriptor] {
        &self.exports
    }

    pub fn lookup(&self, module_path: &str, symbol_name: &str) -> Option<&ExportDescriptor> {
        self.exports
            .iter()
            .find(|e| e.module_path == module_path && e.symbol_name == symbol_name)
    }

    pub fn for_module<'a>(
        &'a self,
        module_path: &'a str,
    ) -> impl Iterator<Item = &'a ExportDescriptor> + 'a {
        self.exports
            .iter()
            .filter(move |e| e.module_path == module_path)
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

impl IntoIterator for Manifest {
    type Item = ExportDescriptor;
    type IntoIter = std::vec::IntoIter<ExportDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.exports.into_iter()
    }
}

/// Parsed `<module>:<symbol>` entry point reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryPoint {
    pub module_path: String,
    pub symbol_name: String,
}

impl EntryPoint {
    pub fn parse(value: &str) -> Option<Self> {
        let (module_path, symbol_name) = value.rsplit_once(':')?;
        if module_path.is_empty() || symbol_name.is_empty() {
            return None;
        }
        Some(Self {
            module_path: module_path.trim_start_matches("./").to_string(),
            symbol_name: symbol_name.to_string(),
        })
    }
}

impl std::fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.module_path, self.symbol_name)
    }
}
