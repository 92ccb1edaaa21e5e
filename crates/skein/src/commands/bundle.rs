use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use skein_core::build_bundle;
use tracing::info;

use super::Command;

pub struct BundleCommand {
    pub code_dir: PathBuf,
    pub out_dir: PathBuf,
}

#[async_trait]
impl Command for BundleCommand {
    async fn execute(&self) -> Result<()> {
        let code_dir = self.code_dir.clone();
        let out_dir = self.out_dir.clone();
        let manifest = tokio::task::spawn_blocking(move || build_bundle(&code_dir, &out_dir))
            .await?
            .wrap_err_with(|| format!("Failed to bundle {}", self.code_dir.display()))?;
        info!(
            out_dir = %self.out_dir.display(),
            modules = manifest.modules.len(),
            "bundle written"
        );

        let mut out = std::io::stdout().lock();
        writeln!(
            out,
            "Bundled {} modules ({} exports, {} call sites) and copied {} files into {}",
            manifest.modules.len(),
            manifest.exports.len(),
            manifest
                .modules
                .iter()
                .map(|m| m.call_sites.len())
                .sum::<usize>(),
            manifest.copied.len(),
            self.out_dir.display()
        )?;
        for (package, requirement) in &manifest.packages {
            writeln!(out, "  package {package} {requirement}")?;
        }
        Ok(())
    }
}
