use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use eyre::Result;
use skein_core::analyze;

use super::Command;

pub struct ExportsCommand {
    pub code_dir: PathBuf,
    pub json: bool,
}

#[async_trait]
impl Command for ExportsCommand {
    async fn execute(&self) -> Result<()> {
        let manifest = analyze(&self.code_dir)?;
        let mut out = std::io::stdout().lock();
        if self.json {
            serde_json::to_writer_pretty(&mut out, &manifest)?;
            writeln!(out)?;
            return Ok(());
        }
        for export in manifest.exports() {
            let kind = if export.is_direct_call {
                "direct"
            } else {
                "durable"
            };
            writeln!(out, "{}\t{kind}", export.entry_point())?;
        }
        Ok(())
    }
}
