use async_trait::async_trait;
use eyre::Result;

pub mod bundle;
pub mod exports;
pub mod serve;

#[async_trait]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}
