use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

/// Show the status of services.
#[derive(Clone, Args)]
#[command(name = "status")]
pub struct Status {}

impl Status {
    pub async fn run(self, _config: Option<PathBuf>) -> Result<()> {
        tracing::info!("lokl runs in the foreground: no daemon to query, see the `up` session");
        Ok(())
    }
}
