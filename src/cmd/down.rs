use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

/// Stop the development environment.
///
/// The supervisor is foreground-only; there is no daemon to talk to.
#[derive(Clone, Args)]
#[command(name = "down")]
pub struct Down {
    /// Ignored; present for muscle-memory compatibility
    pub services: Vec<String>,
}

impl Down {
    pub async fn run(self, _config: Option<PathBuf>) -> Result<()> {
        tracing::info!("lokl runs in the foreground: press Ctrl-C in the `up` session to stop");
        Ok(())
    }
}
