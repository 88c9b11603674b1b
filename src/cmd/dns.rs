use crate::common::{SUCCESS, WARN};
use crate::config;
use crate::proxy::Proxy;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Manage the project's hosts-file entries.
#[derive(Clone, Args)]
#[command(name = "dns")]
pub struct Dns {
    #[command(subcommand)]
    action: DnsAction,
}

#[derive(Clone, Subcommand)]
enum DnsAction {
    /// Add the project's block to the hosts file
    Setup,
    /// Remove the project's block from the hosts file
    Remove,
}

impl Dns {
    pub async fn run(self, config: Option<PathBuf>) -> Result<()> {
        let cfg = config::load(config).await.context("loading config")?;
        let proxy = Proxy::new(&cfg);

        match self.action {
            DnsAction::Setup => {
                let domains = proxy.domains();
                if domains.is_empty() {
                    tracing::info!("no domains configured");
                    return Ok(());
                }

                if proxy.needs_sudo() {
                    tracing::warn!(
                        "{}the hosts file is not writable, re-run as: sudo lokl dns setup",
                        WARN
                    );
                }

                proxy.setup_dns().await.context("adding DNS entries")?;
                tracing::info!(
                    "{}added {} entries to the hosts file",
                    SUCCESS,
                    domains.len()
                );
            }
            DnsAction::Remove => {
                proxy.remove_dns().await.context("removing DNS entries")?;
                tracing::info!("{}removed DNS entries from the hosts file", SUCCESS);

                tracing::info!("to flush the DNS cache:");
                if cfg!(target_os = "macos") {
                    tracing::info!(
                        "  sudo dscacheutil -flushcache && sudo killall -HUP mDNSResponder"
                    );
                } else {
                    tracing::info!("  sudo systemd-resolve --flush-caches");
                }
            }
        }

        Ok(())
    }
}
