use crate::common::STARTING;
use crate::config::{self, deps};
use crate::process::Process;
use crate::proxy::Proxy;
use crate::supervisor::{ProcessFactory, Supervisor};
use crate::tui;
use anyhow::{Context, Result, anyhow};
use clap::Args;
use std::path::PathBuf;

/// Start the development environment.
#[derive(Clone, Args)]
#[command(name = "up")]
pub struct Up {
    /// Services to start, with their dependencies [default: all]
    pub services: Vec<String>,

    /// Run without the TUI and block until Ctrl-C
    #[arg(short = 'd', long)]
    pub detach: bool,
}

impl Up {
    pub async fn run(self, config: Option<PathBuf>) -> Result<()> {
        let mut cfg = config::load(config).await.context("loading config")?;

        // A service selection narrows the start set; dependencies come
        // along, everything else behaves like autostart=false.
        if !self.services.is_empty() {
            let selected = deps::expand_with_dependencies(&cfg.services, &self.services)?;
            for (name, svc) in cfg.services.iter_mut() {
                svc.autostart = Some(selected.contains(name));
            }
        }

        tracing::info!("{}lokl - {}", STARTING, cfg.name);

        let proxy = Proxy::new(&cfg);

        let project_env = cfg.env.clone();
        let factory: ProcessFactory<Process> = Box::new(move |name, svc, on_change| {
            Process::new(name, svc.clone(), svc.merged_env(&project_env), on_change)
        });

        let supervisor = Supervisor::new(cfg, factory, proxy)?;

        if let Err(err) = supervisor.start().await {
            supervisor.stop().await;
            return Err(err);
        }

        if self.detach {
            tracing::info!("press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("listening for shutdown signal")?;
            tracing::info!("shutting down");
        } else {
            let events = supervisor
                .take_events()
                .ok_or_else(|| anyhow!("event channel already taken"))?;
            let tui_supervisor = supervisor.clone();
            let runtime = tokio::runtime::Handle::current();
            let outcome =
                tokio::task::spawn_blocking(move || tui::run(tui_supervisor, events, runtime))
                    .await
                    .context("joining TUI task");
            if let Err(err) = outcome.and_then(|r| r) {
                supervisor.stop().await;
                return Err(err);
            }
        }

        supervisor.stop().await;
        Ok(())
    }
}
