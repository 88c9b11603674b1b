#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

mod cmd;
mod common;
mod config;
mod error;
mod process;
mod proxy;
mod supervisor;
mod tui;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use common::ERROR;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Lokl::parse();

    let colored = init_color(&cli);

    tracing_subscriber::registry()
        // level filter derived from -v/-q/--log
        .with(eval_logging(&cli))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(colored)
                .with_target(false)
                .with_level(true)
                .compact(),
        )
        .try_init()
        .context("error initializing logging")?;

    Ok(match cli.run().await {
        Err(err) => {
            // One terse line; the chain carries the context.
            eprintln!("{}{err:#}", ERROR);
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    })
}

fn init_color(cli: &Lokl) -> bool {
    if cli.no_color {
        return false;
    }

    match cli.color {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => std::io::stdout().is_terminal(),
    }
}

fn eval_logging(cli: &Lokl) -> tracing_subscriber::EnvFilter {
    // an explicit directive string trumps the verbosity flags
    if let Some(directives) = &cli.log {
        return tracing_subscriber::EnvFilter::new(directives);
    }

    let directives = match (cli.verbose, cli.quiet) {
        (_, true) => "error,lokl=warn",
        (0, false) => "error,lokl=info",
        (1, false) => "error,lokl=debug",
        // two or more -v flags
        (_, false) => "error,lokl=trace",
    };

    tracing_subscriber::EnvFilter::new(directives)
}

/// Define and run your local development environment with a single command.
#[derive(Parser)]
#[command(about, author, version)]
struct Lokl {
    #[command(subcommand)]
    action: LoklSubcommands,

    /// Path to the project file
    #[arg(short, long, env = "LOKL_CONFIG", global(true))]
    pub config: Option<PathBuf>,

    /// Log more; repeat for even more detail
    #[arg(short, long, global(true), action=ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors (mutually exclusive with --verbose)
    #[arg(short, long, global(true), conflicts_with("verbose"))]
    pub quiet: bool,

    /// Raw tracing filter directives, taking precedence over -v and -q
    #[arg(long, global(true), conflicts_with_all(["verbose", "quiet"]), env("RUST_LOG"))]
    pub log: Option<String>,

    /// When to colorize output
    #[arg(long, env = "LOKL_COLOR", global(true), value_enum, conflicts_with = "no_color", default_value_t = ColorMode::Auto)]
    pub color: ColorMode,

    /// Force plain output (honours the NO_COLOR convention)
    #[arg(long, env = "NO_COLOR", global(true))]
    pub no_color: bool,
}

#[derive(Clone, Debug, Default, ValueEnum)]
#[value(rename_all = "lower")]
enum ColorMode {
    /// Colorize only when stdout is a terminal
    #[default]
    Auto,
    /// Colorize unconditionally
    Always,
    /// Plain output
    Never,
}

impl Lokl {
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn run(self) -> Result<()> {
        match self.action {
            LoklSubcommands::Up(inner) => inner.run(self.config).await,
            LoklSubcommands::Down(inner) => inner.run(self.config).await,
            LoklSubcommands::Status(inner) => inner.run(self.config).await,
            LoklSubcommands::Dns(inner) => inner.run(self.config).await,
            LoklSubcommands::Init(inner) => inner.run(self.config).await,
        }
    }
}

#[derive(Subcommand)]
enum LoklSubcommands {
    /// Start the development environment.
    Up(cmd::up::Up),
    /// Stop the development environment (informational, see `up`).
    Down(cmd::down::Down),
    /// Show status of services (informational, see `up`).
    #[command(visible_alias = "ps")]
    Status(cmd::status::Status),
    /// Manage the hosts-file entries.
    Dns(cmd::dns::Dns),
    /// Write a starter project file.
    Init(cmd::init::Init),
}

#[cfg(test)]
mod tests {
    use crate::Lokl;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Lokl::command().debug_assert();
    }
}
