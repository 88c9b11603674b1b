//! Project configuration.
//!
//! A project is described by a single YAML file (`lokl.yaml` by default).
//! Loading parses it, validates every invariant and hands back a model the
//! supervisor can trust: unique names, an acyclic dependency graph, ports
//! present wherever routing or health probing needs them.

pub mod deps;
mod models;
mod validate;

pub use models::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// The default project file name, looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "lokl.yaml";

/// Load and validate the project file, falling back to [`DEFAULT_CONFIG_FILE`].
pub async fn load(path: Option<PathBuf>) -> Result<Configuration> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let cfg = parse(&path).await?;
    validate::validate(&cfg).context("validating config")?;
    Ok(cfg)
}

async fn parse(path: &Path) -> Result<Configuration> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config file '{}'", path.display()))?;

    serde_yaml::from_str(&data)
        .with_context(|| format!("parsing config file '{}'", path.display()))
}
