use crate::common::SUCCESS;
use crate::config::DEFAULT_CONFIG_FILE;
use anyhow::{Context, Result, bail};
use clap::Args;
use std::path::PathBuf;

/// Write a starter project file for the current directory.
#[derive(Clone, Args)]
#[command(name = "init")]
pub struct Init {}

impl Init {
    pub async fn run(self, config: Option<PathBuf>) -> Result<()> {
        let path = config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if tokio::fs::metadata(&path).await.is_ok() {
            bail!("'{}' already exists, not overwriting it", path.display());
        }

        let name = project_name();
        tokio::fs::write(&path, template(&name))
            .await
            .with_context(|| format!("writing '{}'", path.display()))?;

        tracing::info!("{}created {}", SUCCESS, path.display());
        tracing::info!("edit it to match your services, then run: lokl up");
        Ok(())
    }
}

/// The directory name, lowercased into a usable project name.
fn project_name() -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| cwd.file_name().map(|n| n.to_string_lossy().into_owned()))
        .map(|name| name.to_lowercase().replace([' ', '_'], "-"))
        .unwrap_or_else(|| "myproject".to_string())
}

fn template(name: &str) -> String {
    format!(
        r#"name: {name}

proxy:
  domain: {name}.dev

services:
  web:
    command: npm run dev
    port: 3000
    subdomain: app
    # health:
    #   path: /healthz
    # depends_on: [api]
"#
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn writes_a_parseable_project_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lokl.yaml");

        Init {}.run(Some(path.clone())).await.unwrap();

        let cfg = crate::config::load(Some(path.clone())).await.unwrap();
        assert_eq!(cfg.services.len(), 1);
        assert!(cfg.services.contains_key("web"));

        // A second run must refuse to clobber the file.
        let err = Init {}.run(Some(path)).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
