//! Local-CA certificate issuance via mkcert.
//!
//! A single wildcard + apex leaf covers every subdomain of the base
//! domain, so adding a service never requires re-issuance.

use crate::common::run_command;
use crate::error::LoklError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Certificates live under the project directory, next to the config.
pub const DEFAULT_CERT_DIR: &str = ".lokl/certs";

const MKCERT: &str = "mkcert";

pub struct CertManager {
    dir: PathBuf,
}

impl CertManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Install the local trust root. Idempotent; mkcert itself detects an
    /// already-installed CA.
    pub async fn ensure_ca(&self) -> Result<()> {
        let mkcert = locate_mkcert()?;
        run_command(MKCERT, &mkcert, &["-install"])
            .await
            .context("installing mkcert CA")
    }

    /// Issue the leaf for `domain` unless both files already exist.
    ///
    /// Returns the certificate and key paths.
    pub async fn generate(&self, domain: &str) -> Result<(PathBuf, PathBuf)> {
        let cert_path = self.cert_path(domain);
        let key_path = self.key_path(domain);
        if path_exists(&cert_path).await && path_exists(&key_path).await {
            return Ok((cert_path, key_path));
        }

        let mkcert = locate_mkcert()?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating cert directory '{}'", self.dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o755))
                .await
                .context("setting cert directory permissions")?;
        }

        let wildcard = format!("*.{domain}");
        let cert_arg = cert_path.display().to_string();
        let key_arg = key_path.display().to_string();
        run_command(
            MKCERT,
            &mkcert,
            &[
                "-cert-file",
                cert_arg.as_str(),
                "-key-file",
                key_arg.as_str(),
                wildcard.as_str(),
                domain,
            ],
        )
        .await
        .context("generating certificate")?;

        Ok((cert_path, key_path))
    }

    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{domain}.pem"))
    }

    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{domain}-key.pem"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn locate_mkcert() -> Result<PathBuf> {
    which::which(MKCERT).map_err(|_| {
        LoklError::preflight(
            "mkcert not found: install with 'brew install mkcert' \
             or see https://github.com/FiloSottile/mkcert",
        )
        .into()
    })
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}
