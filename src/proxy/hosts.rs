//! Block-scoped edits to the system hosts file.
//!
//! Every domain the proxy serves must resolve to loopback. The manager
//! owns one marker-delimited block per project, so multiple projects can
//! coexist in the same file and each can be added or removed without
//! touching the others.

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(unix)]
const HOSTS_FILE: &str = "/etc/hosts";
#[cfg(not(unix))]
const HOSTS_FILE: &str = r"C:\Windows\System32\drivers\etc\hosts";

/// Timeout for each per-domain resolution probe.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct HostsManager {
    project: String,
    path: PathBuf,
}

impl HostsManager {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            path: PathBuf::from(HOSTS_FILE),
        }
    }

    #[cfg(test)]
    fn with_path(project: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            path: path.into(),
        }
    }

    /// Write this project's block, replacing any previous one.
    ///
    /// Adding the same domains twice yields identical file content. A
    /// no-op on an empty domain list.
    pub async fn add(&self, domains: &[String]) -> Result<()> {
        if domains.is_empty() {
            return Ok(());
        }

        let content = self.read().await?;
        let cleaned = self.strip_block(&content);

        let mut next = cleaned.trim_end_matches('\n').to_string();
        if !next.is_empty() {
            next.push_str("\n\n");
        }
        next.push_str(&self.block(domains));

        self.write(&next).await
    }

    /// Remove this project's block, leaving everything else untouched.
    pub async fn remove(&self) -> Result<()> {
        let content = self.read().await?;
        let cleaned = self.strip_block(&content);

        let mut next = cleaned.trim_end_matches('\n').to_string();
        if !next.is_empty() {
            next.push('\n');
        }

        self.write(&next).await
    }

    /// Whether writing the hosts file will require elevated privileges.
    ///
    /// Probes an advisory write-open without touching the content. Used
    /// for pre-flight messaging only.
    pub fn needs_sudo(&self) -> bool {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .is_err()
    }

    /// The subset of `domains` that does not currently resolve to loopback
    /// through the system resolver.
    pub async fn unresolved(&self, domains: &[String]) -> Vec<String> {
        let mut unresolved = Vec::new();
        for domain in domains {
            if !resolves_to_loopback(domain).await {
                unresolved.push(domain.clone());
            }
        }
        unresolved
    }

    /// Render the block without writing it, so the user can paste it.
    pub fn block(&self, domains: &[String]) -> String {
        let mut block = String::new();
        block.push_str(&self.start_marker());
        block.push('\n');
        for domain in domains {
            block.push_str(&format!("127.0.0.1 {domain}\n"));
        }
        block.push_str(&self.end_marker());
        block.push('\n');
        block
    }

    fn start_marker(&self) -> String {
        format!("# lokl:{} - START", self.project)
    }

    fn end_marker(&self) -> String {
        format!("# lokl:{} - END", self.project)
    }

    /// Drop this project's block, line-exact on the markers.
    fn strip_block(&self, content: &str) -> String {
        let start_marker = self.start_marker();
        let end_marker = self.end_marker();

        let mut result = String::new();
        let mut in_block = false;
        for line in content.lines() {
            if line == start_marker {
                in_block = true;
                continue;
            }
            if line == end_marker {
                in_block = false;
                continue;
            }
            if !in_block {
                result.push_str(line);
                result.push('\n');
            }
        }

        result
    }

    async fn read(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading hosts file '{}'", self.path.display()))
    }

    async fn write(&self, content: &str) -> Result<()> {
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("writing hosts file '{}'", self.path.display()))
    }
}

/// A domain counts as configured iff loopback appears among its answers.
async fn resolves_to_loopback(domain: &str) -> bool {
    let lookup = tokio::net::lookup_host((domain, 80));
    match tokio::time::timeout(RESOLVE_TIMEOUT, lookup).await {
        Ok(Ok(addrs)) => addrs.map(|addr| addr.ip()).any(is_loopback),
        _ => false,
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}
