//! The configuration model
//!
//! This is what the user provides in the project file. Accessors fill in
//! the documented defaults so the rest of the crate never needs to reason
//! about absent fields.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

mod duration;

pub use duration::ConfigDuration;

/// The default TLS port of the reverse proxy.
pub const DEFAULT_PROXY_PORT: u16 = 443;

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_HEALTH_RETRIES: u32 = 3;

/// A project: a named collection of services plus an optional proxy block.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Configuration {
    pub name: String,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Environment entries merged into every service, service entries win.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub services: BTreeMap<String, Service>,
}

/// The proxy block. An empty `domain` disables the proxy entirely.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    https: Option<bool>,

    #[serde(default)]
    port: Option<u16>,
}

impl ProxyConfig {
    pub fn https(&self) -> bool {
        self.https.unwrap_or(true)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PROXY_PORT)
    }
}

/// A single long-running service declaration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Service {
    /// Shell command to run. Exactly one of `command`/`image` must be set.
    #[serde(default)]
    pub command: Option<String>,

    /// Container image. Accepted by the parser, rejected at start.
    #[serde(default)]
    pub image: Option<String>,

    /// Working directory for the child.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Local port the service listens on. Required whenever `subdomain`
    /// or a health path is set.
    #[serde(default)]
    pub port: Option<u16>,

    /// Bare label (joined with the proxy domain) or a full FQDN.
    #[serde(default)]
    pub subdomain: Option<String>,

    #[serde(default)]
    pub rewrite: Option<RewriteConfig>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub health: Option<HealthConfig>,

    /// `None` means the default of true.
    #[serde(default)]
    pub autostart: Option<bool>,

    #[serde(default)]
    pub restart: Option<RestartPolicy>,

    /// Reserved: accepted and validated, not yet acted on.
    #[serde(default)]
    pub ready_timeout: Option<ConfigDuration>,
}

impl Service {
    pub fn autostart(&self) -> bool {
        self.autostart.unwrap_or(true)
    }

    pub fn restart(&self) -> RestartPolicy {
        self.restart.unwrap_or_default()
    }

    /// The fully-qualified domain this service is exposed on, if any.
    ///
    /// A label already containing a dot is taken as an FQDN; a bare label
    /// is joined with the base domain.
    pub fn fqdn(&self, base_domain: &str) -> Option<String> {
        let subdomain = self.subdomain.as_deref()?;
        if subdomain.is_empty() {
            return None;
        }
        if subdomain.contains('.') {
            Some(subdomain.to_string())
        } else if base_domain.is_empty() {
            None
        } else {
            Some(format!("{subdomain}.{base_domain}"))
        }
    }

    /// Project env ⊕ service env, service entries winning on conflict.
    pub fn merged_env(&self, project_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = project_env.clone();
        merged.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Path rewrite rules applied in local mode.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RewriteConfig {
    /// Leading path segment to drop when present.
    #[serde(default)]
    pub strip_prefix: String,

    /// Replacement path for non-asset requests (SPA index serving).
    #[serde(default)]
    pub fallback: String,
}

/// Periodic health probe against a local HTTP endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub interval: Option<ConfigDuration>,

    #[serde(default)]
    pub timeout: Option<ConfigDuration>,

    #[serde(default)]
    pub retries: Option<u32>,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        self.interval
            .as_ref()
            .map(|d| d.0)
            .unwrap_or(DEFAULT_HEALTH_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
            .as_ref()
            .map(|d| d.0)
            .unwrap_or(DEFAULT_HEALTH_TIMEOUT)
    }

    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_HEALTH_RETRIES)
    }
}

/// What to do when a service exits unexpectedly.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    #[default]
    OnFailure,
    Never,
}
