//! The error taxonomy of the orchestrator.
//!
//! Most functions propagate `anyhow::Result` with context attached at the
//! I/O boundary; these variants classify the failures the CLI reports so
//! callers can tell a bad project file from a dead upstream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoklError {
    /// Schema violations, bad durations, unknown dependencies, cycles.
    #[error("{0}")]
    Config(String),
    /// Failed checks before any child is spawned: missing mkcert, DNS not
    /// pointing at loopback, hosts file not writable.
    #[error("{0}")]
    Preflight(String),
    /// A child could not be spawned, or the service kind is unsupported.
    #[error("{0}")]
    Start(String),
    /// A child misbehaved after a successful start.
    #[error("{0}")]
    Runtime(String),
    /// TLS material, upstream resolution or the listener itself failed.
    #[error("{0}")]
    Proxy(String),
    /// The graceful-shutdown window was exceeded.
    #[error("{0}")]
    Shutdown(String),
}

impl LoklError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn preflight(msg: impl Into<String>) -> Self {
        Self::Preflight(msg.into())
    }

    pub fn start(msg: impl Into<String>) -> Self {
        Self::Start(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }

    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::Shutdown(msg.into())
    }
}
