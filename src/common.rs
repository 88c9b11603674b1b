//! Common functionality and types.

use anyhow::{Context, Result, bail};
use console::Emoji;
use std::ffi::OsStr;
use std::fmt::Debug;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::process::Command;

pub static SUCCESS: Emoji = Emoji("✓ ", "");
pub static ERROR: Emoji = Emoji("✗ ", "");
pub static WARN: Emoji = Emoji("⚠ ", "(!) ");
pub static SERVER: Emoji = Emoji("📡 ", "");
pub static STARTING: Emoji = Emoji("🚀 ", "");

/// Lock a mutex, recovering the guard when a writer panicked mid-update.
///
/// Every structure guarded this way stays consistent across panics (plain
/// field writes), so continuing with the inner value is safe.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Invoke an external tool with inherited stdio, failing on a non-zero
/// exit status.
#[tracing::instrument(level = "trace", skip(name, args))]
pub async fn run_command(
    name: &str,
    path: impl AsRef<Path> + Debug,
    args: &[impl AsRef<OsStr> + Debug],
) -> Result<()> {
    tracing::debug!(?args, "{name} args");

    let path = path.as_ref();

    let status = Command::new(path)
        .args(args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("spawning {name} ('{}' {args:?})", path.display()))?
        .wait()
        .await
        .with_context(|| format!("waiting for {name}"))?;

    if !status.success() {
        bail!(
            "{name} ('{}' {args:?}) exited with {status}",
            path.display()
        );
    }

    Ok(())
}
