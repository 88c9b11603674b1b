//! A single child process: spawn, state machine, signals, health, logs.

mod health;
mod logs;
mod state;

pub use logs::{LogRing, MAX_LOG_LINES};
pub use state::ProcessState;

use crate::common::lock;
use crate::config::Service;
use crate::error::LoklError;
use anyhow::Result;
use health::HealthProbe;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How long a stopping child gets between SIGTERM and SIGKILL.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A state or health transition reported to the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    State(ProcessState),
    Health(bool),
}

/// Observer callback fired on every [`Change`]. Must not block and must not
/// call back into the process it observes.
pub type OnChange = Arc<dyn Fn(Change) + Send + Sync>;

/// One managed child process.
///
/// `start`/`stop` serialise against each other on an internal async mutex;
/// the read accessors are safe from any thread at any time.
pub struct Process {
    service: Service,
    env: BTreeMap<String, String>,
    runtime: tokio::sync::Mutex<Runtime>,
    shared: Arc<Shared>,
}

/// State shared with the reaper, the output pumps and the health task.
pub(crate) struct Shared {
    name: String,
    state: Mutex<ProcessState>,
    healthy: AtomicBool,
    logs: LogRing,
    on_change: OnChange,
}

#[derive(Default)]
struct Runtime {
    pgid: Option<i32>,
    exit: Option<watch::Receiver<bool>>,
    health_cancel: Option<CancellationToken>,
}

impl Shared {
    /// Swap in a new state and notify, without holding the lock through the
    /// callback.
    fn transition(&self, to: ProcessState) {
        *lock(&self.state) = to;
        (self.on_change)(Change::State(to));
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        if self.healthy.swap(healthy, Ordering::SeqCst) != healthy {
            (self.on_change)(Change::Health(healthy));
        }
    }
}

impl Process {
    /// Create a process in the `stopped` state. `env` is the merged
    /// project ⊕ service environment, layered over the ambient one.
    pub fn new(
        name: impl Into<String>,
        service: Service,
        env: BTreeMap<String, String>,
        on_change: OnChange,
    ) -> Self {
        Self {
            service,
            env,
            runtime: tokio::sync::Mutex::new(Runtime::default()),
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(ProcessState::Stopped),
                healthy: AtomicBool::new(false),
                logs: LogRing::new(MAX_LOG_LINES),
                on_change,
            }),
        }
    }

    /// Spawn the child and transition to `running`.
    ///
    /// Only legal from `stopped` or `failed`. The command runs as
    /// `sh -c "exec <command>"` in its own process group, with stdout and
    /// stderr pumped into the log ring. A reaper task watches for exit; a
    /// health task probes the configured endpoint.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;

        {
            let mut state = lock(&self.shared.state);
            if !state.can_start() {
                let message = format!(
                    "service {}: cannot start from state {}",
                    self.shared.name, *state
                );
                return Err(LoklError::start(message).into());
            }
            *state = ProcessState::Starting;
        }

        // A fresh run logs from a clean slate.
        self.shared.logs.clear();
        self.shared.healthy.store(false, Ordering::SeqCst);
        if let Some(cancel) = runtime.health_cancel.take() {
            cancel.cancel();
        }

        let Some(command) = self.service.command.as_deref() else {
            self.shared.transition(ProcessState::Failed);
            return Err(LoklError::start(format!(
                "service {}: docker services not yet supported",
                self.shared.name
            ))
            .into());
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            // exec replaces the shell, so signals reach the real binary
            .arg(format!("exec {command}"))
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.service.path {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.shared.transition(ProcessState::Failed);
                return Err(LoklError::start(format!(
                    "service {}: failed to start: {err}",
                    self.shared.name
                ))
                .into());
            }
        };

        runtime.pgid = child.id().map(|id| id as i32);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, self.shared.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, self.shared.clone()));
        }

        self.shared.transition(ProcessState::Running);

        let (exit_tx, exit_rx) = watch::channel(false);
        runtime.exit = Some(exit_rx);
        tokio::spawn(reap(child, self.shared.clone(), exit_tx));

        let cancel = CancellationToken::new();
        runtime.health_cancel = Some(cancel.clone());
        match HealthProbe::from_service(&self.service) {
            Some(probe) => {
                tokio::spawn(probe.run(self.shared.clone(), cancel));
            }
            None => self.shared.set_healthy(true),
        }

        Ok(())
    }

    /// Terminate the child and transition to `stopped`.
    ///
    /// No-op unless `running` or `starting`. SIGTERM goes to the whole
    /// process group; a [`STOP_TIMEOUT`] timer escalates to SIGKILL.
    pub async fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;

        {
            let mut state = lock(&self.shared.state);
            if !state.can_stop() {
                return Ok(());
            }
            *state = ProcessState::Stopping;
        }

        if let Some(cancel) = runtime.health_cancel.take() {
            cancel.cancel();
        }
        self.shared.set_healthy(false);

        let pgid = runtime.pgid.take();
        if let Some(pgid) = pgid {
            signal_group(pgid, Signal::Term);
        }

        let mut graceful = true;
        if let Some(mut exit) = runtime.exit.take() {
            graceful = tokio::time::timeout(STOP_TIMEOUT, exit.wait_for(|done| *done))
                .await
                .is_ok();
            if !graceful {
                if let Some(pgid) = pgid {
                    signal_group(pgid, Signal::Kill);
                }
                let _ = exit.wait_for(|done| *done).await;
            }
        }

        self.shared.transition(ProcessState::Stopped);

        if !graceful {
            // The child is gone either way; the caller only reports this.
            return Err(LoklError::shutdown(format!(
                "service {}: exceeded the {STOP_TIMEOUT:?} stop window, process group killed",
                self.shared.name
            ))
            .into());
        }
        Ok(())
    }

    pub fn state(&self) -> ProcessState {
        *lock(&self.shared.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::SeqCst)
    }

    /// Snapshot of the captured output lines.
    pub fn logs(&self) -> Vec<String> {
        self.shared.logs.lines()
    }
}

impl crate::supervisor::ProcessHandle for Process {
    async fn start(&self) -> Result<()> {
        Process::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        Process::stop(self).await
    }

    fn state(&self) -> ProcessState {
        Process::state(self)
    }

    fn is_running(&self) -> bool {
        Process::is_running(self)
    }

    fn is_healthy(&self) -> bool {
        Process::is_healthy(self)
    }

    fn logs(&self) -> Vec<String> {
        Process::logs(self)
    }
}

/// Wait for the child and flag an unexpected exit as `failed`.
async fn reap(mut child: tokio::process::Child, shared: Arc<Shared>, exit_tx: watch::Sender<bool>) {
    let status = child.wait().await;

    let unexpected = {
        let mut state = lock(&shared.state);
        if *state == ProcessState::Running {
            *state = ProcessState::Failed;
            true
        } else {
            false
        }
    };

    if unexpected {
        let err = match status {
            Ok(status) => LoklError::runtime(format!(
                "service {}: exited unexpectedly ({status})",
                shared.name
            )),
            Err(err) => LoklError::runtime(format!(
                "service {}: error waiting for child: {err}",
                shared.name
            )),
        };
        tracing::warn!("{err}");
        shared.set_healthy(false);
        (shared.on_change)(Change::State(ProcessState::Failed));
    }

    let _ = exit_tx.send(true);
}

/// Copy child output into the log ring until EOF.
async fn pump(mut reader: impl tokio::io::AsyncRead + Unpin, shared: Arc<Shared>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => shared.logs.write(&buf[..n]),
        }
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: Signal) {
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative pid addresses the whole group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        tracing::debug!(pgid, "error signalling process group");
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: Signal) {}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn recorder() -> (OnChange, Arc<StdMutex<Vec<Change>>>) {
        let changes = Arc::new(StdMutex::new(Vec::new()));
        let sink = changes.clone();
        let on_change: OnChange = Arc::new(move |change| {
            lock(&sink).push(change);
        });
        (on_change, changes)
    }

    fn process(command: &str) -> (Process, Arc<StdMutex<Vec<Change>>>) {
        let (on_change, changes) = recorder();
        let service = Service {
            command: Some(command.to_string()),
            ..Default::default()
        };
        (
            Process::new("test", service, BTreeMap::new(), on_change),
            changes,
        )
    }

    async fn wait_for_state(proc: &Process, expected: ProcessState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while proc.state() != expected {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {expected}, still {}",
                proc.state()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn start_then_stop_reaches_stopped() {
        let (proc, changes) = process("sleep 30");

        proc.start().await.unwrap();
        assert!(proc.is_running());

        let began = Instant::now();
        proc.stop().await.unwrap();
        assert_eq!(proc.state(), ProcessState::Stopped);
        // SIGTERM alone must have done it, well before the kill timer.
        assert!(began.elapsed() < Duration::from_secs(5));

        let changes = lock(&changes).clone();
        assert!(changes.contains(&Change::State(ProcessState::Running)));
        assert_eq!(changes.last(), Some(&Change::State(ProcessState::Stopped)));
    }

    #[tokio::test]
    async fn unexpected_exit_becomes_failed() {
        let (proc, changes) = process("sh -c 'printf \"boom\\n\" >&2; sleep 0.1; exit 1'");

        proc.start().await.unwrap();
        wait_for_state(&proc, ProcessState::Failed).await;

        assert!(!proc.is_running());
        assert!(!proc.is_healthy());
        assert!(proc.logs().contains(&"boom".to_string()));
        assert!(lock(&changes).contains(&Change::State(ProcessState::Failed)));
    }

    #[tokio::test]
    async fn start_from_running_is_rejected() {
        let (proc, _) = process("sleep 30");

        proc.start().await.unwrap();
        let err = proc.start().await.unwrap_err();
        assert!(
            err.to_string().contains("cannot start from state running"),
            "{err}"
        );

        proc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_failure() {
        let (proc, _) = process("true");

        proc.start().await.unwrap();
        wait_for_state(&proc, ProcessState::Failed).await;

        proc.start().await.unwrap();
        proc.stop().await.unwrap();
        assert_eq!(proc.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_noop() {
        let (proc, changes) = process("sleep 30");
        proc.stop().await.unwrap();
        assert_eq!(proc.state(), ProcessState::Stopped);
        assert!(lock(&changes).is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_becomes_failed() {
        let (on_change, _) = recorder();
        let service = Service {
            command: Some("true".into()),
            path: Some("/nonexistent/working/dir".into()),
            ..Default::default()
        };
        let proc = Process::new("test", service, BTreeMap::new(), on_change);

        let err = proc.start().await.unwrap_err();
        assert!(err.to_string().contains("failed to start"), "{err}");
        assert_eq!(proc.state(), ProcessState::Failed);
    }

    #[tokio::test]
    async fn service_env_reaches_the_child() {
        let (on_change, _) = recorder();
        let service = Service {
            command: Some("printf '%s\\n' \"$GREETING\"".into()),
            ..Default::default()
        };
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        let proc = Process::new("test", service, env, on_change);

        proc.start().await.unwrap();
        wait_for_state(&proc, ProcessState::Failed).await;
        assert_eq!(proc.logs(), ["hello"]);
    }

    #[tokio::test]
    async fn no_health_config_is_immediately_healthy() {
        let (proc, changes) = process("sleep 30");

        proc.start().await.unwrap();
        assert!(proc.is_healthy());
        assert!(lock(&changes).contains(&Change::Health(true)));

        proc.stop().await.unwrap();
        assert!(!proc.is_healthy());
    }
}
