//! Orchestration of services, proxy and lifecycle.
//!
//! The supervisor owns one process handle per service and drives the `up`
//! sequence: proxy preflight, dependency-ordered start with unwinding on
//! failure, the proxy listener as a background task, and structured
//! shutdown. Process and proxy are injected behind small traits so the
//! whole orchestration runs against scripted fakes in tests.

use crate::common::{ERROR, SUCCESS, WARN, lock};
use crate::config::{Configuration, RestartPolicy, Service, deps};
use crate::error::LoklError;
use crate::process::{Change, OnChange, ProcessState};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Restart backoff: 1s doubling up to this cap.
const RESTART_MAX_DELAY: Duration = Duration::from_secs(30);
/// A failure this long after the previous one resets the backoff.
const RESTART_RESET_WINDOW: Duration = Duration::from_secs(60);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What the supervisor needs from a running process.
pub trait ProcessHandle: Send + Sync + 'static {
    fn start(&self) -> impl Future<Output = Result<()>> + Send;
    fn stop(&self) -> impl Future<Output = Result<()>> + Send;
    fn state(&self) -> ProcessState;
    fn is_running(&self) -> bool;
    fn is_healthy(&self) -> bool;
    fn logs(&self) -> Vec<String>;
}

/// What the supervisor needs from the reverse proxy.
pub trait ProxyHandle: Send + Sync + 'static {
    fn setup(&self) -> impl Future<Output = Result<()>> + Send;
    fn serve(&self) -> impl Future<Output = Result<()>> + Send;
    fn shutdown(&self);
    fn port(&self) -> u16;
    fn cert_dir(&self) -> PathBuf;
    fn base_domain(&self) -> String;
    fn domains(&self) -> Vec<String>;
    fn unresolved_domains(&self) -> impl Future<Output = Vec<String>> + Send;
    fn dns_block(&self) -> String;
    fn set_route_enabled(&self, domain: &str, enabled: bool) -> bool;
    fn route_enabled(&self, domain: &str) -> Option<bool>;
}

/// Creates a process handle for a service declaration.
pub type ProcessFactory<P> = Box<dyn Fn(&str, &Service, OnChange) -> P + Send + Sync>;

/// A notification for the UI. Missed events are acceptable; consumers
/// re-read the snapshot on every event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub service: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    ServiceStateChanged,
    ServiceHealthChanged,
}

/// Point-in-time view of one service for the UI.
#[derive(Clone, Debug)]
pub struct ServiceView {
    pub name: String,
    pub domain: Option<String>,
    pub port: Option<u16>,
    pub running: bool,
    pub healthy: bool,
    pub proxy_enabled: Option<bool>,
}

pub struct Supervisor<P, X> {
    cfg: Configuration,
    proxy: Arc<X>,
    factory: ProcessFactory<P>,
    processes: Mutex<HashMap<String, Arc<P>>>,
    /// Topological start order, fixed at construction.
    order: Vec<String>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    restart_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    backoff: Mutex<HashMap<String, Backoff>>,
    shutting_down: AtomicBool,
}

struct Backoff {
    attempts: u32,
    last_failure: Instant,
}

impl<P: ProcessHandle, X: ProxyHandle> Supervisor<P, X> {
    pub fn new(cfg: Configuration, factory: ProcessFactory<P>, proxy: X) -> Result<Arc<Self>> {
        let order = deps::sort_by_dependency(&cfg.services).context("resolving dependencies")?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new(Self {
            cfg,
            proxy: Arc::new(proxy),
            factory,
            processes: Mutex::new(HashMap::new()),
            order,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            restart_tx: Mutex::new(Some(restart_tx)),
            backoff: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        });

        tokio::spawn(Self::restart_loop(
            Arc::downgrade(&supervisor),
            restart_rx,
        ));

        Ok(supervisor)
    }

    pub fn project_name(&self) -> &str {
        &self.cfg.name
    }

    /// The single-subscriber event stream. The first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        lock(&self.events_rx).take()
    }

    /// Run the `up` sequence: proxy preflight, dependency-ordered service
    /// start, then the proxy listener in a background task.
    ///
    /// A start failure unwinds the already-started services in reverse
    /// order and returns the original error.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.setup_proxy().await?;

        let mut started: Vec<String> = Vec::new();
        for name in &self.order {
            let svc = &self.cfg.services[name];
            if !svc.autostart() {
                continue;
            }

            if let Err(err) = self.start_service(name).await {
                for prev in started.iter().rev() {
                    if let Err(stop_err) = self.stop_service(prev).await {
                        tracing::error!("{}failed to stop {prev}: {stop_err:#}", ERROR);
                    }
                }
                return Err(err);
            }
            tracing::info!("{}started {name}", SUCCESS);
            started.push(name.clone());
        }

        self.spawn_proxy();
        Ok(())
    }

    /// Stop every process in reverse start order, then the proxy.
    ///
    /// Hosts entries are left in place so the next `up` is fast; only the
    /// explicit `dns remove` cleans them.
    pub async fn stop(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        lock(&self.restart_tx).take();

        for name in self.order.iter().rev() {
            let Some(process) = lock(&self.processes).get(name).cloned() else {
                continue;
            };
            if !process.state().can_stop() {
                continue;
            }
            match process.stop().await {
                Ok(()) => tracing::info!("{}stopped {name}", SUCCESS),
                Err(err) => tracing::error!("{}failed to stop {name}: {err:#}", ERROR),
            }
        }

        self.proxy.shutdown();
    }

    /// Start one service. Starting an already-running service is not an
    /// error.
    pub async fn start_service(&self, name: &str) -> Result<()> {
        let svc = self
            .cfg
            .services
            .get(name)
            .ok_or_else(|| LoklError::config(format!("unknown service: {name}")))?;

        if svc.image.is_some() {
            return Err(LoklError::start(format!(
                "service {name}: docker services not yet supported"
            ))
            .into());
        }

        let process = self.process(name, svc);
        if process.is_running() {
            return Ok(());
        }

        process
            .start()
            .await
            .with_context(|| format!("starting {name}"))
    }

    /// Stop one service. Unknown or never-started services are a no-op.
    pub async fn stop_service(&self, name: &str) -> Result<()> {
        let Some(process) = lock(&self.processes).get(name).cloned() else {
            return Ok(());
        };
        process
            .stop()
            .await
            .with_context(|| format!("stopping {name}"))
    }

    pub async fn restart_service(&self, name: &str) -> Result<()> {
        self.stop_service(name).await?;
        self.start_service(name).await
    }

    /// Flip a service's route between local and remote mode; returns the
    /// new enabled state.
    pub fn toggle_proxy(&self, name: &str) -> Result<bool> {
        let svc = self
            .cfg
            .services
            .get(name)
            .ok_or_else(|| LoklError::config(format!("unknown service: {name}")))?;

        let domain = svc
            .fqdn(&self.proxy.base_domain())
            .ok_or_else(|| LoklError::config(format!("service {name} has no proxy domain")))?;

        let enabled = self
            .proxy
            .route_enabled(&domain)
            .ok_or_else(|| LoklError::config(format!("no route for domain {domain}")))?;

        self.proxy.set_route_enabled(&domain, !enabled);
        Ok(!enabled)
    }

    /// Fresh snapshots in topological order, for the UI.
    pub fn services(&self) -> Vec<ServiceView> {
        let base_domain = self.proxy.base_domain();
        let processes = lock(&self.processes);

        self.order
            .iter()
            .map(|name| {
                let svc = &self.cfg.services[name];
                let domain = svc.fqdn(&base_domain);
                let proxy_enabled = domain
                    .as_deref()
                    .and_then(|domain| self.proxy.route_enabled(domain));
                let process = processes.get(name);

                ServiceView {
                    name: name.clone(),
                    domain,
                    port: svc.port,
                    running: process.is_some_and(|p| p.is_running()),
                    healthy: process.is_some_and(|p| p.is_healthy()),
                    proxy_enabled,
                }
            })
            .collect()
    }

    /// Snapshot of one service's captured output.
    pub fn logs(&self, name: &str) -> Vec<String> {
        lock(&self.processes)
            .get(name)
            .map(|process| process.logs())
            .unwrap_or_default()
    }

    async fn setup_proxy(&self) -> Result<()> {
        if self.proxy.base_domain().is_empty() {
            return Ok(());
        }

        self.proxy.setup().await.context("proxy setup")?;
        tracing::info!(
            "{}certificates ready in {}",
            SUCCESS,
            self.proxy.cert_dir().display()
        );

        let unresolved = self.proxy.unresolved_domains().await;
        if !unresolved.is_empty() {
            tracing::warn!("{}DNS entries needed for: {}", WARN, unresolved.join(", "));
            tracing::warn!("option 1 - run: sudo lokl dns setup");
            tracing::warn!(
                "option 2 - add manually to the hosts file:\n{}",
                self.proxy.dns_block()
            );
            return Err(LoklError::preflight("DNS not configured").into());
        }

        tracing::info!(
            "{}DNS configured for {} domains",
            SUCCESS,
            self.proxy.domains().len()
        );
        Ok(())
    }

    fn spawn_proxy(&self) {
        if self.proxy.base_domain().is_empty() {
            return;
        }

        let proxy = self.proxy.clone();
        tokio::spawn(async move {
            // A graceful shutdown resolves cleanly; anything else is a
            // real listener failure worth surfacing.
            if let Err(err) = proxy.serve().await {
                tracing::error!("{}proxy error: {err:#}", ERROR);
            }
        });
    }

    /// Get or create the handle for a service.
    fn process(&self, name: &str, svc: &Service) -> Arc<P> {
        let mut processes = lock(&self.processes);
        if let Some(process) = processes.get(name) {
            return process.clone();
        }

        let process = Arc::new((self.factory)(name, svc, self.on_change(name)));
        processes.insert(name.to_string(), process.clone());
        process
    }

    /// The observer wired into each process: translate changes into UI
    /// events and hand failures to the restart loop.
    fn on_change(&self, name: &str) -> OnChange {
        let events = self.events_tx.clone();
        let restart = lock(&self.restart_tx).clone();
        let service = name.to_string();

        Arc::new(move |change| {
            let kind = match change {
                Change::State(state) => {
                    if state == ProcessState::Failed
                        && let Some(restart) = &restart
                    {
                        let _ = restart.send(service.clone());
                    }
                    EventKind::ServiceStateChanged
                }
                Change::Health(_) => EventKind::ServiceHealthChanged,
            };
            // A full channel only means the UI is behind; it re-reads the
            // snapshot on the next event anyway.
            let _ = events.try_send(Event {
                kind,
                service: service.clone(),
            });
        })
    }

    /// Act on `running → failed` transitions according to the restart
    /// policy, with exponential backoff.
    async fn restart_loop(supervisor: Weak<Self>, mut failures: mpsc::UnboundedReceiver<String>) {
        while let Some(name) = failures.recv().await {
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };
            if supervisor.shutting_down.load(Ordering::SeqCst) {
                continue;
            }

            let Some(svc) = supervisor.cfg.services.get(&name) else {
                continue;
            };
            if svc.restart() == RestartPolicy::Never {
                tracing::warn!("{}{name} failed, restart policy is never", WARN);
                continue;
            }

            let delay = supervisor.next_backoff(&name);
            tracing::warn!("{}{name} failed, restarting in {delay:?}", WARN);

            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if supervisor.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                let still_failed = lock(&supervisor.processes)
                    .get(&name)
                    .is_some_and(|p| p.state() == ProcessState::Failed);
                if !still_failed {
                    return;
                }
                if let Err(err) = supervisor.start_service(&name).await {
                    tracing::error!("{}failed to restart {name}: {err:#}", ERROR);
                }
            });
        }
    }

    fn next_backoff(&self, name: &str) -> Duration {
        let mut backoff = lock(&self.backoff);
        let now = Instant::now();
        let entry = backoff.entry(name.to_string()).or_insert(Backoff {
            attempts: 0,
            last_failure: now,
        });

        if now.duration_since(entry.last_failure) > RESTART_RESET_WINDOW {
            entry.attempts = 0;
        }
        entry.last_failure = now;

        let delay = Duration::from_secs(1 << entry.attempts.min(5)).min(RESTART_MAX_DELAY);
        entry.attempts = entry.attempts.saturating_add(1);
        delay
    }
}
