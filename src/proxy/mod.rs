//! The HTTPS reverse proxy and everything that makes it reachable:
//! host-based routing, hosts-file entries and locally trusted certificates.

mod certs;
mod handler;
mod hosts;
mod router;
mod upstream;

pub use certs::{CertManager, DEFAULT_CERT_DIR};
pub use hosts::HostsManager;
pub use router::Router;
pub use upstream::{DEFAULT_RESOLVER, RemoteUpstream};

use crate::common::SERVER;
use crate::config::Configuration;
use crate::error::LoklError;
use anyhow::{Context, Result};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use handler::ProxyState;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// How long in-flight requests get when the listener shuts down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The reverse proxy for one project.
///
/// Construction is cheap and performs no I/O; `setup` prepares the
/// certificates and `serve` runs the listener until `shutdown`.
pub struct Proxy {
    router: Arc<Router>,
    certs: CertManager,
    hosts: HostsManager,
    https: bool,
    port: u16,
    handle: Handle,
}

impl Proxy {
    pub fn new(cfg: &Configuration) -> Self {
        Self {
            router: Arc::new(Router::new(cfg)),
            certs: CertManager::new(DEFAULT_CERT_DIR),
            hosts: HostsManager::new(&cfg.name),
            https: cfg.proxy.https(),
            port: cfg.proxy.port(),
            handle: Handle::new(),
        }
    }

    /// Ensure the local CA is installed and the base-domain leaf exists.
    pub async fn setup(&self) -> Result<()> {
        let domain = self.router.base_domain().to_string();
        if domain.is_empty() {
            return Err(LoklError::preflight("no proxy domain configured").into());
        }

        self.certs.ensure_ca().await.context("setting up CA")?;
        self.certs
            .generate(&domain)
            .await
            .context("generating certificate")?;

        Ok(())
    }

    /// Run the listener until [`Self::shutdown`] is called.
    pub async fn serve(&self) -> Result<()> {
        let domain = self.router.base_domain();
        let state = Arc::new(
            ProxyState::new(self.router.clone(), RemoteUpstream::new(DEFAULT_RESOLVER))
                .map_err(|err| LoklError::proxy(format!("building proxy clients: {err}")))?,
        );

        let app = axum::Router::new()
            .fallback(handler::handle)
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        tracing::info!("{}proxy listening on :{}", SERVER, self.port);

        if self.https {
            let tls = RustlsConfig::from_pem_file(
                self.certs.cert_path(domain),
                self.certs.key_path(domain),
            )
            .await
            .map_err(|err| LoklError::proxy(format!("loading certificate: {err}")))?;

            axum_server::bind_rustls(addr, tls)
                .handle(self.handle.clone())
                .serve(app.into_make_service())
                .await
                .map_err(|err| LoklError::proxy(format!("proxy listener: {err}")).into())
        } else {
            axum_server::bind(addr)
                .handle(self.handle.clone())
                .serve(app.into_make_service())
                .await
                .map_err(|err| LoklError::proxy(format!("proxy listener: {err}")).into())
        }
    }

    /// Stop the listener, giving in-flight requests a bounded window.
    pub fn shutdown(&self) {
        self.handle
            .graceful_shutdown(Some(SHUTDOWN_TIMEOUT));
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn cert_dir(&self) -> PathBuf {
        std::path::absolute(self.certs.dir()).unwrap_or_else(|_| self.certs.dir().to_path_buf())
    }

    pub fn base_domain(&self) -> &str {
        self.router.base_domain()
    }

    pub fn domains(&self) -> Vec<String> {
        self.router.all_domains()
    }

    pub fn enabled_domains(&self) -> Vec<String> {
        self.router.enabled_domains()
    }

    /// The domains that do not resolve to loopback yet.
    pub async fn unresolved_domains(&self) -> Vec<String> {
        self.hosts.unresolved(&self.router.all_domains()).await
    }

    /// The hosts block the user would have to paste manually.
    pub fn dns_block(&self) -> String {
        self.hosts.block(&self.router.all_domains())
    }

    pub fn needs_sudo(&self) -> bool {
        self.hosts.needs_sudo()
    }

    pub async fn setup_dns(&self) -> Result<()> {
        self.hosts.add(&self.router.all_domains()).await
    }

    pub async fn remove_dns(&self) -> Result<()> {
        self.hosts.remove().await
    }

    /// Flip a route between local and remote mode. Returns false for an
    /// unknown domain.
    pub fn set_route_enabled(&self, domain: &str, enabled: bool) -> bool {
        self.router.set_enabled(domain, enabled)
    }

    pub fn route_enabled(&self, domain: &str) -> Option<bool> {
        self.router.match_host(domain).map(|route| route.is_enabled())
    }
}

impl crate::supervisor::ProxyHandle for Proxy {
    async fn setup(&self) -> Result<()> {
        Proxy::setup(self).await
    }

    async fn serve(&self) -> Result<()> {
        Proxy::serve(self).await
    }

    fn shutdown(&self) {
        Proxy::shutdown(self);
    }

    fn port(&self) -> u16 {
        Proxy::port(self)
    }

    fn cert_dir(&self) -> PathBuf {
        Proxy::cert_dir(self)
    }

    fn base_domain(&self) -> String {
        Proxy::base_domain(self).to_string()
    }

    fn domains(&self) -> Vec<String> {
        Proxy::domains(self)
    }

    async fn unresolved_domains(&self) -> Vec<String> {
        Proxy::unresolved_domains(self).await
    }

    fn dns_block(&self) -> String {
        Proxy::dns_block(self)
    }

    fn set_route_enabled(&self, domain: &str, enabled: bool) -> bool {
        Proxy::set_route_enabled(self, domain, enabled)
    }

    fn route_enabled(&self, domain: &str) -> Option<bool> {
        Proxy::route_enabled(self, domain)
    }
}
