//! Upstream selection for remote mode.
//!
//! When a route is disabled its domain must be reachable at the real
//! origin, yet the hosts file pins that very name to loopback. The system
//! resolver is therefore useless here: the override resolver queries a
//! fixed upstream nameserver directly, caches the first A answer for the
//! session, and hands out an HTTP client that dials the resolved address
//! while still performing SNI and certificate validation against the
//! origin's hostname.

use crate::common::lock;
use crate::error::LoklError;
use anyhow::{Context, Result};
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

/// The nameserver consulted instead of the system resolver.
pub const DEFAULT_RESOLVER: SocketAddr =
    SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(1, 1, 1, 1)), 53);

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RemoteUpstream {
    resolver: TokioResolver,
    /// First A answer per host, kept for the whole session.
    addresses: Mutex<HashMap<String, IpAddr>>,
    /// One client per host, pinned to its resolved address.
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl RemoteUpstream {
    pub fn new(nameserver: SocketAddr) -> Self {
        let group =
            NameServerConfigGroup::from_ips_clear(&[nameserver.ip()], nameserver.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);

        let mut builder =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().timeout = QUERY_TIMEOUT;

        Self {
            resolver: builder.build(),
            addresses: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The client for dialing `https://<domain>` at its real origin.
    pub async fn client_for(&self, domain: &str) -> Result<reqwest::Client> {
        if let Some(client) = lock(&self.clients).get(domain) {
            return Ok(client.clone());
        }

        let address = self.resolve(domain).await?;
        let client = reqwest::Client::builder()
            // The URL keeps the real hostname, so TLS still verifies the
            // origin; only the dialed address is overridden.
            .resolve(domain, SocketAddr::new(address, 443))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("error building remote upstream client")?;

        lock(&self.clients)
            .entry(domain.to_string())
            .or_insert(client.clone());
        Ok(client)
    }

    async fn resolve(&self, domain: &str) -> Result<IpAddr> {
        if let Some(address) = lock(&self.addresses).get(domain) {
            return Ok(*address);
        }

        let lookup = self.resolver.lookup_ip(domain).await.map_err(|err| {
            LoklError::proxy(format!("resolving remote origin for {domain}: {err}"))
        })?;
        let address = lookup
            .iter()
            .find(IpAddr::is_ipv4)
            .or_else(|| lookup.iter().next())
            .ok_or_else(|| {
                LoklError::proxy(format!("remote origin for {domain} has no addresses"))
            })?;

        lock(&self.addresses)
            .entry(domain.to_string())
            .or_insert(address);
        Ok(address)
    }

    #[cfg(test)]
    fn seed(&self, domain: &str, address: IpAddr) {
        lock(&self.addresses).insert(domain.to_string(), address);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn cached_answers_bypass_the_resolver() {
        // An unroutable nameserver: any real query would time out, so a
        // quick success proves the cache short-circuits it.
        let upstream = RemoteUpstream::new("127.0.0.1:1".parse().unwrap());
        upstream.seed("example.real", "203.0.113.7".parse().unwrap());

        let address = upstream.resolve("example.real").await.unwrap();
        assert_eq!(address, "203.0.113.7".parse::<IpAddr>().unwrap());

        let _client = upstream.client_for("example.real").await.unwrap();
        // The second request for the same host reuses the pinned client.
        let _again = upstream.client_for("example.real").await.unwrap();
    }
}
