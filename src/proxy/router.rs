//! The in-memory host → route table.

use crate::config::{Configuration, RewriteConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A binding from a fully-qualified host to a local upstream.
pub struct Route {
    pub domain: String,
    pub port: u16,
    pub rewrite: Option<RewriteConfig>,
    enabled: AtomicBool,
}

impl Route {
    /// Whether requests are forwarded to the local port (true) or to the
    /// real origin at the same hostname (false).
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Immutable routing table built once from the project file.
///
/// The per-route `enabled` flag is the only state that mutates after
/// construction, and it is atomic: the request fast path takes no lock.
pub struct Router {
    base_domain: String,
    routes: HashMap<String, Arc<Route>>,
}

impl Router {
    pub fn new(cfg: &Configuration) -> Self {
        let mut routes = HashMap::new();

        for svc in cfg.services.values() {
            let (Some(domain), Some(port)) = (svc.fqdn(&cfg.proxy.domain), svc.port) else {
                continue;
            };
            if port == 0 {
                continue;
            }

            let route = Arc::new(Route {
                domain: domain.clone(),
                port,
                rewrite: svc.rewrite.clone(),
                enabled: AtomicBool::new(true),
            });
            routes.insert(domain, route);
        }

        Self {
            base_domain: cfg.proxy.domain.clone(),
            routes,
        }
    }

    /// Look up the route for a host header value.
    ///
    /// A trailing `:port` is ignored. Disabled routes are returned too;
    /// the request handler decides between local and remote mode.
    pub fn match_host(&self, host: &str) -> Option<Arc<Route>> {
        let host = match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        };
        self.routes.get(host).cloned()
    }

    /// Atomically flip a route. Returns false if the domain is unknown.
    pub fn set_enabled(&self, domain: &str, enabled: bool) -> bool {
        match self.routes.get(domain) {
            Some(route) => {
                route.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// All configured domains, sorted for stable output.
    pub fn all_domains(&self) -> Vec<String> {
        let mut domains: Vec<_> = self.routes.keys().cloned().collect();
        domains.sort();
        domains
    }

    /// The domains currently routed to a local port, sorted.
    pub fn enabled_domains(&self) -> Vec<String> {
        let mut domains: Vec<_> = self
            .routes
            .values()
            .filter(|route| route.is_enabled())
            .map(|route| route.domain.clone())
            .collect();
        domains.sort();
        domains
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::Service;
    use std::collections::BTreeMap;

    fn configuration() -> Configuration {
        let yaml = r#"
name: demo
proxy:
  domain: example.com
services:
  web:
    command: run
    subdomain: app
    port: 8080
    rewrite:
      strip_prefix: web
      fallback: /index.html
  api:
    command: run
    subdomain: api.example.com
    port: 3000
  no-subdomain:
    command: run
    port: 5000
  no-port:
    command: run
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn builds_routes_for_exposed_services_only() {
        let router = Router::new(&configuration());

        assert_eq!(router.base_domain(), "example.com");
        assert_eq!(router.all_domains(), ["api.example.com", "app.example.com"]);
    }

    #[test]
    fn match_host_expands_and_strips_port() {
        let router = Router::new(&configuration());

        let route = router.match_host("app.example.com").unwrap();
        assert_eq!(route.port, 8080);
        let rewrite = route.rewrite.as_ref().unwrap();
        assert_eq!(rewrite.strip_prefix, "web");
        assert_eq!(rewrite.fallback, "/index.html");

        // FQDN subdomains are taken as-is.
        assert_eq!(router.match_host("api.example.com").unwrap().port, 3000);
        // :port suffixes are ignored.
        assert_eq!(
            router.match_host("app.example.com:8443").unwrap().port,
            8080
        );

        assert!(router.match_host("unknown.example.com").is_none());
    }

    #[test]
    fn disabled_routes_still_match() {
        let router = Router::new(&configuration());

        assert!(router.set_enabled("app.example.com", false));
        let route = router.match_host("app.example.com").unwrap();
        assert!(!route.is_enabled());

        assert!(router.set_enabled("app.example.com", true));
        assert!(router.match_host("app.example.com").unwrap().is_enabled());

        assert!(!router.set_enabled("unknown.example.com", false));
    }

    #[test]
    fn enabled_domains_track_the_flag() {
        let router = Router::new(&configuration());
        assert_eq!(
            router.enabled_domains(),
            ["api.example.com", "app.example.com"]
        );

        router.set_enabled("app.example.com", false);
        assert_eq!(router.enabled_domains(), ["api.example.com"]);
    }

    #[test]
    fn no_base_domain_skips_bare_subdomains() {
        let mut services = BTreeMap::new();
        services.insert(
            "web".to_string(),
            Service {
                command: Some("run".into()),
                subdomain: Some("app".into()),
                port: Some(8080),
                ..Default::default()
            },
        );
        let cfg = Configuration {
            name: "demo".into(),
            services,
            ..Default::default()
        };

        let router = Router::new(&cfg);
        assert!(router.all_domains().is_empty());
    }
}
