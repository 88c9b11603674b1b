//! Periodic health probing of a service's local HTTP endpoint.

use crate::config::Service;
use crate::process::Shared;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The child gets a moment to open its listener before the first probe.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct HealthProbe {
    url: String,
    interval: Duration,
    timeout: Duration,
    retries: u32,
}

impl HealthProbe {
    /// Build a probe from the service declaration. `None` means the service
    /// has no health endpoint and counts as immediately healthy.
    pub(crate) fn from_service(svc: &Service) -> Option<Self> {
        let health = svc.health.as_ref()?;
        if health.path.is_empty() {
            return None;
        }
        let port = svc.port?;

        Some(Self {
            url: format!("http://127.0.0.1:{port}{path}", path = health.path),
            interval: health.interval(),
            timeout: health.timeout(),
            retries: health.retries(),
        })
    }

    /// Probe until cancelled, flipping the shared healthy flag.
    ///
    /// A 2xx/3xx answer resets the failure counter and marks the service
    /// healthy; an error, timeout or ≥400 answer counts one failure, and
    /// `retries` consecutive failures mark it unhealthy.
    pub(crate) async fn run(self, shared: Arc<Shared>, cancel: CancellationToken) {
        let client = match reqwest::Client::builder().timeout(self.timeout).build() {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(error = %err, "error building health probe client");
                return;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(STARTUP_GRACE) => {}
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately

        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if self.check(&client).await {
                failures = 0;
                shared.set_healthy(true);
            } else {
                failures = failures.saturating_add(1);
                if failures >= self.retries {
                    shared.set_healthy(false);
                }
            }
        }
    }

    async fn check(&self, client: &reqwest::Client) -> bool {
        match client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                (200..400).contains(&status)
            }
            Err(err) => {
                tracing::trace!(url = %self.url, error = %err, "health probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::{ConfigDuration, HealthConfig};
    use crate::process::{Change, OnChange, Process, ProcessState};
    use axum::Router;
    use axum::routing::get;
    use std::collections::BTreeMap;
    use std::str::FromStr;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn probe_service(port: u16, path: &str) -> Service {
        Service {
            command: Some("sleep 30".into()),
            port: Some(port),
            health: Some(HealthConfig {
                path: path.to_string(),
                interval: Some(ConfigDuration::from_str("50ms").unwrap()),
                timeout: Some(ConfigDuration::from_str("250ms").unwrap()),
                retries: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn wait_for_health(proc: &Process, expected: bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while proc.is_healthy() != expected {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for healthy == {expected}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn probe_tracks_the_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/healthz", get(|| async { "ok" }));
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let changes = Arc::new(StdMutex::new(Vec::new()));
        let sink = changes.clone();
        let on_change: OnChange = Arc::new(move |change| {
            crate::common::lock(&sink).push(change);
        });
        let proc = Process::new(
            "probed",
            probe_service(port, "/healthz"),
            BTreeMap::new(),
            on_change,
        );

        proc.start().await.unwrap();
        assert!(!proc.is_healthy());
        wait_for_health(&proc, true).await;

        // Endpoint gone: `retries` consecutive failures flip it back.
        server.abort();
        wait_for_health(&proc, false).await;

        proc.stop().await.unwrap();
        assert_eq!(proc.state(), ProcessState::Stopped);
        assert!(crate::common::lock(&changes).contains(&Change::Health(true)));
    }

    #[tokio::test]
    async fn error_status_counts_as_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route(
            "/healthz",
            get(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "down") }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let probe = HealthProbe::from_service(&probe_service(port, "/healthz")).unwrap();
        let client = reqwest::Client::new();
        assert!(!probe.check(&client).await);
    }

    #[test]
    fn missing_health_or_path_means_no_probe() {
        let service = Service {
            command: Some("run".into()),
            ..Default::default()
        };
        assert!(HealthProbe::from_service(&service).is_none());

        let service = probe_service(8080, "");
        assert!(HealthProbe::from_service(&service).is_none());
    }
}
