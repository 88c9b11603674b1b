//! The per-request reverse-proxy handler.

use crate::proxy::router::{Route, Router};
use crate::proxy::upstream::RemoteUpstream;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use http::header::{
    CACHE_CONTROL, CONNECTION, ETAG, EXPIRES, HOST, HeaderMap, HeaderName, HeaderValue,
    LAST_MODIFIED, PRAGMA, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{StatusCode, Uri};
use std::sync::Arc;

/// Marks which mode served the response, so a local↔remote toggle is
/// visible in the browser's network tab.
pub const PROXY_MODE_HEADER: &str = "x-lokl-proxy";

/// Path prefixes dev servers use for static assets and tooling endpoints.
const ASSET_PREFIXES: &[&str] = &["/assets/", "/static/", "/@vite/", "/@fs/", "/__vite_ping"];

/// Lowercased extensions that identify an asset request.
const ASSET_EXTENSIONS: &[&str] = &[
    ".js", ".mjs", ".cjs", ".css", ".scss", ".sass", ".less", ".png", ".jpg", ".jpeg", ".gif",
    ".svg", ".ico", ".webp", ".woff", ".woff2", ".ttf", ".eot", ".json", ".map", ".html", ".htm",
    ".mp4", ".webm", ".mp3", ".wav", ".pdf",
];

pub(crate) struct ProxyState {
    pub router: Arc<Router>,
    /// Pooled client for local upstreams.
    pub local: reqwest::Client,
    pub remote: RemoteUpstream,
}

impl ProxyState {
    pub(crate) fn new(router: Arc<Router>, remote: RemoteUpstream) -> anyhow::Result<Self> {
        let local = reqwest::Client::builder()
            .http1_only()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            router,
            local,
            remote,
        })
    }
}

/// Route one inbound request to its upstream and relay the answer.
pub(crate) async fn handle(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let Some(host) = request_host(&request) else {
        return (StatusCode::NOT_FOUND, "service not found").into_response()
    };

    let Some(route) = state.router.match_host(&host) else {
        return (StatusCode::NOT_FOUND, "service not found").into_response()
    };

    let (client, url, mode) = match upstream_for(&state, &route, request.uri()).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::debug!(%host, error = %err, "remote upstream unavailable");
            return (StatusCode::BAD_GATEWAY, format!("upstream error: {err:#}")).into_response();
        }
    };

    let method = request.method().clone();
    let mut headers = forwarded_headers(request.headers());
    if let Ok(value) = HeaderValue::from_str(&host) {
        // Local backends vhost- and CORS-check the Host header, so it is
        // forwarded as received. Remote mode leaves it unset and the
        // client derives Host from the target URL instead.
        if mode == "local" {
            headers.insert(HOST, value.clone());
        }
        headers.insert("x-forwarded-host", value);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));

    let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());

    let upstream_response = match client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(%host, %url, error = %err, "error forwarding request");
            return (StatusCode::BAD_GATEWAY, format!("upstream error: {err}")).into_response();
        }
    };

    relay(upstream_response, mode)
}

/// Pick client, URL and mode for a route, honouring the enabled flag.
async fn upstream_for(
    state: &ProxyState,
    route: &Route,
    uri: &Uri,
) -> anyhow::Result<(reqwest::Client, String, &'static str)> {
    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();

    if route.is_enabled() {
        let mut path = uri.path().to_string();
        if let Some(rewrite) = &route.rewrite {
            path = rewrite_path(&path, rewrite);
        }
        let url = format!("http://127.0.0.1:{port}{path}{query}", port = route.port);
        Ok((state.local.clone(), url, "local"))
    } else {
        // The hosts file pins this name to loopback, so the client dials
        // the address resolved through the override nameserver instead.
        let client = state.remote.client_for(&route.domain).await?;
        let url = format!(
            "https://{domain}{path}{query}",
            domain = route.domain,
            path = uri.path()
        );
        Ok((client, url, "remote"))
    }
}

/// Turn the upstream answer into the response sent to the browser.
fn relay(response: reqwest::Response, mode: &'static str) -> Response {
    let status = response.status();
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if is_hop_by_hop(name) || *name == ETAG || *name == LAST_MODIFIED {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    // A local↔remote toggle must take effect on the next browser request.
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
    headers.insert(PROXY_MODE_HEADER, HeaderValue::from_static(mode));

    let mut relayed = Response::new(Body::from_stream(response.bytes_stream()));
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    relayed
}

/// The request host, preferring the Host header over the URI authority.
fn request_host(request: &Request) -> Option<String> {
    if let Some(host) = request.headers().get(HOST) {
        return host.to_str().ok().map(ToString::to_string);
    }
    request.uri().host().map(ToString::to_string)
}

/// Copy request headers, dropping host and hop-by-hop fields.
fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if *name == HOST || is_hop_by_hop(name) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == CONNECTION
        || *name == TE
        || *name == TRAILER
        || *name == TRANSFER_ENCODING
        || *name == UPGRADE
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-authenticate"
        || name.as_str() == "proxy-authorization"
}

/// Apply the route's rewrite rules to a request path (local mode only).
pub(crate) fn rewrite_path(path: &str, rewrite: &crate::config::RewriteConfig) -> String {
    let mut path = path.to_string();

    if !rewrite.strip_prefix.is_empty() {
        let prefix = format!("/{}", rewrite.strip_prefix);
        if let Some(after) = path.strip_prefix(&prefix) {
            path = if after.is_empty() {
                "/".to_string()
            } else {
                after.to_string()
            };
        }
    }

    // SPA index serving: application routes fall back, assets pass through.
    if !rewrite.fallback.is_empty() && !is_asset_path(&path) {
        return rewrite.fallback.clone();
    }

    path
}

fn is_asset_path(path: &str) -> bool {
    if ASSET_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
    {
        return true;
    }

    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(dot) => {
            let ext = name[dot..].to_ascii_lowercase();
            ASSET_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::{Configuration, RewriteConfig};
    use crate::proxy::upstream::RemoteUpstream;
    use axum::Router as AxumRouter;
    use axum::routing::get;
    use rstest::rstest;
    use tower::ServiceExt;

    fn rw(strip_prefix: &str, fallback: &str) -> RewriteConfig {
        RewriteConfig {
            strip_prefix: strip_prefix.to_string(),
            fallback: fallback.to_string(),
        }
    }

    #[rstest]
    #[case::strip_prefix("/customer-funnel/dashboard", rw("customer-funnel", ""), "/dashboard")]
    #[case::strip_prefix_root("/customer-funnel", rw("customer-funnel", ""), "/")]
    #[case::strip_prefix_trailing_slash("/customer-funnel/", rw("customer-funnel", ""), "/")]
    #[case::no_match_prefix("/other/path", rw("customer-funnel", ""), "/other/path")]
    #[case::fallback_for_non_asset("/dashboard", rw("", "/index.html"), "/index.html")]
    #[case::no_fallback_for_asset("/assets/main.js", rw("", "/index.html"), "/assets/main.js")]
    #[case::strip_then_fallback(
        "/customer-funnel/dashboard",
        rw("customer-funnel", "/index.html"),
        "/index.html"
    )]
    #[case::strip_keeps_asset(
        "/customer-funnel/assets/main.js",
        rw("customer-funnel", "/index.html"),
        "/assets/main.js"
    )]
    #[case::empty_config("/some/path", rw("", ""), "/some/path")]
    fn rewrite_cases(#[case] path: &str, #[case] rewrite: RewriteConfig, #[case] want: &str) {
        assert_eq!(rewrite_path(path, &rewrite), want);
    }

    #[rstest]
    // by extension
    #[case("/main.js", true)]
    #[case("/style.css", true)]
    #[case("/image.png", true)]
    #[case("/font.woff2", true)]
    #[case("/data.json", true)]
    #[case("/page.html", true)]
    #[case("/app.mjs", true)]
    #[case("/UPPER.JS", true)]
    // by prefix
    #[case("/assets/anything", true)]
    #[case("/static/file.txt", true)]
    #[case("/@vite/client", true)]
    #[case("/@fs/some/path", true)]
    #[case("/__vite_ping", true)]
    // non-assets
    #[case("/dashboard", false)]
    #[case("/users/123", false)]
    #[case("/api/data", false)]
    #[case("/", false)]
    #[case("/settings", false)]
    fn asset_classification(#[case] path: &str, #[case] want: bool) {
        assert_eq!(is_asset_path(path), want);
    }

    fn proxy_app(backend_port: u16) -> AxumRouter {
        let yaml = format!(
            r#"
name: demo
proxy:
  domain: example.com
services:
  web:
    command: run
    subdomain: app
    port: {backend_port}
"#
        );
        let cfg: Configuration = serde_yaml::from_str(&yaml).unwrap();
        let router = Arc::new(Router::new(&cfg));
        let state = Arc::new(
            ProxyState::new(router, RemoteUpstream::new("127.0.0.1:1".parse().unwrap())).unwrap(),
        );
        AxumRouter::new().fallback(handle).with_state(state)
    }

    async fn spawn_backend() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = AxumRouter::new().route(
            "/api/hello",
            get(|headers: HeaderMap| async move {
                let header = |name: HeaderName| {
                    headers
                        .get(&name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string()
                };
                let forwarded = header(HeaderName::from_static("x-forwarded-host"));
                let host = header(HOST);
                (
                    [
                        (ETAG, HeaderValue::from_static("\"abc\"")),
                        (LAST_MODIFIED, HeaderValue::from_static("yesterday")),
                    ],
                    format!("hello via {forwarded}, host {host}"),
                )
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn request(host: &str, path: &str) -> Request {
        Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn local_mode_forwards_and_marks_the_response() {
        let backend_port = spawn_backend().await;
        let app = proxy_app(backend_port);

        let response = app
            .oneshot(request("app.example.com", "/api/hello"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[PROXY_MODE_HEADER], "local");
        assert_eq!(
            response.headers()[CACHE_CONTROL],
            "no-store, no-cache, must-revalidate, max-age=0"
        );
        assert_eq!(response.headers()[PRAGMA], "no-cache");
        assert_eq!(response.headers()[EXPIRES], "0");
        assert!(response.headers().get(ETAG).is_none());
        assert!(response.headers().get(LAST_MODIFIED).is_none());

        // The backend must see the caller's Host, not 127.0.0.1:<port>.
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(
            body.as_ref(),
            b"hello via app.example.com, host app.example.com"
        );
    }

    #[tokio::test]
    async fn host_with_port_still_matches() {
        let backend_port = spawn_backend().await;
        let app = proxy_app(backend_port);

        let response = app
            .oneshot(request("app.example.com:8443", "/api/hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_host_is_not_found() {
        let app = proxy_app(1);

        let response = app
            .oneshot(request("unknown.example.com", "/"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body.as_ref(), b"service not found");
    }

    #[tokio::test]
    async fn dead_upstream_is_bad_gateway() {
        // Bind-then-drop guarantees a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let app = proxy_app(port);
        let response = app
            .oneshot(request("app.example.com", "/api/hello"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.starts_with(b"upstream error"));
    }
}
