//! End-to-end dispatcher tests with stub launchers standing in for the
//! cloud-backed engines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use url::Url;

use ipspinner::config::Config;
use ipspinner::error::LauncherError;
use ipspinner::providers::{self, Launcher, Provider};
use ipspinner::proxy::EgressHandler;
use ipspinner::request::{RequestData, ResponseData};

struct StaticLauncher {
    name: String,
    available: AtomicBool,
    failing: bool,
    requests_sent: AtomicU64,
    stopped: AtomicBool,
}

impl StaticLauncher {
    fn new(name: &str, available: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            available: AtomicBool::new(available),
            failing: false,
            requests_sent: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            available: AtomicBool::new(true),
            failing: true,
            requests_sent: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Launcher for StaticLauncher {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn total_requests(&self) -> u64 {
        self.requests_sent.load(Ordering::SeqCst)
    }

    fn summarize_state(&self) -> String {
        format!("Launcher {} : nbTotalRequestsSent={}", self.name, self.total_requests())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn preload_hosts(&self, _hosts: &[Url]) {}

    async fn send(
        &self,
        request: &RequestData,
        _config: &Config,
    ) -> Result<(ResponseData, String), LauncherError> {
        if self.failing {
            return Err(LauncherError::CloudApi("simulated control plane outage".into()));
        }

        self.requests_sent.fetch_add(1, Ordering::SeqCst);

        let response = ResponseData {
            status: 200,
            headers: HashMap::from([
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Upstream".to_string(), request.url.host_str().unwrap_or("").to_string()),
            ]),
            body: b"upstream says hi".to_vec(),
        };

        Ok((response, format!("stub={}", self.name)))
    }

    async fn clear(&self) -> bool {
        self.stopped.store(true, Ordering::SeqCst);
        true
    }
}

struct StaticProvider {
    launchers: Vec<Arc<StaticLauncher>>,
    stopped: AtomicBool,
}

impl StaticProvider {
    fn new(launchers: Vec<Arc<StaticLauncher>>) -> Arc<dyn Provider> {
        Arc::new(Self {
            launchers,
            stopped: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &'static str {
        "Static"
    }

    fn launchers(&self) -> Vec<Arc<dyn Launcher>> {
        self.launchers
            .iter()
            .map(|launcher| Arc::clone(launcher) as Arc<dyn Launcher>)
            .collect()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn clear(&self) -> bool {
        self.stopped.store(true, Ordering::SeqCst);

        for launcher in &self.launchers {
            launcher.clear().await;
        }

        true
    }
}

fn proxied_request(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Full::<Bytes>::default())
        .expect("request build failed")
}

#[tokio::test]
async fn dispatches_and_shapes_the_launcher_response() {
    let launcher = StaticLauncher::new("stub-1", true);
    let provider = StaticProvider::new(vec![Arc::clone(&launcher)]);

    let handler = EgressHandler::new(Arc::new(Config::default()), vec![provider]);

    let response = handler.handle(proxied_request("http://origin.test/path"), None).await;

    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers().clone();

    assert_eq!(
        headers.get("content-type").and_then(|v| v.to_str().ok()),
        Some("application/json")
    );
    assert_eq!(
        headers.get("x-upstream").and_then(|v| v.to_str().ok()),
        Some("origin.test")
    );

    // Debug headers are on by default and identify the egress used
    assert_eq!(
        headers.get("x-ipspinner-provider").and_then(|v| v.to_str().ok()),
        Some("Static")
    );
    assert_eq!(
        headers.get("x-ipspinner-launcher").and_then(|v| v.to_str().ok()),
        Some("stub-1")
    );
    assert_eq!(
        headers.get("x-ipspinner-launcher-custom").and_then(|v| v.to_str().ok()),
        Some("stub=stub-1")
    );

    let body = response.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(&body[..], b"upstream says hi");

    assert_eq!(launcher.total_requests(), 1);
}

#[tokio::test]
async fn debug_headers_can_be_disabled() {
    let provider = StaticProvider::new(vec![StaticLauncher::new("stub-1", true)]);

    let mut config = Config::default();
    config.proxy.debug_response_headers = false;

    let handler = EgressHandler::new(Arc::new(config), vec![provider]);

    let response = handler.handle(proxied_request("http://origin.test/"), None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ipspinner-provider").is_none());
}

#[tokio::test]
async fn unavailable_launchers_are_never_picked() {
    let busy = StaticLauncher::new("busy", false);
    let free = StaticLauncher::new("free", true);

    let provider = StaticProvider::new(vec![Arc::clone(&busy), Arc::clone(&free)]);

    let handler = EgressHandler::new(Arc::new(Config::default()), vec![provider]);

    for _ in 0..10 {
        let response = handler.handle(proxied_request("http://origin.test/"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(busy.total_requests(), 0);
    assert_eq!(free.total_requests(), 10);
}

#[tokio::test]
async fn launcher_errors_surface_as_502_with_the_error_text() {
    let provider = StaticProvider::new(vec![StaticLauncher::failing("broken")]);

    let handler = EgressHandler::new(Arc::new(Config::default()), vec![provider]);

    let response = handler.handle(proxied_request("http://origin.test/"), None).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = response.into_body().collect().await.expect("body").to_bytes();
    let body = String::from_utf8_lossy(&body);

    assert!(body.contains("Error while processing request"));
    assert!(body.contains("simulated control plane outage"));
}

#[tokio::test]
async fn registry_pairs_launchers_with_their_provider() {
    let provider_a = StaticProvider::new(vec![StaticLauncher::new("a-1", true)]);
    let provider_b = StaticProvider::new(vec![
        StaticLauncher::new("b-1", true),
        StaticLauncher::new("b-2", false),
    ]);

    let registry = vec![provider_a, provider_b];

    assert_eq!(providers::all_launchers(&registry).len(), 3);

    let available = providers::all_available_launchers(&registry);
    assert_eq!(available.len(), 2);

    for (provider, launcher) in available {
        assert!(launcher.is_available());
        assert!(provider
            .launchers()
            .iter()
            .any(|candidate| candidate.name() == launcher.name()));
    }
}
