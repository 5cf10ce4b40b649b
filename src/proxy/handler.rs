//! Egress dispatcher: binds each intercepted client request to one of the
//! available launchers and shapes the launcher's response back onto the
//! proxy response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use tracing::{error, info, trace, warn};
use url::Url;

use crate::config::Config;
use crate::crypto;
use crate::hosts;
use crate::providers::{self, Launcher, Provider};
use crate::request::{self, RequestData};

/// Prefix of the diagnostic headers added to responses in debug mode.
pub const RESPONSE_HEADER_PREFIX: &str = "X-IPSpinner-";

const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_millis(100);

const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

pub struct EgressHandler {
    config: Arc<Config>,
    providers: Vec<Arc<dyn Provider>>,
    whitelist: Vec<Url>,
    blacklist: Vec<Url>,
    user_agents: Vec<String>,
    request_count: AtomicU64,
}

impl EgressHandler {
    pub fn new(config: Arc<Config>, providers: Vec<Arc<dyn Provider>>) -> Self {
        let whitelist = hosts::parse_hosts_file(&config.proxy.whitelist_hosts_file);
        let blacklist = hosts::parse_hosts_file(&config.proxy.blacklist_hosts_file);

        if !whitelist.is_empty() {
            info!(nb_hosts_in_whitelist = whitelist.len(), "Hosts mentioned in the whitelist have been loaded.");

            if !blacklist.is_empty() {
                warn!("The blacklist has been ignored because a whitelist has been given.");
            }
        } else if !blacklist.is_empty() {
            info!(nb_hosts_in_blacklist = blacklist.len(), "Hosts mentioned in the blacklist have been loaded.");
        }

        let mut user_agents = Vec::new();

        if !config.proxy.user_agents_file.is_empty() {
            match hosts::read_file_lines(&config.proxy.user_agents_file) {
                Ok(lines) => user_agents = lines,
                Err(e) => warn!(error = %e, "Can not read user agents file."),
            }
        }

        Self {
            config,
            providers,
            whitelist,
            blacklist,
            user_agents,
            request_count: AtomicU64::new(0),
        }
    }

    /// Handles one intercepted request. `forced_authority` carries the
    /// CONNECT target for MITM'ed traffic; plain proxy requests arrive in
    /// absolute form.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        forced_authority: Option<String>,
    ) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let Some(url) = target_url(&req, forced_authority.as_deref()) else {
            return reject("PROXY ERROR: Can not determine the request target URL.");
        };

        if let Err(reason) = self.check_host_policy(&url) {
            warn!(host = %url, "{}", reason.trim_start_matches("PROXY ERROR: "));
            return reject(&reason);
        }

        let Some((provider, launcher)) = self.wait_for_available_launcher().await else {
            return reject("PROXY ERROR: Timeout - no launcher seem to be available.");
        };

        // Multi-valued headers collapse to their last value.
        let mut headers = HashMap::new();

        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), value.to_string());
            }
        }

        if !self.user_agents.is_empty() {
            if let Some(user_agent) = crypto::random_element(&self.user_agents) {
                headers.insert("User-Agent".to_string(), user_agent.clone());
            }
        }

        let method = req.method().to_string();

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!(error = %e, "Error reading request body.");
                return reject(&format!("PROXY ERROR: Error reading request body: {e}"));
            }
        };

        let envelope = RequestData {
            url: url.clone(),
            method: method.clone(),
            headers,
            body,
            follow_redirects: false,
        };

        let (response, custom_tag) = match launcher.send(&envelope, &self.config).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Error while processing request.");
                return reject(&format!("PROXY ERROR: Error while processing request: {e}"));
            }
        };

        let mut proxy_response = Response::new(Full::from(response.body));

        *proxy_response.status_mut() =
            StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);

        let content_type = response
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| CONTENT_TYPE_TEXT.to_string());

        if let Ok(value) = HeaderValue::from_str(&content_type) {
            proxy_response.headers_mut().insert(CONTENT_TYPE, value);
        }

        for (name, value) in &response.headers {
            if name.eq_ignore_ascii_case("content-type") {
                continue;
            }

            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), HeaderValue::from_str(value))
            {
                proxy_response.headers_mut().insert(name, value);
            }
        }

        if self.config.proxy.debug_response_headers {
            let debug_headers = [
                ("Provider", provider.name().to_string()),
                ("Launcher", launcher.name()),
                ("Provider-NbTotalReqSent", provider.total_requests().to_string()),
                ("Launcher-NbTotalReqSent", launcher.total_requests().to_string()),
            ];

            for (suffix, value) in debug_headers {
                set_debug_header(&mut proxy_response, suffix, &value);
            }

            if !custom_tag.is_empty() {
                set_debug_header(&mut proxy_response, "Launcher-Custom", &custom_tag);
            }
        }

        let count = self.request_count.fetch_add(1, Ordering::SeqCst) + 1;

        trace!(
            from = %url,
            to_provider = provider.name(),
            to_launcher = %launcher.name(),
            method = %method,
            "Redirecting request #{count}."
        );

        proxy_response
    }

    /// Applies the allow/deny host policy. The whitelist takes priority
    /// over the blacklist.
    fn check_host_policy(&self, url: &Url) -> Result<(), String> {
        if !self.whitelist.is_empty() {
            if !request::url_list_contains_base_url(&self.whitelist, url) {
                return Err(
                    "PROXY ERROR: Can not send a request to this host because it is not mentioned in the whitelist."
                        .to_string(),
                );
            }
        } else if !self.blacklist.is_empty()
            && request::url_list_contains_base_url(&self.blacklist, url)
        {
            return Err(
                "PROXY ERROR: Can not send a request to this host because it is mentioned in the blacklist."
                    .to_string(),
            );
        }

        Ok(())
    }

    /// Polls until at least one launcher is available, bounded by the
    /// configured timeout. Returns a uniformly random available launcher
    /// paired with its provider.
    async fn wait_for_available_launcher(
        &self,
    ) -> Option<(Arc<dyn Provider>, Arc<dyn Launcher>)> {
        let max_attempts = self.config.proxy.wait_for_launcher_available_timeout * 10;

        let mut attempts = 0u64;

        let available = loop {
            let available = providers::all_available_launchers(&self.providers);

            if !available.is_empty() {
                break available;
            }

            attempts += 1;

            if attempts >= max_attempts {
                return None;
            }

            tokio::time::sleep(AVAILABILITY_POLL_INTERVAL).await;
        };

        let index = crypto::secure_random_index(available.len());

        Some(available[index].clone())
    }
}

/// Reconstructs the absolute target URL of a proxied request.
fn target_url<B>(req: &Request<B>, forced_authority: Option<&str>) -> Option<Url> {
    if let Some(authority) = forced_authority {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        Url::parse(&format!("https://{authority}{path_and_query}")).ok()
    } else if req.uri().scheme().is_some() {
        Url::parse(&req.uri().to_string()).ok()
    } else {
        None
    }
}

/// Synthesizes the plain-text 502 used for policy rejections and launcher
/// failures.
fn reject(message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::from(message.to_string()));

    *response.status_mut() = StatusCode::BAD_GATEWAY;

    if let Ok(value) = HeaderValue::from_str(CONTENT_TYPE_TEXT) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }

    response
}

fn set_debug_header(response: &mut Response<Full<Bytes>>, suffix: &str, value: &str) {
    let name = format!("{RESPONSE_HEADER_PREFIX}{suffix}");

    if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
        response.headers_mut().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn handler_with_whitelist(entries: &str) -> EgressHandler {
        let mut whitelist_file = tempfile::NamedTempFile::new().expect("temp file creation failed");
        whitelist_file.write_all(entries.as_bytes()).expect("write failed");

        let mut config = Config::default();
        config.proxy.whitelist_hosts_file =
            whitelist_file.path().to_str().expect("path").to_string();

        // The list is parsed during construction; the file can go away after.
        let handler = EgressHandler::new(Arc::new(config), Vec::new());
        drop(whitelist_file);

        handler
    }

    fn url(s: &str) -> Url {
        Url::parse(s).expect("parse failed")
    }

    #[test]
    fn whitelist_blocks_unlisted_hosts() {
        let handler = handler_with_whitelist("example.com\n");

        assert!(handler.check_host_policy(&url("https://example.com/")).is_ok());

        let rejection = handler
            .check_host_policy(&url("http://blocked.test/"))
            .expect_err("expected a rejection");

        assert!(rejection.contains("not mentioned in the whitelist"));
    }

    #[test]
    fn blacklist_blocks_listed_hosts() {
        let mut blacklist_file = tempfile::NamedTempFile::new().expect("temp file creation failed");
        blacklist_file.write_all(b"bad.test\n").expect("write failed");

        let mut config = Config::default();
        config.proxy.blacklist_hosts_file =
            blacklist_file.path().to_str().expect("path").to_string();

        let handler = EgressHandler::new(Arc::new(config), Vec::new());

        assert!(handler.check_host_policy(&url("https://ok.test/")).is_ok());

        let rejection = handler
            .check_host_policy(&url("https://bad.test/x"))
            .expect_err("expected a rejection");

        assert!(rejection.contains("mentioned in the blacklist"));
    }

    #[tokio::test]
    async fn blocked_host_gets_502_without_any_launcher() {
        let handler = handler_with_whitelist("example.com\n");

        let request = Request::builder()
            .method("GET")
            .uri("http://blocked.test/")
            .body(Full::<Bytes>::default())
            .expect("request build failed");

        // No providers are registered: a dispatched request would time out,
        // but the policy rejection must answer first.
        let response = handler.handle(request, None).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("not mentioned in the whitelist"));
    }

    #[tokio::test]
    async fn unavailable_launchers_time_out_with_502() {
        let mut config = Config::default();
        config.proxy.wait_for_launcher_available_timeout = 0;

        let handler = EgressHandler::new(Arc::new(config), Vec::new());

        let request = Request::builder()
            .method("GET")
            .uri("http://any.test/")
            .body(Full::<Bytes>::default())
            .expect("request build failed");

        let response = handler.handle(request, None).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("Timeout"));
    }

    #[test]
    fn target_url_prefers_the_connect_authority() {
        let request = Request::builder()
            .method("GET")
            .uri("/api?x=1")
            .body(Full::<Bytes>::default())
            .expect("request build failed");

        let resolved = target_url(&request, Some("example.com:443")).expect("no URL");

        assert_eq!(resolved.as_str(), "https://example.com/api?x=1");
    }

    #[test]
    fn target_url_accepts_absolute_form() {
        let request = Request::builder()
            .method("GET")
            .uri("http://plain.test/path")
            .body(Full::<Bytes>::default())
            .expect("request build failed");

        let resolved = target_url(&request, None).expect("no URL");

        assert_eq!(resolved.as_str(), "http://plain.test/path");
    }

    #[test]
    fn origin_form_without_authority_has_no_url() {
        let request = Request::builder()
            .method("GET")
            .uri("/no-authority")
            .body(Full::<Bytes>::default())
            .expect("request build failed");

        assert!(target_url(&request, None).is_none());
    }
}
