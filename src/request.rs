//! Unified HTTP client, JSON request helpers, and URL canonicalisation.
//!
//! TLS verification is disabled on every outbound client by design: the
//! system talks to arbitrary cloud control planes and to intercepted origins,
//! and the gateway propagation probe must reach endpoints that are still
//! being provisioned.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use ipnetwork::IpNetwork;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::redirect::Policy;
use serde_json::{Map, Value};
use url::Url;

use crate::error::RequestError;

#[derive(Debug, Clone)]
pub struct RequestData {
    pub url: Url,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub follow_redirects: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseData {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct JsonRequestData {
    pub url: Url,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub follow_redirects: bool,
}

#[derive(Debug, Clone, Default)]
pub struct JsonResponseData {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Map<String, Value>,
}

impl JsonResponseData {
    /// Returns the string under `key` in the body, or `default` when absent
    /// or not a string.
    pub fn body_str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.body.get(key).and_then(Value::as_str).unwrap_or(default)
    }
}

/// Shared HTTP client with TLS verification disabled.
pub fn insecure_client(follow_redirects: bool) -> &'static reqwest::Client {
    static FOLLOW: OnceLock<reqwest::Client> = OnceLock::new();
    static NO_FOLLOW: OnceLock<reqwest::Client> = OnceLock::new();

    let build = |policy: Policy| {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(policy)
            .build()
            .expect("HTTP client construction failed")
    };

    if follow_redirects {
        FOLLOW.get_or_init(|| build(Policy::limited(10)))
    } else {
        NO_FOLLOW.get_or_init(|| build(Policy::none()))
    }
}

/// Rustls client configuration that accepts any server certificate. Used for
/// the websocket dials of the cloud-shell launcher.
pub fn insecure_rustls_config() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth(),
    )
}

#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Sends an HTTP request with the provided request data. Multi-valued
/// response headers collapse to their first value.
pub async fn send_request(request: &RequestData) -> Result<ResponseData, RequestError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| RequestError::InvalidMethod(request.method.clone()))?;

    let client = insecure_client(request.follow_redirects);

    let mut builder = client.request(method, request.url.clone());

    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }

    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let response = builder.send().await?;

    let status = response.status().as_u16();

    let mut headers = HashMap::new();

    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.entry(name.to_string()).or_insert_with(|| value.to_string());
        }
    }

    let body = response.bytes().await?.to_vec();

    Ok(ResponseData { status, headers, body })
}

/// Sends a JSON request and decodes the response body into a JSON object.
/// `Content-Type: application/json` is set when absent.
pub async fn send_json_request(request: &JsonRequestData) -> Result<JsonResponseData, RequestError> {
    let mut headers = request.headers.clone();

    if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
        headers.insert("Content-Type".to_string(), "application/json".to_string());
    }

    let body = match &request.body {
        Some(value) => Bytes::from(serde_json::to_vec(value)?),
        None => Bytes::new(),
    };

    let response = send_request(&RequestData {
        url: request.url.clone(),
        method: request.method.clone(),
        headers,
        body,
        follow_redirects: request.follow_redirects,
    })
    .await?;

    let body = if response.body.is_empty() {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(&response.body)? {
            Value::Object(map) => map,
            _ => return Err(RequestError::UnexpectedJson),
        }
    };

    Ok(JsonResponseData {
        status: response.status,
        headers: response.headers,
        body,
    })
}

/// Canonical base URL: `scheme://lowercase-host:port`, with the port made
/// explicit (443 for https, 80 otherwise).
pub fn base_url(url: &Url) -> String {
    let scheme = url.scheme().to_lowercase();
    let host = url.host_str().unwrap_or("").to_lowercase();

    let port = url.port().unwrap_or(match scheme.as_str() {
        "https" => 443,
        _ => 80,
    });

    format!("{scheme}://{host}:{port}")
}

/// Everything after `scheme://host[:port]`, preserving query and fragment.
pub fn path_from_url(url: &Url) -> String {
    let mut path = url.path().to_string();

    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    if let Some(fragment) = url.fragment() {
        path.push('#');
        path.push_str(fragment);
    }

    path
}

pub fn compare_base_urls(a: &Url, b: &Url) -> bool {
    base_url(a) == base_url(b)
}

pub fn url_list_contains_base_url(urls: &[Url], url: &Url) -> bool {
    urls.iter().any(|candidate| compare_base_urls(candidate, url))
}

/// Joins headers into `key\nvalue\n` pairs with the trailing newline
/// stripped. This is the framing shared by the remote executors.
pub fn join_header_lines(headers: &HashMap<String, String>) -> String {
    let mut joined = String::new();

    for (key, value) in headers {
        joined.push_str(key);
        joined.push('\n');
        joined.push_str(value);
        joined.push('\n');
    }

    if !joined.is_empty() {
        joined.pop();
    }

    joined
}

/// Draws a uniformly random address inside the given CIDR network.
pub fn random_ip_from_cidr(cidr: &str) -> Result<IpAddr, RequestError> {
    let network: IpNetwork = cidr
        .parse()
        .map_err(|_| RequestError::InvalidCidr(cidr.to_string()))?;

    match network {
        IpNetwork::V4(net) => {
            let start = u32::from(net.network());
            let host_bits = 32 - u32::from(net.prefix());

            let offset = if host_bits >= 32 {
                OsRng.next_u32()
            } else {
                OsRng.next_u32() & ((1u32 << host_bits) - 1)
            };

            Ok(IpAddr::V4(Ipv4Addr::from(start | offset)))
        }
        IpNetwork::V6(net) => {
            let start = u128::from(net.network());
            let host_bits = 128 - u32::from(net.prefix());

            let raw = ((OsRng.next_u64() as u128) << 64) | OsRng.next_u64() as u128;

            let offset = if host_bits >= 128 {
                raw
            } else {
                raw & ((1u128 << host_bits) - 1)
            };

            Ok(IpAddr::V6(Ipv6Addr::from(start | offset)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_case_insensitive_with_port_defaults() {
        let upper = Url::parse("HTTP://X.com").expect("parse failed");
        let explicit = Url::parse("http://x.com:80").expect("parse failed");

        assert_eq!(base_url(&upper), base_url(&explicit));
        assert_eq!(base_url(&upper), "http://x.com:80");
    }

    #[test]
    fn base_url_defaults_https_port() {
        let url = Url::parse("https://Example.COM/path?q=1").expect("parse failed");

        assert_eq!(base_url(&url), "https://example.com:443");
    }

    #[test]
    fn base_url_keeps_explicit_port() {
        let url = Url::parse("https://example.com:8443/").expect("parse failed");

        assert_eq!(base_url(&url), "https://example.com:8443");
    }

    #[test]
    fn path_preserves_query_and_fragment() {
        let url = Url::parse("https://example.com/api/v1?x=1&y=2#frag").expect("parse failed");

        assert_eq!(path_from_url(&url), "/api/v1?x=1&y=2#frag");
    }

    #[test]
    fn url_list_lookup_compares_base_urls() {
        let list = vec![
            Url::parse("https://a.test").expect("parse failed"),
            Url::parse("http://b.test").expect("parse failed"),
        ];

        let hit = Url::parse("https://A.TEST:443/whatever").expect("parse failed");
        let miss = Url::parse("https://b.test").expect("parse failed");

        assert!(url_list_contains_base_url(&list, &hit));
        assert!(!url_list_contains_base_url(&list, &miss));
    }

    #[test]
    fn join_header_lines_strips_trailing_newline() {
        let mut headers = HashMap::new();
        headers.insert("Accept".to_string(), "*/*".to_string());

        assert_eq!(join_header_lines(&headers), "Accept\n*/*");
        assert_eq!(join_header_lines(&HashMap::new()), "");
    }

    #[test]
    fn random_ip_stays_inside_ipv4_cidr() {
        for _ in 0..50 {
            let ip = random_ip_from_cidr("35.180.0.0/16").expect("draw failed");

            match ip {
                IpAddr::V4(v4) => {
                    let octets = v4.octets();
                    assert_eq!(octets[0], 35);
                    assert_eq!(octets[1], 180);
                }
                IpAddr::V6(_) => panic!("expected an IPv4 address"),
            }
        }
    }

    #[test]
    fn random_ip_rejects_invalid_cidr() {
        assert!(random_ip_from_cidr("not-a-cidr").is_err());
    }
}
