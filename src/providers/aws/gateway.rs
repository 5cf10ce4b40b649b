//! API-Gateway launcher: regional HTTP-passthrough REST APIs multiplexing
//! many target origins, rotated after a configurable number of requests.
//!
//! Each gateway serves one passthrough path per registered origin, keyed by
//! an identifier of the form `{scheme}_{host}:{port}`. Outbound traffic
//! leaves from the gateway's region, and the `X-My-X-Forwarded-For` header
//! is rewritten into `X-Forwarded-For` at the gateway for a second layer of
//! source randomisation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_sdk_apigateway::primitives::Blob;
use aws_sdk_apigateway::types::PutMode;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{AwsSettings, Config};
use crate::crypto;
use crate::error::LauncherError;
use crate::providers::Launcher;
use crate::request::{self, RequestData, ResponseData};

/// Maximum number of registered origins per gateway instance.
pub const MAX_RESOURCE_PER_INSTANCE: usize = 300;

const PROPAGATION_PROBE_INTERVAL: Duration = Duration::from_millis(250);
const PROPAGATION_PROBE_WINDOW: Duration = Duration::from_secs(15);
const PROPAGATION_SETTLE: Duration = Duration::from_secs(3);
const MISSING_AUTH_TOKEN_MARKER: &str = r#"{"message":"Missing Authentication Token"}"#;

/// One provisioned regional REST API.
pub struct Gateway {
    pub rest_api_id: String,
    pub region: String,
    pub title: String,
    client: aws_sdk_apigateway::Client,
    registered_urls: RwLock<Vec<Url>>,
    requests_sent: AtomicU64,
    deleted: AtomicBool,
    deleting: AtomicBool,
    // Serialises add-origin; held for the whole update + redeploy + probe.
    updating: Mutex<()>,
    deployment_description: String,
    stage_description: String,
    stage_name: String,
}

impl Gateway {
    /// Whether this gateway already passes traffic through to the origin of
    /// the given URL.
    pub fn does_target_url(&self, url: &Url) -> bool {
        let base = request::base_url(url);

        self.registered_urls
            .read()
            .map(|urls| urls.iter().any(|registered| request::base_url(registered) == base))
            .unwrap_or(false)
    }

    /// Whether new origins can still be added.
    pub fn can_still_increase(&self) -> bool {
        self.registered_urls
            .read()
            .map(|urls| urls.len() < MAX_RESOURCE_PER_INSTANCE)
            .unwrap_or(false)
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    fn registered_urls(&self) -> Vec<Url> {
        self.registered_urls.read().map(|urls| urls.clone()).unwrap_or_default()
    }

    /// The deployed stage endpoint of this REST API.
    pub fn stage_url(&self) -> String {
        format!(
            "https://{}.execute-api.{}.amazonaws.com/{}/",
            self.rest_api_id, self.region, self.stage_name
        )
    }

    /// The gateway endpoint that relays to the given URL, i.e.
    /// `{stage}/{scheme}_{host}:{port}{original-path}`.
    pub fn reach_url(&self, url: &Url) -> Result<Url, LauncherError> {
        let identifier = url_identifier(url);
        let path = request::path_from_url(url);

        let full = format!("{}{}{}", self.stage_url(), identifier, path);

        Url::parse(&full).map_err(|e| LauncherError::Framing(e.to_string()))
    }

    /// Registers a new origin on this gateway and redeploys it. Serialised
    /// per gateway; rolls the origin back out on update failure. Returns
    /// once the deployment has propagated (bounded probe) plus a settle
    /// delay.
    pub async fn add_url(&self, url: &Url) -> Result<(), LauncherError> {
        if !self.can_still_increase() {
            return Err(LauncherError::GatewayCapacity);
        }

        let _updating = self.updating.lock().await;

        // Another caller may have added the same origin while we waited.
        if self.does_target_url(url) {
            return Ok(());
        }

        if let Ok(mut urls) = self.registered_urls.write() {
            urls.push(url.clone());
        }

        let specification = openapi_specification(&self.title, &self.registered_urls());

        let put = self
            .client
            .put_rest_api()
            .rest_api_id(&self.rest_api_id)
            .mode(PutMode::Overwrite)
            .parameters("endpointConfigurationTypes", "REGIONAL")
            .body(Blob::new(specification))
            .send()
            .await;

        if let Err(e) = put {
            self.remove_url(url);
            return Err(LauncherError::CloudApi(e.to_string()));
        }

        let deployment = self
            .client
            .create_deployment()
            .rest_api_id(&self.rest_api_id)
            .description(&self.deployment_description)
            .stage_description(&self.stage_description)
            .stage_name(&self.stage_name)
            .send()
            .await;

        if let Err(e) = deployment {
            self.remove_url(url);
            return Err(LauncherError::CloudApi(e.to_string()));
        }

        let reach_url = self.reach_url(url)?;

        // Probe the new route until the deployment has propagated: as long
        // as the gateway answers with the missing-authentication-token
        // marker, the route is not live yet.
        let started = Instant::now();

        while started.elapsed() < PROPAGATION_PROBE_WINDOW {
            tokio::time::sleep(PROPAGATION_PROBE_INTERVAL).await;

            let probe = request::send_request(&RequestData {
                url: reach_url.clone(),
                method: "GET".to_string(),
                headers: HashMap::new(),
                body: Bytes::new(),
                follow_redirects: false,
            })
            .await;

            match probe {
                Ok(response)
                    if !String::from_utf8_lossy(&response.body)
                        .contains(MISSING_AUTH_TOKEN_MARKER) =>
                {
                    break;
                }
                _ => continue,
            }
        }

        tokio::time::sleep(PROPAGATION_SETTLE).await;

        Ok(())
    }

    fn remove_url(&self, url: &Url) {
        if let Ok(mut urls) = self.registered_urls.write() {
            urls.retain(|registered| !request::compare_base_urls(registered, url));
        }
    }

    /// Deletes the REST API behind this gateway.
    pub async fn delete(&self) -> Result<(), LauncherError> {
        self.client
            .delete_rest_api()
            .rest_api_id(&self.rest_api_id)
            .send()
            .await
            .map_err(|e| LauncherError::CloudApi(e.to_string()))?;

        self.deleted.store(true, Ordering::SeqCst);

        Ok(())
    }
}

/// Gateway path identifier for an origin, e.g. `https_example.com:443`.
pub fn url_identifier(url: &Url) -> String {
    request::base_url(url).replacen("://", "_", 1)
}

/// Materialises the OpenAPI 2.0 passthrough document for the given origins.
pub fn openapi_specification(title: &str, urls: &[Url]) -> Vec<u8> {
    let cache_namespace = crypto::random_prefix(7);
    let version_date = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let parameters = json!([
        {
            "name": "proxy",
            "in": "path",
            "required": true,
            "type": "string"
        },
        {
            "name": "X-My-X-Forwarded-For",
            "in": "header",
            "required": false,
            "type": "string"
        }
    ]);

    let integration = |uri: String| {
        json!({
            "uri": uri,
            "responses": {
                "default": {
                    "statusCode": "200"
                }
            },
            "requestParameters": {
                "integration.request.path.proxy": "method.request.path.proxy",
                "integration.request.header.X-Forwarded-For": "method.request.header.X-My-X-Forwarded-For"
            },
            "passthroughBehavior": "when_no_match",
            "httpMethod": "ANY",
            "tlsConfig": {
                "insecureSkipVerification": true
            },
            "cacheNamespace": cache_namespace,
            "cacheKeyParameters": ["method.request.path.proxy"],
            "type": "http_proxy"
        })
    };

    let mut paths = serde_json::Map::new();

    paths.insert(
        "/".to_string(),
        json!({
            "get": {
                "parameters": parameters.clone(),
                "responses": {},
                "x-amazon-apigateway-integration": integration("https://amazon.com/".to_string())
            }
        }),
    );

    for url in urls {
        let base = request::base_url(url);
        let identifier = url_identifier(url);

        let method = json!({
            "produces": ["application/json"],
            "parameters": parameters.clone(),
            "responses": {},
            "x-amazon-apigateway-integration": integration(format!("{base}/{{proxy}}"))
        });

        paths.insert(
            format!("/{identifier}/"),
            json!({ "x-amazon-apigateway-any-method": method.clone() }),
        );
        paths.insert(
            format!("/{identifier}/{{proxy+}}"),
            json!({ "x-amazon-apigateway-any-method": method }),
        );
    }

    let specification = json!({
        "swagger": "2.0",
        "info": {
            "version": version_date,
            "title": title.replace(' ', "_")
        },
        "basePath": "/",
        "schemes": ["https"],
        "paths": paths
    });

    serde_json::to_vec(&specification).unwrap_or_default()
}

/// The API-Gateway launcher: a pool of gateways per region.
pub struct ApiGatewayLauncher {
    clients: Arc<HashMap<String, aws_sdk_apigateway::Client>>,
    gateways_by_region: DashMap<String, Vec<Arc<Gateway>>>,
    // At most one gateway creation in flight per region.
    region_creation_locks: DashMap<String, Arc<Mutex<()>>>,
    max_instances: usize,
    rotate_after: u64,
    title_prefix: String,
    deployment_description: String,
    stage_description: String,
    stage_name: String,
    stopped: AtomicBool,
}

impl ApiGatewayLauncher {
    pub fn new(
        clients: Arc<HashMap<String, aws_sdk_apigateway::Client>>,
        settings: &AwsSettings,
    ) -> Self {
        let launcher = Self {
            clients,
            gateways_by_region: DashMap::new(),
            region_creation_locks: DashMap::new(),
            max_instances: settings.ag_max_instances,
            rotate_after: settings.ag_rotate_nb_requests,
            title_prefix: settings.ag_instance_title_prefix.clone(),
            deployment_description: settings.ag_instance_deployment_description.clone(),
            stage_description: settings.ag_instance_deployment_stage_description.clone(),
            stage_name: settings.ag_instance_deployment_stage_name.clone(),
            stopped: AtomicBool::new(false),
        };

        info!(launcher = %launcher.name(), "Creating launcher.");

        launcher
    }

    /// Number of gateways that are neither deleted nor being deleted.
    /// Rotation bookkeeping depends on this exact predicate.
    pub fn gateway_instance_count(&self) -> usize {
        self.gateways_by_region
            .iter()
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|gateway| !gateway.is_deleted() && !gateway.is_deleting())
                    .count()
            })
            .sum()
    }

    fn region_lock(&self, region: &str) -> Arc<Mutex<()>> {
        self.region_creation_locks
            .entry(region.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn random_region(&self) -> Result<String, LauncherError> {
        let regions: Vec<&String> = self.clients.keys().collect();

        crypto::random_element(&regions)
            .map(|region| (*region).clone())
            .ok_or_else(|| LauncherError::CloudApi("no AWS region is configured".into()))
    }

    fn store_gateway(&self, region: &str, gateway: Arc<Gateway>) {
        self.gateways_by_region
            .entry(region.to_string())
            .or_default()
            .push(gateway);
    }

    /// Returns a live gateway in the region that already targets the URL,
    /// or failing that one with spare capacity. The list is scanned in
    /// reverse so a just-rotated gateway is preferred over the one it
    /// replaces.
    fn gateway_in_region_for(&self, url: &Url, region: &str) -> Option<Arc<Gateway>> {
        let gateways = self.gateways_by_region.get(region)?;

        let mut spare_capacity = None;

        for gateway in gateways.value().iter().rev() {
            if gateway.is_deleted() || gateway.is_deleting() {
                continue;
            }

            if gateway.does_target_url(url) {
                return Some(Arc::clone(gateway));
            }

            if gateway.can_still_increase() {
                spare_capacity = Some(Arc::clone(gateway));
            }
        }

        spare_capacity
    }

    /// One candidate gateway per region that targets the URL or can still
    /// accept it.
    fn one_gateway_per_region_for(&self, url: &Url) -> Vec<Arc<Gateway>> {
        let regions: Vec<String> = self
            .gateways_by_region
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        regions
            .iter()
            .filter_map(|region| self.gateway_in_region_for(url, region))
            .collect()
    }

    /// Provisions a new REST API with the given origin set and deploys it.
    async fn create_gateway(
        &self,
        region: &str,
        urls: Vec<Url>,
        title: String,
    ) -> Result<Arc<Gateway>, LauncherError> {
        if urls.len() > MAX_RESOURCE_PER_INSTANCE {
            return Err(LauncherError::GatewayCapacity);
        }

        let client = self
            .clients
            .get(region)
            .cloned()
            .ok_or_else(|| LauncherError::CloudApi(format!("no client for region {region}")))?;

        let specification = openapi_specification(&title, &urls);

        let imported = client
            .import_rest_api()
            .parameters("endpointConfigurationTypes", "REGIONAL")
            .body(Blob::new(specification))
            .send()
            .await
            .map_err(|e| LauncherError::CloudApi(e.to_string()))?;

        let rest_api_id = imported
            .id()
            .ok_or_else(|| LauncherError::CloudApi("no REST API id returned on import".into()))?
            .to_string();

        client
            .create_deployment()
            .rest_api_id(&rest_api_id)
            .description(&self.deployment_description)
            .stage_description(&self.stage_description)
            .stage_name(&self.stage_name)
            .send()
            .await
            .map_err(|e| LauncherError::CloudApi(e.to_string()))?;

        Ok(Arc::new(Gateway {
            rest_api_id,
            region: region.to_string(),
            title,
            client,
            registered_urls: RwLock::new(urls),
            requests_sent: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
            deleting: AtomicBool::new(false),
            updating: Mutex::new(()),
            deployment_description: self.deployment_description.clone(),
            stage_description: self.stage_description.clone(),
            stage_name: self.stage_name.clone(),
        }))
    }

    fn new_title(&self) -> String {
        format!("{}_{}", self.title_prefix, chrono::Utc::now().timestamp_micros())
    }

    /// Selects (or provisions) the gateway used for one request, handling
    /// capacity reuse, the per-region creation guard, and rotation.
    async fn select_gateway(&self, url: &Url) -> Result<Arc<Gateway>, LauncherError> {
        let gateway = if self.gateway_instance_count() < self.max_instances {
            let region = self.random_region()?;

            let mut candidate = self.gateway_in_region_for(url, &region);

            if candidate.is_none() {
                // The lock both serialises creation per region and parks
                // concurrent callers until an in-flight creation finishes.
                let lock = self.region_lock(&region);
                let _guard = lock.lock().await;

                candidate = self.gateway_in_region_for(url, &region);

                if candidate.is_none() {
                    let gateway = self
                        .create_gateway(&region, vec![url.clone()], self.new_title())
                        .await?;

                    debug!(url = %url, region = %region, created_instance_id = %gateway.rest_api_id, "Creating API Gateway instance.");

                    self.store_gateway(&region, Arc::clone(&gateway));

                    candidate = Some(gateway);
                }
            }

            match candidate {
                Some(gateway) => {
                    if !gateway.does_target_url(url) {
                        gateway.add_url(url).await?;
                    }

                    gateway
                }
                None => return Err(LauncherError::NoGatewayAvailable),
            }
        } else {
            let candidates = self.one_gateway_per_region_for(url);

            if candidates.is_empty() {
                return Err(LauncherError::NoGatewayAvailable);
            }

            let gateway = Arc::clone(&candidates[crypto::secure_random_index(candidates.len())]);

            if !gateway.does_target_url(url) {
                gateway.add_url(url).await?;
            }

            gateway
        };

        self.rotate_if_needed(gateway).await
    }

    /// Replaces a gateway that hit the rotation threshold with a fresh one
    /// carrying an identical origin set, then deletes the old instance in
    /// the background.
    async fn rotate_if_needed(&self, gateway: Arc<Gateway>) -> Result<Arc<Gateway>, LauncherError> {
        let sent = gateway.requests_sent();

        if self.rotate_after == 0 || sent == 0 || sent % self.rotate_after != 0 {
            return Ok(gateway);
        }

        gateway.deleting.store(true, Ordering::SeqCst);

        let region = gateway.region.clone();

        let lock = self.region_lock(&region);
        let guard = lock.lock().await;

        let renewed = self
            .create_gateway(&region, gateway.registered_urls(), gateway.title.clone())
            .await?;

        debug!(
            region = %region,
            previous_instance_id = %gateway.rest_api_id,
            new_instance_id = %renewed.rest_api_id,
            "Renewing API Gateway instance."
        );

        self.store_gateway(&region, Arc::clone(&renewed));

        drop(guard);

        let old = Arc::clone(&gateway);

        tokio::spawn(async move {
            if let Err(e) = old.delete().await {
                error!(error = %e, instance_id = %old.rest_api_id, "Can not delete API Gateway instance.");
            }
        });

        Ok(renewed)
    }
}

#[async_trait]
impl Launcher for ApiGatewayLauncher {
    fn name(&self) -> String {
        "API Gateways".to_string()
    }

    fn total_requests(&self) -> u64 {
        self.gateways_by_region
            .iter()
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|gateway| gateway.requests_sent())
                    .sum::<u64>()
            })
            .sum()
    }

    fn summarize_state(&self) -> String {
        format!(
            "Launcher {} : nbTotalRequestsSent={}, nbAPIGateways={}",
            self.name(),
            self.total_requests(),
            self.gateway_instance_count()
        )
    }

    fn is_available(&self) -> bool {
        true
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Creates gateways preloaded with the given origins, in chunks of
    /// [`MAX_RESOURCE_PER_INSTANCE`], one set per region, until the
    /// instance cap is reached.
    async fn preload_hosts(&self, hosts: &[Url]) {
        let regions: Vec<String> = self.clients.keys().cloned().collect();

        for region in regions {
            if self.gateway_instance_count() >= self.max_instances {
                warn!(
                    nb_instances_running = self.gateway_instance_count(),
                    max_instances = self.max_instances,
                    region = %region,
                    "Can not preload hosts in this region because the maximum number of gateway instances has been reached."
                );
                continue;
            }

            let title = self.new_title();

            for chunk in hosts.chunks(MAX_RESOURCE_PER_INSTANCE) {
                if self.gateway_instance_count() >= self.max_instances {
                    warn!(
                        max = self.max_instances,
                        "The maximum number of API Gateway instances has been reached, can not create new ones for the remaining preloading hosts."
                    );
                    continue;
                }

                match self.create_gateway(&region, chunk.to_vec(), title.clone()).await {
                    Ok(gateway) => {
                        debug!(
                            preload_hosts_nb = chunk.len(),
                            region = %region,
                            created_instance_id = %gateway.rest_api_id,
                            "Creating API Gateway instance for preloading hosts."
                        );

                        self.store_gateway(&region, gateway);
                    }
                    Err(e) => {
                        warn!(error = %e, region = %region, "Can not create the API Gateway instance for the preloading hosts in this region.");
                    }
                }
            }
        }
    }

    async fn send(
        &self,
        request: &RequestData,
        config: &Config,
    ) -> Result<(ResponseData, String), LauncherError> {
        let gateway = self.select_gateway(&request.url).await?;

        let reach_url = gateway.reach_url(&request.url)?;

        let forwarded_for = request::random_ip_from_cidr(&config.aws.ag_forwarded_for_range)?;

        let mut headers = request.headers.clone();
        headers.insert("X-My-X-Forwarded-For".to_string(), forwarded_for.to_string());

        let tag = format!(
            "apiGatewayID={}, xForwardedFor={}, region={}",
            gateway.rest_api_id, forwarded_for, gateway.region
        );

        let response = request::send_request(&RequestData {
            url: reach_url,
            method: request.method.clone(),
            headers,
            body: request.body.clone(),
            follow_redirects: request.follow_redirects,
        })
        .await?;

        gateway.requests_sent.fetch_add(1, Ordering::SeqCst);

        Ok((response, tag))
    }

    async fn clear(&self) -> bool {
        info!(launcher = %self.name(), "Clearing launcher.");

        let mut result = true;

        let gateways: Vec<Arc<Gateway>> = self
            .gateways_by_region
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();

        for gateway in gateways {
            if gateway.is_deleted() {
                continue;
            }

            debug!(instance_id = %gateway.rest_api_id, "Deleting API Gateway instance.");

            if let Err(e) = gateway.delete().await {
                error!(error = %e, instance_id = %gateway.rest_api_id, "Error while deleting API Gateway instance.");
                result = false;
            }
        }

        self.stopped.store(result, Ordering::SeqCst);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("parse failed")
    }

    fn test_client() -> aws_sdk_apigateway::Client {
        let config = aws_sdk_apigateway::Config::builder()
            .behavior_version(aws_sdk_apigateway::config::BehaviorVersion::latest())
            .region(aws_sdk_apigateway::config::Region::new("eu-west-1"))
            .credentials_provider(aws_sdk_apigateway::config::Credentials::new(
                "test", "test", None, None, "test",
            ))
            .build();

        aws_sdk_apigateway::Client::from_conf(config)
    }

    fn test_gateway(urls: Vec<Url>) -> Gateway {
        Gateway {
            rest_api_id: "abc123".to_string(),
            region: "eu-west-1".to_string(),
            title: "Apple_1".to_string(),
            client: test_client(),
            registered_urls: RwLock::new(urls),
            requests_sent: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
            deleting: AtomicBool::new(false),
            updating: Mutex::new(()),
            deployment_description: "d".to_string(),
            stage_description: "sd".to_string(),
            stage_name: "stage1".to_string(),
        }
    }

    #[test]
    fn identifier_includes_scheme_host_and_port() {
        assert_eq!(url_identifier(&url("https://example.com/api")), "https_example.com:443");
        assert_eq!(url_identifier(&url("http://example.com:8080/")), "http_example.com:8080");
    }

    #[test]
    fn reach_url_routes_through_the_stage() {
        let gateway = test_gateway(vec![url("https://example.com")]);

        let reach = gateway
            .reach_url(&url("https://example.com/api?x=1"))
            .expect("reach url failed");

        assert_eq!(
            reach.as_str(),
            "https://abc123.execute-api.eu-west-1.amazonaws.com/stage1/https_example.com:443/api?x=1"
        );
    }

    #[test]
    fn target_lookup_compares_base_urls() {
        let gateway = test_gateway(vec![url("https://example.com")]);

        assert!(gateway.does_target_url(&url("HTTPS://EXAMPLE.COM:443/other/path")));
        assert!(!gateway.does_target_url(&url("https://other.test/")));
    }

    #[test]
    fn capacity_bound_is_enforced() {
        let urls: Vec<Url> = (0..MAX_RESOURCE_PER_INSTANCE)
            .map(|i| url(&format!("https://host{i}.test")))
            .collect();

        let gateway = test_gateway(urls);

        assert!(!gateway.can_still_increase());
        assert!(test_gateway(vec![url("https://a.test")]).can_still_increase());
    }

    #[test]
    fn openapi_document_contains_passthrough_paths() {
        let spec = openapi_specification("My Title", &[url("https://example.com")]);

        let value: serde_json::Value = serde_json::from_slice(&spec).expect("invalid JSON");

        assert_eq!(value["swagger"], "2.0");
        assert_eq!(value["info"]["title"], "My_Title");

        let paths = value["paths"].as_object().expect("paths missing");
        assert!(paths.contains_key("/"));
        assert!(paths.contains_key("/https_example.com:443/"));
        assert!(paths.contains_key("/https_example.com:443/{proxy+}"));

        let method = &paths["/https_example.com:443/{proxy+}"]["x-amazon-apigateway-any-method"];
        let integration = &method["x-amazon-apigateway-integration"];

        assert_eq!(integration["type"], "http_proxy");
        assert_eq!(integration["httpMethod"], "ANY");
        assert_eq!(integration["passthroughBehavior"], "when_no_match");
        assert_eq!(integration["uri"], "https://example.com:443/{proxy}");
        assert_eq!(integration["tlsConfig"]["insecureSkipVerification"], true);
    }

    #[test]
    fn instance_count_skips_deleted_and_deleting() {
        let launcher = ApiGatewayLauncher::new(
            Arc::new(HashMap::from([("eu-west-1".to_string(), test_client())])),
            &crate::config::AwsSettings::default(),
        );

        let live = Arc::new(test_gateway(vec![url("https://a.test")]));
        let deleting = Arc::new(test_gateway(vec![url("https://b.test")]));
        deleting.deleting.store(true, Ordering::SeqCst);
        let deleted = Arc::new(test_gateway(vec![url("https://c.test")]));
        deleted.deleted.store(true, Ordering::SeqCst);

        launcher.store_gateway("eu-west-1", live);
        launcher.store_gateway("eu-west-1", deleting);
        launcher.store_gateway("eu-west-1", deleted);

        assert_eq!(launcher.gateway_instance_count(), 1);
    }

    #[test]
    fn region_selection_prefers_target_over_capacity() {
        let launcher = ApiGatewayLauncher::new(
            Arc::new(HashMap::from([("eu-west-1".to_string(), test_client())])),
            &crate::config::AwsSettings::default(),
        );

        let spare = Arc::new(test_gateway(vec![url("https://other.test")]));
        let target = Arc::new(test_gateway(vec![url("https://wanted.test")]));

        launcher.store_gateway("eu-west-1", Arc::clone(&spare));
        launcher.store_gateway("eu-west-1", Arc::clone(&target));

        let picked = launcher
            .gateway_in_region_for(&url("https://wanted.test/x"), "eu-west-1")
            .expect("no gateway picked");

        assert!(Arc::ptr_eq(&picked, &target));
    }

    #[test]
    fn region_selection_skips_deleting_gateways() {
        let launcher = ApiGatewayLauncher::new(
            Arc::new(HashMap::from([("eu-west-1".to_string(), test_client())])),
            &crate::config::AwsSettings::default(),
        );

        let rotated_out = Arc::new(test_gateway(vec![url("https://wanted.test")]));
        rotated_out.deleting.store(true, Ordering::SeqCst);

        launcher.store_gateway("eu-west-1", rotated_out);

        assert!(launcher
            .gateway_in_region_for(&url("https://wanted.test/x"), "eu-west-1")
            .is_none());
    }
}
