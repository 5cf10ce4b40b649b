//! Launcher and provider contracts plus the registry lifecycle.
//!
//! A launcher is one concrete mechanism for relaying a single HTTP request
//! through an ephemeral cloud egress. A provider groups the launchers that
//! share one cloud identity. The registry loads every enabled provider at
//! startup, pushes the (filtered) preload hosts through every launcher, and
//! clears everything on shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::LauncherError;
use crate::hosts;
use crate::request::{self, RequestData, ResponseData};

pub mod aws;
pub mod azure;
pub mod github;

#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Cumulative number of requests relayed through this launcher.
    fn total_requests(&self) -> u64;

    fn summarize_state(&self) -> String;

    /// Whether the launcher can accept a request right now. The dispatcher
    /// only ever picks among available launchers.
    fn is_available(&self) -> bool;

    fn is_stopped(&self) -> bool;

    async fn preload_hosts(&self, hosts: &[Url]);

    /// Relays one request. Returns the response envelope together with a
    /// diagnostic tag describing the egress used.
    async fn send(
        &self,
        request: &RequestData,
        config: &Config,
    ) -> Result<(ResponseData, String), LauncherError>;

    /// Destroys the launcher's cloud resources. Idempotent; returns whether
    /// everything was fully cleared.
    async fn clear(&self) -> bool;
}

#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn summarize_state(&self) -> String {
        if self.is_stopped() {
            format!("Provider {} is stopped.", self.name())
        } else {
            format!(
                "Provider {} is running with {} launcher(s).",
                self.name(),
                self.launchers().len()
            )
        }
    }

    fn launchers(&self) -> Vec<Arc<dyn Launcher>>;

    fn available_launchers(&self) -> Vec<Arc<dyn Launcher>> {
        self.launchers()
            .into_iter()
            .filter(|launcher| launcher.is_available())
            .collect()
    }

    fn total_requests(&self) -> u64 {
        self.launchers()
            .iter()
            .map(|launcher| launcher.total_requests())
            .sum()
    }

    fn is_stopped(&self) -> bool;

    async fn clear(&self) -> bool;
}

/// Clears every launcher of a provider, reporting aggregate success.
pub async fn clear_launchers(launchers: &[Arc<dyn Launcher>]) -> bool {
    let mut fully_cleared = true;

    for launcher in launchers {
        if !launcher.clear().await {
            fully_cleared = false;
        }
    }

    fully_cleared
}

/// Initialises every enabled provider independently. A provider that fails
/// to come up is logged and skipped; its partial resources are cleared by
/// its own initialiser. Preload hosts are filtered through the host policy
/// and pushed through every launcher.
pub async fn load_providers(config: &Config) -> Vec<Arc<dyn Provider>> {
    info!("Loading providers, please do not press ctrl+c.");

    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    if config.aws.ag_enabled {
        match aws::AwsProvider::initialize(config).await {
            Ok(provider) => providers.push(Arc::new(provider)),
            Err(e) => error!(error = %e, provider = "AWS", "Can not load the provider."),
        }
    }

    if config.github.ga_enabled {
        match github::GitHubProvider::initialize(config).await {
            Ok(provider) => providers.push(Arc::new(provider)),
            Err(e) => error!(error = %e, provider = "GitHub", "Can not load the provider."),
        }
    }

    if config.azure.cs_enabled {
        match azure::AzureProvider::initialize(config).await {
            Ok(provider) => providers.push(Arc::new(provider)),
            Err(e) => error!(error = %e, provider = "Azure", "Can not load the provider."),
        }
    }

    let preload_hosts = hosts::parse_hosts_file(&config.proxy.preload_hosts_file);
    let whitelist = hosts::parse_hosts_file(&config.proxy.whitelist_hosts_file);
    let blacklist = hosts::parse_hosts_file(&config.proxy.blacklist_hosts_file);

    let preload_hosts = filter_preload_hosts(preload_hosts, &whitelist, &blacklist);

    if !preload_hosts.is_empty() {
        for provider in &providers {
            for launcher in provider.launchers() {
                launcher.preload_hosts(&preload_hosts).await;
            }
        }
    }

    providers
}

/// Applies the host policy to the preload list: with a whitelist, only
/// whitelisted hosts survive; otherwise blacklisted hosts are removed.
pub fn filter_preload_hosts(preload: Vec<Url>, whitelist: &[Url], blacklist: &[Url]) -> Vec<Url> {
    if whitelist.is_empty() && blacklist.is_empty() {
        return preload;
    }

    let mut filtered = Vec::new();

    for host in preload {
        if !whitelist.is_empty() {
            if request::url_list_contains_base_url(whitelist, &host) {
                filtered.push(host);
            } else {
                warn!(host = %host, "The host has been removed from the preloading hosts because it is not mentioned in the whitelist.");
            }
        } else if request::url_list_contains_base_url(blacklist, &host) {
            warn!(host = %host, "The host has been removed from the preloading hosts because it is mentioned in the blacklist.");
        } else {
            filtered.push(host);
        }
    }

    filtered
}

/// Clears every provider, logging aggregate success.
pub async fn clear_providers(providers: &[Arc<dyn Provider>]) {
    let mut result = true;

    for provider in providers {
        if !provider.clear().await {
            result = false;
        }
    }

    if result {
        info!("All providers have been cleared.");
    } else {
        error!("Some providers have not been cleared.");
    }
}

/// Every launcher across all providers, paired with its owning provider.
pub fn all_launchers(
    providers: &[Arc<dyn Provider>],
) -> Vec<(Arc<dyn Provider>, Arc<dyn Launcher>)> {
    let mut launchers = Vec::new();

    for provider in providers {
        for launcher in provider.launchers() {
            launchers.push((Arc::clone(provider), launcher));
        }
    }

    launchers
}

/// Every currently-available launcher across all providers.
pub fn all_available_launchers(
    providers: &[Arc<dyn Provider>],
) -> Vec<(Arc<dyn Provider>, Arc<dyn Launcher>)> {
    let mut launchers = Vec::new();

    for provider in providers {
        for launcher in provider.available_launchers() {
            launchers.push((Arc::clone(provider), launcher));
        }
    }

    launchers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("parse failed")
    }

    #[test]
    fn whitelist_takes_priority_for_preload_filtering() {
        let preload = vec![url("https://a.test"), url("https://b.test")];
        let whitelist = vec![url("https://a.test")];
        let blacklist = vec![url("https://a.test")];

        let filtered = filter_preload_hosts(preload, &whitelist, &blacklist);

        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].host_str(), Some("a.test"));
    }

    #[test]
    fn blacklist_removes_preload_hosts() {
        let preload = vec![url("https://a.test"), url("https://b.test")];
        let blacklist = vec![url("https://b.test")];

        let filtered = filter_preload_hosts(preload, &[], &blacklist);

        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].host_str(), Some("a.test"));
    }

    #[test]
    fn no_policy_keeps_everything() {
        let preload = vec![url("https://a.test"), url("https://b.test")];

        let filtered = filter_preload_hosts(preload.clone(), &[], &[]);

        assert_eq!(filtered.len(), preload.len());
    }
}
