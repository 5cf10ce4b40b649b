//! AWS provider: per-region API Gateway clients under one cloud identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_apigateway::config::Credentials;
use tracing::info;

use crate::config::Config;
use crate::error::{LauncherError, Result};
use crate::providers::{clear_launchers, Launcher, Provider};

mod gateway;

pub use gateway::{ApiGatewayLauncher, Gateway, MAX_RESOURCE_PER_INSTANCE};

/// Transport-level retry cap applied to every SDK client.
const SDK_MAX_ATTEMPTS: u32 = 30;

pub struct AwsProvider {
    launchers: Vec<Arc<ApiGatewayLauncher>>,
    stopped: AtomicBool,
}

impl AwsProvider {
    /// Creates and initialises the AWS provider: one SDK client per
    /// configured region, then the gateway launcher.
    pub async fn initialize(config: &Config) -> Result<Self> {
        info!(provider = "AWS", "Configuring provider.");

        let clients = load_region_clients(config).await;

        if clients.is_empty() {
            return Err(LauncherError::CloudApi(
                "no valid AWS configurations have been set up (please check the provided credentials and regions)".into(),
            )
            .into());
        }

        let mut launchers = Vec::new();

        if config.aws.ag_enabled {
            launchers.push(Arc::new(ApiGatewayLauncher::new(
                Arc::new(clients),
                &config.aws,
            )));
        }

        if launchers.is_empty() {
            return Err(LauncherError::CloudApi("no launchers could have been created".into()).into());
        }

        Ok(Self {
            launchers,
            stopped: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Provider for AwsProvider {
    fn name(&self) -> &'static str {
        "AWS"
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
        info!(provider = self.name(), "Clearing provider.");

        self.stopped.store(true, Ordering::SeqCst);

        clear_launchers(&self.launchers()).await
    }
}

/// Builds one API Gateway client per configured region. Static credentials
/// are used unless a profile name is given, in which case the SDK resolves
/// it from the shared credentials file.
async fn load_region_clients(config: &Config) -> HashMap<String, aws_sdk_apigateway::Client> {
    let mut clients = HashMap::new();

    for region in &config.aws.regions {
        info!(region = %region, "Creating AWS configuration.");

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(SDK_MAX_ATTEMPTS));

        if !config.aws.profile.is_empty() {
            loader = loader.profile_name(&config.aws.profile);
        } else {
            let session_token = if config.aws.session_token.is_empty() {
                None
            } else {
                Some(config.aws.session_token.clone())
            };

            loader = loader.credentials_provider(Credentials::new(
                config.aws.access_key.clone(),
                config.aws.secret_key.clone(),
                session_token,
                None,
                "ipspinner",
            ));
        }

        let sdk_config = loader.load().await;

        clients.insert(region.clone(), aws_sdk_apigateway::Client::new(&sdk_config));
    }

    clients
}
