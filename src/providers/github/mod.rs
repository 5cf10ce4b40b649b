//! GitHub provider: CI-workflow launchers sharing one account identity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{LauncherError, Result};
use crate::providers::{clear_launchers, Launcher, Provider};

pub mod api;
mod assets;
mod repository;

pub use api::ApiCredentials;
pub use repository::RepositoryLauncher;

pub struct GitHubProvider {
    launchers: Vec<Arc<RepositoryLauncher>>,
    stopped: AtomicBool,
}

impl GitHubProvider {
    pub async fn initialize(config: &Config) -> Result<Self> {
        info!(provider = "GitHub", "Configuring provider.");

        let credentials = ApiCredentials::new(
            config.github.username.clone(),
            config.github.token.clone(),
        );

        let mut launchers = Vec::new();

        if config.github.ga_enabled {
            match RepositoryLauncher::create(credentials).await {
                Ok(launcher) => launchers.push(launcher),
                Err(e) => error!(error = %e, "Cannot create repository workers launcher."),
            }
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
impl Provider for GitHubProvider {
    fn name(&self) -> &'static str {
        "GitHub"
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
