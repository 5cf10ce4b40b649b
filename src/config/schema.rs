use serde::{Deserialize, Serialize};

use crate::crypto;

/// Merged configuration for the proxy and every provider, mirroring the
/// `[proxy]`, `[aws]`, `[github]` and `[azure]` sections of the INI file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub aws: AwsSettings,
    #[serde(default)]
    pub github: GitHubSettings,
    #[serde(default)]
    pub azure: AzureSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxySettings::default(),
            aws: AwsSettings::default(),
            github: GitHubSettings::default(),
            azure: AzureSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ProxySettings {
    #[serde(default)]
    pub preload_hosts_file: String,
    #[serde(default)]
    pub whitelist_hosts_file: String,
    #[serde(default)]
    pub blacklist_hosts_file: String,
    #[serde(default)]
    pub ca_cert_file: String,
    #[serde(default)]
    pub ca_cert_key_file: String,
    #[serde(default)]
    pub user_agents_file: String,
    #[serde(default = "default_debug_response_headers")]
    pub debug_response_headers: bool,
    #[serde(default = "default_wait_for_launcher_timeout")]
    pub wait_for_launcher_available_timeout: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            preload_hosts_file: String::new(),
            whitelist_hosts_file: String::new(),
            blacklist_hosts_file: String::new(),
            ca_cert_file: String::new(),
            ca_cert_key_file: String::new(),
            user_agents_file: String::new(),
            debug_response_headers: default_debug_response_headers(),
            wait_for_launcher_available_timeout: default_wait_for_launcher_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct AwsSettings {
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub session_token: String,
    #[serde(default)]
    pub ag_enabled: bool,
    #[serde(default = "default_ag_max_instances")]
    pub ag_max_instances: usize,
    #[serde(default = "default_ag_rotate_nb_requests")]
    pub ag_rotate_nb_requests: u64,
    #[serde(default = "default_ag_forwarded_for_range")]
    pub ag_forwarded_for_range: String,
    #[serde(default = "default_ag_instance_title_prefix")]
    pub ag_instance_title_prefix: String,
    #[serde(default = "default_ag_deployment_description")]
    pub ag_instance_deployment_description: String,
    #[serde(default = "default_ag_deployment_description")]
    pub ag_instance_deployment_stage_description: String,
    #[serde(default = "default_ag_deployment_stage_name")]
    pub ag_instance_deployment_stage_name: String,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            profile: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            session_token: String::new(),
            ag_enabled: false,
            ag_max_instances: default_ag_max_instances(),
            ag_rotate_nb_requests: default_ag_rotate_nb_requests(),
            ag_forwarded_for_range: default_ag_forwarded_for_range(),
            ag_instance_title_prefix: default_ag_instance_title_prefix(),
            ag_instance_deployment_description: default_ag_deployment_description(),
            ag_instance_deployment_stage_description: default_ag_deployment_description(),
            ag_instance_deployment_stage_name: default_ag_deployment_stage_name(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct GitHubSettings {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub ga_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct AzureSettings {
    #[serde(default)]
    pub admin_email: String,
    #[serde(default)]
    pub admin_password: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub accounts_file: String,
    #[serde(default)]
    pub cs_enabled: bool,
    #[serde(default)]
    pub cs_preferred_locations: Vec<String>,
    #[serde(default = "default_cs_nb_instances")]
    pub cs_nb_instances: usize,
}

impl Default for AzureSettings {
    fn default() -> Self {
        Self {
            admin_email: String::new(),
            admin_password: String::new(),
            tenant_id: String::new(),
            subscription_id: String::new(),
            accounts_file: String::new(),
            cs_enabled: false,
            cs_preferred_locations: Vec::new(),
            cs_nb_instances: default_cs_nb_instances(),
        }
    }
}

// Default value functions
fn default_debug_response_headers() -> bool {
    true
}

fn default_wait_for_launcher_timeout() -> u64 {
    60
}

fn default_ag_max_instances() -> usize {
    5
}

fn default_ag_rotate_nb_requests() -> u64 {
    5000
}

fn default_ag_forwarded_for_range() -> String {
    "35.180.0.0/16".to_string()
}

fn default_ag_instance_title_prefix() -> String {
    crypto::random_sentence(1)
}

fn default_ag_deployment_description() -> String {
    crypto::random_sentence(3)
}

fn default_ag_deployment_stage_name() -> String {
    crypto::random_prefix(10)
}

fn default_cs_nb_instances() -> usize {
    5
}
