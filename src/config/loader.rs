use std::path::Path;

use ini::{Ini, Properties};
use ipnetwork::IpNetwork;

use super::schema::{AwsSettings, AzureSettings, Config, GitHubSettings, ProxySettings};
use crate::error::{ConfigError, Result};

/// Loads the configuration from an INI file. Unknown keys are ignored;
/// missing keys fall back to their documented defaults.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let ini = Ini::load_from_file(path.as_ref())
        .map_err(|_| ConfigError::Parse("can not retrieve or parse the configuration file".into()))?;

    let proxy = ini.section(Some("proxy"));
    let aws = ini.section(Some("aws"));
    let github = ini.section(Some("github"));
    let azure = ini.section(Some("azure"));

    let defaults = Config::default();

    let config = Config {
        proxy: ProxySettings {
            preload_hosts_file: get_str(proxy, "preload_hosts_file", ""),
            whitelist_hosts_file: get_str(proxy, "whitelist_hosts_file", ""),
            blacklist_hosts_file: get_str(proxy, "blacklist_hosts_file", ""),
            ca_cert_file: get_str(proxy, "ca_cert_file", ""),
            ca_cert_key_file: get_str(proxy, "ca_cert_key_file", ""),
            user_agents_file: get_str(proxy, "user_agents_file", ""),
            debug_response_headers: get_bool(proxy, "debug_response_headers", true),
            wait_for_launcher_available_timeout: get_u64(
                proxy,
                "wait_for_launcher_available_timeout",
                defaults.proxy.wait_for_launcher_available_timeout,
            ),
        },
        aws: AwsSettings {
            regions: get_list(aws, "regions"),
            profile: get_str(aws, "profile", ""),
            access_key: get_str(aws, "access_key", ""),
            secret_key: get_str(aws, "secret_key", ""),
            session_token: get_str(aws, "session_token", ""),
            ag_enabled: get_bool(aws, "ag_enabled", false),
            ag_max_instances: get_u64(aws, "ag_max_instances", defaults.aws.ag_max_instances as u64)
                as usize,
            ag_rotate_nb_requests: get_u64(
                aws,
                "ag_rotate_nb_requests",
                defaults.aws.ag_rotate_nb_requests,
            ),
            ag_forwarded_for_range: get_str(
                aws,
                "ag_forwarded_for_range",
                &defaults.aws.ag_forwarded_for_range,
            ),
            ag_instance_title_prefix: get_str(
                aws,
                "ag_instance_title_prefix",
                &defaults.aws.ag_instance_title_prefix,
            ),
            ag_instance_deployment_description: get_str(
                aws,
                "ag_instance_deployment_description",
                &defaults.aws.ag_instance_deployment_description,
            ),
            ag_instance_deployment_stage_description: get_str(
                aws,
                "ag_instance_deployment_stage_description",
                &defaults.aws.ag_instance_deployment_stage_description,
            ),
            ag_instance_deployment_stage_name: get_str(
                aws,
                "ag_instance_deployment_stage_name",
                &defaults.aws.ag_instance_deployment_stage_name,
            ),
        },
        github: GitHubSettings {
            username: get_str(github, "username", ""),
            token: get_str(github, "token", ""),
            ga_enabled: get_bool(github, "ga_enabled", false),
        },
        azure: AzureSettings {
            admin_email: get_str(azure, "admin_email", ""),
            admin_password: get_str(azure, "admin_password", ""),
            tenant_id: get_str(azure, "tenant_id", ""),
            subscription_id: get_str(azure, "subscription_id", ""),
            accounts_file: get_str(azure, "accounts_file", ""),
            cs_enabled: get_bool(azure, "cs_enabled", false),
            cs_preferred_locations: get_list(azure, "cs_preferred_locations"),
            cs_nb_instances: get_u64(azure, "cs_nb_instances", defaults.azure.cs_nb_instances as u64)
                as usize,
        },
    };

    validate(&config)?;

    Ok(config)
}

/// Cross-field validation for enabled providers.
pub fn validate(config: &Config) -> Result<()> {
    if config
        .aws
        .ag_forwarded_for_range
        .parse::<IpNetwork>()
        .is_err()
    {
        return Err(ConfigError::Validation(format!(
            "aws.ag_forwarded_for_range is not a valid CIDR: {}",
            config.aws.ag_forwarded_for_range
        ))
        .into());
    }

    if config.aws.ag_enabled && config.aws.regions.is_empty() {
        return Err(ConfigError::Validation(
            "aws.regions must be set when the API Gateway launcher is enabled".into(),
        )
        .into());
    }

    if config.github.ga_enabled
        && (config.github.username.is_empty() || config.github.token.is_empty())
    {
        return Err(ConfigError::Validation(
            "github.username and github.token must be set when the workflow launcher is enabled"
                .into(),
        )
        .into());
    }

    if config.azure.cs_enabled
        && config.azure.accounts_file.is_empty()
        && (config.azure.admin_email.is_empty() || config.azure.admin_password.is_empty())
    {
        return Err(ConfigError::Validation(
            "azure.admin_email and azure.admin_password (or azure.accounts_file) must be set when the cloud shell launcher is enabled".into(),
        )
        .into());
    }

    Ok(())
}

fn get_str(section: Option<&Properties>, key: &str, default: &str) -> String {
    section
        .and_then(|s| s.get(key))
        .map(str::to_string)
        .unwrap_or_else(|| default.to_string())
}

fn get_bool(section: Option<&Properties>, key: &str, default: bool) -> bool {
    section
        .and_then(|s| s.get(key))
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

fn get_u64(section: Option<&Properties>, key: &str, default: u64) -> u64 {
    section
        .and_then(|s| s.get(key))
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn get_list(section: Option<&Properties>, key: &str) -> Vec<String> {
    section
        .and_then(|s| s.get(key))
        .map(|v| {
            v.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file creation failed");
        file.write_all(content.as_bytes()).expect("write failed");
        file
    }

    #[test]
    fn defaults_apply_for_missing_keys() {
        let file = config_file("[proxy]\n");

        let config = load_from_path(file.path()).expect("load failed");

        assert!(config.proxy.debug_response_headers);
        assert_eq!(config.proxy.wait_for_launcher_available_timeout, 60);
        assert_eq!(config.aws.ag_max_instances, 5);
        assert_eq!(config.aws.ag_rotate_nb_requests, 5000);
        assert_eq!(config.aws.ag_forwarded_for_range, "35.180.0.0/16");
        assert_eq!(config.azure.cs_nb_instances, 5);
        assert!(!config.aws.ag_enabled);
        assert!(!config.github.ga_enabled);
        assert!(!config.azure.cs_enabled);
    }

    #[test]
    fn sections_and_lists_are_parsed() {
        let file = config_file(
            "[proxy]\nwait_for_launcher_available_timeout = 10\n\
             [aws]\nag_enabled = true\nregions = eu-west-1, us-east-1\naccess_key = AK\nsecret_key = SK\n\
             [github]\nusername = octocat\ntoken = tk\nga_enabled = true\n",
        );

        let config = load_from_path(file.path()).expect("load failed");

        assert_eq!(config.proxy.wait_for_launcher_available_timeout, 10);
        assert!(config.aws.ag_enabled);
        assert_eq!(config.aws.regions, vec!["eu-west-1", "us-east-1"]);
        assert_eq!(config.github.username, "octocat");
    }

    #[test]
    fn enabled_aws_requires_regions() {
        let file = config_file("[aws]\nag_enabled = true\n");

        assert!(load_from_path(file.path()).is_err());
    }

    #[test]
    fn enabled_github_requires_credentials() {
        let file = config_file("[github]\nga_enabled = true\n");

        assert!(load_from_path(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_a_parse_error() {
        assert!(load_from_path("/definitely/not/here.ini").is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let file = config_file("[proxy]\nsome_future_knob = 42\n");

        assert!(load_from_path(file.path()).is_ok());
    }
}
