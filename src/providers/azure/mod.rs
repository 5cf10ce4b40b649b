//! Azure provider: cloud-shell launchers backed by either pre-created
//! accounts or ephemeral accounts provisioned through the admin identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::{LauncherError, Result};
use crate::hosts;
use crate::providers::{clear_launchers, Launcher, Provider};
use crate::request::{self, JsonRequestData, RequestData};

mod cloudshell;

pub use cloudshell::CloudShellLauncher;

/// Public client id used for the resource-owner-password token grant
/// (the Azure CLI application).
const PUBLIC_CLIENT_ID: &str = "04b07795-8ddb-461a-bbee-02f9e1bf7b46";

/// Contributor role definition, scoped to the subscription on assignment.
const CONTRIBUTOR_ROLE_ID: &str = "b24988ac-6180-42a0-ab88-20f7382dd24c";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; WOW64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/113.0.5666.197 Safari/537.36";

const MANAGEMENT_SCOPE: &str = "https://management.core.windows.net/.default";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RoleAssignment {
    subscription_id: String,
    role_assignment_id: String,
}

/// One Azure user identity. Tokens are acquired lazily per scope set via
/// the password grant and cached until shortly before expiry.
pub struct Account {
    pub username: String,
    email: String,
    password: String,
    tenant_id: String,
    needs_clear: bool,
    id: RwLock<String>,
    user_principal_name: RwLock<String>,
    role_assignments: StdMutex<Vec<RoleAssignment>>,
    token_cache: Mutex<HashMap<String, CachedToken>>,
}

impl Account {
    /// Connects an account, verifying the credentials by acquiring a
    /// management token.
    pub async fn connect(
        email: &str,
        password: &str,
        tenant_id: &str,
        needs_clear: bool,
        id: &str,
        user_principal_name: &str,
    ) -> std::result::Result<Arc<Self>, LauncherError> {
        let username = email.split('@').next().unwrap_or(email).to_string();

        let account = Arc::new(Self {
            username,
            email: email.to_string(),
            password: password.to_string(),
            tenant_id: tenant_id.to_string(),
            needs_clear,
            id: RwLock::new(id.to_string()),
            user_principal_name: RwLock::new(user_principal_name.to_string()),
            role_assignments: StdMutex::new(Vec::new()),
            token_cache: Mutex::new(HashMap::new()),
        });

        account.access_token(&[MANAGEMENT_SCOPE]).await?;

        Ok(account)
    }

    pub fn needs_clear(&self) -> bool {
        self.needs_clear
    }

    /// Returns a bearer token for the given scopes, from cache when still
    /// valid.
    pub async fn access_token(
        &self,
        scopes: &[&str],
    ) -> std::result::Result<String, LauncherError> {
        let scope_key = scopes.join(" ");

        let mut cache = self.token_cache.lock().await;

        if let Some(cached) = cache.get(&scope_key) {
            if cached.expires_at > Utc::now() + chrono::Duration::seconds(60) {
                return Ok(cached.token.clone());
            }
        }

        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("client_id", PUBLIC_CLIENT_ID);
        form.append_pair("grant_type", "password");
        form.append_pair("username", &self.email);
        form.append_pair("password", &self.password);
        form.append_pair("scope", &scope_key);

        let token_url = Url::parse(&format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant_id
        ))
        .map_err(|e| LauncherError::CloudApi(e.to_string()))?;

        let response = request::send_request(&RequestData {
            url: token_url,
            method: "POST".to_string(),
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )]),
            body: Bytes::from(form.finish()),
            follow_redirects: false,
        })
        .await?;

        let body: Value = serde_json::from_slice(&response.body)
            .map_err(|e| LauncherError::CloudApi(e.to_string()))?;

        if response.status != 200 {
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("token request failed");

            return Err(LauncherError::CloudApi(format!(
                "cannot authenticate {}: {}",
                self.email, description
            )));
        }

        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| LauncherError::CloudApi("no access token in the response".into()))?
            .to_string();

        let expires_in = body.get("expires_in").and_then(Value::as_i64).unwrap_or(3600);

        cache.insert(
            scope_key,
            CachedToken {
                token: token.clone(),
                expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
            },
        );

        Ok(token)
    }

    pub async fn bearer_headers(
        &self,
        scopes: &[&str],
    ) -> std::result::Result<HashMap<String, String>, LauncherError> {
        let token = self.access_token(scopes).await?;

        Ok(HashMap::from([
            ("Authorization".to_string(), format!("Bearer {token}")),
            ("Accept".to_string(), "*/*".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), BROWSER_USER_AGENT.to_string()),
        ]))
    }

    async fn load_user_information(&self) -> std::result::Result<(), LauncherError> {
        let mut headers = self.bearer_headers(&[GRAPH_SCOPE]).await?;
        headers.remove("Accept");

        let response = request::send_json_request(&JsonRequestData {
            url: Url::parse("https://graph.microsoft.com/v1.0/me")
                .map_err(|e| LauncherError::CloudApi(e.to_string()))?,
            method: "GET".to_string(),
            headers,
            body: None,
            follow_redirects: false,
        })
        .await?;

        if response.status != 200 {
            return Err(LauncherError::CloudApi(
                "cannot retrieve account's informations".into(),
            ));
        }

        let id = response
            .body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| LauncherError::CloudApi("can not retrieve account's ID".into()))?;
        let upn = response
            .body
            .get("userPrincipalName")
            .and_then(Value::as_str)
            .ok_or_else(|| LauncherError::CloudApi("can not retrieve account's UPN".into()))?;

        if let Ok(mut stored) = self.id.write() {
            *stored = id.to_string();
        }

        if let Ok(mut stored) = self.user_principal_name.write() {
            *stored = upn.to_string();
        }

        Ok(())
    }

    pub async fn account_id(&self) -> std::result::Result<String, LauncherError> {
        if let Ok(id) = self.id.read() {
            if !id.is_empty() {
                return Ok(id.clone());
            }
        }

        self.load_user_information().await?;

        Ok(self.id.read().map(|id| id.clone()).unwrap_or_default())
    }

    pub async fn user_principal_name(&self) -> std::result::Result<String, LauncherError> {
        if let Ok(upn) = self.user_principal_name.read() {
            if !upn.is_empty() {
                return Ok(upn.clone());
            }
        }

        self.load_user_information().await?;

        Ok(self
            .user_principal_name
            .read()
            .map(|upn| upn.clone())
            .unwrap_or_default())
    }

    /// Creates a new enabled user under the admin's domain through the
    /// Graph batch endpoint and connects it.
    pub async fn create_account(
        self: &Arc<Self>,
        username: &str,
        password: &str,
        needs_clear: bool,
    ) -> std::result::Result<Arc<Account>, LauncherError> {
        let headers = self.bearer_headers(&[GRAPH_SCOPE]).await?;

        let admin_email = self.user_principal_name().await?;

        let domain = admin_email
            .split('@')
            .nth(1)
            .ok_or_else(|| LauncherError::CloudApi("cannot determine Azure domain".into()))?;

        let email = format!("{username}@{domain}");

        let response = request::send_json_request(&JsonRequestData {
            url: Url::parse("https://graph.microsoft.com/v1.0/$batch")
                .map_err(|e| LauncherError::CloudApi(e.to_string()))?,
            method: "POST".to_string(),
            headers,
            body: Some(json!({
                "requests": [{
                    "id": uuid::Uuid::new_v4().to_string(),
                    "method": "POST",
                    "url": "/users",
                    "body": {
                        "accountEnabled": true,
                        "displayName": username,
                        "passwordProfile": {
                            "forceChangePasswordNextSignIn": false,
                            "password": password
                        },
                        "mailNickname": username,
                        "userPrincipalName": email
                    },
                    "headers": {
                        "Content-Type": "application/json"
                    }
                }]
            })),
            follow_redirects: false,
        })
        .await?;

        let inner = response
            .body
            .get("responses")
            .and_then(Value::as_array)
            .and_then(|responses| responses.first())
            .ok_or_else(|| LauncherError::CloudApi("can not parse batch responses".into()))?;

        let status = inner
            .get("status")
            .and_then(Value::as_i64)
            .ok_or_else(|| LauncherError::CloudApi("can not parse batch status code".into()))?;

        if status != 201 {
            let message = inner
                .pointer("/body/error/message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");

            return Err(LauncherError::CloudApi(format!(
                "cannot create {username} user account ({message})"
            )));
        }

        let account_id = inner
            .pointer("/body/id")
            .and_then(Value::as_str)
            .ok_or_else(|| LauncherError::CloudApi("can not parse created account id".into()))?;
        let upn = inner
            .pointer("/body/userPrincipalName")
            .and_then(Value::as_str)
            .ok_or_else(|| LauncherError::CloudApi("can not parse created account UPN".into()))?;

        Account::connect(&email, password, &self.tenant_id, needs_clear, account_id, upn).await
    }

    /// Grants the user Contributor on the subscription via the management
    /// batch endpoint and records the created assignment for cleanup.
    pub async fn add_contributor_to_subscription(
        self: &Arc<Self>,
        user: &Arc<Account>,
        subscription_id: &str,
    ) -> std::result::Result<(), LauncherError> {
        let headers = self.bearer_headers(&[MANAGEMENT_SCOPE]).await?;

        let role_assignment_id = uuid::Uuid::new_v4().to_string();

        let user_id = user.account_id().await?;

        let response = request::send_json_request(&JsonRequestData {
            url: Url::parse("https://management.azure.com/batch?api-version=2020-06-01")
                .map_err(|e| LauncherError::CloudApi(e.to_string()))?,
            method: "POST".to_string(),
            headers,
            body: Some(json!({
                "requests": [{
                    "content": {
                        "Id": role_assignment_id,
                        "Properties": {
                            "Id": role_assignment_id,
                            "PrincipalId": user_id,
                            "PrincipalType": "User",
                            "RoleDefinitionId": format!("/providers/Microsoft.Authorization/roleDefinitions/{CONTRIBUTOR_ROLE_ID}"),
                            "Scope": format!("/subscriptions/{subscription_id}"),
                            "Condition": null,
                            "ConditionVersion": null
                        }
                    },
                    "httpMethod": "PUT",
                    "name": uuid::Uuid::new_v4().to_string(),
                    "requestHeaderDetails": {
                        "commandName": "Microsoft_Azure_AD.AddRoleAssignments.batch"
                    },
                    "url": format!("https://management.azure.com/subscriptions/{subscription_id}/providers/Microsoft.Authorization/roleAssignments/{role_assignment_id}?api-version=2020-04-01-preview")
                }]
            })),
            follow_redirects: false,
        })
        .await?;

        if response.status != 200 {
            return Err(LauncherError::CloudApi(format!(
                "cannot add {} to the subscription #{subscription_id} as Contributor",
                user.username
            )));
        }

        if let Ok(mut assignments) = user.role_assignments.lock() {
            assignments.push(RoleAssignment {
                subscription_id: subscription_id.to_string(),
                role_assignment_id,
            });
        }

        Ok(())
    }

    /// Deletes every role assignment previously created for the user.
    pub async fn delete_created_role_assignments(
        self: &Arc<Self>,
        user: &Arc<Account>,
    ) -> std::result::Result<(), LauncherError> {
        let headers = self.bearer_headers(&[MANAGEMENT_SCOPE]).await?;

        let assignments = user
            .role_assignments
            .lock()
            .map(|assignments| assignments.clone())
            .unwrap_or_default();

        let requests: Vec<Value> = assignments
            .iter()
            .map(|assignment| {
                json!({
                    "httpMethod": "DELETE",
                    "name": uuid::Uuid::new_v4().to_string(),
                    "requestHeaderDetails": {
                        "commandName": "Microsoft_Azure_AD.DeleteRoleAssignment.batch"
                    },
                    "url": format!(
                        "https://management.azure.com/subscriptions/{}/providers/Microsoft.Authorization/roleAssignments/{}?api-version=2020-04-01-preview",
                        assignment.subscription_id, assignment.role_assignment_id
                    )
                })
            })
            .collect();

        let response = request::send_json_request(&JsonRequestData {
            url: Url::parse("https://management.azure.com/batch?api-version=2020-06-01")
                .map_err(|e| LauncherError::CloudApi(e.to_string()))?,
            method: "POST".to_string(),
            headers,
            body: Some(json!({ "requests": requests })),
            follow_redirects: false,
        })
        .await?;

        if response.status != 200 {
            return Err(LauncherError::CloudApi(format!(
                "cannot delete {} user account's created role assignments",
                user.username
            )));
        }

        Ok(())
    }

    /// Deletes the user through the Graph batch endpoint.
    pub async fn delete_account(
        self: &Arc<Self>,
        user: &Arc<Account>,
    ) -> std::result::Result<(), LauncherError> {
        let headers = self.bearer_headers(&[GRAPH_SCOPE]).await?;

        let user_id = user.account_id().await?;

        let response = request::send_json_request(&JsonRequestData {
            url: Url::parse("https://graph.microsoft.com/v1.0/$batch")
                .map_err(|e| LauncherError::CloudApi(e.to_string()))?,
            method: "POST".to_string(),
            headers,
            body: Some(json!({
                "requests": [{
                    "id": user_id,
                    "method": "DELETE",
                    "url": format!("/users/{user_id}")
                }]
            })),
            follow_redirects: false,
        })
        .await?;

        if response.status != 200 {
            return Err(LauncherError::CloudApi(format!(
                "cannot delete {} user account",
                user.username
            )));
        }

        Ok(())
    }

    /// Switches the account's cloud-shell preferences to an ephemeral bash
    /// session in the preferred location.
    pub async fn update_cloudshell_preferences(
        &self,
        preferred_location: &str,
        subscription_id: &str,
    ) -> std::result::Result<(), LauncherError> {
        let headers = self.bearer_headers(&[MANAGEMENT_SCOPE]).await?;

        let response = request::send_json_request(&JsonRequestData {
            url: Url::parse("https://management.azure.com/providers/Microsoft.Portal/userSettings/cloudconsole?api-version=2023-02-01-preview")
                .map_err(|e| LauncherError::CloudApi(e.to_string()))?,
            method: "PUT".to_string(),
            headers,
            body: Some(json!({
                "properties": {
                    "preferredOsType": "",
                    "preferredLocation": preferred_location,
                    "storageProfile": null,
                    "terminalSettings": {
                        "fontSize": "medium",
                        "fontStyle": "monospace"
                    },
                    "vnetSettings": null,
                    "userSubscription": subscription_id,
                    "sessionType": "Ephemeral",
                    "networkType": "Default",
                    "preferredShellType": "bash"
                }
            })),
            follow_redirects: false,
        })
        .await?;

        if response.status != 200 {
            return Err(LauncherError::CloudApi(format!(
                "cannot update {} user account's cloudshell preferences",
                self.username
            )));
        }

        Ok(())
    }
}

pub struct AzureProvider {
    launchers: Vec<Arc<CloudShellLauncher>>,
    stopped: AtomicBool,
}

impl AzureProvider {
    pub async fn initialize(config: &Config) -> Result<Self> {
        info!(provider = "Azure", "Configuring provider.");

        let mut admin_account = None;
        let mut precreated_accounts = Vec::new();

        if config.azure.accounts_file.is_empty() {
            admin_account = Some(
                Account::connect(
                    &config.azure.admin_email,
                    &config.azure.admin_password,
                    &config.azure.tenant_id,
                    false,
                    "",
                    "",
                )
                .await?,
            );
        } else {
            precreated_accounts = load_precreated_accounts(config).await?;
        }

        let mut launchers = Vec::new();

        if config.azure.cs_enabled {
            launchers = load_cloud_shell_launchers(
                config,
                admin_account.as_ref(),
                &precreated_accounts,
            )
            .await;
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
impl Provider for AzureProvider {
    fn name(&self) -> &'static str {
        "Azure"
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

/// Parses the accounts file (two lines per account: email then password)
/// and connects each one. Accounts that fail to connect are skipped.
async fn load_precreated_accounts(config: &Config) -> Result<Vec<Arc<Account>>> {
    let lines = hosts::read_file_lines(&config.azure.accounts_file)?;

    if lines.len() % 2 != 0 {
        return Err(LauncherError::CloudApi(
            "the Azure accounts file does not respect the expected format: 2 lines per account (email, password)".into(),
        )
        .into());
    }

    let mut accounts = Vec::new();

    for pair in lines.chunks(2) {
        let [email, password] = pair else { continue };

        match Account::connect(email, password, &config.azure.tenant_id, false, "", "").await {
            Ok(account) => accounts.push(account),
            Err(_) => {
                warn!(provider = "Azure", email = %email, "Cannot connect to this user.");
            }
        }
    }

    if accounts.is_empty() {
        return Err(LauncherError::CloudApi(
            "could not connect to any of the precreated accounts".into(),
        )
        .into());
    }

    Ok(accounts)
}

/// Builds the configured number of cloud-shell launchers, round-robining
/// over the preferred locations. Accounts come from the pre-created pool
/// when available, otherwise they are provisioned through the admin.
async fn load_cloud_shell_launchers(
    config: &Config,
    admin_account: Option<&Arc<Account>>,
    precreated_accounts: &[Arc<Account>],
) -> Vec<Arc<CloudShellLauncher>> {
    let mut locations = config.azure.cs_preferred_locations.clone();

    if locations.is_empty() {
        locations.push("westeurope".to_string());
    }

    let mut launchers = Vec::new();

    for i in 0..config.azure.cs_nb_instances {
        let account = if !precreated_accounts.is_empty() {
            match precreated_accounts.get(i) {
                Some(account) => Arc::clone(account),
                None => {
                    warn!("No more precreated account available for creating a new CloudShell launcher.");
                    continue;
                }
            }
        } else {
            let Some(admin) = admin_account else {
                continue;
            };

            let username = format!("ips.cs.{}", crate::crypto::random_prefix(10));
            let password = crate::crypto::random_password(15);

            let created = match admin.create_account(&username, &password, true).await {
                Ok(account) => account,
                Err(e) => {
                    error!(error = %e, "Cannot create an account for this CloudShell launcher.");
                    continue;
                }
            };

            if let Err(e) = admin
                .add_contributor_to_subscription(&created, &config.azure.subscription_id)
                .await
            {
                error!(error = %e, "Cannot create an account for this CloudShell launcher.");
                continue;
            }

            created
        };

        let location = locations[i % locations.len()].clone();

        match CloudShellLauncher::create(
            account,
            admin_account.cloned(),
            &config.azure.subscription_id,
            location,
        )
        .await
        {
            Ok(launcher) => launchers.push(launcher),
            Err((launcher, e)) => {
                error!(error = %e, "Cannot create cloud shell launcher.");

                // Leave time for the account to propagate before cleanup.
                tokio::time::sleep(Duration::from_secs(2)).await;

                launcher.clear().await;
            }
        }
    }

    launchers
}
