//! GitHub REST surface: repositories, secrets, and workflow runs.

use std::collections::HashMap;

use base64::prelude::{Engine, BASE64_STANDARD};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::crypto;
use crate::error::LauncherError;
use crate::request::{self, JsonRequestData, JsonResponseData, RequestData};

const API_BASE: &str = "https://api.github.com";
const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";

const RUNS_PER_PAGE: i64 = 100;

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub username: String,
    token: String,
}

impl ApiCredentials {
    pub fn new(username: String, token: String) -> Self {
        Self { username, token }
    }

    fn headers(&self) -> HashMap<String, String> {
        HashMap::from([
            ("Accept".to_string(), ACCEPT.to_string()),
            ("X-GitHub-Api-Version".to_string(), API_VERSION.to_string()),
            ("Authorization".to_string(), format!("Bearer {}", self.token)),
        ])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJob {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub steps: Vec<WorkflowJobStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJobStep {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    total_count: i64,
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct JobsPage {
    total_count: i64,
    jobs: Vec<WorkflowJob>,
}

fn api_url(path: &str) -> Result<Url, LauncherError> {
    Url::parse(&format!("{API_BASE}{path}"))
        .map_err(|e| LauncherError::Framing(e.to_string()))
}

fn api_error(response: &JsonResponseData, default: &str) -> LauncherError {
    LauncherError::CloudApi(response.body_str_or("message", default).to_string())
}

/// Creates a private repository under the authenticated user.
pub async fn create_repository(
    credentials: &ApiCredentials,
    repository_name: &str,
) -> Result<(), LauncherError> {
    let response = request::send_json_request(&JsonRequestData {
        url: api_url("/user/repos")?,
        method: "POST".to_string(),
        headers: credentials.headers(),
        body: Some(json!({ "name": repository_name, "private": true })),
        follow_redirects: false,
    })
    .await?;

    if response.status != 201 {
        return Err(api_error(&response, "Can not create the repository."));
    }

    Ok(())
}

/// Adds a file to the repository; the content is already base64-encoded.
pub async fn add_repository_file(
    credentials: &ApiCredentials,
    repository_name: &str,
    path: &str,
    content_b64: &str,
    commit_message: &str,
) -> Result<(), LauncherError> {
    let path = path.trim_start_matches('/');

    let response = request::send_json_request(&JsonRequestData {
        url: api_url(&format!(
            "/repos/{}/{}/contents/{}",
            credentials.username, repository_name, path
        ))?,
        method: "PUT".to_string(),
        headers: credentials.headers(),
        body: Some(json!({ "message": commit_message, "content": content_b64 })),
        follow_redirects: false,
    })
    .await?;

    if response.status != 201 {
        return Err(api_error(&response, "Can not add the file to the repository."));
    }

    Ok(())
}

/// Creates or updates a repository secret: fetches the repository public
/// key, seals the value into a NaCl sealed box, and uploads it.
pub async fn create_or_update_repository_secret(
    credentials: &ApiCredentials,
    repository_name: &str,
    secret_name: &str,
    secret_value: &str,
) -> Result<(), LauncherError> {
    let public_key_response = request::send_json_request(&JsonRequestData {
        url: api_url(&format!(
            "/repos/{}/{}/actions/secrets/public-key",
            credentials.username, repository_name
        ))?,
        method: "GET".to_string(),
        headers: credentials.headers(),
        body: None,
        follow_redirects: false,
    })
    .await?;

    if public_key_response.status != 200 {
        return Err(api_error(
            &public_key_response,
            "Can not retrieve the repository public key.",
        ));
    }

    let key = public_key_response
        .body
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| LauncherError::CloudApi("Can not retrieve the repository public key.".into()))?;
    let key_id = public_key_response
        .body
        .get("key_id")
        .and_then(Value::as_str)
        .ok_or_else(|| LauncherError::CloudApi("Can not retrieve the repository public key.".into()))?;

    let sealed = seal_secret(key, secret_value)?;

    let response = request::send_json_request(&JsonRequestData {
        url: api_url(&format!(
            "/repos/{}/{}/actions/secrets/{}",
            credentials.username, repository_name, secret_name
        ))?,
        method: "PUT".to_string(),
        headers: credentials.headers(),
        body: Some(json!({ "encrypted_value": sealed, "key_id": key_id })),
        follow_redirects: false,
    })
    .await?;

    if response.status != 201 && response.status != 204 {
        return Err(LauncherError::CloudApi(format!(
            "can not update repository secrets, status code: {}",
            response.status
        )));
    }

    Ok(())
}

/// Seals a secret value against the repository public key (NaCl sealed box,
/// both sides base64).
fn seal_secret(public_key_b64: &str, value: &str) -> Result<String, LauncherError> {
    let key_bytes = BASE64_STANDARD
        .decode(public_key_b64)
        .map_err(|e| LauncherError::CloudApi(format!("invalid repository public key: {e}")))?;

    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| LauncherError::CloudApi("invalid repository public key length".into()))?;

    let public_key = crypto_box::PublicKey::from(key_bytes);

    let sealed = public_key
        .seal(&mut crypto_box::aead::OsRng, value.as_bytes())
        .map_err(|_| LauncherError::CloudApi("secret sealing failed".into()))?;

    Ok(BASE64_STANDARD.encode(sealed))
}

/// Dispatches a workflow run with the given inputs and returns the random
/// run identifier embedded in the dispatched step name.
pub async fn dispatch_workflow(
    credentials: &ApiCredentials,
    repository_name: &str,
    mut inputs: serde_json::Map<String, Value>,
) -> Result<String, LauncherError> {
    // The dispatch API returns no run id, so a random identifier is planted
    // in the inputs and surfaces later as a step name in the job listing.
    let run_identifier = crypto::random_prefix(10);

    inputs.insert("runIdentifier".to_string(), Value::String(run_identifier.clone()));

    let response = request::send_json_request(&JsonRequestData {
        url: api_url(&format!(
            "/repos/{}/{}/actions/workflows/sprayer.yml/dispatches",
            credentials.username, repository_name
        ))?,
        method: "POST".to_string(),
        headers: credentials.headers(),
        body: Some(json!({ "ref": "main", "inputs": inputs })),
        follow_redirects: false,
    })
    .await?;

    if response.status != 204 {
        return Err(api_error(&response, "Can not dispatch the workflow."));
    }

    Ok(run_identifier)
}

/// Lists every workflow run in the repository (paginated).
pub async fn workflow_runs(
    credentials: &ApiCredentials,
    repository_name: &str,
) -> Result<Vec<WorkflowRun>, LauncherError> {
    let mut all_runs = Vec::new();

    let mut page = 1i64;
    let mut max_page = 1i64;

    while page <= max_page {
        let response = request::send_request(&RequestData {
            url: api_url(&format!(
                "/repos/{}/{}/actions/runs?page={}&per_page={}",
                credentials.username, repository_name, page, RUNS_PER_PAGE
            ))?,
            method: "GET".to_string(),
            headers: credentials.headers(),
            body: Bytes::new(),
            follow_redirects: false,
        })
        .await?;

        if response.status != 200 {
            return Err(LauncherError::CloudApi("Can not list workflow runs.".into()));
        }

        let runs_page: RunsPage = serde_json::from_slice(&response.body)
            .map_err(|e| LauncherError::Framing(e.to_string()))?;

        all_runs.extend(runs_page.workflow_runs);

        max_page = runs_page.total_count / RUNS_PER_PAGE + 1;
        page += 1;
    }

    Ok(all_runs)
}

/// Lists every job of a workflow run (paginated).
pub async fn workflow_jobs(
    credentials: &ApiCredentials,
    repository_name: &str,
    run_id: i64,
) -> Result<Vec<WorkflowJob>, LauncherError> {
    let mut all_jobs = Vec::new();

    let mut page = 1i64;
    let mut max_page = 1i64;

    while page <= max_page {
        let response = request::send_request(&RequestData {
            url: api_url(&format!(
                "/repos/{}/{}/actions/runs/{}/jobs?page={}&per_page={}",
                credentials.username, repository_name, run_id, page, RUNS_PER_PAGE
            ))?,
            method: "GET".to_string(),
            headers: credentials.headers(),
            body: Bytes::new(),
            follow_redirects: false,
        })
        .await?;

        if response.status != 200 {
            return Err(LauncherError::CloudApi("Can not list workflow jobs.".into()));
        }

        let jobs_page: JobsPage = serde_json::from_slice(&response.body)
            .map_err(|e| LauncherError::Framing(e.to_string()))?;

        all_jobs.extend(jobs_page.jobs);

        max_page = jobs_page.total_count / RUNS_PER_PAGE + 1;
        page += 1;
    }

    Ok(all_jobs)
}

/// Fetches the logs of one workflow job, split into lines. The log endpoint
/// answers with a redirect to short-lived storage, so redirects are
/// followed here.
pub async fn workflow_job_logs(
    credentials: &ApiCredentials,
    repository_name: &str,
    job_id: i64,
) -> Result<Vec<String>, LauncherError> {
    let response = request::send_request(&RequestData {
        url: api_url(&format!(
            "/repos/{}/{}/actions/jobs/{}/logs",
            credentials.username, repository_name, job_id
        ))?,
        method: "GET".to_string(),
        headers: credentials.headers(),
        body: Bytes::new(),
        follow_redirects: true,
    })
    .await?;

    if response.status != 200 {
        return Err(LauncherError::CloudApi(
            String::from_utf8_lossy(&response.body).into_owned(),
        ));
    }

    Ok(String::from_utf8_lossy(&response.body)
        .split('\n')
        .map(str::to_string)
        .collect())
}

/// Deletes one workflow run.
pub async fn delete_workflow_run(
    credentials: &ApiCredentials,
    repository_name: &str,
    run_id: i64,
) -> Result<(), LauncherError> {
    let response = request::send_request(&RequestData {
        url: api_url(&format!(
            "/repos/{}/{}/actions/runs/{}",
            credentials.username, repository_name, run_id
        ))?,
        method: "DELETE".to_string(),
        headers: credentials.headers(),
        body: Bytes::new(),
        follow_redirects: false,
    })
    .await?;

    if response.status != 204 {
        return Err(LauncherError::CloudApi(
            String::from_utf8_lossy(&response.body).into_owned(),
        ));
    }

    Ok(())
}

/// Deletes the repository.
pub async fn delete_repository(
    credentials: &ApiCredentials,
    repository_name: &str,
) -> Result<(), LauncherError> {
    let response = request::send_request(&RequestData {
        url: api_url(&format!("/repos/{}/{}", credentials.username, repository_name))?,
        method: "DELETE".to_string(),
        headers: credentials.headers(),
        body: Bytes::new(),
        follow_redirects: false,
    })
    .await?;

    if response.status != 204 {
        return Err(LauncherError::CloudApi(format!(
            "can not delete the repository, status code: {}",
            response.status
        )));
    }

    Ok(())
}
