//! CI-workflow launcher: a private repository whose workflow runs execute
//! one HTTP request each, end-to-end encrypted with a per-launcher key.
//!
//! Dispatching registers a one-shot worker under a random run identifier;
//! a background poller matches finished runs back to their workers through
//! the step name carrying the identifier, decrypts the job logs, and parks
//! the response on the worker channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use url::Url;

use super::{api, assets};
use crate::config::Config;
use crate::crypto;
use crate::error::LauncherError;
use crate::providers::Launcher;
use crate::request::{self, RequestData, ResponseData};

const SECRET_NAME: &str = "AES256_KEY_HEX";
const REQUEST_JOB_NAME: &str = "Request";

const FINISHED_RUN_STATUSES: &[&str] = &["completed", "cancelled", "failure", "skipped", "success"];
const RUNNING_JOB_STATUSES: &[&str] = &["in_progress", "queued"];

const RESP_ERROR_PREFIX: &str = "RESP_ERR";
const RESP_STATUS_PREFIX: &str = "RESP_STATUS_ENCRYPTED_HEX";
const RESP_HEADERS_PREFIX: &str = "RESP_HEADERS_ENCRYPTED_HEX";
const RESP_BODY_PREFIX: &str = "RESP_BODY_ENCRYPTED_HEX";

type WorkerResult = Result<ResponseData, LauncherError>;

/// One-shot delivery channel parking a dispatching caller until its
/// response arrives. Removing the map entry and delivering are one atomic
/// step, so each worker receives at most one value.
struct Worker {
    tx: oneshot::Sender<WorkerResult>,
}

pub struct RepositoryLauncher {
    name: String,
    credentials: api::ApiCredentials,
    aes_key_hex: String,
    pending: DashMap<String, Worker>,
    requests_sent: AtomicU64,
    stopped: Arc<AtomicBool>,
}

impl RepositoryLauncher {
    /// Bootstraps the repository (name, secret, executor files) and starts
    /// the log-polling loop. If file or secret provisioning fails after the
    /// repository was created, the repository is deleted again.
    pub async fn create(credentials: api::ApiCredentials) -> Result<Arc<Self>, LauncherError> {
        let name = crypto::random_sentence(3).replace(' ', "-");

        info!(launcher = %name, "Creating launcher.");

        let launcher = Arc::new(Self {
            name,
            credentials,
            aes_key_hex: crypto::aes256_generate_key(),
            pending: DashMap::new(),
            requests_sent: AtomicU64::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
        });

        launcher.prepare_sprayer_repository().await?;

        launcher.spawn_workflow_loop();

        Ok(launcher)
    }

    async fn prepare_sprayer_repository(&self) -> Result<(), LauncherError> {
        api::create_repository(&self.credentials, &self.name).await?;

        if let Err(e) = self.install_repository_content().await {
            if let Err(delete_err) = api::delete_repository(&self.credentials, &self.name).await {
                error!(error = %delete_err, repository_name = %self.name, "Cannot delete the previously created repository.");
            }

            return Err(e);
        }

        Ok(())
    }

    async fn install_repository_content(&self) -> Result<(), LauncherError> {
        api::create_or_update_repository_secret(
            &self.credentials,
            &self.name,
            SECRET_NAME,
            &self.aes_key_hex,
        )
        .await?;

        api::add_repository_file(
            &self.credentials,
            &self.name,
            "sprayer.py",
            &BASE64_STANDARD.encode(assets::SPRAYER_PY),
            "add sprayer.py",
        )
        .await?;

        api::add_repository_file(
            &self.credentials,
            &self.name,
            "requirements.txt",
            &BASE64_STANDARD.encode(assets::REQUIREMENTS_TXT),
            "add requirements.txt",
        )
        .await?;

        api::add_repository_file(
            &self.credentials,
            &self.name,
            ".github/workflows/sprayer.yml",
            &BASE64_STANDARD.encode(assets::SPRAYER_YML),
            "add sprayer.yml",
        )
        .await?;

        Ok(())
    }

    fn spawn_workflow_loop(self: &Arc<Self>) {
        let launcher = Arc::clone(self);

        tokio::spawn(async move {
            launcher.poll_workflow_runs().await;
        });
    }

    /// Background loop matching finished workflow runs to pending workers.
    /// The sleep widens when nothing is pending to stay well under the API
    /// rate limit.
    async fn poll_workflow_runs(self: Arc<Self>) {
        while !self.stopped.load(Ordering::SeqCst) {
            let wait = std::cmp::max(5, 10 / (self.pending.len() as u64 + 1));

            tokio::time::sleep(Duration::from_secs(wait)).await;

            let runs = match api::workflow_runs(&self.credentials, &self.name).await {
                Ok(runs) => runs,
                Err(e) => {
                    warn!(error = %e, "Can not retrieve workflow runs.");
                    continue;
                }
            };

            for run in runs {
                if !FINISHED_RUN_STATUSES.contains(&run.status.as_str()) {
                    continue;
                }

                let jobs = match api::workflow_jobs(&self.credentials, &self.name, run.id).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        warn!(error = %e, run_id = run.id, "Can not retrieve workflow jobs.");
                        continue;
                    }
                };

                // The step named after a pending run identifier tells us
                // which dispatch this run belongs to.
                let run_identifier = jobs.iter().find_map(|job| {
                    job.steps
                        .iter()
                        .find(|step| self.pending.contains_key(&step.name))
                        .map(|step| step.name.clone())
                });

                let Some(run_identifier) = run_identifier else {
                    continue;
                };

                for job in &jobs {
                    if job.name != REQUEST_JOB_NAME
                        || RUNNING_JOB_STATUSES.contains(&job.status.as_str())
                    {
                        continue;
                    }

                    let launcher = Arc::clone(&self);
                    let identifier = run_identifier.clone();
                    let job_id = job.id;
                    let run_id = run.id;

                    tokio::spawn(async move {
                        launcher.deliver_job_result(identifier, job_id, run_id).await;
                    });

                    break;
                }
            }
        }
    }

    /// Extracts the response from the job logs, delivers it to the worker
    /// and deletes the workflow run.
    async fn deliver_job_result(&self, run_identifier: String, job_id: i64, run_id: i64) {
        let outcome = match api::workflow_job_logs(&self.credentials, &self.name, job_id).await {
            Ok(logs) => extract_response_from_logs(&logs, &self.aes_key_hex),
            Err(e) => Err(e),
        };

        if let Some((_, worker)) = self.pending.remove(&run_identifier) {
            if worker.tx.send(outcome).is_err() {
                warn!(run_id, "The worker channel is closed (the client may have terminated the connection).");
            }
        }

        if let Err(e) = api::delete_workflow_run(&self.credentials, &self.name, run_id).await {
            warn!(error = %e, run_id, "Cannot delete the workflow run.");
        }
    }
}

#[async_trait]
impl Launcher for RepositoryLauncher {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn total_requests(&self) -> u64 {
        self.requests_sent.load(Ordering::SeqCst)
    }

    fn summarize_state(&self) -> String {
        format!(
            "Launcher {} : nbTotalRequestsSent={}, nbPendingRequests={}",
            self.name,
            self.total_requests(),
            self.pending.len()
        )
    }

    fn is_available(&self) -> bool {
        true
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn preload_hosts(&self, _hosts: &[Url]) {
        info!(launcher = %self.name, "This launcher cannot preload hosts.");
    }

    async fn send(
        &self,
        request: &RequestData,
        _config: &Config,
    ) -> Result<(ResponseData, String), LauncherError> {
        let headers_joined = request::join_header_lines(&request.headers);
        let body = String::from_utf8_lossy(&request.body).into_owned();

        let mut inputs = serde_json::Map::new();
        inputs.insert(
            "methodEnc".to_string(),
            Value::String(crypto::aes256_encrypt(request.method.as_bytes(), &self.aes_key_hex)?),
        );
        inputs.insert(
            "urlEnc".to_string(),
            Value::String(crypto::aes256_encrypt(request.url.as_str().as_bytes(), &self.aes_key_hex)?),
        );
        inputs.insert(
            "headersEnc".to_string(),
            Value::String(crypto::aes256_encrypt(headers_joined.as_bytes(), &self.aes_key_hex)?),
        );
        inputs.insert(
            "bodyEnc".to_string(),
            Value::String(crypto::aes256_encrypt(body.as_bytes(), &self.aes_key_hex)?),
        );

        let run_identifier = api::dispatch_workflow(&self.credentials, &self.name, inputs).await?;

        let (tx, rx) = oneshot::channel();

        self.pending.insert(run_identifier.clone(), Worker { tx });

        self.requests_sent.fetch_add(1, Ordering::SeqCst);

        let tag = format!("runIdentifier={run_identifier}");

        match rx.await {
            Ok(outcome) => outcome.map(|response| (response, tag)),
            Err(_) => Err(LauncherError::WorkerGone),
        }
    }

    async fn clear(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return true;
        }

        info!(launcher = %self.name, "Clearing launcher.");

        if let Err(e) = api::delete_repository(&self.credentials, &self.name).await {
            error!(error = %e, repository_name = %self.name, "Error while deleting GitHub repository.");
            return false;
        }

        self.stopped.store(true, Ordering::SeqCst);

        true
    }
}

/// Parses the `RESP_*` lines of a job log into a response envelope. Log
/// lines carry a timestamp, the prefix, and the payload; header and body
/// payloads may be chunked over several lines and concatenate in order.
fn extract_response_from_logs(
    logs: &[String],
    key_hex: &str,
) -> Result<ResponseData, LauncherError> {
    let mut status_enc: Option<String> = None;
    let mut headers_enc: Option<String> = None;
    let mut body_enc: Option<String> = None;

    for line in logs {
        let parts: Vec<&str> = line.split(' ').collect();

        if parts.len() < 3 {
            continue;
        }

        match parts[1] {
            RESP_ERROR_PREFIX => {
                let decoded = BASE64_STANDARD
                    .decode(parts[2])
                    .map_err(|e| LauncherError::Framing(e.to_string()))?;

                return Err(LauncherError::Remote(
                    String::from_utf8_lossy(&decoded).into_owned(),
                ));
            }
            RESP_STATUS_PREFIX => status_enc = Some(parts[2].to_string()),
            RESP_HEADERS_PREFIX => {
                headers_enc.get_or_insert_with(String::new).push_str(parts[2]);
            }
            RESP_BODY_PREFIX => {
                body_enc.get_or_insert_with(String::new).push_str(parts[2]);
            }
            _ => {}
        }
    }

    let Some(status_enc) = status_enc else {
        return Err(LauncherError::Framing("no response found in the job logs".into()));
    };

    let status_raw = crypto::aes256_decrypt(&status_enc, key_hex)?;
    let status = String::from_utf8_lossy(&status_raw)
        .parse::<u16>()
        .map_err(|e| LauncherError::Framing(e.to_string()))?;

    let mut headers = std::collections::HashMap::new();

    if let Some(headers_enc) = headers_enc {
        let decrypted = crypto::aes256_decrypt(&headers_enc, key_hex)?;
        let decrypted = String::from_utf8_lossy(&decrypted).into_owned();

        let lines: Vec<&str> = decrypted.split('\n').collect();

        for pair in lines.chunks(2) {
            if let [key, value] = pair {
                headers.insert(key.to_string(), value.to_string());
            }
        }
    }

    let body = match body_enc {
        Some(body_enc) => crypto::aes256_decrypt(&body_enc, key_hex)?,
        None => Vec::new(),
    };

    Ok(ResponseData { status, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_line(prefix: &str, payload: &str) -> String {
        format!("2026-01-01T00:00:00.000Z {prefix} {payload}")
    }

    #[test]
    fn response_extraction_round_trip() {
        let key = crypto::aes256_generate_key();

        let logs = vec![
            "2026-01-01T00:00:00.000Z Set up job".to_string(),
            log_line(RESP_STATUS_PREFIX, &crypto::aes256_encrypt(b"200", &key).expect("encrypt")),
            log_line(
                RESP_HEADERS_PREFIX,
                &crypto::aes256_encrypt(b"Content-Type\ntext/html", &key).expect("encrypt"),
            ),
            log_line(RESP_BODY_PREFIX, &crypto::aes256_encrypt(b"hi", &key).expect("encrypt")),
        ];

        let response = extract_response_from_logs(&logs, &key).expect("extraction failed");

        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("Content-Type").map(String::as_str), Some("text/html"));
        assert_eq!(response.body, b"hi");
    }

    #[test]
    fn chunked_body_lines_concatenate_in_order() {
        let key = crypto::aes256_generate_key();

        let body_hex = crypto::aes256_encrypt(b"a longer body split over lines", &key).expect("encrypt");
        let (first, second) = body_hex.split_at(body_hex.len() / 2);

        let logs = vec![
            log_line(RESP_STATUS_PREFIX, &crypto::aes256_encrypt(b"201", &key).expect("encrypt")),
            log_line(RESP_BODY_PREFIX, first),
            log_line(RESP_BODY_PREFIX, second),
        ];

        let response = extract_response_from_logs(&logs, &key).expect("extraction failed");

        assert_eq!(response.status, 201);
        assert_eq!(response.body, b"a longer body split over lines");
    }

    #[test]
    fn remote_error_line_surfaces_its_message() {
        let key = crypto::aes256_generate_key();

        let logs = vec![log_line(
            RESP_ERROR_PREFIX,
            &BASE64_STANDARD.encode("connection refused"),
        )];

        match extract_response_from_logs(&logs, &key) {
            Err(LauncherError::Remote(message)) => assert_eq!(message, "connection refused"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn missing_status_is_a_framing_error() {
        let key = crypto::aes256_generate_key();

        let logs = vec![log_line(RESP_BODY_PREFIX, &crypto::aes256_encrypt(b"hi", &key).expect("encrypt"))];

        assert!(matches!(
            extract_response_from_logs(&logs, &key),
            Err(LauncherError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn worker_delivery_is_exactly_once_and_removes_the_entry() {
        let pending: DashMap<String, Worker> = DashMap::new();

        let (tx, rx) = oneshot::channel::<WorkerResult>();
        pending.insert("abcdefghij".to_string(), Worker { tx });

        let removed = pending.remove("abcdefghij");
        assert!(removed.is_some());

        if let Some((_, worker)) = removed {
            worker
                .tx
                .send(Ok(ResponseData { status: 200, ..Default::default() }))
                .ok();
        }

        // The entry is gone and the parked caller observed the one value.
        assert!(pending.get("abcdefghij").is_none());
        let delivered = rx.await.expect("channel dropped");
        assert_eq!(delivered.expect("worker error").status, 200);
    }

    #[test]
    fn dropped_receiver_means_discarded_delivery() {
        let (tx, rx) = oneshot::channel::<WorkerResult>();

        drop(rx);

        assert!(tx.send(Ok(ResponseData::default())).is_err());
    }
}
