//! Serverless-shell launcher: each request is executed from inside a
//! websocket-attached cloud shell whose Python prints a framed,
//! base64-encoded response back on the same socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::Account;
use crate::config::Config;
use crate::error::LauncherError;
use crate::providers::Launcher;
use crate::request::{self, JsonRequestData, RequestData, ResponseData};

/// Sockets older than this are considered stale and replaced before use.
const MAX_SOCKET_LIFETIME_SECS: i64 = 10 * 60;

const CONSOLE_URL: &str =
    "https://management.azure.com/providers/Microsoft.Portal/consoles/default?api-version=2023-02-01-preview";

const CONCURRENT_SESSIONS_MARKER: &str = "Exceeded 20 concurrent sessions";

const USER_IMPERSONATION_SCOPE: &str = "https://management.core.windows.net/user_impersonation";

const RESP_START_PREFIX: &str = "RESP_START";
const RESP_ERROR_PREFIX: &str = "RESP_ERR";
const RESP_END_PREFIX: &str = "RESP_END";
const RESP_STATUS_PREFIX: &str = "RESP_STATUS_ENC";
const RESP_HEADERS_PREFIX: &str = "RESP_HEADERS_ENC";
const RESP_BODY_PREFIX: &str = "RESP_BODY_ENC";

/// Request executor pushed into the shell, base64-encoded into the framed
/// command and decoded remotely by `base64 --decode`.
const EXECUTOR_SCRIPT: &str = r#"import base64
import sys

import requests


def b64(value):
    return base64.b64encode(value).decode()


try:
    method = base64.b64decode(sys.argv[1]).decode()
    url = base64.b64decode(sys.argv[2]).decode()
    raw_headers = base64.b64decode(sys.argv[3]).decode()
    body = base64.b64decode(sys.argv[4])

    headers = {}
    lines = raw_headers.split("\n") if raw_headers else []
    for i in range(0, len(lines) - 1, 2):
        headers[lines[i]] = lines[i + 1]

    resp = requests.request(
        method,
        url,
        headers=headers,
        data=body,
        verify=False,
        allow_redirects=False,
    )

    print("RESP_START")
    print("RESP_STATUS_ENC " + b64(str(resp.status_code).encode()))

    header_lines = []
    for key, value in resp.headers.items():
        header_lines.append(key)
        header_lines.append(value)
    print("RESP_HEADERS_ENC " + b64("\n".join(header_lines).encode()))

    encoded_body = b64(resp.content)
    for i in range(0, len(encoded_body), 4000):
        print("RESP_BODY_ENC " + encoded_body[i:i + 4000])

    print("RESP_END")
except Exception:
    print("RESP_ERR")
"#;

type ShellSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct CloudShellLauncher {
    name: String,
    account: Arc<Account>,
    admin_account: Option<Arc<Account>>,
    preferred_location: String,
    socket: Mutex<Option<ShellSocket>>,
    socket_created_at: AtomicI64,
    socket_closed: AtomicBool,
    available: AtomicBool,
    requests_sent: AtomicU64,
    stopped: AtomicBool,
}

impl CloudShellLauncher {
    /// Creates the launcher, updates the account's cloud-shell preferences
    /// and dials the first socket. On failure the half-built launcher is
    /// returned alongside the error so the caller can clear it.
    pub async fn create(
        account: Arc<Account>,
        admin_account: Option<Arc<Account>>,
        subscription_id: &str,
        preferred_location: String,
    ) -> std::result::Result<Arc<Self>, (Arc<Self>, LauncherError)> {
        info!(launcher = %account.username, "Creating launcher.");

        let launcher = Arc::new(Self {
            name: account.username.clone(),
            account,
            admin_account,
            preferred_location,
            socket: Mutex::new(None),
            socket_created_at: AtomicI64::new(0),
            socket_closed: AtomicBool::new(true),
            available: AtomicBool::new(true),
            requests_sent: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });

        if let Err(e) = launcher
            .account
            .update_cloudshell_preferences(&launcher.preferred_location, subscription_id)
            .await
        {
            launcher.available.store(false, Ordering::SeqCst);
            return Err((Arc::clone(&launcher), e));
        }

        {
            let mut socket = launcher.socket.lock().await;

            if let Err(e) = launcher.load_socket(&mut socket).await {
                return Err((Arc::clone(&launcher), e));
            }
        }

        Ok(launcher)
    }

    fn socket_is_stale(&self) -> bool {
        chrono::Utc::now().timestamp() - self.socket_created_at.load(Ordering::SeqCst)
            > MAX_SOCKET_LIFETIME_SECS
    }

    /// Dials a fresh websocket, restarting all sessions and retrying once
    /// when the concurrent-session limit is hit.
    async fn load_socket(
        &self,
        slot: &mut Option<ShellSocket>,
    ) -> std::result::Result<(), LauncherError> {
        match self.dial_socket().await {
            Ok(socket) => {
                *slot = Some(socket);
                self.socket_closed.store(false, Ordering::SeqCst);
                self.socket_created_at
                    .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                if !e.to_string().contains(CONCURRENT_SESSIONS_MARKER) {
                    return Err(e);
                }

                self.restart_cloud_shells().await?;

                let socket = self.dial_socket().await?;

                *slot = Some(socket);
                self.socket_closed.store(false, Ordering::SeqCst);
                self.socket_created_at
                    .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);

                Ok(())
            }
        }
    }

    /// Console provisioning choreography: PUT the console resource, fetch a
    /// short-lived auth token, open a terminal, then dial the websocket
    /// with the token cookie.
    async fn dial_socket(&self) -> std::result::Result<ShellSocket, LauncherError> {
        let headers = self.request_headers().await?;

        let console_url = Url::parse(CONSOLE_URL).map_err(|e| LauncherError::CloudApi(e.to_string()))?;

        let create_response = request::send_json_request(&JsonRequestData {
            url: console_url,
            method: "PUT".to_string(),
            headers: headers.clone(),
            body: Some(json!({ "properties": { "osType": "linux" } })),
            follow_redirects: false,
        })
        .await?;

        if create_response.status != 200 && create_response.status != 201 {
            let message = create_response
                .body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", create_response.body));

            return Err(LauncherError::CloudApi(message));
        }

        let console_uri = create_response
            .body
            .get("properties")
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .ok_or_else(|| LauncherError::CloudApi("unable to read the console uri".into()))?
            .to_string();

        let token_response = request::send_json_request(&JsonRequestData {
            url: Url::parse(&format!("{console_uri}/authorize"))
                .map_err(|e| LauncherError::CloudApi(e.to_string()))?,
            method: "POST".to_string(),
            headers: headers.clone(),
            body: Some(json!({})),
            follow_redirects: false,
        })
        .await?;

        let auth_token = token_response
            .body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| LauncherError::CloudApi("unable to read the console auth token".into()))?
            .to_string();

        let terminal_response = request::send_json_request(&JsonRequestData {
            url: Url::parse(&format!(
                "{console_uri}/terminals?cols=103&rows=13&version=2019-01-01&shell=bash"
            ))
            .map_err(|e| LauncherError::CloudApi(e.to_string()))?,
            method: "POST".to_string(),
            headers: headers.clone(),
            body: Some(json!({})),
            follow_redirects: false,
        })
        .await?;

        if terminal_response.status != 200 {
            let message = terminal_response
                .body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unable to open a terminal")
                .to_string();

            return Err(LauncherError::CloudApi(message));
        }

        let socket_uri = terminal_response
            .body
            .get("socketUri")
            .and_then(Value::as_str)
            .ok_or_else(|| LauncherError::CloudApi("unable to read the terminal socket uri".into()))?;

        let socket_url =
            Url::parse(socket_uri).map_err(|e| LauncherError::CloudApi(e.to_string()))?;
        let console_parsed =
            Url::parse(&console_uri).map_err(|e| LauncherError::CloudApi(e.to_string()))?;

        let host = console_parsed
            .host_str()
            .ok_or_else(|| LauncherError::CloudApi("console uri has no host".into()))?;
        let console_path = console_parsed.path().trim_matches('/');
        let terminal_id = socket_url.path().trim_matches('/');

        let shell_url = format!("wss://{host}/$hc/{console_path}/terminals/{terminal_id}");

        let mut ws_request = shell_url
            .into_client_request()
            .map_err(|e| LauncherError::WebSocket(e.to_string()))?;

        ws_request.headers_mut().insert(
            "Cookie",
            HeaderValue::from_str(&format!("auth-token={auth_token}"))
                .map_err(|e| LauncherError::WebSocket(e.to_string()))?,
        );

        let connector = Connector::Rustls(request::insecure_rustls_config());

        let (socket, _) = connect_async_tls_with_config(ws_request, None, false, Some(connector))
            .await
            .map_err(|e| LauncherError::WebSocket(e.to_string()))?;

        Ok(socket)
    }

    /// Restarts every cloud-shell session of the account, renewing its
    /// egress address.
    async fn restart_cloud_shells(&self) -> std::result::Result<(), LauncherError> {
        let headers = self.request_headers().await?;

        let response = request::send_json_request(&JsonRequestData {
            url: Url::parse(CONSOLE_URL).map_err(|e| LauncherError::CloudApi(e.to_string()))?,
            method: "DELETE".to_string(),
            headers,
            body: Some(json!({})),
            follow_redirects: false,
        })
        .await?;

        if response.status != 200 {
            return Err(LauncherError::CloudApi(
                "cannot restart Cloud Shell sessions".into(),
            ));
        }

        Ok(())
    }

    async fn request_headers(
        &self,
    ) -> std::result::Result<HashMap<String, String>, LauncherError> {
        let mut headers = self.account.bearer_headers(&[USER_IMPERSONATION_SCOPE]).await?;
        headers.insert("Referer".to_string(), "https://ux.console.azure.com".to_string());
        headers.remove("Accept");
        headers.remove("Content-Type");

        Ok(headers)
    }

    /// Closes the current socket by sending `exit` and dropping the stream.
    async fn close_current_socket(
        &self,
        slot: &mut Option<ShellSocket>,
    ) -> std::result::Result<(), LauncherError> {
        if self.socket_closed.load(Ordering::SeqCst) || slot.is_none() {
            return Ok(());
        }

        self.socket_closed.store(true, Ordering::SeqCst);

        debug!(launcher = %self.name, "Closing web socket connection.");

        if let Some(mut socket) = slot.take() {
            if let Err(e) = socket.send(Message::Text("exit".to_string())).await {
                self.socket_closed.store(false, Ordering::SeqCst);
                *slot = Some(socket);
                return Err(LauncherError::WebSocket(e.to_string()));
            }

            if let Err(e) = socket.close(None).await {
                return Err(LauncherError::WebSocket(e.to_string()));
            }
        }

        Ok(())
    }

    /// Accumulates websocket frames until a complete framed response (or an
    /// error marker) is present, then parses it.
    async fn wait_for_shell_response(
        &self,
        socket: &mut ShellSocket,
    ) -> std::result::Result<ResponseData, LauncherError> {
        let mut buffer = String::new();

        while !self.socket_closed.load(Ordering::SeqCst) {
            let message = match socket.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.socket_closed.store(true, Ordering::SeqCst);
                    error!(launcher = %self.name, error = %e, "An error occurred while reading websocket message.");
                    break;
                }
                None => {
                    self.socket_closed.store(true, Ordering::SeqCst);
                    break;
                }
            };

            buffer.push_str(&message);

            if buffer.contains(RESP_START_PREFIX)
                && (buffer.contains(RESP_END_PREFIX) || buffer.contains(RESP_ERROR_PREFIX))
            {
                return parse_shell_response(&buffer);
            }
        }

        Err(LauncherError::SocketClosed)
    }

    /// Post-send renewal: close the socket, restart all sessions, dial a
    /// fresh socket, then flip the launcher available again.
    fn spawn_socket_renewal(self: &Arc<Self>) {
        let launcher = Arc::clone(self);

        tokio::spawn(async move {
            let mut slot = launcher.socket.lock().await;

            if let Err(e) = launcher.close_current_socket(&mut slot).await {
                warn!(launcher = %launcher.name, error = %e, "Cannot close web socket connection.");
            }

            if let Err(e) = launcher.restart_cloud_shells().await {
                warn!(launcher = %launcher.name, error = %e, "Cannot restart Cloud Shells.");
            }

            if let Err(e) = launcher.load_socket(&mut slot).await {
                warn!(launcher = %launcher.name, error = %e, "Cannot load a new web socket connection.");
            }

            launcher.available.store(true, Ordering::SeqCst);
        });
    }
}

/// Builds the framed shell command executing one request remotely.
pub fn prepare_shell_command(request: &RequestData) -> String {
    let headers_joined = request::join_header_lines(&request.headers);

    format!(
        "pip3 install requests && python3 -c \"$(echo '{}' | base64 --decode)\" {} {} {} {}",
        BASE64_STANDARD.encode(EXECUTOR_SCRIPT),
        BASE64_STANDARD.encode(&request.method),
        BASE64_STANDARD.encode(request.url.as_str()),
        BASE64_STANDARD.encode(&headers_joined),
        BASE64_STANDARD.encode(&request.body),
    )
}

/// Parses an accumulated framed response: CRLF-separated lines carrying
/// base64 status and header fields plus one or more body lines.
fn parse_shell_response(buffer: &str) -> std::result::Result<ResponseData, LauncherError> {
    if !buffer.contains(RESP_END_PREFIX) {
        return Err(LauncherError::RemoteExecution);
    }

    let lines: Vec<&str> = buffer.split("\r\n").collect();

    let status_line = lines
        .iter()
        .find(|line| line.starts_with(&format!("{RESP_STATUS_PREFIX} ")))
        .ok_or_else(|| LauncherError::Framing("missing status line".into()))?;

    let status_raw = BASE64_STANDARD
        .decode(&status_line[RESP_STATUS_PREFIX.len() + 1..])
        .map_err(|e| LauncherError::Framing(e.to_string()))?;

    let status = String::from_utf8_lossy(&status_raw)
        .trim()
        .parse::<u16>()
        .map_err(|e| LauncherError::Framing(e.to_string()))?;

    let headers_line = lines
        .iter()
        .find(|line| line.starts_with(&format!("{RESP_HEADERS_PREFIX} ")))
        .ok_or_else(|| LauncherError::Framing("missing headers line".into()))?;

    let headers_raw = BASE64_STANDARD
        .decode(&headers_line[RESP_HEADERS_PREFIX.len() + 1..])
        .map_err(|e| LauncherError::Framing(e.to_string()))?;

    let headers_decoded = String::from_utf8_lossy(&headers_raw).into_owned();

    let mut headers = HashMap::new();

    if !headers_decoded.is_empty() {
        let header_lines: Vec<&str> = headers_decoded.split('\n').collect();

        for pair in header_lines.chunks(2) {
            if let [key, value] = pair {
                headers.insert(key.to_string(), value.to_string());
            }
        }
    }

    let body_b64: String = lines
        .iter()
        .filter(|line| line.starts_with(&format!("{RESP_BODY_PREFIX} ")))
        .map(|line| &line[RESP_BODY_PREFIX.len() + 1..])
        .collect();

    let body = BASE64_STANDARD
        .decode(body_b64)
        .map_err(|e| LauncherError::Framing(e.to_string()))?;

    Ok(ResponseData { status, headers, body })
}

#[async_trait]
impl Launcher for CloudShellLauncher {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn total_requests(&self) -> u64 {
        self.requests_sent.load(Ordering::SeqCst)
    }

    fn summarize_state(&self) -> String {
        format!(
            "Launcher {} : nbTotalRequestsSent={}, socketCreatedTime={}, socketClosed={}, isAvailable={}",
            self.name,
            self.total_requests(),
            self.socket_created_at.load(Ordering::SeqCst),
            self.socket_closed.load(Ordering::SeqCst),
            self.is_available()
        )
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
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
        // Unavailable for the whole send + renewal window; concurrent
        // callers are steered to other launchers by the dispatcher.
        self.available.store(false, Ordering::SeqCst);

        let tag = format!("location={}", self.preferred_location);

        let command = prepare_shell_command(request);

        let mut slot = self.socket.lock().await;

        if self.socket_is_stale() || slot.is_none() || self.socket_closed.load(Ordering::SeqCst) {
            if self.socket_is_stale() {
                if let Err(e) = self.close_current_socket(&mut slot).await {
                    self.available.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }

            if let Err(e) = self.load_socket(&mut slot).await {
                self.available.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }

        let socket = match slot.as_mut() {
            Some(socket) => socket,
            None => {
                self.available.store(true, Ordering::SeqCst);
                return Err(LauncherError::SocketClosed);
            }
        };

        if let Err(e) = socket.send(Message::Text(format!("{command}\n"))).await {
            drop(slot);
            self.spawn_socket_renewal();
            return Err(LauncherError::WebSocket(e.to_string()));
        }

        self.requests_sent.fetch_add(1, Ordering::SeqCst);

        let outcome = self.wait_for_shell_response(socket).await;

        drop(slot);

        self.spawn_socket_renewal();

        outcome.map(|response| (response, tag))
    }

    async fn clear(&self) -> bool {
        info!(launcher = %self.name, "Clearing launcher.");

        let mut fully_cleared = true;

        {
            let mut slot = self.socket.lock().await;

            if let Err(e) = self.close_current_socket(&mut slot).await {
                fully_cleared = false;
                error!(launcher = %self.name, error = %e, "Cannot close the socket.");
            }
        }

        if self.account.needs_clear() {
            if let Some(admin) = &self.admin_account {
                debug!(account = %self.account.username, "Deleting Azure account and associated role assignments.");

                if let Err(e) = admin.delete_created_role_assignments(&self.account).await {
                    fully_cleared = false;
                    error!(launcher = %self.name, error = %e, "Cannot delete account's role assignments.");
                }

                if let Err(e) = admin.delete_account(&self.account).await {
                    fully_cleared = false;
                    error!(launcher = %self.name, error = %e, "Cannot delete account.");
                }
            }
        }

        self.stopped.store(fully_cleared, Ordering::SeqCst);

        fully_cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample_request() -> RequestData {
        RequestData {
            url: Url::parse("https://example.com/api?x=1").expect("parse failed"),
            method: "POST".to_string(),
            headers: HashMap::from([("Accept".to_string(), "*/*".to_string())]),
            body: Bytes::from_static(b"payload"),
            follow_redirects: false,
        }
    }

    #[test]
    fn command_frames_every_field_in_base64() {
        let command = prepare_shell_command(&sample_request());

        assert!(command.starts_with("pip3 install requests && python3 -c"));
        assert!(command.contains(&BASE64_STANDARD.encode("POST")));
        assert!(command.contains(&BASE64_STANDARD.encode("https://example.com/api?x=1")));
        assert!(command.contains(&BASE64_STANDARD.encode("Accept\n*/*")));
        assert!(command.contains(&BASE64_STANDARD.encode("payload")));
    }

    #[test]
    fn framed_response_parses_status_headers_and_body() {
        let buffer = format!(
            "noise\r\nRESP_START\r\nRESP_STATUS_ENC {}\r\nRESP_HEADERS_ENC {}\r\nRESP_BODY_ENC {}\r\nRESP_END\r\n",
            BASE64_STANDARD.encode("200"),
            BASE64_STANDARD.encode("Content-Type\ntext/html"),
            BASE64_STANDARD.encode("hello"),
        );

        let response = parse_shell_response(&buffer).expect("parse failed");

        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("Content-Type").map(String::as_str), Some("text/html"));
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn body_lines_concatenate_before_decoding() {
        let full_body = BASE64_STANDARD.encode("a body split across frames");
        let (first, second) = full_body.split_at(full_body.len() / 2);

        let buffer = format!(
            "RESP_START\r\nRESP_STATUS_ENC {}\r\nRESP_HEADERS_ENC {}\r\nRESP_BODY_ENC {first}\r\nRESP_BODY_ENC {second}\r\nRESP_END\r\n",
            BASE64_STANDARD.encode("204"),
            BASE64_STANDARD.encode(""),
        );

        let response = parse_shell_response(&buffer).expect("parse failed");

        assert_eq!(response.status, 204);
        assert_eq!(response.body, b"a body split across frames");
    }

    #[test]
    fn error_marker_fails_opaquely() {
        let buffer = "RESP_START\r\nRESP_ERR\r\n";

        assert!(matches!(
            parse_shell_response(buffer),
            Err(LauncherError::RemoteExecution)
        ));
    }

    fn offline_launcher() -> CloudShellLauncher {
        let account = Arc::new(Account {
            username: "ips.cs.test".to_string(),
            email: "ips.cs.test@example.onmicrosoft.com".to_string(),
            password: "secret".to_string(),
            tenant_id: "tenant".to_string(),
            needs_clear: false,
            id: std::sync::RwLock::new(String::new()),
            user_principal_name: std::sync::RwLock::new(String::new()),
            role_assignments: std::sync::Mutex::new(Vec::new()),
            token_cache: Mutex::new(std::collections::HashMap::new()),
        });

        CloudShellLauncher {
            name: account.username.clone(),
            account,
            admin_account: None,
            preferred_location: "westeurope".to_string(),
            socket: Mutex::new(None),
            socket_created_at: AtomicI64::new(0),
            socket_closed: AtomicBool::new(true),
            available: AtomicBool::new(true),
            requests_sent: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    #[test]
    fn sockets_older_than_ten_minutes_are_stale() {
        let launcher = offline_launcher();

        let now = chrono::Utc::now().timestamp();

        launcher.socket_created_at.store(now, Ordering::SeqCst);
        assert!(!launcher.socket_is_stale());

        launcher
            .socket_created_at
            .store(now - MAX_SOCKET_LIFETIME_SECS - 1, Ordering::SeqCst);
        assert!(launcher.socket_is_stale());
    }
}
