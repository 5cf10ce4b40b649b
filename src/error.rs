use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpinnerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Launcher error: {0}")]
    Launcher(#[from] LauncherError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Certificate generation failed: {0}")]
    CertGeneration(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("Cipher operation failed")]
    Cipher,
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("JSON decode failed: {0}")]
    JsonDecode(#[from] serde_json::Error),

    #[error("Expected a JSON object in the response body")]
    UnexpectedJson,
}

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Cloud API error: {0}")]
    CloudApi(String),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("the maximum number of resources per gateway instance has been reached")]
    GatewayCapacity,

    #[error("the maximum number of gateway instances has been reached and no existing gateway can target this URL")]
    NoGatewayAvailable,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("the websocket connection has been closed")]
    SocketClosed,

    #[error("an error occurred while executing the request")]
    RemoteExecution,

    #[error("{0}")]
    Remote(String),

    #[error("Malformed remote response: {0}")]
    Framing(String),

    #[error("the worker channel was dropped before a response arrived")]
    WorkerGone,
}

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    #[error("Failed to load certificate: {0}")]
    CertLoad(String),

    #[error("Invalid certificate: {0}")]
    InvalidCert(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SpinnerError>;
