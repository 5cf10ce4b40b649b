//! Client-facing intercepting proxy: plain forward proxying plus
//! CONNECT-MITM with certificates forged on demand.

use std::convert::Infallible;
use std::sync::Arc;

use http::{Method, Request, Response};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::error::{Result, SpinnerError};

mod handler;
mod tls;

pub use handler::EgressHandler;
pub use tls::CertificateAuthority;

pub struct ProxyServer {
    listen_address: String,
    handler: Arc<EgressHandler>,
    ca: Arc<CertificateAuthority>,
}

impl ProxyServer {
    pub fn new(
        listen_address: String,
        handler: Arc<EgressHandler>,
        ca: Arc<CertificateAuthority>,
    ) -> Self {
        Self {
            listen_address,
            handler,
            ca,
        }
    }

    /// Accept loop. Returns when the shutdown signal fires.
    pub async fn run(self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_address)
            .await
            .map_err(SpinnerError::Io)?;

        info!(listen_address = %self.listen_address, "Proxy is running.");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted.map_err(SpinnerError::Io)?;

                    let handler = Arc::clone(&self.handler);
                    let ca = Arc::clone(&self.ca);

                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, handler, ca).await {
                            debug!(peer = %peer_addr, error = %e, "Connection error.");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_client(
    stream: tokio::net::TcpStream,
    handler: Arc<EgressHandler>,
    ca: Arc<CertificateAuthority>,
) -> Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let ca = Arc::clone(&ca);

        async move { Ok::<_, Infallible>(route_request(req, handler, ca).await) }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|e| SpinnerError::Proxy(e.to_string()))?;

    Ok(())
}

/// CONNECT requests are upgraded and re-served over a forged-certificate
/// TLS session; everything else is dispatched directly.
async fn route_request(
    req: Request<Incoming>,
    handler: Arc<EgressHandler>,
    ca: Arc<CertificateAuthority>,
) -> Response<Full<Bytes>> {
    if req.method() != Method::CONNECT {
        return handler.handle(req, None).await;
    }

    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        let mut response = Response::new(Full::from("PROXY ERROR: CONNECT without authority."));
        *response.status_mut() = http::StatusCode::BAD_REQUEST;
        return response;
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = serve_intercepted(upgraded, authority.clone(), handler, ca).await {
                    debug!(authority = %authority, error = %e, "Intercepted connection error.");
                }
            }
            Err(e) => error!(error = %e, "CONNECT upgrade failed."),
        }
    });

    Response::new(Full::default())
}

/// Terminates the client's TLS with a certificate forged for the CONNECT
/// authority, then serves the decrypted HTTP through the dispatcher.
async fn serve_intercepted(
    upgraded: hyper::upgrade::Upgraded,
    authority: String,
    handler: Arc<EgressHandler>,
    ca: Arc<CertificateAuthority>,
) -> Result<()> {
    let host = authority
        .split(':')
        .next()
        .unwrap_or(authority.as_str())
        .to_string();

    let server_config = ca.server_config(&host)?;

    let acceptor = tokio_rustls::TlsAcceptor::from(server_config);

    let tls_stream = acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(SpinnerError::Io)?;

    let io = TokioIo::new(tls_stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let authority = authority.clone();

        async move { Ok::<_, Infallible>(handler.handle(req, Some(authority)).await) }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .await
        .map_err(|e| SpinnerError::Proxy(e.to_string()))?;

    Ok(())
}
