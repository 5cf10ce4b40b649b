use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use ipspinner::config;
use ipspinner::crypto;
use ipspinner::error::Result;
use ipspinner::providers::{self, Provider};
use ipspinner::proxy::{CertificateAuthority, EgressHandler, ProxyServer};

const LOG_FILE: &str = "ipspinner.log";
const EXPORTED_CA_CERT_FILE: &str = "ipspinner-ca-cert.pem";
const EXPORTED_CA_CERT_KEY_FILE: &str = "ipspinner-ca-cert-key.pem";

/// Seconds between two state summaries in verbose mode.
const SUMMARIZE_STATE_INTERVAL: u64 = 300;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "ipspinner")]
#[command(about = "An intercepting proxy that relays HTTP(S) requests through ephemeral cloud egress points", long_about = None)]
struct Args {
    /// Proxy host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Proxy port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Export the CA certificate and key next to the process
    #[arg(long = "export-ca-cert")]
    export_ca_cert: bool,

    /// Config INI file path
    #[arg(long, value_name = "FILE", default_value = "config.ini")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();

    let _log_guard = init_logging(args.verbose);

    info!("Starting IPSpinner");

    let config = match config::load_from_path(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "Can not parse the configuration file.");
            return Err(e);
        }
    };

    let providers = providers::load_providers(&config).await;

    if providers::all_launchers(&providers).is_empty() {
        error!("No launcher is available.");
        return Err(ipspinner::error::SpinnerError::Proxy(
            "no launcher is available".into(),
        ));
    }

    let (ca_cert_pem, ca_key_pem) = match prepare_ca_material(&config, args.export_ca_cert) {
        Ok(material) => material,
        Err(e) => {
            error!(error = %e, "Can not prepare the proxy CA certificate.");
            providers::clear_providers(&providers).await;
            return Err(e);
        }
    };

    let ca = match CertificateAuthority::from_pem(&ca_cert_pem, &ca_key_pem) {
        Ok(ca) => Arc::new(ca),
        Err(e) => {
            error!(error = %e, "Can not load the proxy CA certificate.");
            providers::clear_providers(&providers).await;
            return Err(e.into());
        }
    };

    let handler = Arc::new(EgressHandler::new(Arc::clone(&config), providers.clone()));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let summary_handle = if args.verbose > 0 {
        Some(spawn_summarize_state_task(
            providers.clone(),
            shutdown_tx.subscribe(),
        ))
    } else {
        None
    };

    let listen_address = format!("{}:{}", args.host, args.port);

    let server = ProxyServer::new(listen_address.clone(), handler, ca);

    let proxy_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        let providers = providers.clone();

        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown_rx).await {
                error!(listen_address = %listen_address, error = %e, "An error happened while launching the proxy.");

                providers::clear_providers(&providers).await;

                std::process::exit(1);
            }
        })
    };

    shutdown_signal().await;

    info!("Stopping proxy ...");

    let _ = shutdown_tx.send(());

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, proxy_handle).await.is_err() {
        error!("Shutdown timeout exceeded while stopping the proxy.");
    }

    if let Some(handle) = summary_handle {
        handle.abort();
    }

    providers::clear_providers(&providers).await;

    Ok(())
}

/// Two fmt layers: a stderr mirror gated by the verbosity flags and an
/// append-only file log capturing everything.
fn init_logging(verbosity: u8) -> tracing_appender::non_blocking::WorkerGuard {
    let console_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let file_appender = tracing_appender::rolling::never(".", LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::new(format!("ipspinner={console_level}"))),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new("ipspinner=trace")),
        )
        .init();

    guard
}

/// Loads the configured CA material or generates a fresh CA, optionally
/// exporting both PEM files.
fn prepare_ca_material(
    config: &config::Config,
    export_ca_cert: bool,
) -> Result<(String, String)> {
    let (cert_pem, key_pem) = if config.proxy.ca_cert_file.is_empty()
        || config.proxy.ca_cert_key_file.is_empty()
    {
        info!("Generating a new CA certificate.");

        crypto::generate_rsa_ca_certificate()?
    } else {
        info!(
            ca_cert_path = %config.proxy.ca_cert_file,
            ca_cert_key_path = %config.proxy.ca_cert_key_file,
            "Retrieving the provided CA certificate."
        );

        (
            std::fs::read_to_string(&config.proxy.ca_cert_file)?,
            std::fs::read_to_string(&config.proxy.ca_cert_key_file)?,
        )
    };

    if export_ca_cert {
        info!(
            exported_ca_cert_path = EXPORTED_CA_CERT_FILE,
            exported_ca_cert_key_path = EXPORTED_CA_CERT_KEY_FILE,
            "Exporting the CA certificate."
        );

        std::fs::write(EXPORTED_CA_CERT_FILE, &cert_pem)?;
        std::fs::write(EXPORTED_CA_CERT_KEY_FILE, &key_pem)?;
    }

    Ok((cert_pem, key_pem))
}

/// Periodically logs each provider's and launcher's state summary.
fn spawn_summarize_state_task(
    providers: Vec<Arc<dyn Provider>>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(Duration::from_secs(SUMMARIZE_STATE_INTERVAL)) => {
                    for provider in &providers {
                        debug!(provider = provider.name(), "{}", provider.summarize_state());

                        for launcher in provider.launchers() {
                            debug!(
                                provider = provider.name(),
                                launcher = %launcher.name(),
                                "  - {}",
                                launcher.summarize_state()
                            );
                        }
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
