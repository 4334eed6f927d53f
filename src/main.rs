//! jobgate - admission control proxy for the Nomad job API

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jobgate::admission::{build_mutators, build_validators, JobHandler};
use jobgate::config::{Config, NomadConfig};
use jobgate::proxy::{proxy_router, ProxyState};

/// Admission control proxy for the Nomad job API
#[derive(Parser, Debug)]
#[command(name = "jobgate", version, about, long_about = None)]
struct Cli {
    /// Path to a jobgate config file
    #[arg(long, env = "JOBGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Initialize tracing; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!("Starting jobgate admission control proxy");

    let mutators = build_mutators(&config.mutators)?;
    let validators = build_validators(&config.validators)?;
    tracing::info!(
        mutators = mutators.len(),
        validators = validators.len(),
        "Admission pipeline assembled"
    );
    let handler = JobHandler::new(mutators, validators);

    let upstream = reqwest::Url::parse(&config.nomad.address)
        .map_err(|e| anyhow::anyhow!("Failed to parse upstream address: {}", e))?;
    let client = build_upstream_client(&config.nomad)?;

    let state = Arc::new(ProxyState {
        upstream,
        client,
        handler,
    });
    let app = proxy_router(state);

    let ip: IpAddr = config
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Failed to parse bind address: {}", e))?;
    let addr = SocketAddr::new(ip, config.port);
    tracing::info!(%addr, upstream = %config.nomad.address, "Proxy listening");

    if let Some(tls) = &config.tls {
        let tls_config = RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to configure TLS: {}", e))?;
        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
    } else {
        axum_server::bind(addr)
            .serve(app.into_make_service())
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
    }

    Ok(())
}

/// Build the shared upstream transport, loading client TLS material when the
/// orchestrator requires it.
fn build_upstream_client(config: &NomadConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Some(tls) = &config.tls {
        let ca = std::fs::read(&tls.ca_file)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", tls.ca_file, e))?;
        builder = builder.add_root_certificate(
            reqwest::Certificate::from_pem(&ca)
                .map_err(|e| anyhow::anyhow!("Failed to parse CA bundle: {}", e))?,
        );

        let mut identity = std::fs::read(&tls.cert_file)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", tls.cert_file, e))?;
        let key = std::fs::read(&tls.key_file)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", tls.key_file, e))?;
        identity.extend_from_slice(&key);
        builder = builder.identity(
            reqwest::Identity::from_pem(&identity)
                .map_err(|e| anyhow::anyhow!("Failed to load client certificate: {}", e))?,
        );

        if tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create upstream client: {}", e))
}
