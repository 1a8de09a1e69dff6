//! ewsproxy — Basic-to-OAuth authenticating reverse proxy for EWS.
//!
//! Legacy mail clients authenticate to this proxy with HTTP Basic; the
//! proxy maintains an OAuth2 credential via the device-code flow and
//! forwards requests to Exchange Online with a bearer token instead.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use ewsproxy_oauth::{
    CredentialManager, GateCredentials, ProviderConfig, ProxyConfig, ProxyServer, oauth,
};

/// Basic-to-OAuth authenticating reverse proxy for Exchange Web Services.
#[derive(Parser, Debug)]
#[command(name = "ewsproxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Entra tenant id (or "common" for multi-tenant sign-in)
    #[arg(long, env = "EWS_PROXY_TENANT_ID", default_value = "common")]
    tenant_id: String,

    /// OAuth client id
    #[arg(long, env = "EWS_PROXY_CLIENT_ID", default_value = oauth::DEFAULT_CLIENT_ID)]
    client_id: String,

    /// OAuth client secret (confidential clients only)
    #[arg(long, env = "EWS_PROXY_CLIENT_SECRET")]
    client_secret: Option<String>,

    /// Address to listen on
    #[arg(long, env = "EWS_PROXY_LISTEN_ADDRESS", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Path of the persisted refresh-token record
    #[arg(long, env = "EWS_PROXY_TOKEN_FILE", default_value = ".token.json")]
    token_file: PathBuf,

    /// Upstream EWS base URL
    #[arg(
        long,
        env = "EWS_PROXY_TARGET_URL",
        default_value = "https://outlook.office365.com"
    )]
    target_url: String,

    /// Device-code endpoint template ({tenant} is substituted)
    #[arg(long, env = "EWS_PROXY_DEVICE_CODE_URL", default_value = oauth::DEFAULT_DEVICE_CODE_URL)]
    device_code_url: String,

    /// Token endpoint template ({tenant} is substituted)
    #[arg(long, env = "EWS_PROXY_TOKEN_URL", default_value = oauth::DEFAULT_TOKEN_URL)]
    token_url: String,

    /// OAuth scope to request
    #[arg(long, env = "EWS_PROXY_SCOPE", default_value = oauth::DEFAULT_SCOPE)]
    scope: String,

    /// Username clients must present (enables the Basic-Auth gate)
    #[arg(long, env = "EWS_PROXY_USERNAME")]
    username: Option<String>,

    /// Password clients must present (enables the Basic-Auth gate)
    #[arg(long, env = "EWS_PROXY_PASSWORD")]
    password: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Load the optional env-style config file before flag parsing so its
/// values are visible as env fallbacks. Already-set variables win.
fn load_env_file() {
    let path = std::env::var("EWS_PROXY_CONFIG").unwrap_or_else(|_| "config.env".to_string());
    if dotenvy::from_path(&path).is_ok() {
        eprintln!("loaded configuration from {path}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "ewsproxy=debug,ewsproxy_oauth=debug,tower_http=debug,info"
    } else {
        "ewsproxy=info,ewsproxy_oauth=info,warn"
    };
    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
                ),
        )
        .init();

    let provider = ProviderConfig {
        tenant_id: cli.tenant_id,
        client_id: cli.client_id,
        client_secret: cli.client_secret,
        device_code_url: cli.device_code_url,
        token_url: cli.token_url,
        scope: cli.scope,
    };

    let manager = Arc::new(CredentialManager::new(provider, &cli.token_file)?);
    manager
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("authentication failed: {e}"))?;

    let gate = match (cli.username, cli.password) {
        (Some(username), Some(password)) => Some(GateCredentials { username, password }),
        (None, None) => None,
        _ => anyhow::bail!("--username and --password must be set together"),
    };

    let config = ProxyConfig {
        bind_addr: cli.listen,
        upstream_url: cli.target_url.clone(),
        gate,
    };
    let server = ProxyServer::new(config, manager.clone())?;

    info!(listen = %cli.listen, upstream = %cli.target_url, "ewsproxy starting");
    info!("point the mail client's Exchange URL at http://{}/EWS/Exchange.asmx", cli.listen);

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
    };
    server.run(shutdown).await?;

    manager.shutdown();
    Ok(())
}
