//! Runs one mesh service with an echo handler

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Map, Value};
use spiffe_mesh::{
    DevIdentityAgent, FallbackPolicy, IdentityAgent, MeshContext, RequestHandler, ServiceConfig,
    ServiceRuntime, SpiffeId, WorkloadApiClient, WorkloadApiConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service name reported by /health
    #[arg(long, default_value = "mesh-service")]
    service_name: String,

    /// Listen port
    #[arg(short, long, env = "SERVICE_PORT")]
    port: Option<u16>,

    /// Trust domain
    #[arg(long, env = "TRUST_DOMAIN")]
    trust_domain: Option<String>,

    /// Identity agent socket
    #[arg(long, env = "SPIFFE_ENDPOINT_SOCKET")]
    socket: Option<String>,

    /// Comma-separated SPIFFE IDs allowed to call this service
    #[arg(long, env = "ALLOWED_CALLERS", value_delimiter = ',')]
    allowed_callers: Vec<String>,

    /// Refuse connections until credentials are loaded
    #[arg(long)]
    fail_closed: bool,

    /// Serve plain HTTP
    #[arg(long)]
    no_tls: bool,

    /// Mint credentials in-process instead of asking the SPIRE agent
    #[arg(long)]
    dev_agent: bool,

    /// SPIFFE ID minted by --dev-agent
    #[arg(long)]
    dev_spiffe_id: Option<String>,
}

/// Echoes the request body back along with the caller's identity.
struct Echo;

#[async_trait]
impl RequestHandler for Echo {
    async fn handle(
        &self,
        path: &str,
        mut data: Map<String, Value>,
        peer_id: Option<&SpiffeId>,
    ) -> Result<Map<String, Value>> {
        data.insert("path".into(), Value::String(path.to_string()));
        data.insert(
            "caller".into(),
            peer_id.map_or(Value::Null, |id| Value::String(id.to_string())),
        );
        Ok(data)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;
    let agent = build_agent(&args, &config)?;

    let ctx = MeshContext::new(config, agent).context("Invalid service configuration")?;
    let runtime = Arc::new(ServiceRuntime::new(ctx, Arc::new(Echo)));

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    runtime
        .run(shutdown)
        .await
        .context("Service terminated with an error")?;
    Ok(())
}

fn build_config(args: &Args) -> Result<ServiceConfig> {
    // Environment first; flags (which clap also reads from env) win.
    let mut config = ServiceConfig::from_env(args.service_name.clone())?;

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(trust_domain) = &args.trust_domain {
        config.trust_domain = trust_domain.clone();
    }
    if let Some(socket) = &args.socket {
        config.socket_path = PathBuf::from(socket.strip_prefix("unix://").unwrap_or(socket));
    }
    if !args.allowed_callers.is_empty() {
        config.allowed_callers = args
            .allowed_callers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if args.fail_closed {
        config.fallback = FallbackPolicy::FailClosed;
    }
    if args.no_tls {
        config.tls_enabled = false;
    }

    config.validate()?;
    Ok(config)
}

fn build_agent(args: &Args, config: &ServiceConfig) -> Result<Arc<dyn IdentityAgent>> {
    if args.dev_agent {
        let raw = args
            .dev_spiffe_id
            .clone()
            .unwrap_or_else(|| format!("spiffe://{}/{}", config.trust_domain, config.service_name));
        let spiffe_id = SpiffeId::parse(&raw).with_context(|| format!("Invalid --dev-spiffe-id {raw}"))?;
        warn!(spiffe_id = %spiffe_id, "Using in-process development identity agent");
        return Ok(Arc::new(DevIdentityAgent::standalone(spiffe_id)?));
    }

    info!(socket = %config.socket_path.display(), "Using SPIFFE Workload API");
    Ok(Arc::new(WorkloadApiClient::new(WorkloadApiConfig {
        socket_path: config.socket_path.clone(),
        ..Default::default()
    })))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
