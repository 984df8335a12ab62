//! `gridctl-gateway`: aggregating-gateway entry point.
//!
//! CLI shape follows `git-proxy-mcp`'s `clap::Parser` struct (config path +
//! verbosity flags); startup wires a `BootstrapConfig` into registered
//! upstream servers and agents, starts the health ticker and session
//! cleanup background tasks, then serves the downstream HTTP/SSE front-ends
//! with a graceful shutdown that broadcasts a close event to every open
//! session before the grace period elapses.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use gridctl_gateway::acl::ToolSelector;
use gridctl_gateway::config::{BootstrapConfig, TransportConfig};
use gridctl_gateway::error::GatewayError;
use gridctl_gateway::frontend;
use gridctl_gateway::gateway::Gateway;
use gridctl_gateway::health::Pingable;
use gridctl_gateway::upstream::http::HttpTransport;
use gridctl_gateway::upstream::openapi::OpenApiTransport;
use gridctl_gateway::upstream::subprocess::SubprocessTransport;
use gridctl_gateway::upstream::{ToolWhitelist, Transporter, UpstreamClient};

const HEALTH_TICK_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Aggregates many MCP servers behind one tool catalog.
#[derive(Parser, Debug)]
#[command(name = "gridctl-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the downstream HTTP/SSE front-ends to.
    #[arg(long, env = "GRIDCTL_LISTEN", default_value = "127.0.0.1:8787")]
    listen: String,

    /// Path to the bootstrap config declaring upstream servers and agents.
    #[arg(long, env = "GRIDCTL_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn log_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Builds a connected upstream transporter from one server declaration,
/// plus its `Pingable` health probe when the transport has a persistent
/// connection to probe. `ContainerStdio` needs a live Docker attach stream,
/// which this standalone binary has no way to obtain on its own, so that
/// variant is reported as unsupported rather than faked. `Openapi` is never
/// passed to this function — `register_servers` handles it on its own path
/// via `Gateway::register_openapi_server`, since it has no JSON-RPC
/// handshake to run.
async fn build_transport(
    transport: &TransportConfig,
) -> Result<(Arc<dyn Transporter>, Option<Arc<dyn Pingable>>), GatewayError> {
    match transport {
        TransportConfig::Http { url, headers } => {
            let transport = Arc::new(HttpTransport::connect(url, headers.clone()).await?);
            Ok((transport.clone(), Some(transport)))
        }
        TransportConfig::Subprocess { command, args, env } => {
            let transport = Arc::new(SubprocessTransport::spawn(command, args, env).await?);
            Ok((transport.clone(), Some(transport)))
        }
        TransportConfig::ContainerStdio { container_id } => Err(GatewayError::Registration(format!(
            "container '{container_id}': container-attach transport requires an external \
             collaborator that supplies a live attach stream, which this binary does not provide"
        ))),
        TransportConfig::Openapi { .. } => Err(GatewayError::Registration(
            "openapi transport is registered via register_openapi_server, not build_transport".to_string(),
        )),
    }
}

async fn register_servers(gateway: &Gateway, config: &BootstrapConfig) {
    for server in &config.servers {
        if !server.enabled {
            info!(server = server.id, "server disabled in config, skipping");
            continue;
        }

        let whitelist = match &server.tool_whitelist {
            Some(names) => ToolWhitelist::only(names.clone()),
            None => ToolWhitelist::all(),
        };

        // OpenAPI has no JSON-RPC handshake (spec §4.E/§9), so it gets its
        // own registration path instead of going through `build_transport`
        // + `register_mcp_server`'s shared `initialize`/`tools/list` flow.
        if let TransportConfig::Openapi { document_path, base_url, .. } = &server.transport {
            let document = match std::fs::read_to_string(document_path) {
                Ok(d) => d,
                Err(e) => {
                    error!(server = server.id, error = %e, "failed to read openapi document");
                    continue;
                }
            };
            let transport = match OpenApiTransport::from_document(&document, base_url, server.transport.openapi_auth()) {
                Ok(t) => Arc::new(t),
                Err(e) => {
                    error!(server = server.id, error = %e, "failed to parse openapi document");
                    continue;
                }
            };
            let client = Arc::new(UpstreamClient::new(server.id.clone(), whitelist));
            match gateway.register_openapi_server(server.id.clone(), client, transport).await {
                Ok(()) => info!(server = server.id, "registered openapi upstream server"),
                Err(e) => error!(server = server.id, error = %e, "failed to register openapi upstream server"),
            }
            continue;
        }

        let (transporter, pingable) = match build_transport(&server.transport).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(server = server.id, error = %e, "failed to build upstream transport");
                continue;
            }
        };

        let client = Arc::new(UpstreamClient::new(server.id.clone(), whitelist));
        match gateway.register_mcp_server(server.id.clone(), client, transporter).await {
            Ok(()) => {
                info!(server = server.id, "registered upstream server");
                if let Some(pingable) = pingable {
                    gateway.health.register(server.id.clone(), pingable).await;
                }
            }
            Err(e) => error!(server = server.id, error = %e, "failed to register upstream server"),
        }
    }

    for agent in &config.agents {
        gateway.register_agent(agent.name.clone()).await;
        if let Some(allowed) = &agent.allowed_servers {
            let selectors = allowed.iter().cloned().map(ToolSelector::whole_server).collect();
            gateway.set_acl(agent.name.clone(), selectors).await;
        }
        info!(agent = agent.name, "registered agent");
    }
}

fn spawn_health_ticker(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_TICK_INTERVAL);
        loop {
            ticker.tick().await;
            gateway.health.tick().await;
        }
    });
}

fn spawn_session_cleanup(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = gateway.sessions.cleanup_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "cleaned up expired sessions");
            }
        }
    });
}

async fn run(args: Args) -> Result<(), GatewayError> {
    let gateway = Arc::new(Gateway::new());

    if let Some(path) = &args.config {
        let config = BootstrapConfig::load(path)?;
        register_servers(&gateway, &config).await;
    } else {
        warn!("no --config given, starting with an empty upstream catalog");
    }

    spawn_health_ticker(gateway.clone());
    spawn_session_cleanup(gateway.clone());

    let app = frontend::router(gateway.clone());
    let listener = tokio::net::TcpListener::bind(&args.listen).await.map_err(GatewayError::Io)?;
    info!(addr = %args.listen, "gridctl-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(gateway.clone()))
        .await
        .map_err(GatewayError::Io)?;

    Ok(())
}

/// Waits for Ctrl-C, then broadcasts a `close` event to every open SSE
/// session and clears the session map, giving
/// `axum::serve`'s graceful shutdown a short grace period to flush
/// in-flight responses before the listener stops accepting new connections.
async fn shutdown_signal(gateway: Arc<Gateway>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, closing sessions");
    gateway.sessions.broadcast_and_clear("close", "server shutting down").await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(log_level(args.verbose));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gridctl-gateway exited with an error");
            ExitCode::FAILURE
        }
    }
}
