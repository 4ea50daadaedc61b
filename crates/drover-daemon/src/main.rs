//! drover-daemon - proxy configuration agent daemon
//!
//! Runs the reconcile agent beside a data-plane proxy: polls the discovery
//! snapshot for changes, feeds the agent's inbox, exposes metrics, and
//! translates host signals into graceful agent shutdown.
//!
//! The daemon runs in the foreground by design; it expects to live under a
//! host supervisor (container entrypoint, systemd unit) that owns
//! daemonization and restart-on-fatal policy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use drover_core::agent::{Agent, ReconcileRequest};
use drover_core::bootstrap;
use drover_core::config::AgentConfig;
use drover_core::environment::{FileDiscovery, NodeIdentity};
use drover_core::metrics::SharedMetricsRegistry;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// drover daemon - proxy configuration agent
#[derive(Parser, Debug)]
#[command(name = "drover-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to agent configuration file
    #[arg(short, long, default_value = "drover.toml")]
    config: PathBuf,

    /// Path to the environment snapshot file maintained by discovery sync
    #[arg(long, default_value = "environment.json")]
    environment_file: PathBuf,

    /// IP address used to match host-local instances
    #[arg(long, default_value = "127.0.0.1")]
    node_ip: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Port for the Prometheus metrics HTTP endpoint
    #[arg(long, default_value = "9102")]
    metrics_port: u16,

    /// Disable the metrics HTTP endpoint
    #[arg(long)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = if args.config.exists() {
        AgentConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!("No config file found at {:?}, using defaults", args.config);
        AgentConfig::default()
    };

    let node = NodeIdentity {
        service_cluster: config.service_cluster.clone(),
        service_node: config.service_node.clone(),
        ip_address: args.node_ip.clone(),
    };
    let discovery = Arc::new(FileDiscovery::new(args.environment_file.clone()));
    let generator = bootstrap::renderer(config.proxy.clone());
    let refresh_delay = config.proxy.discovery_refresh_delay;
    let shutdown_ceiling = config.proxy.parent_shutdown_duration;

    let (agent, handles) = Agent::new(config, node, discovery, generator)
        .context("failed to initialize metrics registry")?;
    let metrics = Arc::clone(&handles.metrics);
    let mut agent_task = tokio::spawn(agent.run());

    // Poll the snapshot source on the discovery cadence. Requests are
    // payloadless; the agent's fingerprint comparison decides whether
    // anything actually changed.
    let inbox = handles.inbox.clone();
    let poller_task = tokio::spawn(async move {
        loop {
            if inbox.send(ReconcileRequest).await.is_err() {
                break;
            }
            tokio::time::sleep(refresh_delay).await;
        }
    });

    let metrics_task = if args.no_metrics {
        info!("Metrics HTTP server disabled");
        None
    } else {
        let addr: SocketAddr = ([127, 0, 0, 1], args.metrics_port).into();
        Some(tokio::spawn(run_metrics_server(metrics, addr)))
    };

    let signal_task = tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    });

    info!(
        pid = std::process::id(),
        config = ?args.config,
        environment = ?args.environment_file,
        "drover daemon started"
    );

    let agent_result = tokio::select! {
        result = &mut agent_task => Some(result),
        _ = signal_task => None,
    };

    poller_task.abort();
    if let Some(task) = metrics_task {
        task.abort();
    }

    let result = match agent_result {
        // The agent stopped on its own, which only happens on fatal errors.
        Some(result) => result,
        None => {
            info!("Shutting down agent...");
            let _ = handles.shutdown.send(true);
            tokio::time::timeout(shutdown_ceiling + Duration::from_secs(1), &mut agent_task)
                .await
                .context("agent did not stop within the shutdown ceiling")?
        },
    };

    match result {
        Ok(Ok(())) => {
            info!("Daemon shutdown complete");
            Ok(())
        },
        Ok(Err(err)) => {
            error!("Agent failed: {err}");
            Err(err.into())
        },
        Err(join_err) => Err(anyhow::anyhow!("agent task panicked: {join_err}")),
    }
}

/// Initialize logging to stdout or a file.
fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Serve agent counters in Prometheus text format.
///
/// Binds to localhost only; put a reverse proxy with authentication in
/// front if network access is needed.
async fn run_metrics_server(metrics: SharedMetricsRegistry, addr: SocketAddr) {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let metrics_handler = {
        let metrics = Arc::clone(&metrics);
        move || {
            let metrics = Arc::clone(&metrics);
            async move {
                match metrics.encode_text() {
                    Ok(body) => (
                        StatusCode::OK,
                        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                        body,
                    )
                        .into_response(),
                    Err(err) => {
                        error!("Failed to encode metrics: {err}");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("Failed to encode metrics: {err}"),
                        )
                            .into_response()
                    },
                }
            }
        }
    };

    let app = Router::new().route("/metrics", get(metrics_handler)).route(
        "/",
        get(|| async { "drover-daemon metrics server\n\nGET /metrics - Prometheus metrics endpoint\n" }),
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind metrics server: {err}");
            return;
        },
    };

    info!(addr = %addr, "Metrics HTTP server listening");
    if let Err(err) = axum::serve(listener, app).await {
        error!("Metrics server error: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["drover-daemon"]);
        assert_eq!(args.config, PathBuf::from("drover.toml"));
        assert_eq!(args.environment_file, PathBuf::from("environment.json"));
        assert_eq!(args.metrics_port, 9102);
        assert!(!args.no_metrics);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_arg_overrides() {
        let args = Args::parse_from([
            "drover-daemon",
            "--config",
            "/etc/drover/drover.toml",
            "--node-ip",
            "10.0.0.9",
            "--metrics-port",
            "9200",
            "--no-metrics",
        ]);
        assert_eq!(args.config, PathBuf::from("/etc/drover/drover.toml"));
        assert_eq!(args.node_ip, "10.0.0.9");
        assert_eq!(args.metrics_port, 9200);
        assert!(args.no_metrics);
    }
}
