//! Speculative Query Proxy
//!
//! MySQL wire protocol proxy in front of a group of redundant replicas:
//! - every write reaches every replica; replica 0 answers reads by default
//! - while a query runs, the likely next statements are pre-issued on idle
//!   replicas so the answer may already be there when the client asks
//! - speculative writes are guarded by savepoints and undone on a miss
//! - Prometheus metrics and health checks over HTTP (/metrics, /health)

mod http_api;
mod metrics;
mod mysql_wire;
mod proxy;
mod query;
mod server_group;
mod speculator;
mod telemetry;
mod undo;

use crate::proxy::ProxyServer;
use crate::query::TemplateRegistry;
use crate::speculator::trace::ReferenceTrace;
use clap::Parser;
use sqp_common::{ProxyConfig, SpeculatorKind};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sqp-proxy")]
#[command(about = "Speculative MySQL proxy over redundant replicas")]
struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Client listen address
    #[arg(long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Comma-separated replica addresses; the first one is the designated replica
    #[arg(long, env = "BACKENDS", value_delimiter = ',')]
    backends: Vec<String>,

    /// Reference trace used for speculation
    #[arg(long, env = "TRACE_PATH")]
    trace: Option<PathBuf>,

    /// Speculator (trace, model, synthetic, disabled)
    #[arg(long, env = "SPECULATOR")]
    speculator: Option<SpeculatorKind>,

    /// Health and metrics HTTP address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Write the trace's query templates as `id,template` lines and exit
    #[arg(long)]
    dump_templates: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if !self.backends.is_empty() {
            config.backends = self.backends.clone();
        }
        if let Some(trace) = &self.trace {
            config.speculation.trace_path = Some(trace.clone());
        }
        if let Some(kind) = self.speculator {
            config.speculation.kind = kind;
        }
        if let Some(addr) = &self.metrics_addr {
            config.metrics_addr = Some(addr.clone());
        }
        if let Some(level) = &self.log_level {
            config.telemetry.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let mut config = ProxyConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    telemetry::init(&config.telemetry.log_level, config.telemetry.json_logs)?;

    if let Some(out) = &args.dump_templates {
        return dump_templates(&config, out);
    }

    config.validate()?;

    info!("Starting speculative query proxy");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Replicas: {:?} (designated: {})", config.backends, config.backends[0]);
    info!(
        "  Speculator: {:?}, width={}, hit_probability={}, writes={}",
        config.speculation.kind,
        config.speculation.width,
        config.speculation.hit_probability,
        config.speculation.speculate_writes
    );
    info!("  Max connections: {}", config.max_connections);

    metrics::init_metrics();

    if let Some(addr) = &config.metrics_addr {
        let http_addr: SocketAddr = addr.parse()?;
        info!("HTTP server listening on {}", http_addr);
        info!("  /metrics - Prometheus metrics");
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&http_addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, http_api::router()).await {
                        error!("HTTP server error: {}", e);
                    }
                }
                Err(e) => error!("Failed to bind HTTP server on {}: {}", http_addr, e),
            }
        });
    }

    let server = ProxyServer::new(config)?;
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("MySQL proxy error: {}", e);
        }
    });

    info!("Speculative query proxy started");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down speculative query proxy");
        }
        _ = proxy_handle => {}
    }

    Ok(())
}

fn dump_templates(config: &ProxyConfig, out: &Path) -> anyhow::Result<()> {
    let trace_path = config
        .speculation
        .trace_path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("--dump-templates needs a reference trace (--trace)"))?;
    let trace = ReferenceTrace::load(trace_path)?;

    let mut registry = TemplateRegistry::new();
    for statement in trace.statements() {
        if !statement.trim().is_empty() {
            registry.intern(statement);
        }
    }

    let mut writer = std::io::BufWriter::new(std::fs::File::create(out)?);
    registry.dump(&mut writer)?;
    writer.flush()?;
    info!(
        templates = registry.len(),
        path = %out.display(),
        "Wrote query templates"
    );
    Ok(())
}
