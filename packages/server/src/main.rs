// ABOUTME: `codegate` binary: serve the HTTP gateway or run and check scripts locally
// ABOUTME: Loads .env and configuration, initialises tracing, wires the counter store

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use codegate_gateway::monitor::UsageMonitor;
use codegate_gateway::{
    CounterStore, ErrorKind, ExecutionRequest, Gateway, GatewayConfig, MemoryCounterStore,
    SourceFile, SqliteCounterStore, Tier,
};
use codegate_server::{create_router, AppState, FloodGuard, ServerConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "codegate")]
#[command(about = "Codegate - secure execution gateway for untrusted Python")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        #[arg(long, help = "Listen address (overrides CODEGATE_HOST)")]
        host: Option<std::net::IpAddr>,
        #[arg(long, help = "Listen port (overrides CODEGATE_PORT)")]
        port: Option<u16>,
    },
    /// Run files through the full pipeline and print the output
    Run {
        /// Python files; the first is the entry point unless --entry is given
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        entry: Option<String>,
        #[arg(long, default_value = "free")]
        tier: Tier,
        #[arg(long, default_value = "local")]
        identity: String,
        #[arg(long, help = "Print the full result as JSON")]
        json: bool,
    },
    /// Run the validator on a file without executing it
    Check { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::load().context("failed to load gateway configuration")?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Run {
            files,
            entry,
            tier,
            identity,
            json,
        } => {
            let code = run(config, &files, entry, tier, identity, json).await?;
            std::process::exit(code);
        }
        Commands::Check { file } => {
            let code = check(config, &file).await?;
            std::process::exit(code);
        }
    }
}

async fn counter_store(config: &GatewayConfig) -> Result<Arc<dyn CounterStore>> {
    match &config.database_url {
        Some(url) => {
            let store = SqliteCounterStore::connect(url)
                .await
                .with_context(|| format!("failed to open counter store at {}", url))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryCounterStore::new())),
    }
}

async fn serve(
    config: GatewayConfig,
    host: Option<std::net::IpAddr>,
    port: Option<u16>,
) -> Result<()> {
    let mut server = ServerConfig::from_env()?;
    if let Some(host) = host {
        server.host = host;
    }
    if let Some(port) = port {
        server.port = port;
    }

    let store = counter_store(&config).await?;
    let gateway = Arc::new(Gateway::builder(config).store(store.clone()).build()?);
    let guard = FloodGuard::new(server.http_rpm, server.http_burst);

    spawn_housekeeping(store, gateway.monitor().clone(), guard.clone());

    let app = create_router(AppState::new(gateway), guard);
    let addr = server.addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "Codegate listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Codegate stopped");
    Ok(())
}

/// Expired counters and idle per-identity state are dropped once a minute
fn spawn_housekeeping(store: Arc<dyn CounterStore>, monitor: Arc<UsageMonitor>, guard: FloodGuard) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match store.purge_expired(Utc::now()).await {
                Ok(removed) => debug!(removed, "Purged expired counters"),
                Err(e) => warn!(error = %e, "Failed to purge expired counters"),
            }
            monitor.purge_idle(Utc::now());
            guard.purge();
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}

fn read_sources(files: &[PathBuf]) -> Result<Vec<SourceFile>> {
    files
        .iter()
        .map(|path| {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(SourceFile::new(module_path(path)?, content))
        })
        .collect()
}

/// Relative paths keep their directories so packages import as written
fn module_path(path: &Path) -> Result<String> {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        bail!("{} is not a file path", path.display());
    }
    if path.is_absolute() {
        return Ok(parts[parts.len() - 1].clone());
    }
    Ok(parts.join("/"))
}

async fn run(
    config: GatewayConfig,
    files: &[PathBuf],
    entry: Option<String>,
    tier: Tier,
    identity: String,
    json: bool,
) -> Result<i32> {
    let mut sources = read_sources(files)?;
    let request = if sources.len() == 1 && entry.is_none() {
        let file = sources.remove(0);
        ExecutionRequest::source(file.content, tier)
    } else {
        let entry = match entry {
            Some(entry) => entry,
            None => sources[0].path.clone(),
        };
        ExecutionRequest::project(sources, entry, tier)
    };
    let request = request.with_identity(identity);

    let store = counter_store(&config).await?;
    let gateway = Gateway::builder(config)
        .store(store)
        .inline_monitor(true)
        .build()?;
    let result = gateway.submit(request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
        if result.truncated {
            eprintln!("[output truncated]");
        }
    }

    Ok(match result.error_kind {
        ErrorKind::None => result.exit_code.unwrap_or(0),
        kind => {
            if !json {
                let message = result
                    .detail
                    .as_ref()
                    .and_then(|d| d.message.clone())
                    .unwrap_or_default();
                eprintln!("codegate: {:?} {}", kind, message);
            }
            2
        }
    })
}

async fn check(config: GatewayConfig, file: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let gateway = Gateway::builder(config).inline_monitor(true).build()?;
    let verdict = gateway.check(&ExecutionRequest::source(content, Tier::Free))?;

    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(if verdict.safe { 0 } else { 1 })
}
