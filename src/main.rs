//! agentgate - API gateway and process orchestrator for agent workers

use agentgate::{
    api::build_app,
    config::{AgentGateConfig, LogFormat},
    gateway::GatewayBuilder,
    orchestrator::{AgentOrchestrator, ProcessOrchestrator},
    worker::{run_worker, WorkerOptions},
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "agentgate")]
#[command(version)]
#[command(about = "API gateway and process orchestrator for agent workers")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AGENTGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Server token for protected handlers
        #[arg(long, env = "AGENTGATE_TOKEN")]
        token: Option<String>,
    },

    /// Run an agent worker on stdin/stdout (spawned by the orchestrator)
    #[command(hide = true)]
    Worker,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AgentGateConfig::load(cli.config.as_deref())?;

    let worker = matches!(cli.command, Commands::Worker);
    init_logging(cli.verbose, config.logging.format, worker);

    match cli.command {
        Commands::Serve { host, port, token } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if token.is_some() {
                config.server.token = token;
            }
            config.validate()?;
            if let Some(token) = config.server.ensure_token() {
                tracing::warn!("No server token configured, generated a random one");
                // Shown once on the terminal, never through the log pipeline
                eprintln!("Server token: {}", token);
            }
            run_server(config).await?;
        }
        Commands::Worker => {
            run_worker(WorkerOptions::from_env()).await?;
        }
        Commands::Config { default } => {
            let shown = if default {
                AgentGateConfig::default()
            } else {
                config
            };
            print!("{}", toml::to_string_pretty(&shown)?);
        }
    }

    Ok(())
}

/// Workers log to stderr so stdout stays a clean RPC channel
fn init_logging(verbose: bool, format: LogFormat, worker: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("agentgate={},tower_http={}", log_level, log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    match (format, worker) {
        (LogFormat::Json, _) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        (LogFormat::Pretty, true) => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        (LogFormat::Pretty, false) => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn run_server(config: AgentGateConfig) -> Result<()> {
    let orchestrator = Arc::new(ProcessOrchestrator::new(config.agents.clone()));
    let gateway = GatewayBuilder::new()
        .config(config.server.clone())
        .orchestrator(orchestrator.clone())
        .build()?;
    let app = build_app(Arc::new(gateway));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(address = %addr, "agentgate is running. Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down...");
        })
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}
