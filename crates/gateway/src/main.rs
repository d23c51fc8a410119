use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use valet_domain::config::Config;
use valet_domain::sysenv::StartupEnv;
use valet_gateway::api;
use valet_gateway::capture::{NoopCapture, NoopTranscriber};
use valet_gateway::state::AppState;
use valet_gateway::storage::MemoryStore;
use valet_providers::ProviderRegistry;
use valet_retriever::Retriever;

#[derive(Parser)]
#[command(name = "valet", about = "Desktop AI-assistant backend")]
struct Cli {
    /// Config file path.
    #[arg(long, default_value = "valet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(&cli.config)?;
            run_server(config).await
        }
        Some(Command::Version) => {
            println!("valet {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,valet_gateway=debug")),
        )
        .init();
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("valet starting");

    // The PATH seen now is the PATH every child gets, forever.
    let env = StartupEnv::capture();

    // ── Retriever backend probe ──────────────────────────────────────
    let retriever = Retriever::probe(&config.retriever).await;

    // ── Provider adapters ────────────────────────────────────────────
    // Adapters are registered by the embedding application; a bare
    // gateway starts with none and reports model errors per turn.
    let providers = ProviderRegistry::new();
    if providers.is_empty() {
        tracing::warn!("no provider adapters registered — queries will fail until one is added");
    }

    let google_token = config.google_token_file();
    let google_servers: Vec<_> = [config.google.gmail.clone(), config.google.calendar.clone()]
        .into_iter()
        .flatten()
        .collect();
    let tool_servers = config.tool_servers.clone();
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let state = AppState::build(
        config,
        env,
        providers,
        Arc::new(MemoryStore::new()),
        Arc::new(NoopCapture),
        Arc::new(NoopTranscriber),
        retriever,
    );

    // ── Tool servers ─────────────────────────────────────────────────
    state.servers.connect_configured(&tool_servers).await;
    if let Some(token_file) = google_token {
        state
            .servers
            .connect_google_servers(&token_file, &google_servers)
            .await;
    }
    tracing::info!(
        servers = state.servers.server_count(),
        tools = state.servers.tools().len(),
        "tool servers ready"
    );

    // ── Serve ────────────────────────────────────────────────────────
    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "valet listening");

    let result = axum::serve(listener, app).await.context("server error");

    state.servers.cleanup().await;
    result
}
