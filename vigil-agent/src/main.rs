use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use vigil_agent::Agent;
use vigil_agent::config::AgentConfig;
use vigil_agent::global_state_dir;
use vigil_agent::token_store::TokenStore;

/// Vigil agent - remote host administration over TCP
#[derive(Parser)]
#[command(name = "vigil-agent", about = "Remote administration agent", version)]
struct Args {
    /// Config file (defaults to ~/.vigil/vigil.yaml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the directory holding watch records
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let state_dir = global_state_dir();
    let mut config = AgentConfig::load_or_default(args.config.as_deref(), &state_dir)?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.storage.db_dir = data_dir;
    }
    config.validate()?;

    info!("Starting vigil agent on {}", config.listen_addr());
    let tokens = Arc::new(TokenStore::load(&config.auth.tokens_file));
    let agent = Agent::start(&config, tokens).await?;

    let shutdown = agent.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = shutdown.send(()).await;
        }
    });

    agent.run().await?;
    Ok(())
}
