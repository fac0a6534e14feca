use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tollgate::cli::{Cli, Commands};
use tollgate::config::{AppConfig, StoreMode};
use tollgate::icap::IcapServer;
use tollgate::state::AppState;
use tollgate::store::{spawn_poller, PolicyStore, RespStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            cmd_start(&cli.config).await?;
        }
        Commands::Check => {
            cmd_check(&cli.config).await?;
        }
        Commands::Patterns => {
            cmd_patterns(&cli.config)?;
        }
        Commands::Init => {
            cmd_init(&cli.config)?;
        }
    }

    Ok(())
}

async fn cmd_start(config_path: &Path) -> anyhow::Result<()> {
    let config = AppConfig::load_from_path(config_path)?;
    let poll_interval = config.store.poll_interval();
    let state = AppState::from_config(config)?;

    let _poller = spawn_poller(
        Arc::clone(&state.security),
        Arc::clone(&state.store),
        poll_interval,
    );

    let server = IcapServer::new(Arc::clone(&state));
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}

async fn cmd_check(config_path: &Path) -> anyhow::Result<()> {
    let config = AppConfig::load_from_path(config_path)?;
    if config.store.mode == StoreMode::Resp {
        let store = RespStore::new(config.store.clone())?;
        store.ping().await?;
        println!("store: reachable");
    }
    println!("{}: OK", config_path.display());
    Ok(())
}

fn cmd_patterns(config_path: &Path) -> anyhow::Result<()> {
    let config = AppConfig::load_from_path(config_path)?;
    for p in &config.patterns {
        let policy = if p.always_block {
            "always-block"
        } else if p.allow_domains.is_some() {
            "blocked outside allowed domains"
        } else {
            "block"
        };
        println!("{:<24} {}", p.name, policy);
    }
    Ok(())
}

fn cmd_init(config_path: &Path) -> anyhow::Result<()> {
    if config_path.exists() {
        anyhow::bail!("{} already exists", config_path.display());
    }
    std::fs::write(config_path, include_str!("../templates/default.toml"))?;
    println!("wrote {}", config_path.display());
    Ok(())
}
