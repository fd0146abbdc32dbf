use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use secrecy::ExposeSecret;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use registry_provisioner::api::start_server;
use registry_provisioner::cli::{Cli, Command, run_check_config};
use registry_provisioner::config::Config;
use registry_provisioner::provision::ledger::JsonlLedger;
use registry_provisioner::provision::registry::ComponentRegistry;
use registry_provisioner::runtime::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.clone().unwrap_or(Command::Serve { ephemeral: false }) {
        Command::Serve { ephemeral } => serve(&cli, ephemeral).await,
        Command::Snapshot => snapshot(&cli).await,
        Command::CheckConfig => run_check_config(cli.config.as_deref()).await,
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "registry_provisioner=info,tower_http=info".into());
    let json = std::env::var("PROVISIONER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn serve(cli: &Cli, ephemeral: bool) -> anyhow::Result<()> {
    let config = Config::from_env_with_toml(cli.config.as_deref())?;
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid gateway address {}:{}",
                config.gateway.host, config.gateway.port
            )
        })?;

    let state = Arc::new(AppState::build(&config, ephemeral).await?);
    let gateway = start_server(addr, state, config.gateway.auth_token.clone()).await?;

    if config.gateway.auth_token_generated {
        println!(
            "Gateway token (set GATEWAY_AUTH_TOKEN to pin it): {}",
            config.gateway.auth_token.expose_secret()
        );
    }
    println!("Listening on http://{}", gateway.addr);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");
    gateway.shutdown().await;
    Ok(())
}

async fn snapshot(cli: &Cli) -> anyhow::Result<()> {
    let config = Config::from_env_with_toml(cli.config.as_deref())?;
    let ledger = Arc::new(JsonlLedger::new(&config.ledger.path));
    let registry = ComponentRegistry::open(ledger, &config.chain.network).await?;
    let view = registry.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
