use anyhow::{Context, Result};
use clap::Parser;
use dispatcher::config::Config;
use dispatcher::dispatcher::Dispatcher;
use dispatcher::server::Server;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "dispatcher", version, about = "Translation request dispatcher")]
struct Args {
    /// JSON configuration file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:3000
    #[arg(short, long)]
    bind: Option<String>,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("dispatcher={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting dispatcher service");
    tracing::info!(
        bind_address = %config.bind_address,
        redis = config.redis_url.is_some(),
        providers = config.providers.len(),
        "Configuration loaded"
    );

    let dispatcher = Arc::new(Dispatcher::from_config(&config).context("Failed to build dispatcher")?);
    dispatcher.restore_key_usage().await;
    let janitor = dispatcher.spawn_janitor();

    Server::new(config.bind_address.clone(), Arc::clone(&dispatcher))
        .run()
        .await
        .context("Server error")?;

    janitor.abort();
    if !dispatcher.persist_key_usage().await {
        tracing::warn!("Key usage was not persisted");
    }
    Ok(())
}
