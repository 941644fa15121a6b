mod api;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use shardline::{HttpSqlClient, Operator, ShardingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardline-server")]
#[command(about = "Sharding coordinator sidecar for search engine clusters")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "shardline.toml")]
    config: PathBuf,

    /// Address of the sidecar API
    #[arg(long, env = "SHARDLINE_BIND")]
    bind: Option<String>,

    /// Base URL of the local engine's HTTP endpoint
    #[arg(long, env = "SHARDLINE_ENGINE_URL")]
    engine_url: Option<String>,

    /// Node id to advertise instead of reading the engine's listen settings
    #[arg(long, env = "SHARDLINE_NODE_ID")]
    node_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,shardline=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!("Config file: {}", args.config.display());

    let mut config = ShardingConfig::load_or_default(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(url) = args.engine_url {
        config.engine.url = url;
    }
    if args.node_id.is_some() {
        config.node.advertise_addr = args.node_id;
    }
    config.validate()?;

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("installing metrics recorder")?;

    let client = Arc::new(HttpSqlClient::new(&config.engine)?);
    let operator = Arc::new(Operator::new(config.clone(), client).await?);

    let ticker = operator.clone();
    let tick_interval = config.cluster.tick_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = ticker.tick().await;
            if !report.errors.is_empty() {
                tracing::debug!(errors = ?report.errors, "Tick finished with errors");
            }
        }
    });

    let app = api::router(api::AppState::new(operator, Some(metrics)));
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;

    tracing::info!("Listening on {}", config.server.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
