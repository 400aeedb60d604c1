use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use marketswarm::account::Account;
use marketswarm::agent::AgentConfig;
use marketswarm::audit::AuditLog;
use marketswarm::execution::{ExecutionClient, LiveExecutionClient, PaperExecutionClient};
use marketswarm::hub::{HubConfig, MarketDataHub};
use marketswarm::orchestrator::{Orchestrator, DEFAULT_SAVE_INTERVAL};
use marketswarm::persistence::JsonFileStore;
use marketswarm::risk::governor::RiskGovernor;
use marketswarm::risk::limits::RiskLimits;
use marketswarm::strategy::StrategyRegistry;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Symbols to trade (comma-separated)
    #[arg(short, long, default_value = "BTCUSDT,ETHUSDT")]
    symbols: String,

    /// Kline interval for all agents
    #[arg(short, long, default_value = "1m")]
    interval: String,

    /// Strategy assigned to newly created bots
    #[arg(long, default_value = "momentum")]
    strategy: String,

    /// Exchange WebSocket base URL
    #[arg(long, env = "EXCHANGE_WS_URL", default_value = "wss://stream.binance.com:9443")]
    ws_url: String,

    /// Starting account cash in quote currency
    #[arg(long, default_value = "10000")]
    starting_cash: f64,

    /// Capital allocated to each agent
    #[arg(long, default_value = "2000")]
    capital_per_bot: f64,

    /// Directory for persisted configs, states and trades
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Risk audit log path
    #[arg(long, default_value = "./data/audit.csv")]
    audit_path: String,

    /// Risk monitor sweep interval in seconds
    #[arg(long, default_value = "10")]
    monitor_interval: u64,

    /// Place real orders instead of simulated fills
    #[arg(long)]
    live: bool,

    /// Exchange REST base URL (live mode)
    #[arg(long, env = "EXCHANGE_REST_URL", default_value = "https://api.binance.com")]
    rest_url: String,

    /// Exchange API key (live mode)
    #[arg(long, env = "EXCHANGE_API_KEY", default_value = "")]
    api_key: String,

    /// Exchange API secret (live mode)
    #[arg(long, env = "EXCHANGE_API_SECRET", default_value = "")]
    api_secret: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("marketswarm=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("Starting marketswarm");
    info!("Symbols: {}", args.symbols);
    info!("Interval: {}", args.interval);
    info!("Mode: {}", if args.live { "LIVE" } else { "paper" });

    std::fs::create_dir_all(&args.data_dir).context("creating data directory")?;

    let hub = Arc::new(MarketDataHub::new(HubConfig {
        ws_base_url: args.ws_url.clone(),
        ..Default::default()
    }));
    hub.connect().await.context("connecting market data hub")?;

    let account = Arc::new(Account::new(args.starting_cash));

    let execution: Arc<dyn ExecutionClient> = if args.live {
        if args.api_key.is_empty() || args.api_secret.is_empty() {
            anyhow::bail!("live mode requires EXCHANGE_API_KEY and EXCHANGE_API_SECRET");
        }
        Arc::new(LiveExecutionClient::new(
            args.rest_url.clone(),
            args.api_key.clone(),
            args.api_secret.clone(),
        ))
    } else {
        Arc::new(PaperExecutionClient::new(hub.cache()))
    };

    let audit = AuditLog::new(std::path::Path::new(&args.audit_path))
        .context("opening audit log")?;
    let governor = Arc::new(RiskGovernor::new(
        account.clone(),
        RiskLimits::default(),
        execution.clone(),
        Some(audit),
    ));
    governor
        .start_monitor(hub.clone(), Duration::from_secs(args.monitor_interval))
        .await;

    let persistence = Arc::new(JsonFileStore::new(&args.data_dir)?);
    let orchestrator = Arc::new(Orchestrator::new(
        hub.clone(),
        governor,
        execution,
        account,
        persistence,
        StrategyRegistry::new(),
    ));

    let restored = orchestrator.restore().await?;
    if restored == 0 {
        for symbol in args.symbols.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mut config = AgentConfig::new(
                &format!("{}-{}", symbol.to_lowercase(), args.strategy),
                symbol,
                &args.strategy,
                args.capital_per_bot,
            );
            config.interval = args.interval.clone();
            match orchestrator.create_bot(config).await {
                Ok(bot_id) => orchestrator.start_bot(bot_id).await?,
                Err(e) => warn!(symbol, error = %e, "Failed to create bot"),
            }
        }
    }

    orchestrator.start_save_loop(DEFAULT_SAVE_INTERVAL).await;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    orchestrator.shutdown().await;
    Ok(())
}
