use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use tradebot::audit::TracingAuditSink;
use tradebot::config::BotConfig;
use tradebot::engine::TradingLoopController;
use tradebot::exchange::{ExchangeGateway, PaperExchange};
use tradebot::models::parse_interval;

#[derive(Parser, Debug)]
#[command(name = "tradebot", about = "Indicator-driven trading loop")]
struct Args {
    /// Configuration file (TOML); `tradebot.toml` is used when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single sweep over all symbols and exit
    #[arg(long)]
    once: bool,

    /// Monitor exits only, never open positions
    #[arg(long)]
    dry_run: bool,

    /// Seed for the paper market
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();
    let args = Args::parse();

    tracing::info!("🚀 TradeBot starting");

    let mut config =
        BotConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if args.dry_run {
        config.trading.enabled = false;
    }
    log_configuration(&config);

    let gateways = paper_gateways(&config, args.seed)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = TradingLoopController::new(
        &config,
        gateways,
        Arc::new(TracingAuditSink),
        shutdown_rx,
    )?;

    if args.once {
        let reports = controller.run_once().await;
        for report in &reports {
            tracing::info!(
                "  {}/{}: {:?}",
                report.account,
                report.symbol,
                report.outcome
            );
        }
        tracing::info!("👋 TradeBot stopped after one sweep");
        return Ok(());
    }

    let trading_task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run().await })
    };
    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    tracing::info!("\n⚠️  Received Ctrl+C, finishing in-flight cycles...");
    // Receiver lives inside the controller, send cannot fail while it runs
    let _ = shutdown_tx.send(true);

    if let Err(e) = trading_task.await {
        tracing::error!("Trading loop exited abnormally: {}", e);
    }
    tracing::info!("👋 TradeBot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter("tradebot=info,tradebot::strategy=debug")
        .init();
}

fn log_configuration(config: &BotConfig) {
    let trading = &config.trading;
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Strategy: {:?}", config.algorithm.strategy);
    tracing::info!("  Interval: {} every {}s", trading.interval, trading.trading_frequency);
    tracing::info!("  Max Position: ${:.2}", trading.max_position_size);
    tracing::info!(
        "  Stop Loss: {}% | Profit Target: {}%",
        trading.stop_loss * 100.0,
        trading.profit_target * 100.0
    );
    tracing::info!("  Max Drawdown: {}%", trading.max_drawdown * 100.0);
    tracing::info!("  Max Daily Trades: {}", trading.max_daily_trades);
    if !trading.enabled {
        tracing::warn!("  Trading disabled, exits are still monitored");
    }
    for symbol in &trading.symbols {
        tracing::info!("    - {}", symbol);
    }
}

/// One paper exchange per configured account
fn paper_gateways(
    config: &BotConfig,
    seed: u64,
) -> anyhow::Result<HashMap<String, Arc<dyn ExchangeGateway>>> {
    let interval = parse_interval(&config.trading.interval)
        .with_context(|| format!("unsupported interval {}", config.trading.interval))?;

    let mut gateways: HashMap<String, Arc<dyn ExchangeGateway>> = HashMap::new();
    for (i, account) in config.accounts.iter().enumerate() {
        let mut exchange = PaperExchange::new(&account.name, account.initial_balance, seed + i as u64)
            .with_interval(interval);
        for symbol in &config.trading.symbols {
            exchange = exchange.with_market(symbol, starting_price(symbol));
        }
        tracing::info!(
            "  Paper account {} with ${:.2}",
            account.name,
            account.initial_balance
        );
        gateways.insert(account.name.clone(), Arc::new(exchange));
    }
    Ok(gateways)
}

fn starting_price(symbol: &str) -> f64 {
    match symbol.split('/').next().unwrap_or(symbol) {
        "BTC" => 60_000.0,
        "ETH" => 3_000.0,
        "SOL" => 150.0,
        _ => 100.0,
    }
}
