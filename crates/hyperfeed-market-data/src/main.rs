/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Running market data feeds with periodic per-symbol reports and graceful shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hyperfeed_market_data::{DataManager, FeedConfig};

#[derive(Parser, Debug)]
#[command(name = "hyperfeed", version, about = "Streaming market data runner")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Seconds between per-symbol status reports; 0 disables them
    #[arg(long = "report-interval-secs", value_name = "SECS", default_value_t = 10)]
    report_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    info!(
        config_path = %args.config_path.display(),
        dry_run = args.dry_run,
        "starting hyperfeed"
    );

    let config = load_config(&args.config_path)?;
    config.validate().context("validate config")?;
    hyperfeed_market_data::config::validate_subscriptions(&config.symbols, &config.channels)
        .context("validate subscriptions")?;
    info!(symbol_count = config.symbols.len(), "configuration loaded");

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    let symbols = config.symbols.clone();
    let channels = config.channels.clone();
    let manager = Arc::new(DataManager::new(config).context("build data manager")?);

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone(), symbols.len());

    manager
        .start(&symbols, &channels)
        .context("start data manager")?;

    if args.report_interval_secs > 0 {
        tokio::spawn(report_loop(
            manager.clone(),
            symbols.clone(),
            Duration::from_secs(args.report_interval_secs),
            shutdown.clone(),
        ));
    }

    shutdown.cancelled().await;

    manager.stop().await;
    info!("data manager shutdown complete");

    Ok(())
}

async fn report_loop(
    manager: Arc<DataManager>,
    symbols: Vec<String>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for symbol in &symbols {
            let info = manager.get_market_info(symbol);
            let price = manager.get_current_price(symbol).await;
            let ask_bid = manager.ask_bid(symbol).await;
            info!(
                symbol = %symbol,
                source = ?info.data_source,
                connected = info.connected,
                degraded = info.degraded,
                book = ?info.book_status,
                price = ?price.as_ref().map(|quote| quote.price),
                stale = price.as_ref().is_some_and(|quote| quote.stale),
                ask = ?ask_bid.as_ref().map(|quote| quote.ask),
                bid = ?ask_bid.as_ref().map(|quote| quote.bid),
                "market report"
            );
        }
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn load_config(path: &Path) -> Result<FeedConfig> {
    let path_str = path
        .to_str()
        .context("config path must be valid utf-8")?;
    FeedConfig::from_file(path_str).with_context(|| format!("load config from {}", path.display()))
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken, symbol_count: usize) {
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        info!(signal, symbol_count, "stopping hyperfeed feeds");
        shutdown.cancel();
    });
}

async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(err) => {
                warn!(signal = "SIGINT", error = %err, "signal listener unavailable");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(err) => {
                warn!(signal = "SIGTERM", error = %err, "signal listener unavailable");
                std::future::pending().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}
