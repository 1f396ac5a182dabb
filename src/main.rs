use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::{info, warn};

use crypto_rates::{
    CacheConfig, ClientConfig, CoinGeckoClient, HealthStatus, PrometheusMetrics, RatesReport,
    ResilientCache, SystemClock,
};

#[derive(Parser)]
#[command(name = "crypto-rates", about = "Cached cryptocurrency exchange rates")]
struct Cli {
    /// Seconds a snapshot is served without refreshing
    #[arg(long, env = "FRESH_WINDOW_SECS")]
    fresh_window_secs: Option<u64>,

    /// Seconds after which a snapshot counts as expired
    #[arg(long, env = "STALE_CEILING_SECS")]
    stale_ceiling_secs: Option<u64>,

    /// Provider base URL
    #[arg(long, env = "COINGECKO_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the current rate table
    Rates {
        /// Only show the first N currencies by value
        #[arg(long)]
        top: Option<usize>,
        /// Print the JSON body instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Convert an amount between two currencies
    Convert {
        from: String,
        to: String,
        amount: f64,
    },
    /// Fetch once and report cache health
    Health,
    /// Poll the cache repeatedly and report each answer
    Watch {
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
        /// Stop after this many polls
        #[arg(long)]
        count: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut cache_config = CacheConfig::from_env()?;
    if let Some(secs) = cli.fresh_window_secs {
        cache_config.fresh_window = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.stale_ceiling_secs {
        cache_config.stale_ceiling = Duration::from_secs(secs);
    }
    cache_config.validate()?;

    let mut client_config = ClientConfig::from_env()?;
    if let Some(url) = cli.base_url {
        client_config.base_url = url.trim_end_matches('/').to_string();
    }

    let clock = Arc::new(SystemClock);
    let client = CoinGeckoClient::new(client_config, clock.clone())?;
    let metrics = Arc::new(PrometheusMetrics::new()?);
    let cache = ResilientCache::new(Arc::new(client), cache_config)
        .with_clock(clock)
        .with_metrics(metrics.clone());

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command, cache, metrics))
}

async fn run(
    command: Command,
    cache: ResilientCache,
    metrics: Arc<PrometheusMetrics>,
) -> anyhow::Result<()> {
    match command {
        Command::Rates { top, json } => {
            let lookup = cache.get().await?;
            if json {
                let report = RatesReport::from(&lookup);
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            let snapshot = &lookup.snapshot;
            println!(
                "Exchange rates ({}, updated {}):",
                lookup.status,
                snapshot.fetched_at()
            );
            let limit = top.unwrap_or(usize::MAX);
            for (code, record) in snapshot.sorted_by_value().into_iter().take(limit) {
                println!("{}: {} {} ({})", code, record.value, record.unit, record.name);
            }
        }
        Command::Convert { from, to, amount } => {
            let lookup = cache.get().await?;
            let converted = lookup
                .snapshot
                .convert(&from, &to, amount)
                .with_context(|| format!("Cannot convert {} to {}", from, to))?;
            println!(
                "{} {} is {} {} ({})",
                amount, from, converted, to, lookup.status
            );
        }
        Command::Health => {
            let fetched = cache.get().await;
            let health = cache.health();
            let status = match health.status {
                HealthStatus::Healthy => "healthy",
                HealthStatus::Degraded => "degraded",
                HealthStatus::Unavailable => "unhealthy",
            };
            println!("status: {}", status);
            println!("currencies: {}", health.currency_count);
            if let Some(age) = health.age {
                println!("age: {}s", age.as_secs());
            }
            if let Err(err) = fetched {
                println!("error: {} [{}]", err, err.code());
            }
        }
        Command::Watch {
            interval_secs,
            count,
        } => {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            let mut polls = 0;
            loop {
                ticker.tick().await;
                match cache.get().await {
                    Ok(lookup) => info!(
                        "{} currencies, status {}, fetched at {}",
                        lookup.snapshot.currency_count(),
                        lookup.status,
                        lookup.snapshot.fetched_at()
                    ),
                    Err(err) => warn!("{} [{}]", err, err.code()),
                }
                polls += 1;
                if count.is_some_and(|limit| polls >= limit) {
                    break;
                }
            }
            print!("{}", metrics.encode()?);
        }
    }
    Ok(())
}
