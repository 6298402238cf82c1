//! kis-trader: automated overseas-stock trading backend.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the brokerage client, recommendation service and scheduler,
//! serves the JSON API and shuts the scheduler down on Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use kis_trader::api::{self, ApiState};
use kis_trader::broker::client::{http_client, KisClient};
use kis_trader::broker::Brokerage;
use kis_trader::config;
use kis_trader::scheduler::{AutoTrader, MarketGate, Scheduler, TradePacing, UsMarketHours};
use kis_trader::signals::{AlphaVantageClient, Catalog, RecommendationService, ServicePacing, SentimentSource};
use kis_trader::storage;

/// Environment variable naming the config file.
const CONFIG_ENV: &str = "KIS_TRADER_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Initialise structured logging
    init_logging();

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".into());
    let cfg = load_config(&config_path)?;

    info!(
        config = %config_path,
        environment = %cfg.broker.environment,
        catalog = cfg.catalog.len(),
        "kis-trader starting up"
    );

    // -- Components ------------------------------------------------------

    let store = storage::open(&cfg.storage.database_url).await?;

    let client = KisClient::from_config(&cfg, store.clone())?;
    match client.tokens().access_token().await {
        Ok(_) => info!(expires_at = ?client.tokens().expires_at().await, "Access token ready"),
        Err(e) => warn!(error = %format!("{e:#}"), "No access token yet, will retry on first request"),
    }
    let broker: Arc<dyn Brokerage> = Arc::new(client);

    let sentiment = AlphaVantageClient::from_config(&cfg.sentiment, http_client(cfg.broker.timeout())?)
        .map(|c| Arc::new(c) as Arc<dyn SentimentSource>);

    let recommendations = Arc::new(RecommendationService::new(
        store.clone(),
        broker.clone(),
        sentiment,
        Catalog::new(cfg.catalog.clone()),
        cfg.strategy.clone(),
        ServicePacing {
            balance: Duration::from_millis(cfg.scheduler.balance_pacing_ms),
            sentiment: Duration::from_secs(cfg.sentiment.request_interval_secs),
        },
    ));

    let gate: Arc<dyn MarketGate> = Arc::new(UsMarketHours);
    let trader = Arc::new(AutoTrader::new(
        broker.clone(),
        recommendations.clone(),
        gate.clone(),
        TradePacing::from(&cfg.scheduler),
    ));
    let scheduler = Arc::new(Scheduler::new(
        trader,
        recommendations.clone(),
        gate,
        &cfg.scheduler,
    )?);

    // -- Jobs ------------------------------------------------------------

    if cfg.scheduler.autostart_buy {
        scheduler.start_auto_buy().await;
    }
    if cfg.scheduler.autostart_sell {
        scheduler.start_auto_sell().await;
    }
    if cfg.scheduler.autostart_refresh {
        scheduler.start_refresh().await;
    }

    // -- API -------------------------------------------------------------

    let server = if cfg.api.enabled {
        let state = Arc::new(ApiState {
            broker,
            store,
            recommendations,
            scheduler: scheduler.clone(),
            now: chrono::Utc::now,
        });
        match api::spawn_api(state, cfg.api.port).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %format!("{e:#}"), "API server not started");
                None
            }
        }
    } else {
        info!("API disabled by config");
        None
    };

    // -- Wait for Ctrl+C -------------------------------------------------

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
    info!("Received Ctrl+C, shutting down");

    scheduler.shutdown().await;
    if let Some(handle) = server {
        handle.abort();
    }

    info!("kis-trader stopped");
    Ok(())
}

fn load_config(path: &str) -> Result<config::AppConfig> {
    config::AppConfig::load(path).inspect_err(|e| {
        error!(config = %path, error = %format!("{e:#}"), "Configuration could not be loaded");
    })
}

/// Initialise tracing. `RUST_LOG` overrides the default filter;
/// `KIS_TRADER_LOG_JSON` switches to JSON lines.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kis_trader=info"));

    let json_logging = std::env::var("KIS_TRADER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
