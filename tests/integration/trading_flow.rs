//! End-to-end trading flow over the in-memory brokerage.
//!
//! Seeds daily closes and model predictions, regenerates signals, then
//! drives the auto-buy and auto-sell runs and the scheduler.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use kis_trader::broker::Brokerage;
use kis_trader::config::{CatalogEntry, SchedulerConfig, StrategyConfig};
use kis_trader::scheduler::{AutoTrader, MarketGate, RunStatus, Scheduler, TradePacing};
use kis_trader::signals::{Catalog, RecommendationService, ServicePacing};
use kis_trader::storage::{MemoryStore, Store};
use kis_trader::types::{Exchange, PredictionResult, PriceBar, Side};

use crate::mock_broker::{MockBroker, Position};

struct AlwaysOpen;

impl MarketGate for AlwaysOpen {
    fn is_open(&self) -> bool {
        true
    }
}

fn fast_pacing() -> TradePacing {
    let ms = Duration::from_millis(1);
    TradePacing {
        balance: ms,
        after_buy: ms,
        after_sell: ms,
        after_error: ms,
        rate_limit_backoff: ms,
        empty_price_backoff: ms,
    }
}

fn catalog() -> Catalog {
    let e = |t: &str, n: &str| CatalogEntry {
        ticker: t.into(),
        name: n.into(),
        etf: false,
    };
    Catalog::new(vec![
        e("AAPL", "Apple"),
        e("AMZN", "Amazon"),
        e("MSFT", "Microsoft"),
        e("KO.N", "Coca-Cola"),
    ])
}

/// 60 daily closes compounding at `daily` per day, ending today.
fn series(ticker: &str, start: f64, daily: f64) -> Vec<PriceBar> {
    let today = Utc::now().date_naive();
    (0..60)
        .map(|i| PriceBar {
            ticker: ticker.to_string(),
            date: today - ChronoDuration::days(59 - i),
            close: start * daily.powi(i as i32),
        })
        .collect()
}

fn prediction(ticker: &str, rise: f64) -> PredictionResult {
    PredictionResult {
        ticker: ticker.to_string(),
        prediction_date: Utc::now().date_naive(),
        last_close: 100.0,
        predicted_close: 100.0 + rise,
        rise_probability: rise,
        accuracy: 90.0,
        created_at: Utc::now(),
    }
}

struct Harness {
    broker: Arc<MockBroker>,
    recommendations: Arc<RecommendationService>,
    trader: Arc<AutoTrader>,
}

async fn harness() -> Harness {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut bars = series("AAPL", 150.0, 1.01);
    bars.extend(series("AMZN", 120.0, 1.01));
    bars.extend(series("MSFT", 400.0, 0.99));
    bars.extend(series("KO.N", 70.0, 0.995));
    store.upsert_prices(&bars).await.unwrap();
    for (ticker, rise) in [("AAPL", 6.0), ("AMZN", 5.0), ("MSFT", 7.0)] {
        store.insert_prediction(&prediction(ticker, rise)).await.unwrap();
    }

    let broker = Arc::new(MockBroker::new());
    broker.hold(Position::new("AMZN", Exchange::Nasd, 2, 100.0, 101.0));
    broker.hold(Position::new("KO", Exchange::Nyse, 4, 60.0, 55.0));
    broker.quote("AAPL", "187.5000");
    broker.quote("KO", "55.10");

    let dyn_broker: Arc<dyn Brokerage> = broker.clone();
    let recommendations = Arc::new(RecommendationService::new(
        store,
        dyn_broker.clone(),
        None,
        catalog(),
        StrategyConfig::default(),
        ServicePacing {
            balance: Duration::ZERO,
            sentiment: Duration::ZERO,
        },
    ));
    let trader = Arc::new(AutoTrader::new(
        dyn_broker,
        recommendations.clone(),
        Arc::new(AlwaysOpen),
        fast_pacing(),
    ));
    Harness {
        broker,
        recommendations,
        trader,
    }
}

#[tokio::test]
async fn test_signals_drive_buy_and_sell() {
    let h = harness().await;

    let signals = h.recommendations.generate_technical_signals().await.unwrap();
    assert_eq!(signals.len(), 4);
    let aapl = signals.iter().find(|s| s.ticker == "AAPL").unwrap();
    assert!(aapl.golden_cross && aapl.macd_buy_signal && aapl.recommended);
    let msft = signals.iter().find(|s| s.ticker == "MSFT").unwrap();
    assert!(!msft.recommended);

    let buy = h.trader.run_auto_buy().await;
    assert_eq!(buy.status, RunStatus::Completed);
    assert_eq!(buy.candidates, 2);
    assert_eq!(buy.placed.len(), 1);
    assert_eq!(buy.placed[0].symbol, "AAPL");
    assert_eq!(buy.placed[0].price, dec!(187.5));
    assert_eq!(buy.skipped[0].symbol, "AMZN");

    let sell = h.trader.run_auto_sell().await;
    assert_eq!(sell.status, RunStatus::Completed);
    assert_eq!(sell.placed.len(), 1);
    assert_eq!(sell.placed[0].symbol, "KO");
    assert_eq!(sell.placed[0].exchange, Exchange::Nyse);

    let orders = h.broker.orders();
    assert_eq!(orders.len(), 2);
    assert_eq!((orders[0].side, orders[0].quantity), (Side::Buy, 1));
    assert_eq!((orders[1].side, orders[1].quantity), (Side::Sell, 4));
    assert_eq!(orders[1].price, dec!(55.10));
}

#[tokio::test]
async fn test_unreadable_holdings_abort_buy() {
    let h = harness().await;
    h.recommendations.generate_technical_signals().await.unwrap();
    h.broker.set_error("connection refused");

    let report = h.trader.run_auto_buy().await;
    assert!(matches!(report.status, RunStatus::Aborted(_)));
    assert!(h.broker.orders().is_empty());
}

#[tokio::test]
async fn test_rejected_orders_are_reported_not_fatal() {
    let h = harness().await;
    h.recommendations.generate_technical_signals().await.unwrap();
    h.broker.reject_orders("insufficient buying power");

    let report = h.trader.run_auto_buy().await;
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.placed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].reason.contains("insufficient buying power"));
}

#[tokio::test]
async fn test_concurrent_runs_both_complete() {
    let h = harness().await;
    h.recommendations.generate_technical_signals().await.unwrap();

    let (buy, sell) = tokio::join!(h.trader.run_auto_buy(), h.trader.run_auto_sell());
    assert_eq!(buy.placed.len() + sell.placed.len(), 2);
    assert_eq!(h.broker.orders().len(), 2);
    // The trade lock serialises the runs.
    assert!(buy.finished_at <= sell.started_at || sell.finished_at <= buy.started_at);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_sell_job() {
    let h = harness().await;
    h.recommendations.generate_technical_signals().await.unwrap();

    let cfg = SchedulerConfig {
        sell_interval_secs: 1,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(
        h.trader.clone(),
        h.recommendations.clone(),
        Arc::new(AlwaysOpen),
        &cfg,
    )
    .unwrap();

    assert!(scheduler.start_auto_sell().await);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(scheduler.stop_auto_sell().await);

    // Sold on each of the two firings; the mock keeps the position.
    let sells: Vec<_> = h.broker.orders().into_iter().filter(|o| o.side == Side::Sell).collect();
    assert_eq!(sells.len(), 2);
    let status = scheduler.status().await;
    assert!(status.jobs.iter().all(|j| !j.running));
    assert!(status.last_sell.is_some());
}
