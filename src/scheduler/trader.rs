//! Automatic order placement from recommendations.
//!
//! A run walks the candidate list once, quoting and ordering one ticker at
//! a time with pauses between calls to stay under the brokerage's
//! per-second limit. Per-ticker failures are recorded in the run report
//! and never stop the run.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::market_hours;
use crate::broker::account::all_overseas_holdings_strict;
use crate::broker::{ApiResponse, Brokerage, OrderRequest};
use crate::config::SchedulerConfig;
use crate::signals::{Catalog, RecommendationService};
use crate::types::{Exchange, Side};

/// Quantity of every automatic buy.
const AUTO_BUY_QUANTITY: u64 = 1;

// ---------------------------------------------------------------------------
// Market gate
// ---------------------------------------------------------------------------

/// Decides whether automatic trading may run right now.
pub trait MarketGate: Send + Sync {
    fn is_open(&self) -> bool;
}

/// Regular US session hours.
pub struct UsMarketHours;

impl MarketGate for UsMarketHours {
    fn is_open(&self) -> bool {
        market_hours::is_us_market_open(Utc::now())
    }
}

// ---------------------------------------------------------------------------
// Pacing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TradePacing {
    pub balance: Duration,
    pub after_buy: Duration,
    pub after_sell: Duration,
    pub after_error: Duration,
    pub rate_limit_backoff: Duration,
    pub empty_price_backoff: Duration,
}

impl From<&SchedulerConfig> for TradePacing {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            balance: Duration::from_millis(cfg.balance_pacing_ms),
            after_buy: Duration::from_millis(cfg.buy_pacing_ms),
            after_sell: Duration::from_millis(cfg.sell_pacing_ms),
            after_error: Duration::from_millis(cfg.error_pacing_ms),
            rate_limit_backoff: Duration::from_millis(cfg.rate_limit_backoff_ms),
            empty_price_backoff: Duration::from_millis(cfg.empty_price_backoff_ms),
        }
    }
}

impl Default for TradePacing {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    MarketClosed,
    /// The run could not start (holdings or candidates unavailable).
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedOrder {
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: u64,
    pub price: Decimal,
    /// Brokerage order number, when reported.
    pub order_no: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickerNote {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeReport {
    pub run_id: Uuid,
    pub side: Side,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub placed: Vec<PlacedOrder>,
    pub skipped: Vec<TickerNote>,
    pub failed: Vec<TickerNote>,
}

impl TradeReport {
    fn new(run_id: Uuid, side: Side) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            side,
            status: RunStatus::Completed,
            started_at: now,
            finished_at: now,
            candidates: 0,
            placed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn skip(&mut self, symbol: &str, reason: impl Into<String>) {
        self.skipped.push(TickerNote {
            symbol: symbol.to_string(),
            reason: reason.into(),
        });
    }

    fn fail(&mut self, symbol: &str, reason: impl Into<String>) {
        self.failed.push(TickerNote {
            symbol: symbol.to_string(),
            reason: reason.into(),
        });
    }

    fn finish(mut self, status: RunStatus) -> Self {
        self.status = status;
        self.finished_at = Utc::now();
        self
    }
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

enum Quote {
    Price(Decimal),
    /// Brokerage rejected the quote request.
    Rejected(ApiResponse),
    /// `output.last` was blank, usually a transient gap.
    Empty,
    Invalid(String),
}

fn read_quote(resp: ApiResponse) -> Quote {
    if !resp.is_success() {
        return Quote::Rejected(resp);
    }
    let last = resp
        .get("output")
        .and_then(|o| o.get("last"))
        .map(|v| match v {
            serde_json::Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    if last.is_empty() {
        return Quote::Empty;
    }
    match Decimal::from_str(&last) {
        Ok(p) if p > Decimal::ZERO => Quote::Price(p),
        _ => Quote::Invalid(last),
    }
}

fn order_no(resp: &ApiResponse) -> Option<String> {
    resp.first("output")
        .and_then(|o| o.get("ODNO").and_then(|v| v.as_str()).map(str::to_string))
}

// ---------------------------------------------------------------------------
// Trader
// ---------------------------------------------------------------------------

pub struct AutoTrader {
    broker: Arc<dyn Brokerage>,
    recommendations: Arc<RecommendationService>,
    gate: Arc<dyn MarketGate>,
    pacing: TradePacing,
    /// Held for the whole of a buy or sell run.
    trade_lock: Mutex<()>,
    last_buy: RwLock<Option<TradeReport>>,
    last_sell: RwLock<Option<TradeReport>>,
}

impl AutoTrader {
    pub fn new(
        broker: Arc<dyn Brokerage>,
        recommendations: Arc<RecommendationService>,
        gate: Arc<dyn MarketGate>,
        pacing: TradePacing,
    ) -> Self {
        Self {
            broker,
            recommendations,
            gate,
            pacing,
            trade_lock: Mutex::new(()),
            last_buy: RwLock::new(None),
            last_sell: RwLock::new(None),
        }
    }

    pub async fn last_buy(&self) -> Option<TradeReport> {
        self.last_buy.read().await.clone()
    }

    pub async fn last_sell(&self) -> Option<TradeReport> {
        self.last_sell.read().await.clone()
    }

    /// Buy one unit of each recommended ticker not already held.
    pub async fn run_auto_buy(&self) -> TradeReport {
        let run_id = Uuid::new_v4();
        let report = async {
            let _guard = self.trade_lock.lock().await;
            self.auto_buy(TradeReport::new(run_id, Side::Buy)).await
        }
        .instrument(info_span!("auto_buy", %run_id))
        .await;

        *self.last_buy.write().await = Some(report.clone());
        report
    }

    /// Sell every held position a sell rule flags, at the last price.
    pub async fn run_auto_sell(&self) -> TradeReport {
        let run_id = Uuid::new_v4();
        let report = async {
            let _guard = self.trade_lock.lock().await;
            self.auto_sell(TradeReport::new(run_id, Side::Sell)).await
        }
        .instrument(info_span!("auto_sell", %run_id))
        .await;

        *self.last_sell.write().await = Some(report.clone());
        report
    }

    async fn auto_buy(&self, mut report: TradeReport) -> TradeReport {
        if !self.gate.is_open() {
            info!("US market closed, skipping auto-buy");
            return report.finish(RunStatus::MarketClosed);
        }

        let held: std::collections::HashSet<String> =
            match all_overseas_holdings_strict(self.broker.as_ref(), self.pacing.balance).await {
                Ok(h) => h.into_iter().map(|h| h.symbol).collect(),
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Holdings unavailable, aborting auto-buy");
                    return report.finish(RunStatus::Aborted(format!("holdings unavailable: {e}")));
                }
            };
        info!(held = held.len(), "Current holdings loaded");

        let candidates = match self.recommendations.buy_candidates().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Buy candidates unavailable");
                return report.finish(RunStatus::Aborted(format!("candidates unavailable: {e}")));
            }
        };
        report.candidates = candidates.len();
        if candidates.is_empty() {
            info!("No buy candidates");
            return report.finish(RunStatus::Completed);
        }
        info!(count = candidates.len(), "Evaluating buy candidates");

        for candidate in &candidates {
            let (symbol, exchange) = Catalog::listing(&candidate.ticker);
            if held.contains(&symbol) {
                info!(symbol = %symbol, "Already held, not buying");
                report.skip(&symbol, "already held");
                continue;
            }

            let price = match self.broker.current_price(exchange, &symbol).await {
                Ok(resp) => match read_quote(resp) {
                    Quote::Price(p) => p,
                    Quote::Rejected(resp) => {
                        warn!(symbol = %symbol, msg = %resp.msg1, "Quote rejected");
                        report.skip(&symbol, format!("quote rejected: {}", resp.msg1));
                        continue;
                    }
                    Quote::Empty => {
                        report.skip(&symbol, "no last price");
                        continue;
                    }
                    Quote::Invalid(raw) => {
                        warn!(symbol = %symbol, price = %raw, "Invalid last price");
                        report.skip(&symbol, format!("invalid price {raw}"));
                        continue;
                    }
                },
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "Quote failed");
                    report.fail(&symbol, format!("quote failed: {e}"));
                    continue;
                }
            };

            let order = OrderRequest::limit(exchange, &symbol, AUTO_BUY_QUANTITY, price, Side::Buy);
            info!(
                symbol = %symbol,
                name = %candidate.name,
                score = candidate.composite_score,
                price = %price,
                "Placing auto-buy"
            );
            match self.broker.order(&order).await {
                Ok(resp) if resp.is_success() => {
                    info!(symbol = %symbol, msg = %resp.msg1, "Buy order accepted");
                    report.placed.push(PlacedOrder {
                        symbol: symbol.clone(),
                        exchange,
                        quantity: AUTO_BUY_QUANTITY,
                        price,
                        order_no: order_no(&resp),
                    });
                }
                Ok(resp) => {
                    error!(symbol = %symbol, msg_cd = %resp.msg_cd, msg = %resp.msg1, "Buy order rejected");
                    report.fail(&symbol, format!("order rejected: {}", resp.msg1));
                }
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "Buy order failed");
                    report.fail(&symbol, format!("order failed: {e}"));
                    continue;
                }
            }
            tokio::time::sleep(self.pacing.after_buy).await;
        }

        info!(
            placed = report.placed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Auto-buy finished"
        );
        report.finish(RunStatus::Completed)
    }

    async fn auto_sell(&self, mut report: TradeReport) -> TradeReport {
        if !self.gate.is_open() {
            info!("US market closed, skipping auto-sell");
            return report.finish(RunStatus::MarketClosed);
        }

        let candidates = match self.recommendations.sell_candidates().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Sell candidates unavailable");
                return report.finish(RunStatus::Aborted(format!("candidates unavailable: {e}")));
            }
        };
        report.candidates = candidates.len();
        if candidates.is_empty() {
            info!("No sell candidates");
            return report.finish(RunStatus::Completed);
        }
        info!(count = candidates.len(), "Evaluating sell candidates");

        for candidate in &candidates {
            let symbol = candidate.symbol.as_str();
            info!(symbol, reasons = %candidate.reasons.join("; "), "Sell rule triggered");

            let exchange = match Exchange::from_str(&candidate.exchange) {
                Ok(e) => e,
                Err(e) => {
                    report.skip(symbol, e.to_string());
                    continue;
                }
            };

            let price = match self.broker.current_price(exchange, symbol).await {
                Ok(resp) => match read_quote(resp) {
                    Quote::Price(p) => p,
                    Quote::Rejected(resp) => {
                        error!(symbol, msg = %resp.msg1, "Quote rejected");
                        if resp.is_rate_limited() {
                            tokio::time::sleep(self.pacing.rate_limit_backoff).await;
                        }
                        report.skip(symbol, format!("quote rejected: {}", resp.msg1));
                        continue;
                    }
                    Quote::Empty => {
                        warn!(symbol, "Empty last price, retrying next run");
                        tokio::time::sleep(self.pacing.empty_price_backoff).await;
                        report.skip(symbol, "no last price");
                        continue;
                    }
                    Quote::Invalid(raw) => {
                        error!(symbol, price = %raw, "Invalid last price");
                        report.skip(symbol, format!("invalid price {raw}"));
                        continue;
                    }
                },
                Err(e) => {
                    error!(symbol, error = %e, "Quote failed");
                    report.fail(symbol, format!("quote failed: {e}"));
                    tokio::time::sleep(self.pacing.after_error).await;
                    continue;
                }
            };

            let order = OrderRequest::limit(exchange, symbol, candidate.quantity, price, Side::Sell);
            info!(symbol, quantity = candidate.quantity, price = %price, "Placing auto-sell");
            match self.broker.order(&order).await {
                Ok(resp) if resp.is_success() => {
                    info!(symbol, msg = %resp.msg1, "Sell order accepted");
                    report.placed.push(PlacedOrder {
                        symbol: symbol.to_string(),
                        exchange,
                        quantity: candidate.quantity,
                        price,
                        order_no: order_no(&resp),
                    });
                }
                Ok(resp) => {
                    error!(symbol, msg_cd = %resp.msg_cd, msg = %resp.msg1, "Sell order rejected");
                    report.fail(symbol, format!("order rejected: {}", resp.msg1));
                }
                Err(e) => {
                    error!(symbol, error = %e, "Sell order failed");
                    report.fail(symbol, format!("order failed: {e}"));
                    tokio::time::sleep(self.pacing.after_error).await;
                    continue;
                }
            }
            tokio::time::sleep(self.pacing.after_sell).await;
        }

        info!(
            placed = report.placed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Auto-sell finished"
        );
        report.finish(RunStatus::Completed)
    }
}
