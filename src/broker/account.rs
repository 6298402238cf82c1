//! Account views composed from several brokerage calls.

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use super::{ApiResponse, Brokerage, PsAmountQuery, ReservationRequest, LIMIT_ORDER};
use crate::types::{field_f64, field_str, Exchange, Holding, Side, TraderError};

/// Delay between per-exchange balance calls.
pub const EXCHANGE_PACING: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Holdings
// ---------------------------------------------------------------------------

/// Positions across the three US exchanges.
///
/// An exchange whose inquiry fails is logged and skipped. The call fails
/// only when no exchange could be read, so the result may be partial.
/// Use [`all_overseas_holdings_strict`] where a missing exchange matters.
pub async fn all_overseas_holdings(broker: &dyn Brokerage, pacing: Duration) -> Result<Vec<Holding>> {
    let (holdings, mut failures) = read_holdings(broker, pacing).await;

    if holdings.read == 0 {
        if let Some((_, e)) = failures.pop() {
            return Err(e.context("No exchange balance could be read"));
        }
    }
    info!(positions = holdings.rows.len(), "Loaded overseas holdings");
    Ok(holdings.rows)
}

/// Positions across the three US exchanges, failing if any exchange
/// could not be read.
pub async fn all_overseas_holdings_strict(broker: &dyn Brokerage, pacing: Duration) -> Result<Vec<Holding>> {
    let (holdings, mut failures) = read_holdings(broker, pacing).await;

    if let Some((exchange, e)) = failures.pop() {
        let unread: Vec<String> = failures
            .iter()
            .map(|(ex, _)| ex.to_string())
            .chain(std::iter::once(exchange.to_string()))
            .collect();
        return Err(e.context(format!("Balance unreadable for {}", unread.join(", "))));
    }
    info!(positions = holdings.rows.len(), "Loaded overseas holdings");
    Ok(holdings.rows)
}

struct HoldingsRead {
    rows: Vec<Holding>,
    read: usize,
}

async fn read_holdings(broker: &dyn Brokerage, pacing: Duration) -> (HoldingsRead, Vec<(Exchange, anyhow::Error)>) {
    let mut holdings = HoldingsRead { rows: Vec::new(), read: 0 };
    let mut failures = Vec::new();

    for (i, exchange) in Exchange::US.into_iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(pacing).await;
        }
        match broker.overseas_balance(exchange).await {
            Ok(resp) if resp.is_success() => {
                holdings.read += 1;
                holdings.rows.extend(resp.rows("output1").iter().filter_map(Holding::from_output));
            }
            Ok(resp) => {
                warn!(exchange = %exchange, msg_cd = %resp.msg_cd, msg = %resp.msg1, "Balance inquiry rejected");
                failures.push((exchange, resp.rejection().into()));
            }
            Err(e) => {
                warn!(exchange = %exchange, error = %e, "Balance inquiry failed");
                failures.push((exchange, e));
            }
        }
    }
    (holdings, failures)
}

// ---------------------------------------------------------------------------
// Deposit
// ---------------------------------------------------------------------------

/// Candidate keys for the USD deposit in the overseas balance summary.
/// The field name differs between server versions.
const USD_DEPOSIT_KEYS: &[&str] = &[
    "frcr_dncl_amt1",
    "frcr_dncl_amt_1",
    "frcr_dncl_amt2",
    "frcr_dncl_amt_2",
    "frcr_cblc_amt",
];

const USD_ORDERABLE_KEYS: &[&str] = &[
    "frcr_ord_psbl_amt1",
    "frcr_ord_psbl_amt_1",
    "frcr_ord_psbl_amt2",
    "frcr_ord_psbl_amt_2",
];

/// KRW cash from the domestic balance summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomesticDeposit {
    pub total_deposit: f64,
    pub next_day_settlement: f64,
    pub pending_settlement: f64,
    pub cma_value: f64,
    pub total_value: f64,
}

impl DomesticDeposit {
    fn from_output(row: &Value) -> Self {
        let amount = |key: &str| field_f64(row, key).unwrap_or(0.0);
        Self {
            total_deposit: amount("dnca_tot_amt"),
            next_day_settlement: amount("nxdy_excc_amt"),
            pending_settlement: amount("prvs_rcdl_excc_amt"),
            cma_value: amount("cma_evlu_amt"),
            total_value: amount("tot_evlu_amt"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverseasDeposit {
    pub usd_deposit: f64,
    pub usd_orderable: f64,
    /// KRW equivalent of `usd_orderable` at `exchange_rate`; 0 when the
    /// rate is unknown.
    pub krw_orderable: f64,
    pub exchange_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositInfo {
    /// `None` when the domestic inquiry was rejected.
    pub domestic: Option<DomesticDeposit>,
    pub overseas: OverseasDeposit,
}

fn first_present(row: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find(|k| !field_str(row, k).is_empty())
        .and_then(|k| field_f64(row, k))
}

/// KRW and USD cash available in the account.
///
/// The USD figures come from a purchasable-amount inquiry (the symbol and
/// price do not affect the cash figure) and are then corrected from the
/// overseas balance summary when it reports them.
pub async fn deposit_info(broker: &dyn Brokerage) -> Result<DepositInfo> {
    let domestic = broker.domestic_balance().await?;
    let domestic = if domestic.is_success() {
        domestic.first("output2").map(|row| DomesticDeposit::from_output(&row))
    } else {
        warn!(msg = %domestic.msg1, "Domestic balance rejected");
        None
    };

    let mut overseas = OverseasDeposit::default();

    let probe = PsAmountQuery {
        exchange: Exchange::Nasd,
        symbol: "AAPL".into(),
        price: Decimal::ONE,
    };
    let ps = broker.purchasable_amount(&probe).await?;
    if let (true, Some(row)) = (ps.is_success(), ps.first("output")) {
        let usd = (field_f64(&row, "ord_psbl_frcr_amt").unwrap_or(0.0) * 100.0).round() / 100.0;
        let rate = field_f64(&row, "exrt").unwrap_or(0.0);
        overseas.usd_deposit = usd;
        overseas.usd_orderable = usd;
        overseas.exchange_rate = rate;
        overseas.krw_orderable = if rate > 0.0 { (usd * rate).round() } else { 0.0 };
    } else if !ps.is_success() {
        warn!(msg = %ps.msg1, "Purchasable amount rejected");
    }

    let balance = broker.overseas_balance(Exchange::Nasd).await?;
    if let (true, Some(summary)) = (balance.is_success(), balance.first("output2")) {
        if let Some(v) = first_present(&summary, USD_DEPOSIT_KEYS) {
            overseas.usd_deposit = v;
        }
        if let Some(v) = first_present(&summary, USD_ORDERABLE_KEYS) {
            overseas.usd_orderable = v;
        }
    }

    Ok(DepositInfo { domestic, overseas })
}

// ---------------------------------------------------------------------------
// Conditional (bracket) orders
// ---------------------------------------------------------------------------

fn default_stop_loss() -> Decimal {
    Decimal::new(-5, 0)
}

fn default_take_profit() -> Decimal {
    Decimal::new(5, 0)
}

/// Stop-loss / take-profit reservation pair for a held position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalOrderRequest {
    pub exchange: Exchange,
    pub symbol: String,
    /// Defaults to the average purchase price.
    #[serde(default)]
    pub base_price: Option<Decimal>,
    /// Percent from the base; a leg is only placed when negative.
    #[serde(default = "default_stop_loss")]
    pub stop_loss_pct: Decimal,
    /// Percent from the base; a leg is only placed when positive.
    #[serde(default = "default_take_profit")]
    pub take_profit_pct: Decimal,
    /// Defaults to the orderable quantity.
    #[serde(default)]
    pub quantity: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegKind {
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegResult {
    pub kind: LegKind,
    pub price: Decimal,
    pub response: ApiResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionalStatus {
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalOrderReport {
    pub status: ConditionalStatus,
    pub message: String,
    pub base_price: Decimal,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    pub legs: Vec<LegResult>,
}

fn offset_price(base: Decimal, pct: Decimal) -> Decimal {
    (base * (Decimal::ONE + pct / Decimal::ONE_HUNDRED)).round_dp(2)
}

/// Place sell reservations at a stop-loss and a take-profit level.
///
/// Legs are submitted independently; one leg failing does not cancel
/// the other.
pub async fn create_conditional_orders(
    broker: &dyn Brokerage,
    req: &ConditionalOrderRequest,
) -> Result<ConditionalOrderReport> {
    let balance = broker.overseas_balance(req.exchange).await?;
    if !balance.is_success() {
        return Err(balance.rejection().into());
    }

    let holding = balance
        .rows("output1")
        .iter()
        .filter_map(Holding::from_output)
        .find(|h| h.symbol == req.symbol)
        .ok_or_else(|| TraderError::InvalidInput(format!("{} is not held", req.symbol)))?;

    let base = match req.base_price {
        Some(p) => p,
        None => Decimal::try_from(holding.avg_price).unwrap_or(Decimal::ZERO),
    };
    if base <= Decimal::ZERO {
        return Err(TraderError::InvalidInput(format!("invalid base price {base}")).into());
    }

    let quantity = req.quantity.unwrap_or(holding.orderable_quantity);
    if quantity == 0 {
        return Err(TraderError::InvalidInput(format!("no orderable quantity for {}", req.symbol)).into());
    }

    let stop_loss_price = offset_price(base, req.stop_loss_pct);
    let take_profit_price = offset_price(base, req.take_profit_pct);

    let mut planned = Vec::new();
    if req.stop_loss_pct < Decimal::ZERO {
        planned.push((LegKind::StopLoss, stop_loss_price));
    }
    if req.take_profit_pct > Decimal::ZERO {
        planned.push((LegKind::TakeProfit, take_profit_price));
    }
    if planned.is_empty() {
        return Err(TraderError::InvalidInput(
            "stop loss must be negative or take profit positive".into(),
        )
        .into());
    }

    let mut legs = Vec::with_capacity(planned.len());
    for (kind, price) in planned {
        let order = ReservationRequest {
            exchange: req.exchange,
            symbol: req.symbol.clone(),
            quantity,
            price,
            side: Side::Sell,
            order_type: LIMIT_ORDER.into(),
        };
        let response = match broker.reserve_order(&order).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(symbol = %req.symbol, leg = ?kind, error = %e, "Conditional leg failed");
                ApiResponse::failure("ERROR", e.to_string())
            }
        };
        legs.push(LegResult { kind, price, response });
    }

    let succeeded = legs.iter().filter(|l| l.response.is_success()).count();
    let status = if succeeded == legs.len() {
        ConditionalStatus::Success
    } else if succeeded > 0 {
        ConditionalStatus::PartialSuccess
    } else {
        ConditionalStatus::Failed
    };

    info!(
        symbol = %req.symbol,
        base = base.to_f64().unwrap_or_default(),
        succeeded,
        total = legs.len(),
        "Conditional orders submitted"
    );

    Ok(ConditionalOrderReport {
        status,
        message: format!("{succeeded}/{} orders accepted", legs.len()),
        base_price: base,
        stop_loss_price,
        take_profit_price,
        legs,
    })
}
