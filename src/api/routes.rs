//! HTTP route handlers.
//!
//! Brokerage envelopes are returned as-is on success. A rejection becomes
//! a 400 carrying `msg_cd`/`msg1`; local faults become a 500.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Asia::Seoul;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::broker::account::{self, ConditionalOrderReport, ConditionalOrderRequest, DepositInfo};
use crate::broker::{
    ApiResponse, Brokerage, OrderRequest, PsAmountQuery, ReservationListQuery, ReservationRequest,
};
use crate::config::CatalogEntry;
use crate::scheduler::market_hours::is_reservation_window;
use crate::scheduler::{JobKind, RefreshReport, Scheduler, SchedulerStatus, TradeReport};
use crate::signals::RecommendationService;
use crate::storage::Store;
use crate::types::{
    BuyCandidate, Exchange, Holding, PredictionResult, PriceBar, SellCandidate, SentimentScore,
    TechnicalSignal, TraderError,
};

/// Brokerage text returned when a reservation arrives outside its window.
const NOT_RESERVATION_TIME: &str = "예약주문접수가능시간이 아닙니다";

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ApiState {
    pub broker: Arc<dyn Brokerage>,
    pub store: Arc<dyn Store>,
    pub recommendations: Arc<RecommendationService>,
    pub scheduler: Arc<Scheduler>,
    /// Wall clock used for the reservation window check.
    pub now: fn() -> DateTime<Utc>,
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Brokerage(ApiResponse),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<TraderError>() {
            Some(TraderError::Rejected { code, message }) => {
                ApiError::Brokerage(ApiResponse::failure(code, message.clone()))
            }
            Some(TraderError::InvalidInput(_)) | Some(TraderError::UnsupportedExchange(_)) => {
                ApiError::BadRequest(e.to_string())
            }
            _ => ApiError::Internal(e),
        }
    }
}

impl From<TraderError> for ApiError {
    fn from(e: TraderError) -> Self {
        anyhow::Error::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Brokerage(resp) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": resp.msg1, "rt_cd": resp.rt_cd, "msg_cd": resp.msg_cd }),
            ),
            ApiError::Internal(e) => {
                error!(error = %format!("{e:#}"), "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() }))
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Pass a successful envelope through; turn a rejection into a 400.
fn envelope(resp: ApiResponse) -> ApiResult<ApiResponse> {
    if resp.is_success() {
        Ok(Json(resp))
    } else {
        Err(ApiError::Brokerage(resp))
    }
}

fn parse_exchange(raw: &str) -> Result<Exchange, ApiError> {
    raw.parse::<Exchange>().map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Balances and quotes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ExchangeParams {
    #[serde(default = "default_exchange")]
    pub exchange: String,
}

fn default_exchange() -> String {
    Exchange::Nasd.code().to_string()
}

pub async fn domestic_balance(State(state): State<AppState>) -> ApiResult<ApiResponse> {
    envelope(state.broker.domestic_balance().await?)
}

pub async fn overseas_balance(
    State(state): State<AppState>,
    Query(params): Query<ExchangeParams>,
) -> ApiResult<ApiResponse> {
    let exchange = parse_exchange(&params.exchange)?;
    envelope(state.broker.overseas_balance(exchange).await?)
}

/// Positions across the three US exchanges.
pub async fn holdings(State(state): State<AppState>) -> ApiResult<Vec<Holding>> {
    let holdings =
        account::all_overseas_holdings(state.broker.as_ref(), account::EXCHANGE_PACING).await?;
    Ok(Json(holdings))
}

pub async fn deposit(State(state): State<AppState>) -> ApiResult<DepositInfo> {
    Ok(Json(account::deposit_info(state.broker.as_ref()).await?))
}

#[derive(Debug, Deserialize)]
pub struct PsAmountParams {
    pub exchange: String,
    pub symbol: String,
    pub price: Decimal,
}

pub async fn purchasable_amount(
    State(state): State<AppState>,
    Query(params): Query<PsAmountParams>,
) -> ApiResult<ApiResponse> {
    let query = PsAmountQuery {
        exchange: parse_exchange(&params.exchange)?,
        symbol: params.symbol,
        price: params.price,
    };
    envelope(state.broker.purchasable_amount(&query).await?)
}

#[derive(Debug, Deserialize)]
pub struct QuoteParams {
    pub exchange: String,
    pub symbol: String,
}

pub async fn quote(
    State(state): State<AppState>,
    Query(params): Query<QuoteParams>,
) -> ApiResult<ApiResponse> {
    let exchange = parse_exchange(&params.exchange)?;
    envelope(state.broker.current_price(exchange, &params.symbol).await?)
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OutstandingParams {
    pub exchange: String,
    /// "DS" ascending, anything else descending.
    #[serde(default = "default_sort")]
    pub sort: String,
}

fn default_sort() -> String {
    "DS".into()
}

pub async fn outstanding_orders(
    State(state): State<AppState>,
    Query(params): Query<OutstandingParams>,
) -> ApiResult<ApiResponse> {
    let exchange = parse_exchange(&params.exchange)?;
    envelope(state.broker.outstanding_orders(exchange, &params.sort).await?)
}

#[derive(Debug, Deserialize)]
pub struct ReservationListParams {
    #[serde(default)]
    pub exchange: Option<String>,
    /// YYYYMMDD
    pub start: String,
    /// YYYYMMDD
    pub end: String,
    #[serde(default = "default_inquiry_kind")]
    pub inquiry_kind: String,
    #[serde(default)]
    pub product_type: String,
}

fn default_inquiry_kind() -> String {
    "00".into()
}

fn parse_yyyymmdd(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y%m%d")
        .map_err(|_| ApiError::BadRequest(format!("invalid date {raw:?}, expected YYYYMMDD")))
}

pub async fn reservation_orders(
    State(state): State<AppState>,
    Query(params): Query<ReservationListParams>,
) -> ApiResult<ApiResponse> {
    let start = parse_yyyymmdd(&params.start)?;
    let end = parse_yyyymmdd(&params.end)?;
    if end < start {
        return Err(ApiError::BadRequest("end date must not precede start date".into()));
    }
    let exchange = match params.exchange.as_deref().filter(|e| !e.trim().is_empty()) {
        Some(raw) => Some(parse_exchange(raw)?),
        None => None,
    };
    let query = ReservationListQuery {
        exchange,
        start,
        end,
        inquiry_kind: params.inquiry_kind,
        product_type: params.product_type,
    };
    envelope(state.broker.reservation_orders(&query).await?)
}

pub async fn place_order(
    State(state): State<AppState>,
    Json(req): Json<OrderRequest>,
) -> ApiResult<ApiResponse> {
    if req.quantity == 0 {
        return Err(ApiError::BadRequest("quantity must be positive".into()));
    }
    info!(symbol = %req.symbol, exchange = %req.exchange, side = %req.side, quantity = req.quantity, "Manual order");
    envelope(state.broker.order(&req).await?)
}

fn window_message(now: DateTime<Utc>) -> String {
    format!(
        "Not within the reservation window (now {} KST; accepted 10:00-23:20 except 16:30-16:45)",
        now.with_timezone(&Seoul).format("%H:%M:%S")
    )
}

pub async fn reserve_order(
    State(state): State<AppState>,
    Json(req): Json<ReservationRequest>,
) -> ApiResult<ApiResponse> {
    let now = (state.now)();
    if req.exchange.is_us() && !is_reservation_window(now) {
        return Err(ApiError::BadRequest(window_message(now)));
    }

    let resp = state.broker.reserve_order(&req).await?;
    if !resp.is_success() && resp.msg1.contains(NOT_RESERVATION_TIME) {
        return Err(ApiError::Brokerage(ApiResponse::failure(&resp.msg_cd, window_message(now))));
    }
    envelope(resp)
}

pub async fn conditional_order(
    State(state): State<AppState>,
    Json(req): Json<ConditionalOrderRequest>,
) -> ApiResult<ConditionalOrderReport> {
    Ok(Json(account::create_conditional_orders(state.broker.as_ref(), &req).await?))
}

// ---------------------------------------------------------------------------
// Recommendations and signals
// ---------------------------------------------------------------------------

pub async fn buy_candidates(State(state): State<AppState>) -> ApiResult<Vec<BuyCandidate>> {
    Ok(Json(state.recommendations.buy_candidates().await?))
}

pub async fn sell_candidates(State(state): State<AppState>) -> ApiResult<Vec<SellCandidate>> {
    Ok(Json(state.recommendations.sell_candidates().await?))
}

pub async fn predictions(State(state): State<AppState>) -> ApiResult<Vec<PredictionResult>> {
    Ok(Json(state.recommendations.prediction_recommendations().await?))
}

pub async fn generate_signals(State(state): State<AppState>) -> ApiResult<Vec<TechnicalSignal>> {
    Ok(Json(state.recommendations.generate_technical_signals().await?))
}

pub async fn refresh_sentiment(State(state): State<AppState>) -> ApiResult<Vec<SentimentScore>> {
    Ok(Json(state.recommendations.refresh_sentiment().await?))
}

pub async fn catalog(State(state): State<AppState>) -> Json<Vec<CatalogEntry>> {
    Json(state.recommendations.catalog().entries().to_vec())
}

// ---------------------------------------------------------------------------
// Model inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub accepted: usize,
}

/// Daily closes fed by the offline market-data job.
pub async fn upsert_prices(
    State(state): State<AppState>,
    Json(bars): Json<Vec<PriceBar>>,
) -> ApiResult<Accepted> {
    if let Some(bad) = bars.iter().find(|b| !b.close.is_finite() || b.close <= 0.0) {
        return Err(ApiError::BadRequest(format!(
            "invalid close {} for {} on {}",
            bad.close, bad.ticker, bad.date
        )));
    }
    state.store.upsert_prices(&bars).await?;
    Ok(Json(Accepted { accepted: bars.len() }))
}

/// Predictions fed by the offline model.
pub async fn insert_predictions(
    State(state): State<AppState>,
    Json(rows): Json<Vec<PredictionResult>>,
) -> ApiResult<Accepted> {
    for row in &rows {
        state.store.insert_prediction(row).await?;
    }
    Ok(Json(Accepted { accepted: rows.len() }))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status().await)
}

fn job_kind(raw: &str) -> Result<JobKind, ApiError> {
    match raw {
        "buy" => Ok(JobKind::AutoBuy),
        "sell" => Ok(JobKind::AutoSell),
        "refresh" => Ok(JobKind::Refresh),
        other => Err(ApiError::BadRequest(format!("unknown job {other:?}"))),
    }
}

#[derive(Debug, Serialize)]
pub struct JobToggle {
    pub job: JobKind,
    /// `false` when the job was already in the requested state.
    pub changed: bool,
    pub running: bool,
}

pub async fn start_job(State(state): State<AppState>, Path(job): Path<String>) -> ApiResult<JobToggle> {
    let job = job_kind(&job)?;
    let changed = state.scheduler.start(job).await;
    Ok(Json(JobToggle {
        job,
        changed,
        running: true,
    }))
}

pub async fn stop_job(State(state): State<AppState>, Path(job): Path<String>) -> ApiResult<JobToggle> {
    let job = job_kind(&job)?;
    let changed = state.scheduler.stop(job).await;
    Ok(Json(JobToggle {
        job,
        changed,
        running: false,
    }))
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RunResult {
    Trade(TradeReport),
    Refresh(RefreshReport),
}

pub async fn run_job(State(state): State<AppState>, Path(job): Path<String>) -> ApiResult<RunResult> {
    let result = match job_kind(&job)? {
        JobKind::AutoBuy => RunResult::Trade(state.scheduler.run_auto_buy_now().await),
        JobKind::AutoSell => RunResult::Trade(state.scheduler.run_auto_sell_now().await),
        JobKind::Refresh => RunResult::Refresh(state.scheduler.run_refresh_now().await?),
    };
    Ok(Json(result))
}
