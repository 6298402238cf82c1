//! Brokerage integration (Korea Investment & Securities open API).
//!
//! Defines the `Brokerage` trait consumed by the account helpers,
//! scheduler and HTTP routes, plus the response envelope and request
//! types shared by every implementation:
//! - `client::KisClient` — the live REST client
//! - `token::TokenManager` — access-token cache and issuance gate
//! - `account` — multi-call compositions (all balances, deposit, brackets)
//! - `tr_id` — transaction-type tables

pub mod account;
pub mod client;
pub mod token;
pub mod tr_id;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Environment, Exchange, Side, TraderError};

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// Common response envelope.
///
/// `rt_cd == "0"` means success. Anything else is a brokerage-level
/// rejection; `msg_cd`/`msg1` explain why. Payload keys (`output`,
/// `output1`, `output2`, ...) land in `body`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub rt_cd: String,
    #[serde(default)]
    pub msg_cd: String,
    #[serde(default)]
    pub msg1: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ApiResponse {
    /// Synthesized when a successful response has no body.
    pub const NO_DATA: &'static str = "NODATA";
    /// Synthesized when a body is not valid JSON.
    pub const PARSE_ERROR: &'static str = "PARSEERR";
    /// Synthesized for inquiries the paper server does not offer.
    pub const MOCK_UNSUPPORTED: &'static str = "MOCK_UNSUPPORTED";

    /// Brokerage codes meaning the access token was rejected.
    const TOKEN_ERROR_CODES: &'static [&'static str] = &["EGW00121", "EGW00123"];
    /// Brokerage code for the per-second request limit.
    const RATE_LIMIT_CODE: &'static str = "EGW00201";

    /// Build a locally generated envelope with an empty `output` list.
    pub fn synthetic(success: bool, msg_cd: &str, msg1: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("output".into(), Value::Array(Vec::new()));
        Self {
            rt_cd: if success { "0" } else { "1" }.to_string(),
            msg_cd: msg_cd.to_string(),
            msg1: msg1.into(),
            body,
        }
    }

    pub fn success(body: Value) -> Self {
        let body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            rt_cd: "0".into(),
            msg_cd: String::new(),
            msg1: String::new(),
            body,
        }
    }

    pub fn failure(msg_cd: &str, msg1: impl Into<String>) -> Self {
        Self::synthetic(false, msg_cd, msg1)
    }

    pub fn is_success(&self) -> bool {
        self.rt_cd.trim() == "0"
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Rows under `key`. A single object is treated as one row.
    pub fn rows(&self, key: &str) -> Vec<Value> {
        match self.body.get(key) {
            Some(Value::Array(items)) => items.clone(),
            Some(obj @ Value::Object(_)) => vec![obj.clone()],
            _ => Vec::new(),
        }
    }

    /// The first row under `key`.
    pub fn first(&self, key: &str) -> Option<Value> {
        self.rows(key).into_iter().next()
    }

    pub fn is_token_error(&self) -> bool {
        let code = self.msg_cd.trim();
        Self::TOKEN_ERROR_CODES.contains(&code)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.msg_cd.trim() == Self::RATE_LIMIT_CODE || self.msg1.contains("초당")
    }

    /// The rejection as a domain error, for callers that cannot continue.
    pub fn rejection(&self) -> TraderError {
        TraderError::Rejected {
            code: self.msg_cd.clone(),
            message: self.msg1.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// `ORD_DVSN` for a limit order.
pub const LIMIT_ORDER: &str = "00";
/// `ORD_DVSN` for market-on-open; only valid for US sell reservations.
pub const MARKET_ON_OPEN: &str = "31";

fn limit_order() -> String {
    LIMIT_ORDER.to_string()
}

/// Immediate overseas cash order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub exchange: Exchange,
    pub symbol: String,
    pub quantity: u64,
    pub price: Decimal,
    pub side: Side,
    #[serde(default = "limit_order")]
    pub order_type: String,
}

impl OrderRequest {
    pub fn limit(exchange: Exchange, symbol: &str, quantity: u64, price: Decimal, side: Side) -> Self {
        Self {
            exchange,
            symbol: symbol.to_string(),
            quantity,
            price,
            side,
            order_type: limit_order(),
        }
    }
}

/// Order queued with the brokerage and transmitted at the next session
/// open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub exchange: Exchange,
    pub symbol: String,
    pub quantity: u64,
    pub price: Decimal,
    pub side: Side,
    #[serde(default = "limit_order")]
    pub order_type: String,
}

/// Purchasable-amount inquiry for a symbol at a given unit price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsAmountQuery {
    pub exchange: Exchange,
    pub symbol: String,
    pub price: Decimal,
}

/// Reservation-list inquiry over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationListQuery {
    pub exchange: Option<Exchange>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// `INQR_DVSN_CD`: "00" all, "01" regular, "02" fractional.
    pub inquiry_kind: String,
    /// `PRDT_TYPE_CD`; blank for all product types.
    pub product_type: String,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Operations the backend needs from the brokerage.
///
/// Rejections come back as non-success `ApiResponse`s; `Err` is reserved
/// for transport failures and local faults (e.g. no usable token).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Brokerage: Send + Sync {
    fn environment(&self) -> Environment;

    /// Domestic (KRW) balance; `output2` carries the deposit summary.
    async fn domestic_balance(&self) -> Result<ApiResponse>;

    /// Overseas balance for one exchange (`output1` positions,
    /// `output2` totals).
    async fn overseas_balance(&self, exchange: Exchange) -> Result<ApiResponse>;

    /// Last traded price; `output.last` is a decimal string.
    async fn current_price(&self, exchange: Exchange, symbol: &str) -> Result<ApiResponse>;

    async fn order(&self, req: &OrderRequest) -> Result<ApiResponse>;

    async fn reserve_order(&self, req: &ReservationRequest) -> Result<ApiResponse>;

    async fn purchasable_amount(&self, query: &PsAmountQuery) -> Result<ApiResponse>;

    /// Orders with unfilled quantity on an exchange.
    async fn outstanding_orders(&self, exchange: Exchange, sort: &str) -> Result<ApiResponse>;

    /// Order/fill history between two dates.
    async fn order_history(
        &self,
        exchange: Exchange,
        sort: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ApiResponse>;

    async fn reservation_orders(&self, query: &ReservationListQuery) -> Result<ApiResponse>;
}
