//! Shared types for the trading backend.
//!
//! These types form the data model used across the broker, signal and
//! scheduler modules. Wire formats from the brokerage are mostly
//! stringly-typed JSON; the helpers here turn them into typed values once
//! so the rest of the crate never re-parses strings.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Brokerage environment. Mock is the paper-trading server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Real,
    #[default]
    Mock,
}

impl Environment {
    pub fn is_mock(&self) -> bool {
        matches!(self, Environment::Mock)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Real => write!(f, "real"),
            Environment::Mock => write!(f, "mock"),
        }
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Overseas exchange, identified by its order-side code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Exchange {
    /// NASDAQ
    Nasd,
    /// New York Stock Exchange
    Nyse,
    /// NYSE American
    Amex,
    /// Tokyo
    Tkse,
    /// Shanghai
    Shaa,
    /// Shenzhen
    Szaa,
    /// Hong Kong
    Sehk,
    /// Hanoi
    Hase,
    /// Ho Chi Minh City
    Vnse,
}

impl Exchange {
    /// The three US venues, in the order balances are polled.
    pub const US: [Exchange; 3] = [Exchange::Nasd, Exchange::Nyse, Exchange::Amex];

    /// Order/balance endpoint code (`OVRS_EXCG_CD`).
    pub fn code(&self) -> &'static str {
        match self {
            Exchange::Nasd => "NASD",
            Exchange::Nyse => "NYSE",
            Exchange::Amex => "AMEX",
            Exchange::Tkse => "TKSE",
            Exchange::Shaa => "SHAA",
            Exchange::Szaa => "SZAA",
            Exchange::Sehk => "SEHK",
            Exchange::Hase => "HASE",
            Exchange::Vnse => "VNSE",
        }
    }

    /// Quotation endpoint code (`EXCD`). The price API uses a different
    /// alphabet from the order API.
    pub fn quote_code(&self) -> &'static str {
        match self {
            Exchange::Nasd => "NAS",
            Exchange::Nyse => "NYS",
            Exchange::Amex => "AMS",
            Exchange::Tkse => "TSE",
            Exchange::Shaa => "SHS",
            Exchange::Szaa => "SZS",
            Exchange::Sehk => "HKS",
            Exchange::Hase => "HNX",
            Exchange::Vnse => "HSX",
        }
    }

    pub fn is_us(&self) -> bool {
        matches!(self, Exchange::Nasd | Exchange::Nyse | Exchange::Amex)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Exchange {
    type Err = TraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NASD" | "NAS" => Ok(Exchange::Nasd),
            "NYSE" | "NYS" => Ok(Exchange::Nyse),
            "AMEX" | "AMS" => Ok(Exchange::Amex),
            "TKSE" | "TSE" => Ok(Exchange::Tkse),
            "SHAA" | "SHS" => Ok(Exchange::Shaa),
            "SZAA" | "SZS" => Ok(Exchange::Szaa),
            "SEHK" | "HKS" => Ok(Exchange::Sehk),
            "HASE" | "HNX" => Ok(Exchange::Hase),
            "VNSE" | "HSX" => Ok(Exchange::Vnse),
            other => Err(TraderError::UnsupportedExchange(other.to_string())),
        }
    }
}

impl TryFrom<String> for Exchange {
    type Error = TraderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Exchange> for String {
    fn from(value: Exchange) -> Self {
        value.code().to_string()
    }
}

/// Split a catalog ticker into its bare symbol and listing venue.
///
/// Catalog tickers carry an optional venue suffix: `.N` for NYSE and `.X`
/// for NASDAQ. Unsuffixed tickers are assumed to trade on NASDAQ.
pub fn resolve_listing(ticker: &str) -> (String, Exchange) {
    if let Some(sym) = ticker.strip_suffix(".N") {
        (sym.to_string(), Exchange::Nyse)
    } else if let Some(sym) = ticker.strip_suffix(".X") {
        (sym.to_string(), Exchange::Nasd)
    } else {
        (ticker.to_string(), Exchange::Nasd)
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Read a numeric field the brokerage sends as a string (or occasionally
/// as a number). Blank and malformed values become `None`.
pub fn field_f64(obj: &Value, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Read a string field, returning an empty string when absent.
pub fn field_str(obj: &Value, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

/// One overseas position from the balance inquiry (`output1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub name: String,
    /// Exchange code as reported by the balance row (e.g. "NASD").
    pub exchange: String,
    pub quantity: u64,
    pub orderable_quantity: u64,
    pub avg_price: f64,
    pub current_price: f64,
    /// Unrealised P&L in percent, as reported by the brokerage.
    pub profit_rate: f64,
}

impl Holding {
    /// Parse a balance row. Returns `None` for rows without a symbol.
    pub fn from_output(row: &Value) -> Option<Self> {
        let symbol = field_str(row, "ovrs_pdno");
        if symbol.is_empty() {
            return None;
        }
        let qty = |key: &str| field_f64(row, key).map(|v| v.max(0.0) as u64).unwrap_or(0);
        Some(Self {
            name: field_str(row, "ovrs_item_name"),
            exchange: field_str(row, "ovrs_excg_cd"),
            quantity: qty("ovrs_cblc_qty"),
            orderable_quantity: qty("ord_psbl_qty"),
            avg_price: field_f64(row, "pchs_avg_pric").unwrap_or(0.0),
            current_price: field_f64(row, "now_pric2").unwrap_or(0.0),
            profit_rate: field_f64(row, "evlu_pfls_rt").unwrap_or(0.0),
            symbol,
        })
    }

    /// Percent change of the current price versus the average cost.
    pub fn change_pct(&self) -> f64 {
        if self.avg_price <= 0.0 {
            return 0.0;
        }
        (self.current_price - self.avg_price) / self.avg_price * 100.0
    }
}

// ---------------------------------------------------------------------------
// Market data and signals
// ---------------------------------------------------------------------------

/// A daily closing price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub ticker: String,
    pub date: NaiveDate,
    pub close: f64,
}

/// Technical indicator snapshot for one ticker on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalSignal {
    pub ticker: String,
    pub date: NaiveDate,
    pub close: f64,
    pub sma20: f64,
    pub sma50: f64,
    pub golden_cross: bool,
    pub rsi: f64,
    pub macd: f64,
    pub signal: f64,
    pub macd_buy_signal: bool,
    pub recommended: bool,
}

impl TechnicalSignal {
    /// How many of the three buy conditions hold.
    pub fn buy_conditions(&self, rsi_oversold: f64) -> u8 {
        u8::from(self.golden_cross) + u8::from(self.rsi < rsi_oversold) + u8::from(self.macd_buy_signal)
    }

    /// How many of the three sell conditions hold.
    pub fn sell_conditions(&self, rsi_overbought: f64) -> u8 {
        u8::from(!self.golden_cross) + u8::from(self.rsi > rsi_overbought) + u8::from(!self.macd_buy_signal)
    }
}

/// Output row of the offline price-prediction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub ticker: String,
    pub prediction_date: NaiveDate,
    pub last_close: f64,
    pub predicted_close: f64,
    /// Predicted rise in percent.
    pub rise_probability: f64,
    /// Back-tested model accuracy in percent.
    pub accuracy: f64,
    pub created_at: DateTime<Utc>,
}

/// Averaged news sentiment for a ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentScore {
    pub ticker: String,
    pub average_sentiment: f64,
    pub article_count: u32,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// A ticker recommended for purchase, with the inputs to its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyCandidate {
    pub ticker: String,
    pub name: String,
    pub rise_probability: f64,
    pub accuracy: f64,
    pub golden_cross: bool,
    pub rsi: f64,
    pub macd_buy_signal: bool,
    pub sentiment: Option<f64>,
    pub composite_score: f64,
}

/// A held position flagged for sale, with the reasons it was flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellCandidate {
    pub symbol: String,
    pub name: String,
    pub exchange: String,
    pub quantity: u64,
    pub avg_price: f64,
    pub current_price: f64,
    pub change_pct: f64,
    pub technical_sell_signals: u8,
    pub sentiment: Option<f64>,
    pub reasons: Vec<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Domain errors callers may want to match on.
#[derive(Debug, thiserror::Error)]
pub enum TraderError {
    #[error("Token issuance failed ({code}): {body}")]
    TokenIssue { code: String, body: String },

    #[error("Unsupported exchange: {0}")]
    UnsupportedExchange(String),

    #[error("Brokerage rejected request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl TraderError {
    /// Brokerage error code for the issuance rate limit (one token per minute).
    pub const TOKEN_RATE_LIMIT: &'static str = "EGW00133";

    pub fn is_token_rate_limit(&self) -> bool {
        matches!(self, TraderError::TokenIssue { code, .. } if code == Self::TOKEN_RATE_LIMIT)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
