//! In-memory brokerage for integration testing.
//!
//! Provides a deterministic `Brokerage` that serves configured holdings
//! and quotes, accepts orders, and records them, with no network access.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kis_trader::broker::{
    ApiResponse, Brokerage, OrderRequest, PsAmountQuery, ReservationListQuery, ReservationRequest,
};
use kis_trader::types::{Environment, Exchange};

/// A held position as the balance endpoint reports it.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: u64,
    pub avg_price: f64,
    pub current_price: f64,
}

impl Position {
    pub fn new(symbol: &str, exchange: Exchange, quantity: u64, avg_price: f64, current_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange,
            quantity,
            avg_price,
            current_price,
        }
    }

    fn row(&self) -> Value {
        json!({
            "ovrs_pdno": self.symbol,
            "ovrs_item_name": self.symbol,
            "ovrs_excg_cd": self.exchange.code(),
            "ovrs_cblc_qty": self.quantity.to_string(),
            "ord_psbl_qty": self.quantity.to_string(),
            "pchs_avg_pric": format!("{:.4}", self.avg_price),
            "now_pric2": format!("{:.5}", self.current_price),
        })
    }
}

/// A mock brokerage for deterministic testing.
///
/// All state is in-memory. Positions, quotes and failures are fully
/// controllable from test code.
pub struct MockBroker {
    positions: Arc<Mutex<Vec<Position>>>,
    /// Last price per bare symbol; a missing symbol is quoted as blank.
    quotes: Arc<Mutex<HashMap<String, String>>>,
    orders: Arc<Mutex<Vec<OrderRequest>>>,
    reject_orders: Arc<Mutex<Option<String>>>,
    /// If set, every call fails with this transport error.
    force_error: Arc<Mutex<Option<String>>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            positions: Arc::new(Mutex::new(Vec::new())),
            quotes: Arc::new(Mutex::new(HashMap::new())),
            orders: Arc::new(Mutex::new(Vec::new())),
            reject_orders: Arc::new(Mutex::new(None)),
            force_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn hold(&self, position: Position) {
        self.positions.lock().unwrap().push(position);
    }

    pub fn quote(&self, symbol: &str, last: &str) {
        self.quotes.lock().unwrap().insert(symbol.to_string(), last.to_string());
    }

    /// Reject every subsequent order with this message.
    pub fn reject_orders(&self, msg: &str) {
        *self.reject_orders.lock().unwrap() = Some(msg.to_string());
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        match self.force_error.lock().unwrap().as_ref() {
            Some(err) => Err(anyhow!("{}", err)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Brokerage for MockBroker {
    fn environment(&self) -> Environment {
        Environment::Mock
    }

    async fn domestic_balance(&self) -> Result<ApiResponse> {
        self.check()?;
        Ok(ApiResponse::success(json!({ "output1": [], "output2": [{ "dnca_tot_amt": "0" }] })))
    }

    async fn overseas_balance(&self, exchange: Exchange) -> Result<ApiResponse> {
        self.check()?;
        let rows: Vec<Value> = self
            .positions
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.exchange == exchange)
            .map(Position::row)
            .collect();
        Ok(ApiResponse::success(json!({ "output1": rows, "output2": {} })))
    }

    async fn current_price(&self, _exchange: Exchange, symbol: &str) -> Result<ApiResponse> {
        self.check()?;
        let last = self.quotes.lock().unwrap().get(symbol).cloned().unwrap_or_default();
        Ok(ApiResponse::success(json!({ "output": { "last": last } })))
    }

    async fn order(&self, req: &OrderRequest) -> Result<ApiResponse> {
        self.check()?;
        if let Some(msg) = self.reject_orders.lock().unwrap().as_ref() {
            return Ok(ApiResponse::failure("APBK0001", msg.clone()));
        }
        let mut orders = self.orders.lock().unwrap();
        orders.push(req.clone());
        Ok(ApiResponse::success(json!({
            "output": { "ODNO": format!("{:010}", orders.len()) }
        })))
    }

    async fn reserve_order(&self, _req: &ReservationRequest) -> Result<ApiResponse> {
        self.check()?;
        Ok(ApiResponse::success(json!({ "output": { "ODNO": "R000000001" } })))
    }

    async fn purchasable_amount(&self, _query: &PsAmountQuery) -> Result<ApiResponse> {
        self.check()?;
        Ok(ApiResponse::success(json!({ "output": { "ovrs_ord_psbl_amt": "1000.00" } })))
    }

    async fn outstanding_orders(&self, _exchange: Exchange, _sort: &str) -> Result<ApiResponse> {
        self.check()?;
        Ok(ApiResponse::success(json!({ "output": [] })))
    }

    async fn order_history(
        &self,
        _exchange: Exchange,
        _sort: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<ApiResponse> {
        self.check()?;
        Ok(ApiResponse::success(json!({ "output": [] })))
    }

    async fn reservation_orders(&self, _query: &ReservationListQuery) -> Result<ApiResponse> {
        self.check()?;
        Ok(ApiResponse::synthetic(
            true,
            ApiResponse::MOCK_UNSUPPORTED,
            "not available in paper trading",
        ))
    }
}
