//! Korea Investment & Securities REST client.
//!
//! API docs: https://apiportal.koreainvestment.com/apiservice
//! Live base:  https://openapi.koreainvestment.com:9443
//! Paper base: https://openapivts.koreainvestment.com:29443
//!
//! Every call carries `authorization: Bearer {token}`, `appkey`,
//! `appsecret` and a `tr_id` naming the operation. Responses share the
//! `rt_cd`/`msg_cd`/`msg1` envelope; a non-zero `rt_cd` is returned to
//! the caller as data, not as an error.
//!
//! Retry: every call is retried once when the brokerage rejects the
//! token (after forcing a refresh). Balance inquiries are also retried
//! once on any other rejection or transport failure. Orders are never
//! retried on anything but a token rejection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::token::{HttpTokenIssuer, TokenManager, TokenSettings};
use super::{
    tr_id, ApiResponse, Brokerage, OrderRequest, PsAmountQuery, ReservationListQuery,
    ReservationRequest, MARKET_ON_OPEN,
};
use crate::config::{AppConfig, Credentials, BASE_URL_ENV};
use crate::storage::Store;
use crate::types::{field_f64, Environment, Exchange, Side, TraderError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const DOMESTIC_BALANCE: &str = "/uapi/domestic-stock/v1/trading/inquire-balance";
const OVERSEAS_BALANCE: &str = "/uapi/overseas-stock/v1/trading/inquire-balance";
const OVERSEAS_ORDER: &str = "/uapi/overseas-stock/v1/trading/order";
const OVERSEAS_RESERVATION: &str = "/uapi/overseas-stock/v1/trading/order-resv";
const RESERVATION_LIST: &str = "/uapi/overseas-stock/v1/trading/order-resv-list";
const PURCHASABLE_AMOUNT: &str = "/uapi/overseas-stock/v1/trading/inquire-psamount";
const OUTSTANDING_ORDERS: &str = "/uapi/overseas-stock/v1/trading/inquire-nccs";
const ORDER_HISTORY: &str = "/uapi/overseas-stock/v1/trading/inquire-order";
const CURRENT_PRICE: &str = "/uapi/overseas-price/v1/quotations/price";

const USER_AGENT: &str = concat!("kis-trader/", env!("CARGO_PKG_VERSION"));

/// Attempts per call, first try included.
const MAX_ATTEMPTS: u32 = 2;

/// Paper trading has no outstanding-order endpoint; order history over
/// this many days stands in for it.
const MOCK_OUTSTANDING_LOOKBACK_DAYS: i64 = 7;

/// Build the shared HTTP client.
pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to build HTTP client for brokerage")
}

// ---------------------------------------------------------------------------
// Request plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryPolicy {
    /// Retry once after a token rejection only.
    TokenOnly,
    /// Retry once after any rejection or transport failure.
    Query,
}

struct Call<'a> {
    method: Method,
    path: &'a str,
    tr_id: &'a str,
    query: Vec<(&'static str, String)>,
    body: Option<Value>,
    retry: RetryPolicy,
}

impl<'a> Call<'a> {
    fn get(path: &'a str, tr_id: &'a str, query: Vec<(&'static str, String)>) -> Self {
        Self {
            method: Method::GET,
            path,
            tr_id,
            query,
            body: None,
            retry: RetryPolicy::TokenOnly,
        }
    }

    fn post(path: &'a str, tr_id: &'a str, body: Value) -> Self {
        Self {
            method: Method::POST,
            path,
            tr_id,
            query: Vec::new(),
            body: Some(body),
            retry: RetryPolicy::TokenOnly,
        }
    }

    fn retry_rejections(mut self) -> Self {
        self.retry = RetryPolicy::Query;
        self
    }
}

/// Turn a raw HTTP response into an envelope.
///
/// Empty successful bodies become `NODATA`; unparseable bodies become
/// `PARSEERR` (2xx) or `HTTP_<status>`; JSON without `rt_cd` is marked
/// as a failure and keeps any `error_code` as `msg_cd`.
fn envelope(status: StatusCode, text: &str) -> ApiResponse {
    let http_code = format!("HTTP_{}", status.as_u16());

    if text.trim().is_empty() {
        return if status.is_success() {
            ApiResponse::synthetic(true, ApiResponse::NO_DATA, "No data returned")
        } else {
            ApiResponse::failure(&http_code, format!("Request failed: HTTP {status}"))
        };
    }

    match serde_json::from_str::<ApiResponse>(text) {
        Ok(mut resp) => {
            if resp.rt_cd.trim().is_empty() {
                resp.rt_cd = "1".into();
                if resp.msg_cd.is_empty() {
                    resp.msg_cd = resp
                        .get("error_code")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| http_code.clone());
                }
                if resp.msg1.is_empty() {
                    resp.msg1 = resp
                        .get("error_description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                }
            }
            resp
        }
        Err(_) if status.is_success() => {
            ApiResponse::failure(ApiResponse::PARSE_ERROR, "Failed to parse response")
        }
        Err(_) => ApiResponse::failure(&http_code, format!("Request failed: HTTP {status}")),
    }
}

/// Format a price for the wire: no trailing zeros, at most 4 decimals.
fn wire_price(price: Decimal) -> String {
    price.round_dp(4).normalize().to_string()
}

fn require_quantity(quantity: u64) -> Result<()> {
    if quantity == 0 {
        return Err(TraderError::InvalidInput("order quantity must be positive".into()).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct KisClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
    environment: Environment,
    tokens: Arc<TokenManager>,
    retry_delay: Duration,
}

impl KisClient {
    pub fn new(
        http: Client,
        base_url: &str,
        credentials: Credentials,
        environment: Environment,
        tokens: Arc<TokenManager>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            environment,
            tokens,
            retry_delay,
        }
    }

    /// Wire a client, its token issuer and token manager from config.
    /// Credentials come from the environment variables the config names.
    pub fn from_config(cfg: &AppConfig, store: Arc<dyn Store>) -> Result<Self> {
        let credentials = Credentials::from_config(&cfg.broker)?;
        let base_url = cfg.broker.base_url(std::env::var(BASE_URL_ENV).ok());
        let http = http_client(cfg.broker.timeout())?;

        let issuer = HttpTokenIssuer::new(http.clone(), &base_url, credentials.clone());
        let tokens = Arc::new(TokenManager::new(
            Arc::new(issuer),
            store,
            TokenSettings::from(&cfg.token),
        ));

        info!(
            environment = %cfg.broker.environment,
            base_url = %base_url,
            account = %credentials.account,
            "Brokerage client configured"
        );

        Ok(Self::new(
            http,
            &base_url,
            credentials,
            cfg.broker.environment,
            tokens,
            cfg.broker.retry_delay(),
        ))
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    fn account_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CANO", self.credentials.account.clone()),
            ("ACNT_PRDT_CD", self.credentials.product_code.clone()),
        ]
    }

    async fn send(&self, call: &Call<'_>, token: &str) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, call.path);
        debug!(method = %call.method, path = call.path, tr_id = call.tr_id, "Brokerage request");

        let mut req = self
            .http
            .request(call.method.clone(), &url)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header("appkey", self.credentials.app_key.expose_secret().as_str())
            .header("appsecret", self.credentials.app_secret.expose_secret().as_str())
            .header("tr_id", call.tr_id);
        if !call.query.is_empty() {
            req = req.query(&call.query);
        }
        if let Some(body) = &call.body {
            req = req.body(serde_json::to_string(body)?);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("{} {} request failed", call.method, call.path))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .with_context(|| format!("Failed to read {} response", call.path))?;

        Ok(envelope(status, &text))
    }

    /// Execute a call with bounded retry.
    async fn execute(&self, call: Call<'_>) -> Result<ApiResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let last_attempt = attempt >= MAX_ATTEMPTS;
            let token = self.tokens.access_token().await?;

            let resp = match self.send(&call, &token).await {
                Ok(resp) => resp,
                Err(e) if call.retry == RetryPolicy::Query && !last_attempt => {
                    warn!(path = call.path, attempt, error = %e, "Request failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if resp.is_success() || last_attempt {
                if !resp.is_success() {
                    warn!(
                        path = call.path,
                        tr_id = call.tr_id,
                        msg_cd = %resp.msg_cd,
                        msg = %resp.msg1,
                        "Brokerage rejected request"
                    );
                }
                return Ok(resp);
            }

            if resp.is_token_error() {
                warn!(path = call.path, msg_cd = %resp.msg_cd, "Token rejected, refreshing");
                self.tokens.force_refresh(&token).await?;
            } else if call.retry == RetryPolicy::Query {
                warn!(
                    path = call.path,
                    attempt,
                    msg_cd = %resp.msg_cd,
                    msg = %resp.msg1,
                    "Query rejected, retrying"
                );
            } else {
                return Ok(resp);
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

#[async_trait]
impl Brokerage for KisClient {
    fn environment(&self) -> Environment {
        self.environment
    }

    async fn domestic_balance(&self) -> Result<ApiResponse> {
        let mut query = self.account_params();
        query.extend([
            ("AFHR_FLPR_YN", "N".to_string()),
            ("OFL_YN", String::new()),
            ("INQR_DVSN", "02".to_string()),
            ("UNPR_DVSN", "01".to_string()),
            ("FUND_STTL_ICLD_YN", "N".to_string()),
            ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
            ("PRCS_DVSN", "00".to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ]);
        let tr = tr_id::domestic_balance(self.environment);
        self.execute(Call::get(DOMESTIC_BALANCE, tr, query).retry_rejections())
            .await
    }

    async fn overseas_balance(&self, exchange: Exchange) -> Result<ApiResponse> {
        let mut query = self.account_params();
        query.extend([
            ("OVRS_EXCG_CD", exchange.code().to_string()),
            ("TR_CRCY_CD", "USD".to_string()),
            ("CTX_AREA_FK200", String::new()),
            ("CTX_AREA_NK200", String::new()),
        ]);
        let tr = tr_id::overseas_balance(self.environment);
        self.execute(Call::get(OVERSEAS_BALANCE, tr, query).retry_rejections())
            .await
    }

    async fn current_price(&self, exchange: Exchange, symbol: &str) -> Result<ApiResponse> {
        let query = vec![
            ("AUTH", String::new()),
            ("EXCD", exchange.quote_code().to_string()),
            ("SYMB", symbol.to_string()),
        ];
        self.execute(Call::get(CURRENT_PRICE, tr_id::CURRENT_PRICE, query))
            .await
    }

    async fn order(&self, req: &OrderRequest) -> Result<ApiResponse> {
        require_quantity(req.quantity)?;
        let mut body = json!({
            "CANO": self.credentials.account,
            "ACNT_PRDT_CD": self.credentials.product_code,
            "OVRS_EXCG_CD": req.exchange.code(),
            "PDNO": req.symbol,
            "ORD_QTY": req.quantity.to_string(),
            "OVRS_ORD_UNPR": wire_price(req.price),
            "ORD_SVR_DVSN_CD": "0",
            "ORD_DVSN": req.order_type,
        });
        if req.side == Side::Sell {
            body["SLL_TYPE"] = json!("00");
        }

        let tr = tr_id::order(self.environment, req.exchange, req.side);
        info!(
            tr_id = tr,
            exchange = %req.exchange,
            symbol = %req.symbol,
            side = %req.side,
            quantity = req.quantity,
            price = %req.price,
            "Placing order"
        );
        self.execute(Call::post(OVERSEAS_ORDER, tr, body)).await
    }

    async fn reserve_order(&self, req: &ReservationRequest) -> Result<ApiResponse> {
        require_quantity(req.quantity)?;
        if req.order_type == MARKET_ON_OPEN && !(req.exchange.is_us() && req.side == Side::Sell) {
            return Err(TraderError::InvalidInput(
                "market-on-open reservations are only accepted for US sells".into(),
            )
            .into());
        }

        let tr = tr_id::reservation(self.environment, req.exchange, req.side);
        let mut body = json!({
            "CANO": self.credentials.account,
            "ACNT_PRDT_CD": self.credentials.product_code,
            "PDNO": req.symbol,
            "OVRS_EXCG_CD": req.exchange.code(),
            "FT_ORD_QTY": req.quantity.to_string(),
            "FT_ORD_UNPR3": wire_price(req.price),
            "ORD_DVSN": req.order_type,
            "RVSE_CNCL_DVSN_CD": "00",
            "ORD_SVR_DVSN_CD": "0",
        });
        if let Some(code) = tr.side_code {
            body["SLL_BUY_DVSN_CD"] = json!(code);
        }

        info!(
            tr_id = tr.tr_id,
            exchange = %req.exchange,
            symbol = %req.symbol,
            side = %req.side,
            quantity = req.quantity,
            price = %req.price,
            "Submitting reservation order"
        );
        self.execute(Call::post(OVERSEAS_RESERVATION, tr.tr_id, body))
            .await
    }

    async fn purchasable_amount(&self, query: &PsAmountQuery) -> Result<ApiResponse> {
        let mut params = self.account_params();
        params.extend([
            ("OVRS_EXCG_CD", query.exchange.code().to_string()),
            ("OVRS_ORD_UNPR", wire_price(query.price)),
            ("ITEM_CD", query.symbol.clone()),
            ("AFHR_FLPR_YN", "N".to_string()),
            ("OFL_YN", "N".to_string()),
            ("INQR_DVSN", "02".to_string()),
            ("UNPR_DVSN", "01".to_string()),
            ("FUND_STTL_ICLD_YN", "N".to_string()),
            ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
            ("PRCS_DVSN", "00".to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ]);
        let tr = tr_id::purchasable_amount(self.environment);
        self.execute(Call::get(PURCHASABLE_AMOUNT, tr, params)).await
    }

    async fn outstanding_orders(&self, exchange: Exchange, sort: &str) -> Result<ApiResponse> {
        if self.environment.is_mock() {
            let today = Utc::now().with_timezone(&chrono_tz::Asia::Seoul).date_naive();
            let start = today - ChronoDuration::days(MOCK_OUTSTANDING_LOOKBACK_DAYS);
            let mut resp = self.order_history(exchange, sort, start, today).await?;

            if let Some(Value::Array(rows)) = resp.body.get_mut("output") {
                rows.retain(|row| field_f64(row, "nccs_qty").unwrap_or(0.0) > 0.0);
            }
            return Ok(resp);
        }

        let mut params = self.account_params();
        params.extend([
            ("OVRS_EXCG_CD", exchange.code().to_string()),
            ("SORT_SQN", sort.to_string()),
            ("CTX_AREA_FK200", String::new()),
            ("CTX_AREA_NK200", String::new()),
        ]);
        self.execute(Call::get(OUTSTANDING_ORDERS, tr_id::OUTSTANDING_ORDERS, params))
            .await
    }

    async fn order_history(
        &self,
        exchange: Exchange,
        sort: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ApiResponse> {
        let mut params = self.account_params();
        params.extend([
            ("OVRS_EXCG_CD", exchange.code().to_string()),
            ("SORT_SQN", sort.to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
            ("INQR_ST_DT", start.format("%Y%m%d").to_string()),
            ("INQR_END_DT", end.format("%Y%m%d").to_string()),
        ]);
        let tr = tr_id::order_history(self.environment);
        let resp = self.execute(Call::get(ORDER_HISTORY, tr, params)).await?;

        if resp.msg_cd == "HTTP_404" {
            return Ok(ApiResponse::synthetic(
                true,
                ApiResponse::NO_DATA,
                "Order history is not available",
            ));
        }
        Ok(resp)
    }

    async fn reservation_orders(&self, query: &ReservationListQuery) -> Result<ApiResponse> {
        let Some(tr) = tr_id::reservation_list(self.environment, query.exchange) else {
            return Ok(ApiResponse::synthetic(
                true,
                ApiResponse::MOCK_UNSUPPORTED,
                "Reservation order inquiry is not available in paper trading",
            ));
        };

        let mut params = self.account_params();
        params.extend([
            ("INQR_STRT_DT", query.start.format("%Y%m%d").to_string()),
            ("INQR_END_DT", query.end.format("%Y%m%d").to_string()),
            ("INQR_DVSN_CD", query.inquiry_kind.clone()),
            ("PRDT_TYPE_CD", query.product_type.clone()),
            (
                "OVRS_EXCG_CD",
                query.exchange.map(|e| e.code().to_string()).unwrap_or_default(),
            ),
            ("CTX_AREA_FK200", String::new()),
            ("CTX_AREA_NK200", String::new()),
        ]);
        self.execute(Call::get(RESERVATION_LIST, tr, params)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::token::{IssuedToken, MockTokenIssuer, TokenIssuer};
    use crate::storage::MemoryStore;
    use mockito::{Matcher, Server, ServerGuard};
    use rust_decimal_macros::dec;

    fn creds() -> Credentials {
        Credentials::new("app-key", "app-secret", "12345678", "01")
    }

    async fn client_with(server: &ServerGuard, env: Environment, issuer: MockTokenIssuer) -> KisClient {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_token("tok-1", Utc::now() + ChronoDuration::hours(1))
            .await
            .unwrap();
        let tokens = Arc::new(TokenManager::new(Arc::new(issuer), store, TokenSettings::default()));
        KisClient::new(
            http_client(Duration::from_secs(5)).unwrap(),
            &server.url(),
            creds(),
            env,
            tokens,
            Duration::from_millis(5),
        )
    }

    async fn client(server: &ServerGuard, env: Environment) -> KisClient {
        client_with(server, env, MockTokenIssuer::new()).await
    }

    // -- Envelope --

    #[test]
    fn test_envelope_empty_success_is_nodata() {
        let r = envelope(StatusCode::OK, "");
        assert!(r.is_success());
        assert_eq!(r.msg_cd, ApiResponse::NO_DATA);
    }

    #[test]
    fn test_envelope_garbage() {
        let r = envelope(StatusCode::OK, "<html>");
        assert!(!r.is_success());
        assert_eq!(r.msg_cd, ApiResponse::PARSE_ERROR);

        let r = envelope(StatusCode::BAD_GATEWAY, "<html>");
        assert_eq!(r.msg_cd, "HTTP_502");
    }

    #[test]
    fn test_envelope_error_code_without_rt_cd() {
        let r = envelope(
            StatusCode::FORBIDDEN,
            r#"{"error_code":"EGW00133","error_description":"1분당 1회"}"#,
        );
        assert!(!r.is_success());
        assert_eq!(r.msg_cd, "EGW00133");
        assert_eq!(r.msg1, "1분당 1회");
    }

    #[test]
    fn test_envelope_keeps_rejection_on_server_error() {
        let r = envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"rt_cd":"1","msg_cd":"EGW00123","msg1":"expired"}"#,
        );
        assert!(r.is_token_error());
    }

    #[test]
    fn test_wire_price() {
        assert_eq!(wire_price(dec!(150.2500)), "150.25");
        assert_eq!(wire_price(dec!(12)), "12");
        assert_eq!(wire_price(dec!(0.123456)), "0.1235");
    }

    // -- HTTP --

    #[tokio::test]
    async fn test_domestic_balance_headers_and_params() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", DOMESTIC_BALANCE)
            .match_header("tr_id", "VTTC8434R")
            .match_header("authorization", "Bearer tok-1")
            .match_header("appkey", "app-key")
            .match_header("appsecret", "app-secret")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("CANO".into(), "12345678".into()),
                Matcher::UrlEncoded("ACNT_PRDT_CD".into(), "01".into()),
                Matcher::UrlEncoded("INQR_DVSN".into(), "02".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"rt_cd":"0","msg_cd":"KIOK0000","msg1":"ok","output2":[{"dnca_tot_amt":"1000"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let c = client(&server, Environment::Mock).await;
        let r = c.domestic_balance().await.unwrap();
        assert!(r.is_success());
        assert_eq!(r.first("output2").unwrap()["dnca_tot_amt"], "1000");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_purchasable_amount_params() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", PURCHASABLE_AMOUNT)
            .match_header("tr_id", "VTTS3007R")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("CANO".into(), "12345678".into()),
                Matcher::UrlEncoded("OVRS_EXCG_CD".into(), "NASD".into()),
                Matcher::UrlEncoded("ITEM_CD".into(), "AAPL".into()),
                Matcher::UrlEncoded("OVRS_ORD_UNPR".into(), "1".into()),
                Matcher::UrlEncoded("AFHR_FLPR_YN".into(), "N".into()),
                Matcher::UrlEncoded("OFL_YN".into(), "N".into()),
                Matcher::UrlEncoded("INQR_DVSN".into(), "02".into()),
                Matcher::UrlEncoded("UNPR_DVSN".into(), "01".into()),
                Matcher::UrlEncoded("PRCS_DVSN".into(), "00".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"rt_cd":"0","msg_cd":"KIOK0000","msg1":"ok","output":{"ovrs_ord_psbl_amt":"250.00"}}"#)
            .expect(1)
            .create_async()
            .await;

        let c = client(&server, Environment::Mock).await;
        let query = PsAmountQuery {
            exchange: Exchange::Nasd,
            symbol: "AAPL".into(),
            price: dec!(1.00),
        };
        let r = c.purchasable_amount(&query).await.unwrap();
        assert_eq!(r.get("output").unwrap()["ovrs_ord_psbl_amt"], "250.00");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_rejection_forces_refresh_and_retries() {
        let mut server = Server::new_async().await;
        let stale = server
            .mock("GET", OVERSEAS_BALANCE)
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer tok-1")
            .with_status(500)
            .with_body(r#"{"rt_cd":"1","msg_cd":"EGW00123","msg1":"expired token"}"#)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", OVERSEAS_BALANCE)
            .match_query(Matcher::UrlEncoded("OVRS_EXCG_CD".into(), "NYSE".into()))
            .match_header("authorization", "Bearer tok-2")
            .match_header("tr_id", "TTTS3012R")
            .with_status(200)
            .with_body(r#"{"rt_cd":"0","output1":[],"output2":{}}"#)
            .expect(1)
            .create_async()
            .await;

        let mut issuer = MockTokenIssuer::new();
        issuer.expect_issue().times(1).returning(|| {
            Ok(IssuedToken {
                access_token: "tok-2".into(),
                expires_in: 86_400,
            })
        });

        let c = client_with(&server, Environment::Real, issuer).await;
        let r = c.overseas_balance(Exchange::Nyse).await.unwrap();
        assert!(r.is_success());
        stale.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_rejection_retried_once_then_returned() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", OVERSEAS_BALANCE)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"rt_cd":"1","msg_cd":"APBK0001","msg1":"temporarily unavailable"}"#)
            .expect(2)
            .create_async()
            .await;

        let c = client(&server, Environment::Mock).await;
        let r = c.overseas_balance(Exchange::Nasd).await.unwrap();
        assert!(!r.is_success());
        assert_eq!(r.msg_cd, "APBK0001");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_order_rejection_not_retried() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("POST", OVERSEAS_ORDER)
            .with_status(200)
            .with_body(r#"{"rt_cd":"1","msg_cd":"APBK0656","msg1":"insufficient funds"}"#)
            .expect(1)
            .create_async()
            .await;

        let c = client(&server, Environment::Mock).await;
        let req = OrderRequest::limit(Exchange::Nasd, "AAPL", 1, dec!(150.25), Side::Buy);
        let r = c.order(&req).await.unwrap();
        assert!(!r.is_success());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_order_body_and_tr_id() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("POST", OVERSEAS_ORDER)
            .match_header("tr_id", "VTTT1001U")
            .match_body(Matcher::PartialJson(json!({
                "CANO": "12345678",
                "ACNT_PRDT_CD": "01",
                "OVRS_EXCG_CD": "NYSE",
                "PDNO": "IBM",
                "ORD_QTY": "3",
                "OVRS_ORD_UNPR": "210.5",
                "ORD_DVSN": "00",
                "ORD_SVR_DVSN_CD": "0",
                "SLL_TYPE": "00"
            })))
            .with_status(200)
            .with_body(r#"{"rt_cd":"0","msg1":"ok","output":{"ODNO":"0001"}}"#)
            .create_async()
            .await;

        let c = client(&server, Environment::Mock).await;
        let req = OrderRequest::limit(Exchange::Nyse, "IBM", 3, dec!(210.50), Side::Sell);
        let r = c.order(&req).await.unwrap();
        assert!(r.is_success());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_zero_quantity_rejected_locally() {
        let server = Server::new_async().await;
        let c = client(&server, Environment::Mock).await;
        let req = OrderRequest::limit(Exchange::Nasd, "AAPL", 0, dec!(1), Side::Buy);
        let err = c.order(&req).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TraderError>(), Some(TraderError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_non_us_reservation_carries_side_code() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("POST", OVERSEAS_RESERVATION)
            .match_header("tr_id", "TTTS3013U")
            .match_body(Matcher::PartialJson(json!({
                "OVRS_EXCG_CD": "SEHK",
                "FT_ORD_QTY": "100",
                "FT_ORD_UNPR3": "32.1",
                "SLL_BUY_DVSN_CD": "02",
                "RVSE_CNCL_DVSN_CD": "00"
            })))
            .with_status(200)
            .with_body(r#"{"rt_cd":"0"}"#)
            .create_async()
            .await;

        let c = client(&server, Environment::Real).await;
        let req = ReservationRequest {
            exchange: Exchange::Sehk,
            symbol: "00700".into(),
            quantity: 100,
            price: dec!(32.10),
            side: Side::Buy,
            order_type: "00".into(),
        };
        assert!(c.reserve_order(&req).await.unwrap().is_success());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_market_on_open_only_for_us_sells() {
        let server = Server::new_async().await;
        let c = client(&server, Environment::Real).await;
        let req = ReservationRequest {
            exchange: Exchange::Nasd,
            symbol: "AAPL".into(),
            quantity: 1,
            price: dec!(0),
            side: Side::Buy,
            order_type: MARKET_ON_OPEN.into(),
        };
        assert!(c.reserve_order(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_current_price_uses_quote_code() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", CURRENT_PRICE)
            .match_header("tr_id", "HHDFS00000300")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("EXCD".into(), "NAS".into()),
                Matcher::UrlEncoded("SYMB".into(), "AAPL".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"rt_cd":"0","output":{"last":"187.3400"}}"#)
            .create_async()
            .await;

        let c = client(&server, Environment::Mock).await;
        let r = c.current_price(Exchange::Nasd, "AAPL").await.unwrap();
        assert_eq!(r.get("output").unwrap()["last"], "187.3400");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_mock_outstanding_orders_filters_filled() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", ORDER_HISTORY)
            .match_header("tr_id", "VTTS3035R")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"rt_cd":"0","output":[
                    {"odno":"1","nccs_qty":"0"},
                    {"odno":"2","nccs_qty":"3"},
                    {"odno":"3"}
                ]}"#,
            )
            .create_async()
            .await;

        let c = client(&server, Environment::Mock).await;
        let r = c.outstanding_orders(Exchange::Nasd, "DS").await.unwrap();
        let rows = r.rows("output");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["odno"], "2");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_real_outstanding_orders_endpoint() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", OUTSTANDING_ORDERS)
            .match_header("tr_id", "TTTS3018R")
            .match_query(Matcher::UrlEncoded("SORT_SQN".into(), "DS".into()))
            .with_status(200)
            .with_body(r#"{"rt_cd":"0","output":[{"odno":"9","nccs_qty":"0"}]}"#)
            .create_async()
            .await;

        let c = client(&server, Environment::Real).await;
        let r = c.outstanding_orders(Exchange::Nasd, "DS").await.unwrap();
        assert_eq!(r.rows("output").len(), 1);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_order_history_404_is_nodata() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", ORDER_HISTORY)
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let c = client(&server, Environment::Real).await;
        let d = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let r = c.order_history(Exchange::Nasd, "DS", d, d).await.unwrap();
        assert!(r.is_success());
        assert_eq!(r.msg_cd, ApiResponse::NO_DATA);
    }

    #[tokio::test]
    async fn test_reservation_list_unsupported_in_mock() {
        let server = Server::new_async().await;
        let c = client(&server, Environment::Mock).await;
        let d = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let q = ReservationListQuery {
            exchange: None,
            start: d,
            end: d,
            inquiry_kind: "00".into(),
            product_type: String::new(),
        };
        let r = c.reservation_orders(&q).await.unwrap();
        assert!(r.is_success());
        assert_eq!(r.msg_cd, ApiResponse::MOCK_UNSUPPORTED);
    }

    #[tokio::test]
    async fn test_http_token_issuer() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/oauth2/tokenP")
            .match_body(Matcher::Json(json!({
                "grant_type": "client_credentials",
                "appkey": "app-key",
                "appsecret": "app-secret"
            })))
            .with_status(200)
            .with_body(r#"{"access_token":"issued","token_type":"Bearer","expires_in":86400}"#)
            .create_async()
            .await;

        let issuer = HttpTokenIssuer::new(http_client(Duration::from_secs(5)).unwrap(), &server.url(), creds());
        let t = issuer.issue().await.unwrap();
        assert_eq!(t.access_token, "issued");
        assert_eq!(t.expires_in, 86_400);
    }

    #[tokio::test]
    async fn test_http_token_issuer_rate_limit_code() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/oauth2/tokenP")
            .with_status(403)
            .with_body(r#"{"error_description":"접근토큰 발급 잠시 후 다시 시도하세요(1분당 1회)","error_code":"EGW00133"}"#)
            .create_async()
            .await;

        let issuer = HttpTokenIssuer::new(http_client(Duration::from_secs(5)).unwrap(), &server.url(), creds());
        let err = issuer.issue().await.unwrap_err();
        let domain = err.downcast_ref::<TraderError>().unwrap();
        assert!(domain.is_token_rate_limit());
    }
}
