//! Auto-buy through the real REST client against a local mock server.
//!
//! Covers token issuance and persistence, the per-exchange balance
//! calls, the quotation code mapping and the order body.

use mockito::{Matcher, Server, ServerGuard};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kis_trader::broker::client::{http_client, KisClient};
use kis_trader::broker::token::{HttpTokenIssuer, TokenManager, TokenSettings};
use kis_trader::broker::Brokerage;
use kis_trader::config::{CatalogEntry, Credentials, StrategyConfig};
use kis_trader::scheduler::{AutoTrader, MarketGate, RunStatus, TradePacing};
use kis_trader::signals::{Catalog, RecommendationService, ServicePacing};
use kis_trader::storage::{MemoryStore, Store};
use kis_trader::types::{Environment, PredictionResult, TechnicalSignal};

const BALANCE: &str = "/uapi/overseas-stock/v1/trading/inquire-balance";
const PRICE: &str = "/uapi/overseas-price/v1/quotations/price";
const ORDER: &str = "/uapi/overseas-stock/v1/trading/order";

struct AlwaysOpen;

impl MarketGate for AlwaysOpen {
    fn is_open(&self) -> bool {
        true
    }
}

async fn mock_balance(server: &mut ServerGuard, exchange: &str, rows: &str) -> mockito::Mock {
    server
        .mock("GET", BALANCE)
        .match_header("tr_id", "VTTS3012R")
        .match_query(Matcher::UrlEncoded("OVRS_EXCG_CD".into(), exchange.into()))
        .with_status(200)
        .with_body(format!(r#"{{"rt_cd":"0","msg_cd":"KIOK0000","msg1":"ok","output1":{rows},"output2":{{}}}}"#))
        .create_async()
        .await
}

async fn seeded_store() -> Arc<dyn Store> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let today = Utc::now().date_naive();
    let row = |ticker: &str| TechnicalSignal {
        ticker: ticker.into(),
        date: today,
        close: 100.0,
        sma20: 105.0,
        sma50: 100.0,
        golden_cross: true,
        rsi: 45.0,
        macd: 1.2,
        signal: 0.8,
        macd_buy_signal: true,
        recommended: true,
    };
    store
        .replace_technical_signals(&[row("IBM.N"), row("MSFT")])
        .await
        .unwrap();
    for (ticker, rise) in [("IBM.N", 8.0), ("MSFT", 4.0)] {
        store
            .insert_prediction(&PredictionResult {
                ticker: ticker.into(),
                prediction_date: today,
                last_close: 100.0,
                predicted_close: 100.0 + rise,
                rise_probability: rise,
                accuracy: 85.0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    store
}

#[tokio::test]
async fn test_auto_buy_over_http() {
    let mut server = Server::new_async().await;

    let token = server
        .mock("POST", "/oauth2/tokenP")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": "app-key"
        })))
        .with_status(200)
        .with_body(r#"{"access_token":"tok-live","token_type":"Bearer","expires_in":86400}"#)
        .expect(1)
        .create_async()
        .await;

    let _nasd = mock_balance(
        &mut server,
        "NASD",
        r#"[{"ovrs_pdno":"MSFT","ovrs_item_name":"MICROSOFT","ovrs_excg_cd":"NASD","ovrs_cblc_qty":"1","ord_psbl_qty":"1","pchs_avg_pric":"400.0","now_pric2":"402.0"}]"#,
    )
    .await;
    let _nyse = mock_balance(&mut server, "NYSE", "[]").await;
    let _amex = mock_balance(&mut server, "AMEX", "[]").await;

    let quote = server
        .mock("GET", PRICE)
        .match_header("tr_id", "HHDFS00000300")
        .match_header("authorization", "Bearer tok-live")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("EXCD".into(), "NYS".into()),
            Matcher::UrlEncoded("SYMB".into(), "IBM".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"rt_cd":"0","msg_cd":"","msg1":"","output":{"rsym":"DNYSIBM","last":"251.3000"}}"#)
        .expect(1)
        .create_async()
        .await;

    let order = server
        .mock("POST", ORDER)
        .match_header("tr_id", "VTTT1002U")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "CANO": "12345678",
            "OVRS_EXCG_CD": "NYSE",
            "PDNO": "IBM",
            "ORD_QTY": "1",
            "OVRS_ORD_UNPR": "251.3",
            "ORD_DVSN": "00"
        })))
        .with_status(200)
        .with_body(r#"{"rt_cd":"0","msg_cd":"APBK0013","msg1":"주문 전송 완료","output":{"ODNO":"0030138295"}}"#)
        .expect(1)
        .create_async()
        .await;

    let store = seeded_store().await;
    let http = http_client(Duration::from_secs(5)).unwrap();
    let credentials = Credentials::new("app-key", "app-secret", "12345678", "01");
    let issuer = HttpTokenIssuer::new(http.clone(), &server.url(), credentials.clone());
    let tokens = Arc::new(TokenManager::new(Arc::new(issuer), store.clone(), TokenSettings::default()));
    let client = KisClient::new(
        http,
        &server.url(),
        credentials,
        Environment::Mock,
        tokens,
        Duration::from_millis(5),
    );
    let broker: Arc<dyn Brokerage> = Arc::new(client);

    let entry = |t: &str| CatalogEntry {
        ticker: t.into(),
        name: t.into(),
        etf: false,
    };
    let recommendations = Arc::new(RecommendationService::new(
        store.clone(),
        broker.clone(),
        None,
        Catalog::new(vec![entry("IBM.N"), entry("MSFT")]),
        StrategyConfig::default(),
        ServicePacing {
            balance: Duration::ZERO,
            sentiment: Duration::ZERO,
        },
    ));
    let pacing = TradePacing {
        balance: Duration::from_millis(1),
        after_buy: Duration::from_millis(1),
        ..TradePacing::default()
    };
    let trader = AutoTrader::new(broker, recommendations, Arc::new(AlwaysOpen), pacing);

    let report = trader.run_auto_buy().await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.placed.len(), 1);
    assert_eq!(report.placed[0].symbol, "IBM");
    assert_eq!(report.placed[0].order_no.as_deref(), Some("0030138295"));
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].symbol, "MSFT");

    token.assert_async().await;
    quote.assert_async().await;
    order.assert_async().await;

    // The issued token was persisted for the next process.
    let stored = store.latest_token().await.unwrap().unwrap();
    assert_eq!(stored.access_token, "tok-live");
}
