//! Persistence layer.
//!
//! The `Store` trait covers the handful of tables the backend reads and
//! writes: the brokerage access token, daily closing prices, technical
//! signal snapshots, model predictions and news sentiment. `SqliteStore`
//! is the durable implementation; `MemoryStore` backs tests and
//! throwaway runs.

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::types::{PredictionResult, PriceBar, SentimentScore, TechnicalSignal};

pub use sqlite::SqliteStore;

/// A persisted access token row.
///
/// `expiration_time` is kept as the raw stored text; callers parse it
/// because older rows may use a different timestamp layout.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredToken {
    pub id: i64,
    pub access_token: String,
    pub expiration_time: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Most recently created token row, if any.
    async fn latest_token(&self) -> Result<Option<StoredToken>>;

    /// Insert a token row and return its id.
    async fn insert_token(&self, access_token: &str, expires_at: DateTime<Utc>) -> Result<i64>;

    async fn update_token(&self, id: i64, access_token: &str, expires_at: DateTime<Utc>) -> Result<()>;

    /// Closing prices on or after `since`, ordered by ticker then date.
    async fn price_history(&self, since: NaiveDate) -> Result<Vec<PriceBar>>;

    async fn upsert_prices(&self, bars: &[PriceBar]) -> Result<()>;

    /// Replace every stored technical signal with `signals`.
    async fn replace_technical_signals(&self, signals: &[TechnicalSignal]) -> Result<()>;

    async fn technical_signals(&self) -> Result<Vec<TechnicalSignal>>;

    async fn predictions(&self) -> Result<Vec<PredictionResult>>;

    async fn insert_prediction(&self, prediction: &PredictionResult) -> Result<()>;

    /// Replace every stored sentiment score with `scores`.
    async fn replace_sentiment(&self, scores: &[SentimentScore]) -> Result<()>;

    async fn sentiment(&self) -> Result<Vec<SentimentScore>>;
}

/// Open the store named by a database URL. `memory` selects the
/// in-process store.
pub async fn open(database_url: &str) -> Result<Arc<dyn Store>> {
    if database_url == "memory" {
        info!("Using in-memory store (nothing is persisted)");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(SqliteStore::connect(database_url).await?))
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryTables {
    tokens: Vec<StoredToken>,
    next_token_id: i64,
    prices: Vec<PriceBar>,
    signals: Vec<TechnicalSignal>,
    predictions: Vec<PredictionResult>,
    sentiment: Vec<SentimentScore>,
}

/// Non-persistent `Store` backed by vectors.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn latest_token(&self) -> Result<Option<StoredToken>> {
        Ok(self.tables.read().await.tokens.last().cloned())
    }

    async fn insert_token(&self, access_token: &str, expires_at: DateTime<Utc>) -> Result<i64> {
        let mut t = self.tables.write().await;
        t.next_token_id += 1;
        let id = t.next_token_id;
        t.tokens.push(StoredToken {
            id,
            access_token: access_token.to_string(),
            expiration_time: expires_at.to_rfc3339(),
        });
        Ok(id)
    }

    async fn update_token(&self, id: i64, access_token: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.write().await;
        if let Some(row) = t.tokens.iter_mut().find(|r| r.id == id) {
            row.access_token = access_token.to_string();
            row.expiration_time = expires_at.to_rfc3339();
        }
        Ok(())
    }

    async fn price_history(&self, since: NaiveDate) -> Result<Vec<PriceBar>> {
        let mut bars: Vec<PriceBar> = self
            .tables
            .read()
            .await
            .prices
            .iter()
            .filter(|b| b.date >= since)
            .cloned()
            .collect();
        bars.sort_by(|a, b| a.ticker.cmp(&b.ticker).then(a.date.cmp(&b.date)));
        Ok(bars)
    }

    async fn upsert_prices(&self, bars: &[PriceBar]) -> Result<()> {
        let mut t = self.tables.write().await;
        for bar in bars {
            match t
                .prices
                .iter_mut()
                .find(|p| p.ticker == bar.ticker && p.date == bar.date)
            {
                Some(existing) => existing.close = bar.close,
                None => t.prices.push(bar.clone()),
            }
        }
        Ok(())
    }

    async fn replace_technical_signals(&self, signals: &[TechnicalSignal]) -> Result<()> {
        self.tables.write().await.signals = signals.to_vec();
        Ok(())
    }

    async fn technical_signals(&self) -> Result<Vec<TechnicalSignal>> {
        Ok(self.tables.read().await.signals.clone())
    }

    async fn predictions(&self) -> Result<Vec<PredictionResult>> {
        Ok(self.tables.read().await.predictions.clone())
    }

    async fn insert_prediction(&self, prediction: &PredictionResult) -> Result<()> {
        self.tables.write().await.predictions.push(prediction.clone());
        Ok(())
    }

    async fn replace_sentiment(&self, scores: &[SentimentScore]) -> Result<()> {
        self.tables.write().await.sentiment = scores.to_vec();
        Ok(())
    }

    async fn sentiment(&self) -> Result<Vec<SentimentScore>> {
        Ok(self.tables.read().await.sentiment.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
