//! SQLite-backed `Store`.
//!
//! Dates and timestamps are stored as text (ISO 8601 / RFC 3339) so the
//! schema stays readable from the `sqlite3` shell.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use super::{Store, StoredToken};
use crate::types::{PredictionResult, PriceBar, SentimentScore, TechnicalSignal, TraderError};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS access_tokens (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        access_token TEXT NOT NULL,
        expiration_time TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stock_prices (
        ticker TEXT NOT NULL,
        date TEXT NOT NULL,
        close REAL NOT NULL,
        PRIMARY KEY (ticker, date)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS technical_signals (
        ticker TEXT NOT NULL,
        date TEXT NOT NULL,
        close REAL NOT NULL,
        sma20 REAL NOT NULL,
        sma50 REAL NOT NULL,
        golden_cross INTEGER NOT NULL,
        rsi REAL NOT NULL,
        macd REAL NOT NULL,
        signal REAL NOT NULL,
        macd_buy_signal INTEGER NOT NULL,
        recommended INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS prediction_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ticker TEXT NOT NULL,
        prediction_date TEXT NOT NULL,
        last_close REAL NOT NULL,
        predicted_close REAL NOT NULL,
        rise_probability REAL NOT NULL,
        accuracy REAL NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sentiment_scores (
        ticker TEXT PRIMARY KEY,
        average_sentiment REAL NOT NULL,
        article_count INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if it does not exist.
    pub async fn connect(database_url: &str) -> Result<Self> {
        // An in-memory database lives inside a single connection, so the
        // pool must never recycle it.
        let pool = SqlitePoolOptions::new()
            .max_connections(if database_url.contains(":memory:") { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to open database {database_url}"))?;

        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&pool)
                .await
                .context("Failed to create schema")?;
        }

        info!(url = database_url, "Connected to SQLite store");
        Ok(Self { pool })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| TraderError::Storage(format!("bad date {s:?}: {e}")).into())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TraderError::Storage(format!("bad timestamp {s:?}: {e}")).into())
}

fn signal_from_row(row: &SqliteRow) -> Result<TechnicalSignal> {
    Ok(TechnicalSignal {
        ticker: row.try_get("ticker")?,
        date: parse_date(&row.try_get::<String, _>("date")?)?,
        close: row.try_get("close")?,
        sma20: row.try_get("sma20")?,
        sma50: row.try_get("sma50")?,
        golden_cross: row.try_get("golden_cross")?,
        rsi: row.try_get("rsi")?,
        macd: row.try_get("macd")?,
        signal: row.try_get("signal")?,
        macd_buy_signal: row.try_get("macd_buy_signal")?,
        recommended: row.try_get("recommended")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn latest_token(&self) -> Result<Option<StoredToken>> {
        let row = sqlx::query(
            "SELECT id, access_token, expiration_time FROM access_tokens
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read access token")?;

        row.map(|r| -> Result<StoredToken> {
            Ok(StoredToken {
                id: r.try_get("id")?,
                access_token: r.try_get("access_token")?,
                expiration_time: r.try_get("expiration_time")?,
            })
        })
        .transpose()
    }

    async fn insert_token(&self, access_token: &str, expires_at: DateTime<Utc>) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO access_tokens (access_token, expiration_time, is_active, created_at)
             VALUES (?, ?, 1, ?)",
        )
        .bind(access_token)
        .bind(expires_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert access token")?;
        Ok(result.last_insert_rowid())
    }

    async fn update_token(&self, id: i64, access_token: &str, expires_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE access_tokens SET access_token = ?, expiration_time = ?, is_active = 1
             WHERE id = ?",
        )
        .bind(access_token)
        .bind(expires_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update access token")?;
        Ok(())
    }

    async fn price_history(&self, since: NaiveDate) -> Result<Vec<PriceBar>> {
        let rows = sqlx::query(
            "SELECT ticker, date, close FROM stock_prices
             WHERE date >= ? ORDER BY ticker ASC, date ASC",
        )
        .bind(since.format("%Y-%m-%d").to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to read price history")?;

        rows.iter()
            .map(|r| -> Result<PriceBar> {
                Ok(PriceBar {
                    ticker: r.try_get("ticker")?,
                    date: parse_date(&r.try_get::<String, _>("date")?)?,
                    close: r.try_get("close")?,
                })
            })
            .collect()
    }

    async fn upsert_prices(&self, bars: &[PriceBar]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for bar in bars {
            sqlx::query(
                "INSERT INTO stock_prices (ticker, date, close) VALUES (?, ?, ?)
                 ON CONFLICT (ticker, date) DO UPDATE SET close = excluded.close",
            )
            .bind(&bar.ticker)
            .bind(bar.date.format("%Y-%m-%d").to_string())
            .bind(bar.close)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert price")?;
        }
        tx.commit().await?;
        debug!(count = bars.len(), "Prices upserted");
        Ok(())
    }

    async fn replace_technical_signals(&self, signals: &[TechnicalSignal]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM technical_signals")
            .execute(&mut *tx)
            .await
            .context("Failed to clear technical signals")?;
        for s in signals {
            sqlx::query(
                "INSERT INTO technical_signals
                 (ticker, date, close, sma20, sma50, golden_cross, rsi, macd, signal,
                  macd_buy_signal, recommended)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&s.ticker)
            .bind(s.date.format("%Y-%m-%d").to_string())
            .bind(s.close)
            .bind(s.sma20)
            .bind(s.sma50)
            .bind(s.golden_cross)
            .bind(s.rsi)
            .bind(s.macd)
            .bind(s.signal)
            .bind(s.macd_buy_signal)
            .bind(s.recommended)
            .execute(&mut *tx)
            .await
            .context("Failed to insert technical signal")?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn technical_signals(&self) -> Result<Vec<TechnicalSignal>> {
        let rows = sqlx::query("SELECT * FROM technical_signals ORDER BY ticker ASC, date ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to read technical signals")?;
        rows.iter().map(signal_from_row).collect()
    }

    async fn predictions(&self) -> Result<Vec<PredictionResult>> {
        let rows = sqlx::query(
            "SELECT ticker, prediction_date, last_close, predicted_close, rise_probability,
                    accuracy, created_at
             FROM prediction_results ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to read predictions")?;

        rows.iter()
            .map(|r| -> Result<PredictionResult> {
                Ok(PredictionResult {
                    ticker: r.try_get("ticker")?,
                    prediction_date: parse_date(&r.try_get::<String, _>("prediction_date")?)?,
                    last_close: r.try_get("last_close")?,
                    predicted_close: r.try_get("predicted_close")?,
                    rise_probability: r.try_get("rise_probability")?,
                    accuracy: r.try_get("accuracy")?,
                    created_at: parse_timestamp(&r.try_get::<String, _>("created_at")?)?,
                })
            })
            .collect()
    }

    async fn insert_prediction(&self, p: &PredictionResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO prediction_results
             (ticker, prediction_date, last_close, predicted_close, rise_probability, accuracy, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&p.ticker)
        .bind(p.prediction_date.format("%Y-%m-%d").to_string())
        .bind(p.last_close)
        .bind(p.predicted_close)
        .bind(p.rise_probability)
        .bind(p.accuracy)
        .bind(p.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert prediction")?;
        Ok(())
    }

    async fn replace_sentiment(&self, scores: &[SentimentScore]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sentiment_scores")
            .execute(&mut *tx)
            .await
            .context("Failed to clear sentiment")?;
        for s in scores {
            sqlx::query(
                "INSERT INTO sentiment_scores (ticker, average_sentiment, article_count, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (ticker) DO UPDATE SET
                    average_sentiment = excluded.average_sentiment,
                    article_count = excluded.article_count,
                    updated_at = excluded.updated_at",
            )
            .bind(&s.ticker)
            .bind(s.average_sentiment)
            .bind(i64::from(s.article_count))
            .bind(s.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .context("Failed to insert sentiment")?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn sentiment(&self) -> Result<Vec<SentimentScore>> {
        let rows = sqlx::query(
            "SELECT ticker, average_sentiment, article_count, updated_at
             FROM sentiment_scores ORDER BY ticker ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to read sentiment")?;

        rows.iter()
            .map(|r| -> Result<SentimentScore> {
                let count: i64 = r.try_get("article_count")?;
                Ok(SentimentScore {
                    ticker: r.try_get("ticker")?,
                    average_sentiment: r.try_get("average_sentiment")?,
                    article_count: u32::try_from(count).unwrap_or(0),
                    updated_at: parse_timestamp(&r.try_get::<String, _>("updated_at")?)?,
                })
            })
            .collect()
    }
}
