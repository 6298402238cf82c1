//! News sentiment per ticker.
//!
//! API: `https://www.alphavantage.co/query?function=NEWS_SENTIMENT`
//! Auth: `apikey` query param. Free tier: 25 req/day, 5 req/min.
//!
//! Each article lists the tickers it mentions with a relevance score and
//! a ticker-specific sentiment score in [-1, 1]. Only mentions of the
//! requested ticker above a relevance floor are counted.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{AppConfig, SentimentConfig};

pub const ALPHA_VANTAGE_URL: &str = "https://www.alphavantage.co";

/// Source of per-article sentiment scores for a ticker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SentimentSource: Send + Sync {
    /// Scores of recent articles relevant to `ticker`. Empty when there
    /// is no relevant coverage.
    async fn article_scores(&self, ticker: &str) -> Result<Vec<f64>>;
}

/// Mean of the scores, `None` when there are none.
pub fn average(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

// ---------------------------------------------------------------------------
// Alpha Vantage response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NewsResponse {
    #[serde(default)]
    feed: Option<Vec<Article>>,
    /// Present instead of `feed` when the key is throttled or invalid.
    #[serde(default, rename = "Information")]
    information: Option<String>,
    #[serde(default, rename = "Note")]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Article {
    #[serde(default)]
    ticker_sentiment: Vec<TickerSentiment>,
}

#[derive(Debug, Deserialize)]
struct TickerSentiment {
    ticker: String,
    relevance_score: String,
    ticker_sentiment_score: String,
}

fn relevant_scores(articles: &[Article], ticker: &str, min_relevance: f64) -> Vec<f64> {
    articles
        .iter()
        .flat_map(|a| a.ticker_sentiment.iter())
        .filter(|s| s.ticker == ticker)
        .filter_map(|s| {
            let relevance = s.relevance_score.trim().parse::<f64>().ok()?;
            let score = s.ticker_sentiment_score.trim().parse::<f64>().ok()?;
            (relevance >= min_relevance).then_some(score)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct AlphaVantageClient {
    http: Client,
    base_url: String,
    api_key: SecretString,
    lookback_days: i64,
    min_relevance: f64,
}

impl AlphaVantageClient {
    pub fn new(http: Client, base_url: &str, api_key: SecretString, cfg: &SentimentConfig) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            lookback_days: cfg.lookback_days,
            min_relevance: cfg.min_relevance,
        }
    }

    /// Build a client if the configured API key variable is set.
    pub fn from_config(cfg: &SentimentConfig, http: Client) -> Option<Self> {
        match AppConfig::resolve_env(&cfg.api_key_env) {
            Ok(key) => Some(Self::new(http, ALPHA_VANTAGE_URL, SecretString::new(key), cfg)),
            Err(_) => {
                warn!(var = %cfg.api_key_env, "Sentiment API key not set, sentiment refresh disabled");
                None
            }
        }
    }
}

#[async_trait]
impl SentimentSource for AlphaVantageClient {
    async fn article_scores(&self, ticker: &str) -> Result<Vec<f64>> {
        let time_from = (Utc::now() - ChronoDuration::days(self.lookback_days))
            .format("%Y%m%dT0000")
            .to_string();
        let url = format!(
            "{}/query?function=NEWS_SENTIMENT&tickers={}&time_from={}&limit=100&apikey={}",
            self.base_url,
            urlencoding::encode(ticker),
            time_from,
            urlencoding::encode(self.api_key.expose_secret()),
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("News sentiment request failed for {ticker}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("News sentiment API returned HTTP {status} for {ticker}");
        }

        let body: NewsResponse = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse news sentiment for {ticker}"))?;

        let Some(feed) = body.feed else {
            let reason = body.information.or(body.note).unwrap_or_else(|| "no feed".into());
            bail!("News sentiment unavailable for {ticker}: {reason}");
        };

        let scores = relevant_scores(&feed, ticker, self.min_relevance);
        debug!(ticker, articles = feed.len(), relevant = scores.len(), "Fetched news sentiment");
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn client(base: &str) -> AlphaVantageClient {
        AlphaVantageClient::new(
            Client::new(),
            base,
            SecretString::new("demo".into()),
            &SentimentConfig::default(),
        )
    }

    #[test]
    fn test_average() {
        assert_eq!(average(&[]), None);
        assert!((average(&[0.2, 0.4]).unwrap() - 0.3).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_relevant_scores_only() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/query")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("function".into(), "NEWS_SENTIMENT".into()),
                Matcher::UrlEncoded("tickers".into(), "AAPL".into()),
                Matcher::UrlEncoded("apikey".into(), "demo".into()),
            ]))
            .with_status(200)
            .with_body(
                json!({
                    "feed": [
                        {"ticker_sentiment": [
                            {"ticker": "AAPL", "relevance_score": "0.9", "ticker_sentiment_score": "0.4"},
                            {"ticker": "MSFT", "relevance_score": "0.9", "ticker_sentiment_score": "-0.9"}
                        ]},
                        {"ticker_sentiment": [
                            {"ticker": "AAPL", "relevance_score": "0.1", "ticker_sentiment_score": "-0.8"}
                        ]},
                        {"ticker_sentiment": [
                            {"ticker": "AAPL", "relevance_score": "0.2", "ticker_sentiment_score": "0.2"}
                        ]}
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let scores = client(&server.url()).article_scores("AAPL").await.unwrap();
        assert_eq!(scores, vec![0.4, 0.2]);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_throttled_response_is_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"Information":"rate limit reached"}"#)
            .create_async()
            .await;

        let err = client(&server.url()).article_scores("AAPL").await.unwrap_err();
        assert!(err.to_string().contains("rate limit"));
    }

    #[tokio::test]
    async fn test_http_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/query")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        assert!(client(&server.url()).article_scores("AAPL").await.is_err());
    }
}
