//! Buy and sell recommendations.
//!
//! Three inputs are combined:
//! - technical signals computed here from stored daily closes,
//! - price predictions written to the store by the offline model,
//! - news sentiment refreshed from a `SentimentSource`.
//!
//! Technical rows and predictions are keyed by catalog ticker (which may
//! carry a venue suffix); sentiment and holdings by bare symbol.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::catalog::Catalog;
use super::indicators;
use super::sentiment::{self, SentimentSource};
use crate::broker::account::all_overseas_holdings;
use crate::broker::Brokerage;
use crate::config::StrategyConfig;
use crate::storage::Store;
use crate::types::{
    BuyCandidate, Holding, PredictionResult, SellCandidate, SentimentScore, TechnicalSignal,
    TraderError,
};

const SMA_SHORT: usize = 20;
const SMA_LONG: usize = 50;
const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;

/// Technical conditions needed for a buy.
const MIN_BUY_CONDITIONS: u8 = 2;
/// Sell signals that trigger a sale regardless of sentiment.
const STRONG_SELL_SIGNALS: u8 = 3;
/// Sell signals that trigger a sale when sentiment is negative.
const SENTIMENT_SELL_SIGNALS: u8 = 2;

/// Pacing for recommendation-side brokerage and news calls.
#[derive(Debug, Clone)]
pub struct ServicePacing {
    pub balance: Duration,
    pub sentiment: Duration,
}

impl Default for ServicePacing {
    fn default() -> Self {
        Self {
            balance: Duration::from_millis(500),
            sentiment: Duration::from_secs(5),
        }
    }
}

pub struct RecommendationService {
    store: Arc<dyn Store>,
    broker: Arc<dyn Brokerage>,
    sentiment: Option<Arc<dyn SentimentSource>>,
    catalog: Catalog,
    strategy: StrategyConfig,
    pacing: ServicePacing,
}

impl RecommendationService {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn Brokerage>,
        sentiment: Option<Arc<dyn SentimentSource>>,
        catalog: Catalog,
        strategy: StrategyConfig,
        pacing: ServicePacing,
    ) -> Self {
        Self {
            store,
            broker,
            sentiment,
            catalog,
            strategy,
            pacing,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // -- Technical signals --

    /// Recompute the latest technical snapshot for every catalog stock
    /// and replace the stored set.
    ///
    /// Tickers whose history is too short for every indicator are left
    /// out rather than stored with gaps.
    pub async fn generate_technical_signals(&self) -> Result<Vec<TechnicalSignal>> {
        let since = Utc::now().date_naive() - ChronoDuration::days(self.strategy.history_days);
        let bars = self.store.price_history(since).await?;

        let mut series: HashMap<&str, Vec<(chrono::NaiveDate, f64)>> = HashMap::new();
        for bar in &bars {
            series.entry(bar.ticker.as_str()).or_default().push((bar.date, bar.close));
        }

        let mut signals = Vec::new();
        for entry in self.catalog.stocks() {
            let Some(points) = series.get_mut(entry.ticker.as_str()) else {
                debug!(ticker = %entry.ticker, "No price history");
                continue;
            };
            points.sort_by_key(|(d, _)| *d);
            let closes: Vec<f64> = points.iter().map(|(_, c)| *c).collect();
            let date = points[points.len() - 1].0;

            match self.latest_signal(&entry.ticker, date, &closes) {
                Some(signal) => signals.push(signal),
                None => debug!(ticker = %entry.ticker, days = closes.len(), "Insufficient history"),
            }
        }

        self.store.replace_technical_signals(&signals).await?;
        info!(
            computed = signals.len(),
            recommended = signals.iter().filter(|s| s.recommended).count(),
            "Technical signals regenerated"
        );
        Ok(signals)
    }

    fn latest_signal(&self, ticker: &str, date: chrono::NaiveDate, closes: &[f64]) -> Option<TechnicalSignal> {
        let last = closes.len().checked_sub(1)?;
        let sma20 = indicators::sma(closes, SMA_SHORT)[last]?;
        let sma50 = indicators::sma(closes, SMA_LONG)[last]?;
        let rsi = indicators::rsi(closes, RSI_PERIOD)[last]?;
        let (macd_line, signal_line) = indicators::macd(closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
        let (macd, signal) = (macd_line[last], signal_line[last]);

        let mut snapshot = TechnicalSignal {
            ticker: ticker.to_string(),
            date,
            close: closes[last],
            sma20,
            sma50,
            golden_cross: sma20 > sma50,
            rsi,
            macd,
            signal,
            macd_buy_signal: macd > signal,
            recommended: false,
        };
        snapshot.recommended = snapshot.buy_conditions(self.strategy.rsi_oversold) >= MIN_BUY_CONDITIONS;
        Some(snapshot)
    }

    /// Newest technical row per ticker.
    async fn latest_technical(&self) -> Result<HashMap<String, TechnicalSignal>> {
        let mut latest: HashMap<String, TechnicalSignal> = HashMap::new();
        for row in self.store.technical_signals().await? {
            match latest.get(&row.ticker) {
                Some(existing) if existing.date >= row.date => {}
                _ => {
                    latest.insert(row.ticker.clone(), row);
                }
            }
        }
        Ok(latest)
    }

    // -- Predictions --

    /// Model predictions above the accuracy and rise thresholds, newest
    /// per ticker, highest rise first.
    pub async fn prediction_recommendations(&self) -> Result<Vec<PredictionResult>> {
        let mut rows = self.store.predictions().await?;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut seen = BTreeSet::new();
        let mut picked: Vec<PredictionResult> = rows
            .into_iter()
            .filter(|p| seen.insert(p.ticker.clone()))
            .filter(|p| {
                p.accuracy >= self.strategy.min_accuracy
                    && p.rise_probability >= self.strategy.min_rise_probability
            })
            .collect();
        picked.sort_by(|a, b| b.rise_probability.total_cmp(&a.rise_probability));
        Ok(picked)
    }

    // -- Buy side --

    /// Predicted risers that also meet the technical conditions, ranked
    /// by composite score.
    pub async fn buy_candidates(&self) -> Result<Vec<BuyCandidate>> {
        let technical = self.latest_technical().await?;
        let predictions = self.prediction_recommendations().await?;
        let sentiment: HashMap<String, f64> = self
            .store
            .sentiment()
            .await?
            .into_iter()
            .filter(|s| s.average_sentiment >= self.strategy.buy_sentiment_threshold)
            .map(|s| (s.ticker, s.average_sentiment))
            .collect();

        let mut candidates: Vec<BuyCandidate> = predictions
            .iter()
            .filter_map(|p| {
                let tech = technical.get(&p.ticker)?;
                if tech.buy_conditions(self.strategy.rsi_oversold) < MIN_BUY_CONDITIONS {
                    return None;
                }
                let symbol = Catalog::listing(&p.ticker).0;
                let sentiment = sentiment.get(&symbol).copied();
                Some(BuyCandidate {
                    ticker: p.ticker.clone(),
                    name: self.catalog.name_of(&p.ticker),
                    rise_probability: p.rise_probability,
                    accuracy: p.accuracy,
                    golden_cross: tech.golden_cross,
                    rsi: tech.rsi,
                    macd_buy_signal: tech.macd_buy_signal,
                    sentiment,
                    composite_score: composite_score(p.rise_probability, tech, sentiment, self.strategy.rsi_oversold),
                })
            })
            .collect();

        candidates.sort_by(|a, b| b.composite_score.total_cmp(&a.composite_score));
        debug!(count = candidates.len(), "Buy candidates ranked");
        Ok(candidates)
    }

    // -- Sell side --

    /// Held positions meeting a sell rule, using live holdings.
    pub async fn sell_candidates(&self) -> Result<Vec<SellCandidate>> {
        let holdings = all_overseas_holdings(self.broker.as_ref(), self.pacing.balance).await?;
        self.sell_candidates_for(&holdings).await
    }

    /// Held positions meeting a sell rule, largest move first.
    pub async fn sell_candidates_for(&self, holdings: &[Holding]) -> Result<Vec<SellCandidate>> {
        let technical = self.latest_technical().await?;
        let by_symbol: HashMap<String, &TechnicalSignal> = technical
            .values()
            .map(|t| (Catalog::listing(&t.ticker).0, t))
            .collect();
        let sentiment: HashMap<String, f64> = self
            .store
            .sentiment()
            .await?
            .into_iter()
            .map(|s| (s.ticker, s.average_sentiment))
            .collect();

        let s = &self.strategy;
        let mut candidates = Vec::new();
        for h in holdings.iter().filter(|h| h.quantity > 0) {
            let change = h.change_pct();
            let mut reasons = Vec::new();

            if change >= s.take_profit_pct {
                reasons.push(format!("take profit: {change:+.2}% vs average cost"));
            } else if change <= s.stop_loss_pct {
                reasons.push(format!("stop loss: {change:+.2}% vs average cost"));
            }

            let mut details = Vec::new();
            if let Some(tech) = by_symbol.get(&h.symbol) {
                if !tech.golden_cross {
                    details.push("dead cross".to_string());
                }
                if tech.rsi > s.rsi_overbought {
                    details.push(format!("RSI overbought ({:.2})", tech.rsi));
                }
                if !tech.macd_buy_signal {
                    details.push("MACD below signal".to_string());
                }
            }
            let signals = details.len() as u8;
            let score = sentiment.get(&h.symbol).copied();

            if signals >= STRONG_SELL_SIGNALS {
                reasons.push(format!("all technical sell signals: {}", details.join(", ")));
            } else if let Some(sc) = score.filter(|sc| *sc < s.sell_sentiment_threshold) {
                if signals >= SENTIMENT_SELL_SIGNALS {
                    reasons.push(format!(
                        "negative sentiment ({sc:.2}) with {signals} sell signals: {}",
                        details.join(", ")
                    ));
                }
            }

            if reasons.is_empty() {
                continue;
            }
            candidates.push(SellCandidate {
                symbol: h.symbol.clone(),
                name: h.name.clone(),
                exchange: h.exchange.clone(),
                quantity: h.quantity,
                avg_price: h.avg_price,
                current_price: h.current_price,
                change_pct: change,
                technical_sell_signals: signals,
                sentiment: score,
                reasons,
            });
        }

        candidates.sort_by(|a, b| b.change_pct.abs().total_cmp(&a.change_pct.abs()));
        Ok(candidates)
    }

    // -- Sentiment --

    /// Refresh sentiment for recommended and held symbols and replace
    /// the stored scores.
    ///
    /// A symbol whose fetch fails or has no relevant coverage gets no
    /// score. Holdings that cannot be read only narrow the symbol set.
    pub async fn refresh_sentiment(&self) -> Result<Vec<SentimentScore>> {
        let Some(source) = &self.sentiment else {
            return Err(TraderError::Config("no sentiment source configured".into()).into());
        };

        let mut symbols: BTreeSet<String> = self
            .prediction_recommendations()
            .await?
            .iter()
            .map(|p| Catalog::listing(&p.ticker).0)
            .collect();
        match all_overseas_holdings(self.broker.as_ref(), self.pacing.balance).await {
            Ok(holdings) => symbols.extend(holdings.into_iter().map(|h| h.symbol)),
            Err(e) => warn!(error = %e, "Holdings unavailable, refreshing recommended symbols only"),
        }

        if symbols.is_empty() {
            info!("No symbols to refresh sentiment for");
            self.store.replace_sentiment(&[]).await?;
            return Ok(Vec::new());
        }

        let mut scores = Vec::new();
        for (i, symbol) in symbols.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.pacing.sentiment).await;
            }
            match source.article_scores(symbol).await {
                Ok(articles) => match sentiment::average(&articles) {
                    Some(avg) => scores.push(SentimentScore {
                        ticker: symbol.clone(),
                        average_sentiment: avg,
                        article_count: articles.len() as u32,
                        updated_at: Utc::now(),
                    }),
                    None => debug!(symbol = %symbol, "No relevant articles"),
                },
                Err(e) => warn!(symbol = %symbol, error = %e, "Sentiment fetch failed"),
            }
        }

        self.store.replace_sentiment(&scores).await?;
        info!(symbols = symbols.len(), scored = scores.len(), "Sentiment refreshed");
        Ok(scores)
    }
}

/// `0.3 × rise + 0.4 × weighted technical conditions + 0.3 × sentiment`,
/// where a golden cross weighs 1.5 and the other conditions 1.
fn composite_score(rise: f64, tech: &TechnicalSignal, sentiment: Option<f64>, rsi_oversold: f64) -> f64 {
    let technical = 1.5 * f64::from(u8::from(tech.golden_cross))
        + f64::from(u8::from(tech.rsi < rsi_oversold))
        + f64::from(u8::from(tech.macd_buy_signal));
    0.3 * rise + 0.4 * technical + 0.3 * sentiment.unwrap_or(0.0)
}
