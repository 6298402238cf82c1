//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (app key, app secret, account number) are referenced by
//! env-var name in the config and resolved at runtime.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::types::{Environment, TraderError};

/// Paper-trading server.
pub const MOCK_BASE_URL: &str = "https://openapivts.koreainvestment.com:29443";
/// Live-trading server.
pub const REAL_BASE_URL: &str = "https://openapi.koreainvestment.com:9443";
/// Environment variable that overrides every other base URL setting.
pub const BASE_URL_ENV: &str = "KIS_BASE_URL";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub token: TokenConfig,
    pub scheduler: SchedulerConfig,
    pub strategy: StrategyConfig,
    pub sentiment: SentimentConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub catalog: Vec<CatalogEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            token: TokenConfig::default(),
            scheduler: SchedulerConfig::default(),
            strategy: StrategyConfig::default(),
            sentiment: SentimentConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            catalog: default_catalog(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub environment: Environment,
    pub base_url: Option<String>,
    pub app_key_env: String,
    pub app_secret_env: String,
    pub account_env: String,
    pub product_code_env: String,
    pub timeout_secs: u64,
    /// Delay before retrying a query whose token was rejected.
    pub retry_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Mock,
            base_url: None,
            app_key_env: "KIS_APPKEY".into(),
            app_secret_env: "KIS_APPSECRET".into(),
            account_env: "KIS_CANO".into(),
            product_code_env: "KIS_ACNT_PRDT_CD".into(),
            timeout_secs: 30,
            retry_delay_ms: 1000,
        }
    }
}

impl BrokerConfig {
    /// Resolve the API base URL: explicit override, then config, then the
    /// environment's default server.
    pub fn base_url(&self, env_override: Option<String>) -> String {
        let url = env_override
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.base_url.clone())
            .unwrap_or_else(|| match self.environment {
                Environment::Real => REAL_BASE_URL.to_string(),
                Environment::Mock => MOCK_BASE_URL.to_string(),
            });
        url.trim_end_matches('/').to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TokenConfig {
    /// Minimum spacing between two token issuance calls.
    pub min_refresh_interval_secs: u64,
    /// Wait after the brokerage reports its issuance rate limit.
    pub rate_limit_wait_secs: u64,
    pub max_issue_attempts: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            min_refresh_interval_secs: 60,
            rate_limit_wait_secs: 61,
            max_issue_attempts: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// IANA zone the daily jobs are expressed in.
    pub timezone: String,
    /// Daily auto-buy time, "HH:MM".
    pub buy_at: String,
    /// Daily signal/sentiment refresh time, "HH:MM".
    pub refresh_at: String,
    pub sell_interval_secs: u64,
    pub autostart_buy: bool,
    pub autostart_sell: bool,
    pub autostart_refresh: bool,
    pub balance_pacing_ms: u64,
    pub buy_pacing_ms: u64,
    pub sell_pacing_ms: u64,
    pub error_pacing_ms: u64,
    pub rate_limit_backoff_ms: u64,
    pub empty_price_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Seoul".into(),
            buy_at: "00:00".into(),
            refresh_at: "06:05".into(),
            sell_interval_secs: 60,
            autostart_buy: true,
            autostart_sell: true,
            autostart_refresh: true,
            balance_pacing_ms: 500,
            buy_pacing_ms: 1000,
            sell_pacing_ms: 2000,
            error_pacing_ms: 1000,
            rate_limit_backoff_ms: 3000,
            empty_price_backoff_ms: 2000,
        }
    }
}

impl SchedulerConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| TraderError::Config(format!("bad timezone {}: {e}", self.timezone)).into())
    }

    pub fn buy_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.buy_at)
    }

    pub fn refresh_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.refresh_at)
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("Invalid time of day (expected HH:MM): {s}"))
}

/// Thresholds for the recommendation rules.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StrategyConfig {
    pub history_days: i64,
    pub min_accuracy: f64,
    pub min_rise_probability: f64,
    pub buy_sentiment_threshold: f64,
    pub sell_sentiment_threshold: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            history_days: 180,
            min_accuracy: 80.0,
            min_rise_probability: 3.0,
            buy_sentiment_threshold: 0.15,
            sell_sentiment_threshold: -0.15,
            take_profit_pct: 5.0,
            stop_loss_pct: -7.0,
            rsi_oversold: 50.0,
            rsi_overbought: 70.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SentimentConfig {
    pub api_key_env: String,
    pub lookback_days: i64,
    pub min_relevance: f64,
    pub request_interval_secs: u64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            api_key_env: "ALPHA_VANTAGE_API_KEY".into(),
            lookback_days: 3,
            min_relevance: 0.2,
            request_interval_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// `sqlite://...` URL, or `memory` for a non-persistent store.
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://kis_trader.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: true, port: 8000 }
    }
}

/// One tradable instrument.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CatalogEntry {
    /// Ticker, optionally with a venue suffix (`.N` NYSE, `.X` NASDAQ).
    pub ticker: String,
    pub name: String,
    /// Funds are excluded from signal generation.
    #[serde(default)]
    pub etf: bool,
}

fn default_catalog() -> Vec<CatalogEntry> {
    const STOCKS: &[(&str, &str)] = &[
        ("AAPL", "Apple"),
        ("MSFT", "Microsoft"),
        ("AMZN", "Amazon"),
        ("GOOGL", "Alphabet Class A"),
        ("GOOG", "Alphabet Class C"),
        ("META", "Meta"),
        ("TSLA", "Tesla"),
        ("NVDA", "NVIDIA"),
        ("COST", "Costco"),
        ("NFLX", "Netflix"),
        ("PYPL", "PayPal"),
        ("INTC", "Intel"),
        ("CSCO", "Cisco"),
        ("CMCSA", "Comcast"),
        ("PEP", "PepsiCo"),
        ("AMGN", "Amgen"),
        ("HON", "Honeywell"),
        ("SBUX", "Starbucks"),
        ("MDLZ", "Mondelez"),
        ("MU", "Micron"),
        ("AVGO", "Broadcom"),
        ("ADBE", "Adobe"),
        ("TXN", "Texas Instruments"),
        ("AMD", "AMD"),
        ("AMAT", "Applied Materials"),
    ];
    const FUNDS: &[(&str, &str)] = &[("SPY", "S&P 500 ETF"), ("QQQ", "NASDAQ 100 ETF")];

    let stocks = STOCKS.iter().map(|(t, n)| (t, n, false));
    let funds = FUNDS.iter().map(|(t, n)| (t, n, true));
    stocks
        .chain(funds)
        .map(|(ticker, name, etf)| CatalogEntry {
            ticker: ticker.to_string(),
            name: name.to_string(),
            etf,
        })
        .collect()
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.scheduler.tz()?;
        config.scheduler.buy_time()?;
        config.scheduler.refresh_time()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

/// Brokerage credentials and account identifiers resolved from the
/// environment.
#[derive(Clone)]
pub struct Credentials {
    pub app_key: SecretString,
    pub app_secret: SecretString,
    /// Account number (`CANO`), first 8 digits.
    pub account: String,
    /// Account product code (`ACNT_PRDT_CD`), last 2 digits.
    pub product_code: String,
}

impl Credentials {
    pub fn from_config(cfg: &BrokerConfig) -> Result<Self> {
        Ok(Self {
            app_key: SecretString::new(AppConfig::resolve_env(&cfg.app_key_env)?),
            app_secret: SecretString::new(AppConfig::resolve_env(&cfg.app_secret_env)?),
            account: AppConfig::resolve_env(&cfg.account_env)?,
            product_code: AppConfig::resolve_env(&cfg.product_code_env)?,
        })
    }

    pub fn new(app_key: &str, app_secret: &str, account: &str, product_code: &str) -> Self {
        Self {
            app_key: SecretString::new(app_key.to_string()),
            app_secret: SecretString::new(app_secret.to_string()),
            account: account.to_string(),
            product_code: product_code.to_string(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_key", &"[REDACTED]")
            .field("app_secret", &"[REDACTED]")
            .field("account", &self.account)
            .field("product_code", &self.product_code)
            .finish()
    }
}
