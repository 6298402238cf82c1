//! Access-token lifecycle.
//!
//! The brokerage issues bearer tokens from `POST /oauth2/tokenP`, valid
//! for about a day, and refuses more than one issuance per minute
//! (`EGW00133`). `TokenManager` layers three caches in front of the
//! issuer: an in-memory copy, the newest row in the `access_tokens`
//! table, and finally a fresh issuance behind a process-wide gate.
//!
//! Only one task refreshes at a time. Callers arriving while a refresh is
//! in flight wait on the same lock and then find the new token in the
//! memory cache.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Credentials, TokenConfig};
use crate::storage::Store;
use crate::types::TraderError;

/// Lifetime assumed when the issuance response omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 86_400;

// ---------------------------------------------------------------------------
// Issuer
// ---------------------------------------------------------------------------

/// A freshly issued token.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: i64,
}

/// One issuance call against the brokerage. No caching, no retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<IssuedToken>;
}

/// `TokenIssuer` over HTTP.
pub struct HttpTokenIssuer {
    http: Client,
    url: String,
    credentials: Credentials,
}

impl HttpTokenIssuer {
    pub fn new(http: Client, base_url: &str, credentials: Credentials) -> Self {
        Self {
            http,
            url: format!("{}/oauth2/tokenP", base_url.trim_end_matches('/')),
            credentials,
        }
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(&self) -> Result<IssuedToken> {
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.credentials.app_key.expose_secret(),
            "appsecret": self.credentials.app_secret.expose_secret(),
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("Token issuance request failed")?;

        let status = resp.status();
        let text = resp.text().await.context("Failed to read token response")?;
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if let Some(token) = value.get("access_token").and_then(Value::as_str) {
            let expires_in = value
                .get("expires_in")
                .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
                .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
            return Ok(IssuedToken {
                access_token: token.to_string(),
                expires_in,
            });
        }

        let code = ["error_code", "msg_cd"]
            .iter()
            .find_map(|k| value.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP_{}", status.as_u16()));
        Err(TraderError::TokenIssue { code, body: text }.into())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TokenSettings {
    /// Minimum spacing between issuance calls, process-wide.
    pub min_refresh_interval: Duration,
    /// Wait after an `EGW00133` rejection.
    pub rate_limit_wait: Duration,
    pub max_issue_attempts: u32,
}

impl From<&TokenConfig> for TokenSettings {
    fn from(cfg: &TokenConfig) -> Self {
        Self {
            min_refresh_interval: Duration::from_secs(cfg.min_refresh_interval_secs),
            rate_limit_wait: Duration::from_secs(cfg.rate_limit_wait_secs),
            max_issue_attempts: cfg.max_issue_attempts,
        }
    }
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self::from(&TokenConfig::default())
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// State guarded by the refresh lock.
#[derive(Debug, Default)]
struct IssueGate {
    last_issue: Option<Instant>,
}

pub struct TokenManager {
    issuer: Arc<dyn TokenIssuer>,
    store: Arc<dyn Store>,
    settings: TokenSettings,
    cache: RwLock<Option<CachedToken>>,
    gate: Mutex<IssueGate>,
}

impl TokenManager {
    pub fn new(issuer: Arc<dyn TokenIssuer>, store: Arc<dyn Store>, settings: TokenSettings) -> Self {
        Self {
            issuer,
            store,
            settings,
            cache: RwLock::new(None),
            gate: Mutex::new(IssueGate::default()),
        }
    }

    /// Return a usable access token, refreshing if necessary.
    ///
    /// If the refresh path fails for any reason and a token was cached
    /// earlier (even an expired one), that token is returned with a
    /// warning instead of an error.
    pub async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.valid_cached().await {
            return Ok(token);
        }

        let mut gate = self.gate.lock().await;

        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = self.valid_cached().await {
            debug!("Token refreshed by another task");
            return Ok(token);
        }

        match self.load_or_issue(&mut gate).await {
            Ok(token) => Ok(token),
            Err(e) => self.fallback(e).await,
        }
    }

    /// Replace a token the brokerage has rejected.
    ///
    /// If the cache already holds a different valid token (someone else
    /// refreshed first), that token is returned without issuing.
    pub async fn force_refresh(&self, stale: &str) -> Result<String> {
        let mut gate = self.gate.lock().await;

        if let Some(token) = self.valid_cached().await {
            if token != stale {
                return Ok(token);
            }
        }

        warn!("Access token rejected by brokerage, forcing refresh");
        let row_id = match self.store.latest_token().await {
            Ok(row) => row.map(|r| r.id),
            Err(e) => {
                warn!(error = %e, "Could not read stored token before refresh");
                None
            }
        };

        match self.issue_and_persist(&mut gate, row_id).await {
            Ok(token) => Ok(token),
            Err(e) => self.fallback(e).await,
        }
    }

    /// Expiry of the in-memory token, if any.
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.cache.read().await.as_ref().map(|c| c.expires_at)
    }

    async fn valid_cached(&self) -> Option<String> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|c| Utc::now() < c.expires_at)
            .map(|c| c.token.clone())
    }

    async fn set_cache(&self, token: String, expires_at: DateTime<Utc>) {
        *self.cache.write().await = Some(CachedToken { token, expires_at });
    }

    async fn fallback(&self, err: anyhow::Error) -> Result<String> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            warn!(error = %format!("{err:#}"), "Token refresh failed, using cached token");
            return Ok(cached.token.clone());
        }
        Err(err)
    }

    async fn load_or_issue(&self, gate: &mut IssueGate) -> Result<String> {
        let row = self
            .store
            .latest_token()
            .await
            .context("Failed to read stored access token")?;

        let now = Utc::now();
        match &row {
            Some(stored) => {
                let expires_at = parse_expiration(&stored.expiration_time, now);
                if now < expires_at {
                    info!(
                        remaining_mins = (expires_at - now).num_minutes(),
                        "Reusing stored access token"
                    );
                    self.set_cache(stored.access_token.clone(), expires_at).await;
                    return Ok(stored.access_token.clone());
                }
                info!("Stored access token expired, issuing a new one");
            }
            None => info!("No stored access token, issuing a new one"),
        }

        self.issue_and_persist(gate, row.map(|r| r.id)).await
    }

    async fn issue_and_persist(&self, gate: &mut IssueGate, row_id: Option<i64>) -> Result<String> {
        let issued = self.issue_with_retry(gate).await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(issued.expires_in);

        let persisted = match row_id {
            Some(id) => self.store.update_token(id, &issued.access_token, expires_at).await,
            None => self
                .store
                .insert_token(&issued.access_token, expires_at)
                .await
                .map(|_| ()),
        };
        if let Err(e) = persisted {
            warn!(error = %e, "Failed to persist access token, keeping it in memory only");
        }

        self.set_cache(issued.access_token.clone(), expires_at).await;
        Ok(issued.access_token)
    }

    async fn issue_with_retry(&self, gate: &mut IssueGate) -> Result<IssuedToken> {
        let max_attempts = self.settings.max_issue_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.wait_for_gate(gate).await;
            gate.last_issue = Some(Instant::now());

            match self.issuer.issue().await {
                Ok(issued) => {
                    info!(attempt, expires_in = issued.expires_in, "Access token issued");
                    return Ok(issued);
                }
                Err(e) => {
                    let rate_limited = e
                        .downcast_ref::<TraderError>()
                        .is_some_and(TraderError::is_token_rate_limit);
                    if rate_limited && attempt < max_attempts {
                        warn!(
                            attempt,
                            max_attempts,
                            wait_secs = self.settings.rate_limit_wait.as_secs(),
                            "Token issuance rate limited, retrying after wait"
                        );
                        tokio::time::sleep(self.settings.rate_limit_wait).await;
                        continue;
                    }
                    return Err(e.context(format!("Token issuance failed after {attempt} attempt(s)")));
                }
            }
        }
    }

    async fn wait_for_gate(&self, gate: &IssueGate) {
        let Some(last) = gate.last_issue else {
            return;
        };
        let elapsed = last.elapsed();
        if elapsed < self.settings.min_refresh_interval {
            let wait = self.settings.min_refresh_interval - elapsed;
            info!(wait_secs = wait.as_secs_f64(), "Token issuance gate closed, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Parse a stored expiration timestamp.
///
/// Accepts RFC 3339 (any fractional precision), or a naive
/// `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DDTHH:MM:SS` taken as UTC. Anything
/// else is treated as expiring one day from `now`.
pub fn parse_expiration(raw: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return t.with_timezone(&Utc);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(raw, fmt) {
            return t.and_utc();
        }
    }
    warn!(raw, "Unrecognised token expiration format, assuming one day");
    now + chrono::Duration::days(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
