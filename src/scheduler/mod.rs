//! Background jobs: the daily auto-buy, the periodic auto-sell and the
//! daily signal refresh.
//!
//! Each job is its own task with a `watch` stop channel, so jobs start and
//! stop independently. A stop signal is honoured between runs; a run in
//! progress always completes.

pub mod market_hours;
pub mod trader;

use anyhow::Result;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::signals::RecommendationService;
pub use trader::{AutoTrader, MarketGate, RunStatus, TradePacing, TradeReport, UsMarketHours};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    AutoBuy,
    AutoSell,
    Refresh,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::AutoBuy, JobKind::AutoSell, JobKind::Refresh];
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::AutoBuy => write!(f, "auto_buy"),
            JobKind::AutoSell => write!(f, "auto_sell"),
            JobKind::Refresh => write!(f, "refresh"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    /// Once a day at a wall-clock time in the scheduler's zone.
    Daily(NaiveTime),
    /// Fixed period, first run one period after start.
    Every(Duration),
}

/// Result of a signal refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub signals: usize,
    pub recommended: usize,
    /// Symbols scored; `None` when sentiment could not be refreshed.
    pub sentiment_scores: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: JobKind,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub timezone: String,
    pub market_open: bool,
    pub jobs: Vec<JobStatus>,
    pub last_buy: Option<TradeReport>,
    pub last_sell: Option<TradeReport>,
}

struct Job {
    stop: watch::Sender<bool>,
    next_run: watch::Receiver<Option<DateTime<Utc>>>,
    started_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// What a job does when it fires.
#[derive(Clone)]
struct Work {
    trader: Arc<AutoTrader>,
    recommendations: Arc<RecommendationService>,
}

impl Work {
    async fn run(&self, kind: JobKind) {
        match kind {
            JobKind::AutoBuy => {
                self.trader.run_auto_buy().await;
            }
            JobKind::AutoSell => {
                self.trader.run_auto_sell().await;
            }
            JobKind::Refresh => {
                if let Err(e) = refresh(&self.recommendations).await {
                    error!(error = %format!("{e:#}"), "Signal refresh failed");
                }
            }
        }
    }
}

/// Regenerate technical signals, then sentiment. A sentiment failure is
/// logged and leaves the previous scores in place.
async fn refresh(recommendations: &RecommendationService) -> Result<RefreshReport> {
    let signals = recommendations.generate_technical_signals().await?;
    let sentiment_scores = match recommendations.refresh_sentiment().await {
        Ok(scores) => Some(scores.len()),
        Err(e) => {
            warn!(error = %e, "Sentiment refresh skipped");
            None
        }
    };
    Ok(RefreshReport {
        signals: signals.len(),
        recommended: signals.iter().filter(|s| s.recommended).count(),
        sentiment_scores,
    })
}

pub struct Scheduler {
    work: Work,
    gate: Arc<dyn MarketGate>,
    tz: Tz,
    buy_at: NaiveTime,
    refresh_at: NaiveTime,
    sell_interval: Duration,
    jobs: Mutex<HashMap<JobKind, Job>>,
}

impl Scheduler {
    pub fn new(
        trader: Arc<AutoTrader>,
        recommendations: Arc<RecommendationService>,
        gate: Arc<dyn MarketGate>,
        cfg: &SchedulerConfig,
    ) -> Result<Self> {
        Ok(Self {
            work: Work {
                trader,
                recommendations,
            },
            gate,
            tz: cfg.tz()?,
            buy_at: cfg.buy_time()?,
            refresh_at: cfg.refresh_time()?,
            sell_interval: Duration::from_secs(cfg.sell_interval_secs.max(1)),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    fn trigger(&self, kind: JobKind) -> Trigger {
        match kind {
            JobKind::AutoBuy => Trigger::Daily(self.buy_at),
            JobKind::AutoSell => Trigger::Every(self.sell_interval),
            JobKind::Refresh => Trigger::Daily(self.refresh_at),
        }
    }

    // -- Lifecycle --

    /// Start a job. Returns `false` if it is already running.
    pub async fn start(&self, kind: JobKind) -> bool {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(&kind).is_some_and(|j| !j.handle.is_finished()) {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (next_tx, next_rx) = watch::channel(None);
        let trigger = self.trigger(kind);
        let work = self.work.clone();
        let tz = self.tz;
        let handle = tokio::spawn(
            job_loop(kind, trigger, tz, work, stop_rx, next_tx).instrument(info_span!("job", job = %kind)),
        );

        jobs.insert(
            kind,
            Job {
                stop: stop_tx,
                next_run: next_rx,
                started_at: Utc::now(),
                handle,
            },
        );
        info!(job = %kind, ?trigger, "Job started");
        true
    }

    /// Stop a job and wait for it to exit. Returns `false` if it was not
    /// running.
    pub async fn stop(&self, kind: JobKind) -> bool {
        let Some(job) = self.jobs.lock().await.remove(&kind) else {
            return false;
        };
        let was_running = !job.handle.is_finished();
        let _ = job.stop.send(true);
        if let Err(e) = job.handle.await {
            error!(job = %kind, error = %e, "Job task ended abnormally");
        }
        info!(job = %kind, "Job stopped");
        was_running
    }

    pub async fn start_auto_buy(&self) -> bool {
        self.start(JobKind::AutoBuy).await
    }

    pub async fn stop_auto_buy(&self) -> bool {
        self.stop(JobKind::AutoBuy).await
    }

    pub async fn start_auto_sell(&self) -> bool {
        self.start(JobKind::AutoSell).await
    }

    pub async fn stop_auto_sell(&self) -> bool {
        self.stop(JobKind::AutoSell).await
    }

    pub async fn start_refresh(&self) -> bool {
        self.start(JobKind::Refresh).await
    }

    pub async fn stop_refresh(&self) -> bool {
        self.stop(JobKind::Refresh).await
    }

    /// Stop every job concurrently.
    pub async fn shutdown(&self) {
        let jobs: Vec<(JobKind, Job)> = self.jobs.lock().await.drain().collect();
        if jobs.is_empty() {
            return;
        }
        info!(jobs = jobs.len(), "Stopping scheduler jobs");
        let waits = jobs.into_iter().map(|(kind, job)| async move {
            let _ = job.stop.send(true);
            if let Err(e) = job.handle.await {
                error!(job = %kind, error = %e, "Job task ended abnormally");
            }
        });
        futures::future::join_all(waits).await;
        info!("Scheduler stopped");
    }

    // -- Manual runs --

    pub async fn run_auto_buy_now(&self) -> TradeReport {
        self.work.trader.run_auto_buy().await
    }

    pub async fn run_auto_sell_now(&self) -> TradeReport {
        self.work.trader.run_auto_sell().await
    }

    pub async fn run_refresh_now(&self) -> Result<RefreshReport> {
        refresh(&self.work.recommendations).await
    }

    // -- Status --

    pub async fn is_running(&self, kind: JobKind) -> bool {
        self.jobs
            .lock()
            .await
            .get(&kind)
            .is_some_and(|j| !j.handle.is_finished())
    }

    pub async fn status(&self) -> SchedulerStatus {
        let jobs = {
            let guard = self.jobs.lock().await;
            JobKind::ALL
                .iter()
                .map(|kind| match guard.get(kind) {
                    Some(job) if !job.handle.is_finished() => JobStatus {
                        job: *kind,
                        running: true,
                        started_at: Some(job.started_at),
                        next_run: *job.next_run.borrow(),
                    },
                    _ => JobStatus {
                        job: *kind,
                        running: false,
                        started_at: None,
                        next_run: None,
                    },
                })
                .collect()
        };
        SchedulerStatus {
            timezone: self.tz.name().to_string(),
            market_open: self.gate.is_open(),
            jobs,
            last_buy: self.work.trader.last_buy().await,
            last_sell: self.work.trader.last_sell().await,
        }
    }
}

/// How a running job waits for its next firing.
enum Clock {
    Interval(tokio::time::Interval, Duration),
    Daily(NaiveTime),
}

impl Clock {
    fn new(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Every(period) => {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                Clock::Interval(interval, period)
            }
            Trigger::Daily(at) => Clock::Daily(at),
        }
    }

    /// Publish the next due time and wait for it.
    async fn wait(&mut self, tz: Tz, next_run: &watch::Sender<Option<DateTime<Utc>>>) {
        match self {
            Clock::Interval(interval, period) => {
                let ahead = chrono::Duration::from_std(*period).unwrap_or_else(|_| chrono::Duration::zero());
                next_run.send_replace(Some(Utc::now() + ahead));
                interval.tick().await;
            }
            Clock::Daily(at) => {
                let now = Utc::now();
                let due = market_hours::next_daily_run(now, tz, *at);
                next_run.send_replace(Some(due));
                tokio::time::sleep((due - now).to_std().unwrap_or_default()).await;
            }
        }
    }
}

async fn job_loop(
    kind: JobKind,
    trigger: Trigger,
    tz: Tz,
    work: Work,
    mut stop: watch::Receiver<bool>,
    next_run: watch::Sender<Option<DateTime<Utc>>>,
) {
    let mut clock = Clock::new(trigger);
    loop {
        tokio::select! {
            _ = clock.wait(tz, &next_run) => {
                info!("Job firing");
                work.run(kind).await;
            }
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }
    }
    next_run.send_replace(None);
}
