//! Collection run orchestration: scheduling, history updates, trends and alerts.

mod alerts;
mod config;
mod trend;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ptp_adapters::{
    CollectionError, Collector, FixtureSearchSource, HtmlSearchSource, Normalizer, SearchContext,
    SearchSource,
};
use ptp_core::{Snapshot, TrendRecord};
use ptp_storage::{History, HistoryError, HistoryView, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use alerts::{
    qualifies, qualifying_offers, AlertDispatcher, AlertError, AlertInput, AlertRecord, AlertState,
    compose_email, ChannelError, DispatchOutcome, LogChannel, MemoryChannel, MessageChannel,
    SentMessage, SmtpChannel, WebhookChannel,
};
pub use config::{
    AlertConfig, ChannelSettings, CollectionConfig, ConfigError, HtmlSourceConfig, SourceSettings,
    TrackerConfig, DEFAULT_CONFIG_PATH, MAX_INTERVAL_MINUTES, MAX_PAGE_COUNT,
};
pub use trend::{variation_percent, TrendAnalyzer, TrendError};

pub const CRATE_NAME: &str = "ptp-sync";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Collecting,
}

#[derive(Debug, Clone, Default)]
struct RunnerState {
    last_run_at: Option<DateTime<Utc>>,
    next_eligible_run: Option<DateTime<Utc>>,
    alerts: AlertState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerStatus {
    pub phase: RunPhase,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_eligible_run: Option<DateTime<Utc>>,
    pub snapshots: usize,
    pub query: String,
    pub auto_run: bool,
    pub alerts_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub collected_at: DateTime<Utc>,
    pub query: String,
    pub listings: usize,
    pub dropped: usize,
    pub pages_succeeded: u32,
    pub pages_failed: u32,
    pub changes: Vec<TrendRecord>,
    pub alert_outcome: Option<DispatchOutcome>,
    pub alert_error: Option<AlertError>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("busy: a collection run is already in progress")]
    Busy,
    #[error(transparent)]
    Collection(#[from] CollectionError),
    #[error("no_usable_listings: {raw} listings collected, {dropped} dropped during normalization")]
    NoUsableListings { raw: usize, dropped: usize },
    #[error(transparent)]
    History(#[from] HistoryError),
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Collection(err) => err.kind(),
            Self::NoUsableListings { .. } => "no_usable_listings",
            Self::History(err) => err.kind(),
        }
    }
}

/// Holds the in-flight flag for the lifetime of one run.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns the history and alert dedup state and serializes collection runs.
pub struct Runner {
    config: RwLock<TrackerConfig>,
    collector: Collector,
    normalizer: Normalizer,
    trend: TrendAnalyzer,
    dispatcher: AlertDispatcher,
    history: Arc<History>,
    state: Mutex<RunnerState>,
    in_flight: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl Runner {
    pub fn new(
        config: TrackerConfig,
        collector: Collector,
        dispatcher: AlertDispatcher,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            normalizer: Normalizer::new(config.locale),
            config: RwLock::new(config),
            collector,
            trend: TrendAnalyzer::default(),
            dispatcher,
            history: Arc::new(History::new()),
            state: Mutex::new(RunnerState::default()),
            in_flight: AtomicBool::new(false),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the configured search source and message channel.
    pub fn from_config(config: TrackerConfig) -> Result<Self> {
        let source = build_source(&config.source)?;
        let channel = build_channel(&config.channel)?;
        let runner = Self::new(config, Collector::new(source), AlertDispatcher::new(channel))?;
        Ok(runner)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> TrackerConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn history(&self) -> HistoryView {
        HistoryView::new(Arc::clone(&self.history))
    }

    pub fn trend(&self) -> &TrendAnalyzer {
        &self.trend
    }

    pub fn status(&self) -> RunnerStatus {
        let config = self.config();
        let state = self.lock_state();
        RunnerStatus {
            phase: if self.in_flight.load(Ordering::Acquire) {
                RunPhase::Collecting
            } else {
                RunPhase::Idle
            },
            last_run_at: state.last_run_at,
            next_eligible_run: state.next_eligible_run,
            snapshots: self.history.len(),
            query: config.collection.query,
            auto_run: config.collection.auto_run,
            alerts_enabled: config.alerts.enabled,
        }
    }

    /// Replaces the collection and alert settings. The source, channel and
    /// locale stay as built; the next eligible run follows the new interval.
    pub fn update_config(
        &self,
        collection: CollectionConfig,
        alerts: AlertConfig,
    ) -> Result<TrackerConfig, ConfigError> {
        collection.validate()?;
        alerts.validate()?;

        let updated = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            config.collection = collection;
            config.alerts = alerts;
            config.clone()
        };
        let mut state = self.lock_state();
        state.next_eligible_run = state
            .last_run_at
            .map(|last| last + updated.collection.interval());
        info!(
            query = %updated.collection.query,
            page_count = updated.collection.page_count,
            interval_minutes = updated.collection.interval_minutes,
            alerts_enabled = updated.alerts.enabled,
            "tracker config updated"
        );
        Ok(updated)
    }

    pub async fn trigger_manual(&self) -> Result<RunReport, RunError> {
        let _guard = RunGuard::acquire(&self.in_flight).ok_or(RunError::Busy)?;
        self.execute_run().await
    }

    /// Runs when automatic mode is on and `now` has reached the next eligible
    /// run. Returns `Ok(None)` when nothing was due.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Option<RunReport>, RunError> {
        if !self.is_due(now) {
            return Ok(None);
        }
        let _guard = RunGuard::acquire(&self.in_flight).ok_or(RunError::Busy)?;
        // A manual run may have completed between the check and the guard.
        if !self.is_due(now) {
            return Ok(None);
        }
        self.execute_run().await.map(Some)
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        let auto_run = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .collection
            .auto_run;
        auto_run
            && self
                .lock_state()
                .next_eligible_run
                .map_or(true, |next| now >= next)
    }

    fn lock_state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn execute_run(&self) -> Result<RunReport, RunError> {
        let config = self.config();
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "collection_run",
            %run_id,
            query = %config.collection.query,
            source_id = self.collector.source_id()
        );
        let result = self.run_pipeline(run_id, &config).instrument(span.clone()).await;
        if let Err(err) = &result {
            span.in_scope(|| warn!(kind = err.kind(), error = %err, "collection run failed"));
        }
        result
    }

    async fn run_pipeline(&self, run_id: Uuid, config: &TrackerConfig) -> Result<RunReport, RunError> {
        let ctx = SearchContext { run_id };
        let query = config.collection.query.as_str();
        let collected = self
            .collector
            .collect(&ctx, query, config.collection.page_count)
            .await?;

        let batch = self.normalizer.normalize_all(&collected.listings);
        if batch.listings.is_empty() {
            return Err(RunError::NoUsableListings {
                raw: collected.listings.len(),
                dropped: batch.dropped,
            });
        }
        let listing_count = batch.listings.len();

        let collected_at = self.clock.now();
        let snapshot = self
            .history
            .append(Snapshot::new(run_id, collected_at, batch.listings))?;
        {
            let mut state = self.lock_state();
            state.last_run_at = Some(collected_at);
            state.next_eligible_run = Some(collected_at + config.collection.interval());
        }

        let all = self.history.all();
        let changes = self.trend.compute_changes(&all);

        let artifact = if config.alerts.enabled {
            self.trend.render_trend(&all).unwrap_or_else(|err| {
                warn!(error = %err, "trend chart not rendered");
                None
            })
        } else {
            None
        };

        let mut alert_state = self.lock_state().alerts.clone();
        let dispatched = self
            .dispatcher
            .evaluate_and_dispatch(
                AlertInput {
                    query,
                    snapshot: &snapshot,
                    changes: &changes,
                    artifact: artifact.as_ref(),
                },
                &config.alerts,
                &mut alert_state,
            )
            .await;
        self.lock_state().alerts = alert_state;

        let (alert_outcome, alert_error) = match dispatched {
            Ok(outcome) => (Some(outcome), None),
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "alert not delivered");
                (None, Some(err))
            }
        };

        info!(
            listings = listing_count,
            dropped = batch.dropped,
            pages_failed = collected.pages_failed,
            changes = changes.len(),
            "collection run completed"
        );

        Ok(RunReport {
            run_id,
            collected_at,
            query: query.to_string(),
            listings: listing_count,
            dropped: batch.dropped,
            pages_succeeded: collected.pages_succeeded,
            pages_failed: collected.pages_failed,
            changes,
            alert_outcome,
            alert_error,
        })
    }
}

pub fn build_source(settings: &SourceSettings) -> Result<Arc<dyn SearchSource>> {
    match settings {
        SourceSettings::Html(html) => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(html.timeout_secs),
                user_agent: Some(html.user_agent.clone()),
                ..Default::default()
            })?;
            let source = HtmlSearchSource::new(http, html.search.clone())
                .context("configuring html search source")?;
            Ok(Arc::new(source))
        }
        SourceSettings::Fixture { path } => Ok(Arc::new(FixtureSearchSource::load(path)?)),
    }
}

pub fn build_channel(settings: &ChannelSettings) -> Result<Arc<dyn MessageChannel>> {
    match settings {
        ChannelSettings::Log => Ok(Arc::new(LogChannel)),
        ChannelSettings::Webhook { url, timeout_secs } => Ok(Arc::new(WebhookChannel::new(
            url.clone(),
            Duration::from_secs(*timeout_secs),
        )?)),
        ChannelSettings::Smtp {
            server,
            port,
            sender,
            username,
            password_env,
            timeout_secs,
        } => {
            let credentials = match std::env::var(password_env) {
                Ok(password) => Some((username.clone().unwrap_or_else(|| sender.clone()), password)),
                Err(_) => {
                    warn!(password_env = %password_env, "smtp password not set; sending unauthenticated");
                    None
                }
            };
            Ok(Arc::new(SmtpChannel::new(
                server,
                *port,
                sender,
                credentials,
                Duration::from_secs(*timeout_secs),
            )?))
        }
    }
}

/// Polls `runner.tick` every `poll_every`; the job never overlaps a run in
/// progress because runs go through the runner's guard.
pub async fn build_scheduler(runner: Arc<Runner>, poll_every: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(poll_every, move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            match runner.tick(runner.now()).await {
                Ok(Some(report)) => debug!(run_id = %report.run_id, "scheduled run finished"),
                Ok(None) => {}
                Err(RunError::Busy) => debug!("scheduled tick skipped; run in flight"),
                // already logged inside the run span
                Err(_) => {}
            }
        })
    })
    .context("creating polling job")?;
    sched.add(job).await.context("adding polling job")?;
    Ok(sched)
}
