//! Price sync orchestration: the on-demand request path, the daily scheduled
//! job, alerting and the wiring that builds both from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use finca_adapters::{ExtractedPrice, HtmlTablePriceSource, MatchCriteria, PriceSource, ScrapeError};
use finca_core::{
    ErrorCategory, ErrorLogEntry, InvalidPriceError, PriceNormalizer, PriceReading, PriceUnit, ReadingSource,
};
use finca_storage::{
    BackoffPolicy, DocumentStore, ErrorLog, HttpClientConfig, HttpFetcher, InMemoryDocumentStore,
    JsonFileDocumentStore, PgDocumentStore, PriceStore,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod alert;
pub mod clock;

pub use alert::{
    AlertDispatcher, AlertOutcome, AlertThresholds, DispatchError, HttpPushNotifier, LogNotifier, Notifier,
    PushMessage, PushNotification,
};
pub use clock::{start_of_day, Clock, FixedClock, SystemClock};

pub const CRATE_NAME: &str = "finca-sync";

pub const DEFAULT_PRODUCT_LABEL: &str = "Limón Persa";
const SOURCE_ID: &str = "maga-prices";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    Memory,
    File,
    Postgres,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::File => "file",
            StoreBackend::Postgres => "postgres",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "file" => Ok(StoreBackend::File),
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            other => Err(SyncError::UnknownStore(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("FINCA_PRICE_SOURCE_URL is not set")]
    MissingSourceUrl,
    #[error("DATABASE_URL is required when FINCA_STORE=postgres")]
    MissingDatabaseUrl,
    #[error("unknown store backend `{0}` (expected memory, file or postgres)")]
    UnknownStore(String),
    #[error("timezone offset of {0} hours is out of range")]
    InvalidTimezone(i32),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_url: Option<String>,
    pub keywords: String,
    pub product_label: String,
    pub unit: PriceUnit,
    pub currency: String,
    pub thresholds: AlertThresholds,
    pub alert_topic: String,
    pub push_url: Option<String>,
    pub push_token: Option<String>,
    pub schedule_cron: String,
    pub tz_offset_hours: i32,
    pub store: StoreBackend,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_url: None,
            keywords: "limon,persa".to_string(),
            product_label: DEFAULT_PRODUCT_LABEL.to_string(),
            unit: PriceUnit::PerThousand,
            currency: "GTQ".to_string(),
            thresholds: AlertThresholds::default(),
            alert_topic: "price-alerts".to_string(),
            push_url: None,
            push_token: None,
            schedule_cron: "0 0 7 * * *".to_string(),
            tz_offset_hours: -6,
            store: StoreBackend::File,
            data_dir: PathBuf::from("./data"),
            database_url: None,
            user_agent: "finca-price-bot/0.1".to_string(),
            http_timeout_secs: 20,
            http_max_retries: 0,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_opt(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            source_url: env_opt("FINCA_PRICE_SOURCE_URL"),
            keywords: env_opt("FINCA_PRICE_KEYWORDS").unwrap_or(defaults.keywords),
            product_label: env_opt("FINCA_PRODUCT_LABEL").unwrap_or(defaults.product_label),
            unit: env_parse("FINCA_PRICE_UNIT").unwrap_or(defaults.unit),
            currency: env_opt("FINCA_PRICE_CURRENCY").unwrap_or(defaults.currency),
            thresholds: AlertThresholds {
                absolute_price: env_parse::<Decimal>("FINCA_ALERT_ABSOLUTE")
                    .unwrap_or(defaults.thresholds.absolute_price),
                relative_change_percent: env_parse::<Decimal>("FINCA_ALERT_PERCENT")
                    .unwrap_or(defaults.thresholds.relative_change_percent),
            },
            alert_topic: env_opt("FINCA_ALERT_TOPIC").unwrap_or(defaults.alert_topic),
            push_url: env_opt("FINCA_PUSH_URL"),
            push_token: env_opt("FINCA_PUSH_TOKEN"),
            schedule_cron: env_opt("FINCA_SCHEDULE_CRON").unwrap_or(defaults.schedule_cron),
            tz_offset_hours: env_parse("FINCA_TZ_OFFSET_HOURS").unwrap_or(defaults.tz_offset_hours),
            store: env_parse("FINCA_STORE").unwrap_or(defaults.store),
            data_dir: env_opt("FINCA_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            database_url: env_opt("DATABASE_URL"),
            user_agent: env_opt("FINCA_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("FINCA_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            http_max_retries: env_parse("FINCA_HTTP_MAX_RETRIES").unwrap_or(defaults.http_max_retries),
        }
    }

    pub fn timezone(&self) -> Result<FixedOffset, SyncError> {
        self.tz_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or(SyncError::InvalidTimezone(self.tz_offset_hours))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

/// Opens the configured document store. Postgres also gets its schema ensured.
pub async fn open_document_store(config: &SyncConfig) -> Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match config.store {
        StoreBackend::Memory => Arc::new(InMemoryDocumentStore::new()),
        StoreBackend::File => Arc::new(JsonFileDocumentStore::new(config.data_dir.join("documents"))),
        StoreBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or(SyncError::MissingDatabaseUrl)?;
            let pg = PgDocumentStore::connect(url).await.context("connecting to postgres")?;
            pg.ensure_schema().await.context("ensuring document schema")?;
            Arc::new(pg)
        }
    };
    info!(backend = store.backend(), "document store ready");
    Ok(store)
}

/// Why a scrape produced no usable reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScrapeFailureKind {
    FetchFailure,
    NotFound,
    InvalidPrice,
}

impl ScrapeFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeFailureKind::FetchFailure => "fetch-failure",
            ScrapeFailureKind::NotFound => "not-found",
            ScrapeFailureKind::InvalidPrice => "invalid-price",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeFailure {
    pub kind: ScrapeFailureKind,
    pub message: String,
}

impl ScrapeFailure {
    pub fn kind(&self) -> ScrapeFailureKind {
        self.kind
    }
}

impl From<ScrapeError> for ScrapeFailure {
    fn from(err: ScrapeError) -> Self {
        let kind = match &err {
            ScrapeError::Fetch { .. } => ScrapeFailureKind::FetchFailure,
            // A selector that no longer parses is a page-format problem too.
            ScrapeError::NotFound { .. } | ScrapeError::Extract(_) => ScrapeFailureKind::NotFound,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<InvalidPriceError> for ScrapeFailure {
    fn from(err: InvalidPriceError) -> Self {
        Self {
            kind: ScrapeFailureKind::InvalidPrice,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastKnown {
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub captured_at: DateTime<Utc>,
}

impl From<&PriceReading> for LastKnown {
    fn from(reading: &PriceReading) -> Self {
        Self {
            price: reading.price,
            captured_at: reading.captured_at,
        }
    }
}

/// Body of the on-demand price endpoint. Always returned with a success status;
/// callers branch on `ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceResponse {
    pub ok: bool,
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub price: Option<Decimal>,
    pub unit: PriceUnit,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Outer `None` omits the field; `Some(None)` serializes as `null`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known: Option<Option<LastKnown>>,
}

impl PriceResponse {
    fn fresh(reading: &PriceReading, cached: bool) -> Self {
        Self {
            ok: true,
            price: Some(reading.price),
            unit: reading.unit,
            currency: reading.currency.clone(),
            updated_at: Some(reading.captured_at),
            cached: Some(cached),
            error: None,
            last_known: None,
        }
    }
}

pub struct OnDemandOutcome {
    pub response: PriceResponse,
    /// Detached persistence of a fresh scrape. The response never waits on it.
    pub persist_task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledOutcome {
    Persisted {
        reading: PriceReading,
        change_percent: Decimal,
        alert: AlertOutcome,
    },
    ScrapeFailed {
        kind: ScrapeFailureKind,
        message: String,
    },
    PersistFailed {
        message: String,
    },
}

/// Stateless between invocations: every decision goes through the store.
#[derive(Clone)]
pub struct PriceSyncService {
    source: Arc<dyn PriceSource>,
    normalizer: PriceNormalizer,
    store: PriceStore,
    error_log: ErrorLog,
    alerts: Arc<AlertDispatcher>,
    clock: Arc<dyn Clock>,
    tz: FixedOffset,
}

impl PriceSyncService {
    pub fn new(
        source: Arc<dyn PriceSource>,
        normalizer: PriceNormalizer,
        documents: Arc<dyn DocumentStore>,
        alerts: AlertDispatcher,
        clock: Arc<dyn Clock>,
        tz: FixedOffset,
    ) -> Self {
        Self {
            source,
            normalizer,
            store: PriceStore::new(documents.clone()),
            error_log: ErrorLog::new(documents),
            alerts: Arc::new(alerts),
            clock,
            tz,
        }
    }

    pub fn store(&self) -> &PriceStore {
        &self.store
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    pub fn normalizer(&self) -> &PriceNormalizer {
        &self.normalizer
    }

    /// Request-triggered path. Never fails: every failure becomes `ok: false`.
    pub async fn handle_request(&self, force: bool) -> OnDemandOutcome {
        if !force {
            let since = start_of_day(self.clock.now(), self.tz);
            match self.store.latest_since(since).await {
                Ok(Some(reading)) => {
                    info!(price = %reading.price, "serving same-day cached reading");
                    return OnDemandOutcome {
                        response: PriceResponse::fresh(&reading, true),
                        persist_task: None,
                    };
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "same-day cache lookup failed; scraping"),
            }
        }

        let scraped = match self.scrape_price().await {
            Ok(extracted) => self.normalize(&extracted, ReadingSource::OnDemandProxy),
            Err(failure) => Err(failure),
        };

        match scraped {
            Ok(reading) => {
                let store = self.store.clone();
                let to_persist = reading.clone();
                let persist_task = tokio::spawn(async move {
                    if let Err(err) = store.append(&to_persist).await {
                        warn!(error = %err, "best-effort persistence of on-demand reading failed");
                    }
                });
                OnDemandOutcome {
                    response: PriceResponse::fresh(&reading, false),
                    persist_task: Some(persist_task),
                }
            }
            Err(failure) => {
                warn!(kind = failure.kind.as_str(), error = %failure.message, "on-demand scrape failed; falling back");
                let last_known = match self.store.latest().await {
                    Ok(latest) => latest.as_ref().map(LastKnown::from),
                    Err(err) => {
                        warn!(error = %err, "last-known lookup failed");
                        None
                    }
                };
                OnDemandOutcome {
                    response: PriceResponse {
                        ok: false,
                        price: None,
                        unit: self.normalizer.unit(),
                        currency: self.normalizer.currency().to_string(),
                        updated_at: None,
                        cached: None,
                        error: Some(failure.message),
                        last_known: Some(last_known),
                    },
                    persist_task: None,
                }
            }
        }
    }

    /// Time-triggered path. Failures end up in the error log, never in `Err`.
    pub async fn run_scheduled(&self) -> ScheduledOutcome {
        let extracted = match self.scrape_price().await {
            Ok(extracted) => extracted,
            Err(failure) => return self.record_scrape_failure(failure).await,
        };

        let previous = match self.store.latest().await {
            Ok(previous) => previous,
            Err(err) => return self.record_persist_failure(err.to_string()).await,
        };

        let reading = match self.normalize(&extracted, ReadingSource::ScheduledJob) {
            Ok(reading) => reading,
            Err(failure) => return self.record_scrape_failure(failure).await,
        };

        if let Err(err) = self.store.append(&reading).await {
            return self.record_persist_failure(err.to_string()).await;
        }

        let change_percent = PriceStore::percent_change(previous.as_ref(), &reading);
        info!(price = %reading.price, change_percent = %change_percent, "scheduled reading persisted");
        let alert = self.alerts.process(previous.as_ref(), &reading).await;
        ScheduledOutcome::Persisted {
            reading,
            change_percent,
            alert,
        }
    }

    async fn scrape_price(&self) -> Result<ExtractedPrice, ScrapeFailure> {
        let extracted = self.source.scrape().await?;
        info!(
            source_id = self.source.source_id(),
            row = %extracted.row_label,
            raw = %extracted.raw_value,
            "price row extracted"
        );
        Ok(extracted)
    }

    fn normalize(&self, extracted: &ExtractedPrice, source: ReadingSource) -> Result<PriceReading, ScrapeFailure> {
        Ok(self.normalizer.normalize(extracted.price, source, self.clock.now())?)
    }

    async fn record_scrape_failure(&self, failure: ScrapeFailure) -> ScheduledOutcome {
        error!(kind = failure.kind.as_str(), error = %failure.message, "scheduled scrape failed");
        self.append_error(ErrorCategory::ScrapeFailure, Some(failure.kind), &failure.message)
            .await;
        ScheduledOutcome::ScrapeFailed {
            kind: failure.kind,
            message: failure.message,
        }
    }

    async fn record_persist_failure(&self, message: String) -> ScheduledOutcome {
        error!(error = %message, "scheduled persistence failed");
        self.append_error(ErrorCategory::PersistFailure, None, &message).await;
        ScheduledOutcome::PersistFailed { message }
    }

    async fn append_error(&self, category: ErrorCategory, kind: Option<ScrapeFailureKind>, message: &str) {
        let entry = ErrorLogEntry {
            captured_at: self.clock.now(),
            category,
            kind: kind.map(|k| k.as_str().to_string()),
            message: message.to_string(),
        };
        if let Err(err) = self.error_log.append(&entry).await {
            error!(error = %err, category = category.as_str(), "could not write error log entry");
        }
    }
}

pub fn build_notifier(config: &SyncConfig, http: Arc<HttpFetcher>) -> Arc<dyn Notifier> {
    match &config.push_url {
        Some(url) => Arc::new(HttpPushNotifier::new(http, url.clone(), config.push_token.clone())),
        None => Arc::new(LogNotifier),
    }
}

/// Builds the production service: live HTML source, configured store and notifier.
pub async fn build_service_from_config(config: &SyncConfig) -> Result<PriceSyncService> {
    let source_url = config.source_url.clone().ok_or(SyncError::MissingSourceUrl)?;
    let tz = config.timezone()?;
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let documents = open_document_store(config).await?;
    let source = HtmlTablePriceSource::new(
        SOURCE_ID,
        source_url,
        MatchCriteria::from_csv(&config.keywords),
        http.clone(),
    );
    let alerts = AlertDispatcher::new(
        config.thresholds,
        config.alert_topic.clone(),
        config.product_label.clone(),
        build_notifier(config, http),
    );
    Ok(PriceSyncService::new(
        Arc::new(source),
        PriceNormalizer::new(config.unit, &config.currency),
        documents,
        alerts,
        Arc::new(SystemClock),
        tz,
    ))
}

pub async fn build_service_from_env() -> Result<PriceSyncService> {
    build_service_from_config(&SyncConfig::from_env()).await
}

/// One daily job running [`PriceSyncService::run_scheduled`] in the fixed offset.
pub async fn build_scheduler(service: PriceSyncService, cron: &str, tz: FixedOffset) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async_tz(cron, tz, move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            let outcome = service.run_scheduled().await;
            info!(?outcome, "scheduled price sync finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Starts the scheduler and blocks until ctrl-c.
pub async fn run_scheduler_until_shutdown(config: &SyncConfig) -> Result<()> {
    let service = build_service_from_config(config).await?;
    let tz = config.timezone()?;
    let mut sched = build_scheduler(service, &config.schedule_cron, tz).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.schedule_cron, offset = %tz, "price sync scheduler running");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
