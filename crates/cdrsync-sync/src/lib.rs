//! CDR ingestion run orchestration.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use cdrsync_core::{
    dedupe_keep_last, map_records, CdrRow, DateWindow, MapError, RunLogEntry, RunLogPayload,
    RunLogStart, RunStatus, RunSummary, DEFAULT_LOCAL_TIMEZONE,
};
use cdrsync_source::{CdrApiSource, CdrSource, SourceError};
use cdrsync_storage::{
    CdrSink, DatabaseConfig, HttpClientConfig, HttpFetcher, PgStore, RunLogSink, StoreError,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cdrsync-sync";

/// Maximum rows per upsert statement.
pub const UPSERT_BATCH_SIZE: usize = 100;

pub const DEFAULT_SCRIPT_NAME: &str = "fetch_cdr_dump";

#[derive(Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub cdr_api_url: String,
    pub cdr_api_token: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub local_timezone: Tz,
    pub script_name: String,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("database_url", &"<redacted>")
            .field("cdr_api_url", &self.cdr_api_url)
            .field("cdr_api_token", &"<redacted>")
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("local_timezone", &self.local_timezone)
            .field("script_name", &self.script_name)
            .field("db_max_connections", &self.db_max_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| get(key).with_context(|| format!("{key} must be set"));

        let local_timezone = match get("CDR_LOCAL_TIMEZONE") {
            Some(name) => name
                .trim()
                .parse::<Tz>()
                .map_err(|err| anyhow!("CDR_LOCAL_TIMEZONE={name} is not an IANA timezone: {err}"))?,
            None => DEFAULT_LOCAL_TIMEZONE,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            cdr_api_url: required("CDR_API_URL")?,
            cdr_api_token: required("CDR_API_TOKEN")?,
            http_timeout_secs: parse_or(&get, "CDR_HTTP_TIMEOUT_SECS", 30)?,
            user_agent: get("CDR_USER_AGENT")
                .unwrap_or_else(|| format!("cdrsync/{}", env!("CARGO_PKG_VERSION"))),
            local_timezone,
            script_name: get("CDR_SCRIPT_NAME").unwrap_or_else(|| DEFAULT_SCRIPT_NAME.to_string()),
            db_max_connections: parse_or(&get, "CDR_DB_MAX_CONNECTIONS", 2)?,
            db_acquire_timeout_secs: parse_or(&get, "CDR_DB_ACQUIRE_TIMEOUT_SECS", 10)?,
            scheduler_enabled: get("CDRSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: get("CDR_SYNC_CRON").unwrap_or_else(|| "0 15 * * * *".to_string()),
        })
    }

    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            url: self.database_url.clone(),
            max_connections: self.db_max_connections,
            acquire_timeout: Duration::from_secs(self.db_acquire_timeout_secs),
        }
    }
}

/// Database settings alone, for commands that never reach the CDR API.
pub fn database_config_from_env() -> Result<DatabaseConfig> {
    let get = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
    Ok(DatabaseConfig {
        url: get("DATABASE_URL").context("DATABASE_URL must be set")?,
        max_connections: parse_or(&get, "CDR_DB_MAX_CONNECTIONS", 2)?,
        acquire_timeout: Duration::from_secs(parse_or(&get, "CDR_DB_ACQUIRE_TIMEOUT_SECS", 10)?),
    })
}

fn parse_or<T>(get: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("{key}={raw} is invalid: {err}")),
        None => Ok(default),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountPhase {
    Initial,
    Final,
}

impl fmt::Display for CountPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountPhase::Initial => f.write_str("initial"),
            CountPhase::Final => f.write_str("final"),
        }
    }
}

/// Failures that are reported but never change a run's status.
#[derive(Debug, Error)]
pub enum NonFatalError {
    #[error("initial script log insert failed: {0}")]
    LogInit(#[source] StoreError),
    #[error("{phase} row count failed: {source}")]
    RowCount {
        phase: CountPhase,
        #[source]
        source: StoreError,
    },
    #[error("script log finalize failed: {0}")]
    LogFinalize(#[source] StoreError),
}

/// Side channel for [`NonFatalError`]s: each one is logged at warn level and kept for the summary.
#[derive(Debug, Default)]
pub struct RunDiagnostics {
    entries: Vec<NonFatalError>,
}

impl RunDiagnostics {
    pub fn record(&mut self, err: NonFatalError) {
        warn!(error = %err, "non-fatal run error");
        self.entries.push(err);
    }

    pub fn into_messages(self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }
}

#[derive(Debug, Error)]
#[error(
    "batch {} of {batch_count} rejected after {rows_committed} rows committed: {source}",
    .batch_index + 1
)]
pub struct UpsertError {
    pub batch_index: usize,
    pub batch_count: usize,
    pub rows_committed: usize,
    #[source]
    pub source: StoreError,
}

/// Failures that end ingestion and mark the run `failed`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("CDR fetch failed: {0}")]
    Fetch(#[from] SourceError),
    #[error("record mapping failed: {0}")]
    Map(#[from] MapError),
    #[error("Batch upsert failed: {0}")]
    Upsert(#[from] UpsertError),
}

/// Upserts `rows` in order, `batch_size` at a time, stopping at the first rejected batch.
/// Batches committed before the failure stay committed.
pub async fn upsert_in_batches(
    sink: &dyn CdrSink,
    rows: &[CdrRow],
    batch_size: usize,
) -> Result<usize, UpsertError> {
    let batch_size = batch_size.max(1);
    let batch_count = rows.len().div_ceil(batch_size);
    let mut rows_committed = 0usize;
    for (batch_index, chunk) in rows.chunks(batch_size).enumerate() {
        sink.upsert_rows(chunk)
            .await
            .map_err(|source| UpsertError {
                batch_index,
                batch_count,
                rows_committed,
                source,
            })?;
        rows_committed += chunk.len();
        debug!(
            batch = batch_index + 1,
            batch_count,
            rows = chunk.len(),
            "upserted CDR batch"
        );
    }
    Ok(rows_committed)
}

/// Owns the `script_logs` row for one run: `started` at begin, terminal state at finish.
pub struct RunLogger<'a> {
    sink: &'a dyn RunLogSink,
    start: RunLogStart,
    entry_id: Option<i64>,
}

impl<'a> RunLogger<'a> {
    pub async fn begin(
        sink: &'a dyn RunLogSink,
        script_name: &str,
        run_timestamp: DateTime<Utc>,
        diagnostics: &mut RunDiagnostics,
    ) -> RunLogger<'a> {
        let start = RunLogStart {
            run_timestamp,
            script_name: script_name.to_string(),
            status: RunStatus::Started,
            message: "Script execution started.".to_string(),
        };
        let entry_id = match sink.insert_started(&start).await {
            Ok(id) => Some(id),
            Err(err) => {
                diagnostics.record(NonFatalError::LogInit(err));
                None
            }
        };
        Self {
            sink,
            start,
            entry_id,
        }
    }

    /// Writes the terminal state and returns the id of the row holding it, if any.
    pub async fn finish(
        self,
        payload: &RunLogPayload,
        diagnostics: &mut RunDiagnostics,
    ) -> Option<i64> {
        match self.entry_id {
            Some(id) => {
                if let Err(err) = self.sink.update_run(id, payload).await {
                    diagnostics.record(NonFatalError::LogFinalize(err));
                }
                Some(id)
            }
            None => match self.sink.insert_run(&self.start, payload).await {
                Ok(id) => Some(id),
                Err(err) => {
                    diagnostics.record(NonFatalError::LogFinalize(err));
                    None
                }
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RunProgress {
    records_fetched: Option<i64>,
    records_deduplicated: Option<i64>,
    records_added: Option<i64>,
    initial_db_count: Option<i64>,
    final_db_count: Option<i64>,
}

impl RunProgress {
    fn completion_message(&self) -> String {
        format!(
            "CDR import process complete. Fetched: {}, Deduplicated: {}, Added: {}.",
            display_count(self.records_fetched),
            display_count(self.records_deduplicated),
            display_count(self.records_added)
        )
    }

    fn payload(&self, status: RunStatus, message: String, duration_ms: i64) -> RunLogPayload {
        RunLogPayload {
            status,
            message,
            records_fetched: self.records_fetched,
            records_deduplicated: self.records_deduplicated,
            records_added: self.records_added,
            duration_ms,
            initial_db_count: self.initial_db_count,
            final_db_count: self.final_db_count,
        }
    }
}

fn display_count(count: Option<i64>) -> String {
    count.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

fn as_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

pub struct SyncPipeline {
    source: Box<dyn CdrSource>,
    cdr_sink: Arc<dyn CdrSink>,
    run_log: Arc<dyn RunLogSink>,
    local_timezone: Tz,
    script_name: String,
}

impl SyncPipeline {
    pub fn new(
        source: Box<dyn CdrSource>,
        cdr_sink: Arc<dyn CdrSink>,
        run_log: Arc<dyn RunLogSink>,
    ) -> Self {
        Self {
            source,
            cdr_sink,
            run_log,
            local_timezone: DEFAULT_LOCAL_TIMEZONE,
            script_name: DEFAULT_SCRIPT_NAME.to_string(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let source = CdrApiSource::new(http, &config.cdr_api_url, &config.cdr_api_token);
        let store = Arc::new(
            PgStore::connect_lazy(&config.database_config()).context("configuring database pool")?,
        );
        Ok(Self::new(Box::new(source), store.clone(), store)
            .with_local_timezone(config.local_timezone)
            .with_script_name(config.script_name.clone()))
    }

    pub fn with_local_timezone(mut self, tz: Tz) -> Self {
        self.local_timezone = tz;
        self
    }

    pub fn with_script_name(mut self, script_name: impl Into<String>) -> Self {
        self.script_name = script_name.into();
        self
    }

    /// Runs one ingestion pass. Never fails: every outcome is reported in the summary.
    pub async fn run_once(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("cdr_sync_run", %run_id, source = self.source.source_id());
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> RunSummary {
        let started = Instant::now();
        let run_timestamp = Utc::now();
        let mut diagnostics = RunDiagnostics::default();
        let logger = RunLogger::begin(
            self.run_log.as_ref(),
            &self.script_name,
            run_timestamp,
            &mut diagnostics,
        )
        .await;

        let mut progress = RunProgress::default();
        let (status, message) =
            match self.ingest(run_id, run_timestamp, &mut progress, &mut diagnostics).await {
                Ok(()) => {
                    let message = progress.completion_message();
                    info!("{message}");
                    (RunStatus::Completed, message)
                }
                Err(err) => {
                    error!(error = %err, "CDR ingestion failed");
                    (RunStatus::Failed, err.to_string())
                }
            };

        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let payload = progress.payload(status, message.clone(), duration_ms);
        let log_entry_id = logger.finish(&payload, &mut diagnostics).await;
        info!(%status, duration_ms, "CDR sync finished");

        RunSummary {
            run_id,
            status,
            message,
            records_fetched: progress.records_fetched,
            records_deduplicated: progress.records_deduplicated,
            records_added: progress.records_added,
            duration_ms,
            log_entry_id,
            diagnostics: diagnostics.into_messages(),
        }
    }

    async fn ingest(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        progress: &mut RunProgress,
        diagnostics: &mut RunDiagnostics,
    ) -> Result<(), IngestError> {
        let window = DateWindow::trailing(now);
        progress.initial_db_count = self.count_rows(CountPhase::Initial, diagnostics).await;

        let records = self.source.fetch_window(run_id, &window).await?;
        progress.records_fetched = Some(as_count(records.len()));

        let deduped = dedupe_keep_last(records);
        progress.records_deduplicated = Some(as_count(deduped.deduplicated()));
        if deduped.dropped() > 0 {
            info!(
                fetched = deduped.fetched,
                unique = deduped.deduplicated(),
                "dropped repeated uniqueids"
            );
        }

        let rows = map_records(&deduped.records, self.local_timezone)?;
        let upserted = upsert_in_batches(self.cdr_sink.as_ref(), &rows, UPSERT_BATCH_SIZE).await?;
        info!(upserted, "upserted CDR rows");

        progress.final_db_count = self.count_rows(CountPhase::Final, diagnostics).await;
        if let (Some(before), Some(after)) = (progress.initial_db_count, progress.final_db_count) {
            progress.records_added = Some(after - before);
        }
        Ok(())
    }

    async fn count_rows(&self, phase: CountPhase, diagnostics: &mut RunDiagnostics) -> Option<i64> {
        match self.cdr_sink.count_rows().await {
            Ok(count) => {
                info!(%phase, count, "cdr_logs row count");
                Some(count)
            }
            Err(source) => {
                diagnostics.record(NonFatalError::RowCount { phase, source });
                None
            }
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(&config)?;
    Ok(pipeline.run_once().await)
}

/// Cron-driven runs. Overlapping runs are not coordinated.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let summary = pipeline.run_once().await;
            info!(
                run_id = %summary.run_id,
                status = %summary.status,
                fetched = ?summary.records_fetched,
                added = ?summary.records_added,
                "scheduled CDR sync finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub fn report_recent_runs_markdown(entries: &[RunLogEntry]) -> String {
    let mut lines = vec!["# CDR Sync Runs".to_string(), String::new()];
    if entries.is_empty() {
        lines.push("_No runs recorded._".to_string());
        lines.push(String::new());
    }
    for entry in entries {
        lines.push(format!(
            "## Run {} ({})",
            entry.id,
            entry.run_timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        lines.push(format!("- script: `{}`", entry.script_name));
        lines.push(format!("- status: {}", entry.status));
        lines.push(format!("- fetched: {}", display_count(entry.records_fetched)));
        lines.push(format!(
            "- deduplicated: {}",
            display_count(entry.records_deduplicated)
        ));
        lines.push(format!("- added: {}", display_count(entry.records_added)));
        lines.push(format!(
            "- rows: {} -> {}",
            display_count(entry.initial_db_count),
            display_count(entry.final_db_count)
        ));
        if let Some(ms) = entry.duration_ms {
            lines.push(format!("- duration: {ms} ms"));
        }
        if let Some(message) = entry.message.as_deref().filter(|m| !m.is_empty()) {
            lines.push(format!("- message: {message}"));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}
