//! Postgres persistence + HTTP fetch utilities for cdrsync.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cdrsync_core::{CdrRow, RunLogEntry, RunLogPayload, RunLogStart};
use reqwest::StatusCode;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cdrsync-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// `cdr_logs` columns in bind order. `synced_at` is maintained by the database.
pub const CDR_COLUMNS: [&str; 27] = [
    "uniqueid",
    "did",
    "linkedid",
    "calldate",
    "calldate_local",
    "clid",
    "src",
    "cnam",
    "dst",
    "dst_cnam",
    "duration",
    "billsec",
    "channel",
    "lastapp",
    "amaflags",
    "dcontext",
    "lastdata",
    "sequence",
    "userfield",
    "dstchannel",
    "accountcode",
    "disposition",
    "peeraccount",
    "outbound_cnam",
    "outbound_cnum",
    "recordingfile",
    "raw",
];

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt authenticated GET client. Every request is bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn get_with_bearer(
        &self,
        run_id: Uuid,
        url: &str,
        bearer_token: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self
                .client
                .get(url)
                .bearer_auth(bearer_token)
                .query(query)
                .send()
                .await
                .map_err(|err| self.classify(url, err))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| self.classify(url, err))?
                .to_vec();
            debug!(bytes = body.len(), %status, "fetched response body");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Request(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("script_logs row {id} does not exist")]
    MissingRunLog { id: i64 },
}

/// Target table for normalized CDR rows.
#[async_trait]
pub trait CdrSink: Send + Sync {
    /// Exact number of rows currently stored.
    async fn count_rows(&self) -> Result<i64, StoreError>;

    /// Insert-or-replace every row by `uniqueid`. Rows must have distinct keys.
    async fn upsert_rows(&self, rows: &[CdrRow]) -> Result<u64, StoreError>;
}

/// Audit table with one row per run.
#[async_trait]
pub trait RunLogSink: Send + Sync {
    async fn insert_started(&self, start: &RunLogStart) -> Result<i64, StoreError>;

    async fn update_run(&self, id: i64, payload: &RunLogPayload) -> Result<(), StoreError>;

    async fn insert_run(
        &self,
        start: &RunLogStart,
        payload: &RunLogPayload,
    ) -> Result<i64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Builds a lazily-connecting pool; connection failures surface on first use.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(&config.url)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_timestamp, script_name, status, message,
                   records_fetched, records_deduplicated, records_added,
                   duration_ms, initial_db_count, final_db_count
              FROM script_logs
             ORDER BY run_timestamp DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RunLogEntry {
                id: row.try_get("id")?,
                run_timestamp: row.try_get("run_timestamp")?,
                script_name: row.try_get("script_name")?,
                status: row.try_get("status")?,
                message: row.try_get("message")?,
                records_fetched: row.try_get("records_fetched")?,
                records_deduplicated: row.try_get("records_deduplicated")?,
                records_added: row.try_get("records_added")?,
                duration_ms: row.try_get("duration_ms")?,
                initial_db_count: row.try_get("initial_db_count")?,
                final_db_count: row.try_get("final_db_count")?,
            });
        }
        Ok(out)
    }
}

pub fn build_upsert(rows: &[CdrRow]) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new("INSERT INTO cdr_logs (");
    builder.push(CDR_COLUMNS.join(", "));
    builder.push(") ");
    builder.push_values(rows, |mut b, row| {
        b.push_bind(row.uniqueid.as_str())
            .push_bind(row.did.as_deref())
            .push_bind(row.linkedid.as_deref())
            .push_bind(row.calldate.as_str())
            .push_bind(row.calldate_local.as_str())
            .push_bind(row.clid.as_deref())
            .push_bind(row.src.as_deref())
            .push_bind(row.cnam.as_deref())
            .push_bind(row.dst.as_deref())
            .push_bind(row.dst_cnam.as_deref())
            .push_bind(row.duration)
            .push_bind(row.billsec)
            .push_bind(row.channel.as_deref())
            .push_bind(row.lastapp.as_deref())
            .push_bind(row.amaflags.as_deref())
            .push_bind(row.dcontext.as_deref())
            .push_bind(row.lastdata.as_deref())
            .push_bind(row.sequence.as_deref())
            .push_bind(row.userfield.as_deref())
            .push_bind(row.dstchannel.as_deref())
            .push_bind(row.accountcode.as_deref())
            .push_bind(row.disposition.as_deref())
            .push_bind(row.peeraccount.as_deref())
            .push_bind(row.outbound_cnam.as_deref())
            .push_bind(row.outbound_cnum.as_deref())
            .push_bind(row.recordingfile.as_deref())
            .push_bind(&row.raw);
    });
    builder.push(" ON CONFLICT (uniqueid) DO UPDATE SET ");
    let assignments = CDR_COLUMNS
        .iter()
        .skip(1)
        .map(|col| format!("{col} = EXCLUDED.{col}"))
        .collect::<Vec<_>>()
        .join(", ");
    builder.push(assignments);
    builder.push(", synced_at = now()");
    builder
}

#[async_trait]
impl CdrSink for PgStore {
    async fn count_rows(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cdr_logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn upsert_rows(&self, rows: &[CdrRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut builder = build_upsert(rows);
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RunLogSink for PgStore {
    async fn insert_started(&self, start: &RunLogStart) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO script_logs (run_timestamp, script_name, status, message)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(start.run_timestamp)
        .bind(&start.script_name)
        .bind(start.status.as_str())
        .bind(&start.message)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_run(&self, id: i64, payload: &RunLogPayload) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE script_logs
               SET status = $2,
                   message = $3,
                   records_fetched = $4,
                   records_deduplicated = $5,
                   records_added = $6,
                   duration_ms = $7,
                   initial_db_count = $8,
                   final_db_count = $9
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(payload.status.as_str())
        .bind(&payload.message)
        .bind(payload.records_fetched)
        .bind(payload.records_deduplicated)
        .bind(payload.records_added)
        .bind(payload.duration_ms)
        .bind(payload.initial_db_count)
        .bind(payload.final_db_count)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingRunLog { id });
        }
        Ok(())
    }

    async fn insert_run(
        &self,
        start: &RunLogStart,
        payload: &RunLogPayload,
    ) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO script_logs (
                run_timestamp, script_name, status, message,
                records_fetched, records_deduplicated, records_added,
                duration_ms, initial_db_count, final_db_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(start.run_timestamp)
        .bind(&start.script_name)
        .bind(payload.status.as_str())
        .bind(&payload.message)
        .bind(payload.records_fetched)
        .bind(payload.records_deduplicated)
        .bind(payload.records_added)
        .bind(payload.duration_ms)
        .bind(payload.initial_db_count)
        .bind(payload.final_db_count)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}
