//! CDR source contract + the HTTP API and fixture implementations.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cdrsync_core::{json_kind, CdrRecord, DateWindow, RecordShapeError};
use cdrsync_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cdrsync-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("response body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("response body is not a JSON array (found {found})")]
    NotAnArray { found: &'static str },
    #[error("record {index} in response: {source}")]
    Record {
        index: usize,
        #[source]
        source: RecordShapeError,
    },
    #[error("reading fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that can hand over every CDR inside a date window in one call.
#[async_trait]
pub trait CdrSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_window(
        &self,
        run_id: Uuid,
        window: &DateWindow,
    ) -> Result<Vec<CdrRecord>, SourceError>;
}

/// Decodes a CDR response body. Providers sometimes double-encode the array as a JSON
/// string, so a string body is parsed a second time.
pub fn parse_cdr_body(body: &[u8]) -> Result<Vec<CdrRecord>, SourceError> {
    let mut value: JsonValue = serde_json::from_slice(body).map_err(SourceError::InvalidJson)?;
    if let JsonValue::String(inner) = &value {
        value = serde_json::from_str(inner).map_err(SourceError::InvalidJson)?;
    }
    let items = match value {
        JsonValue::Array(items) => items,
        other => {
            return Err(SourceError::NotAnArray {
                found: json_kind(&other),
            })
        }
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            CdrRecord::from_value(item).map_err(|source| SourceError::Record { index, source })
        })
        .collect()
}

/// Bearer-authenticated `query.php?endpoint=cdr` client.
pub struct CdrApiSource {
    http: HttpFetcher,
    endpoint_url: String,
    bearer_token: String,
}

impl CdrApiSource {
    pub fn new(
        http: HttpFetcher,
        endpoint_url: impl Into<String>,
        bearer_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint_url: endpoint_url.into(),
            bearer_token: bearer_token.into(),
        }
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }
}

impl fmt::Debug for CdrApiSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdrApiSource")
            .field("endpoint_url", &self.endpoint_url)
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl CdrSource for CdrApiSource {
    fn source_id(&self) -> &'static str {
        "cdr-api"
    }

    async fn fetch_window(
        &self,
        run_id: Uuid,
        window: &DateWindow,
    ) -> Result<Vec<CdrRecord>, SourceError> {
        info!(%run_id, %window, "fetching CDR data");
        let query = [
            ("endpoint", "cdr".to_string()),
            ("start", window.start_param()),
            ("end", window.end_param()),
        ];
        let resp = self
            .http
            .get_with_bearer(run_id, &self.endpoint_url, &self.bearer_token, &query)
            .await?;
        let records = parse_cdr_body(&resp.body)?;
        info!(%run_id, records = records.len(), "received CDR records");
        Ok(records)
    }
}

/// Serves a captured API response from disk regardless of the requested window.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn load_fixture_records(path: impl AsRef<Path>) -> Result<Vec<CdrRecord>, SourceError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| SourceError::Fixture {
        path: path.to_path_buf(),
        source,
    })?;
    parse_cdr_body(&bytes)
}

#[async_trait]
impl CdrSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_window(
        &self,
        _run_id: Uuid,
        _window: &DateWindow,
    ) -> Result<Vec<CdrRecord>, SourceError> {
        load_fixture_records(&self.path)
    }
}
