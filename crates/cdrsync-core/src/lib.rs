//! Core CDR domain model and record normalization for cdrsync.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cdrsync-core";

/// Length of the trailing query window, in days.
pub const WINDOW_DAYS: u64 = 7;

/// Display format shared by the source `calldate` and the derived `calldate_local`.
pub const CALLDATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const DEFAULT_LOCAL_TIMEZONE: Tz = chrono_tz::America::Toronto;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordShapeError {
    #[error("record is not a JSON object (found {found})")]
    NotAnObject { found: &'static str },
    #[error("record has no string or numeric uniqueid")]
    MissingUniqueId,
}

/// A CDR exactly as the provider sent it, with its natural key pulled out.
#[derive(Debug, Clone, PartialEq)]
pub struct CdrRecord {
    uniqueid: String,
    fields: JsonMap<String, JsonValue>,
}

impl CdrRecord {
    pub fn from_value(value: JsonValue) -> Result<Self, RecordShapeError> {
        let fields = match value {
            JsonValue::Object(fields) => fields,
            other => {
                return Err(RecordShapeError::NotAnObject {
                    found: json_kind(&other),
                })
            }
        };
        let uniqueid = match fields.get("uniqueid") {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => return Err(RecordShapeError::MissingUniqueId),
        };
        Ok(Self { uniqueid, fields })
    }

    pub fn uniqueid(&self) -> &str {
        &self.uniqueid
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    pub fn raw(&self) -> &JsonMap<String, JsonValue> {
        &self.fields
    }
}

/// Short JSON type name used in shape errors.
pub fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Inclusive UTC date range sent to the CDR endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// Window ending on `now`'s UTC date and starting [`WINDOW_DAYS`] earlier.
    pub fn trailing(now: DateTime<Utc>) -> Self {
        let end = now.date_naive();
        let start = end
            .checked_sub_days(Days::new(WINDOW_DAYS))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end }
    }

    pub fn start_param(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn end_param(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start_param(), self.end_param())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid calldate {input:?}: {source}")]
pub struct TimestampError {
    pub input: String,
    #[source]
    source: chrono::ParseError,
}

/// Reads a naive source timestamp as UTC and renders it as wall-clock time in `tz`.
pub fn normalize_calldate(calldate: &str, tz: Tz) -> Result<String, TimestampError> {
    let trimmed = calldate.trim();
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|source| TimestampError {
            input: calldate.to_string(),
            source,
        })?;
    let local = Utc.from_utc_datetime(&naive).with_timezone(&tz);
    Ok(local.format(CALLDATE_FORMAT).to_string())
}

/// Result of collapsing a fetched batch to one record per `uniqueid`.
#[derive(Debug, Clone, PartialEq)]
pub struct Deduplicated {
    pub records: Vec<CdrRecord>,
    pub fetched: usize,
}

impl Deduplicated {
    pub fn deduplicated(&self) -> usize {
        self.records.len()
    }

    pub fn dropped(&self) -> usize {
        self.fetched - self.records.len()
    }
}

/// Keeps the last record seen for each key, positioned where the key first appeared.
pub fn dedupe_keep_last(records: Vec<CdrRecord>) -> Deduplicated {
    let fetched = records.len();
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(fetched);
    let mut out: Vec<CdrRecord> = Vec::with_capacity(fetched);
    for record in records {
        match slots.get(record.uniqueid()) {
            Some(&slot) => out[slot] = record,
            None => {
                slots.insert(record.uniqueid().to_string(), out.len());
                out.push(record);
            }
        }
    }
    Deduplicated {
        records: out,
        fetched,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {uniqueid}: field {field} is not a base-10 integer: {value}")]
pub struct FieldCoercionError {
    pub uniqueid: String,
    pub field: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("record {uniqueid}: missing calldate")]
    MissingCalldate { uniqueid: String },
    #[error("record {uniqueid}: {source}")]
    Timestamp {
        uniqueid: String,
        #[source]
        source: TimestampError,
    },
    #[error(transparent)]
    Coercion(#[from] FieldCoercionError),
}

/// Normalized `cdr_logs` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrRow {
    pub uniqueid: String,
    pub did: Option<String>,
    pub linkedid: Option<String>,
    pub calldate: String,
    pub calldate_local: String,
    pub clid: Option<String>,
    pub src: Option<String>,
    pub cnam: Option<String>,
    pub dst: Option<String>,
    pub dst_cnam: Option<String>,
    pub duration: Option<i64>,
    pub billsec: Option<i64>,
    pub channel: Option<String>,
    pub lastapp: Option<String>,
    pub amaflags: Option<String>,
    pub dcontext: Option<String>,
    pub lastdata: Option<String>,
    pub sequence: Option<String>,
    pub userfield: Option<String>,
    pub dstchannel: Option<String>,
    pub accountcode: Option<String>,
    pub disposition: Option<String>,
    pub peeraccount: Option<String>,
    pub outbound_cnam: Option<String>,
    pub outbound_cnum: Option<String>,
    pub recordingfile: Option<String>,
    pub raw: JsonValue,
}

/// Integer coercion for `duration`/`billsec`: null, missing and blank map to `None`.
pub fn coerce_integer(
    uniqueid: &str,
    field: &'static str,
    value: Option<&JsonValue>,
) -> Result<Option<i64>, FieldCoercionError> {
    let invalid = |v: &JsonValue| FieldCoercionError {
        uniqueid: uniqueid.to_string(),
        field,
        value: v.to_string(),
    };
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v @ JsonValue::Number(n)) => {
            if let Some(i) = n.as_i64() {
                return Ok(Some(i));
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Some(f as i64)),
                _ => Err(invalid(v)),
            }
        }
        Some(v @ JsonValue::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed.parse::<i64>().map(Some).map_err(|_| invalid(v))
        }
        Some(other) => Err(invalid(other)),
    }
}

fn text_field(record: &CdrRecord, field: &str) -> Option<String> {
    match record.get(field)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub fn map_record(record: &CdrRecord, tz: Tz) -> Result<CdrRow, MapError> {
    let uniqueid = record.uniqueid();
    let calldate = match record.get("calldate") {
        Some(JsonValue::String(s)) => s.clone(),
        _ => {
            return Err(MapError::MissingCalldate {
                uniqueid: uniqueid.to_string(),
            })
        }
    };
    let calldate_local =
        normalize_calldate(&calldate, tz).map_err(|source| MapError::Timestamp {
            uniqueid: uniqueid.to_string(),
            source,
        })?;
    let text = |field: &str| text_field(record, field);

    Ok(CdrRow {
        uniqueid: uniqueid.to_string(),
        did: text("did"),
        linkedid: text("linkedid"),
        calldate,
        calldate_local,
        clid: text("clid"),
        src: text("src"),
        cnam: text("cnam"),
        dst: text("dst"),
        dst_cnam: text("dst_cnam"),
        duration: coerce_integer(uniqueid, "duration", record.get("duration"))?,
        billsec: coerce_integer(uniqueid, "billsec", record.get("billsec"))?,
        channel: text("channel"),
        lastapp: text("lastapp"),
        amaflags: text("amaflags"),
        dcontext: text("dcontext"),
        lastdata: text("lastdata"),
        sequence: text("sequence"),
        userfield: text("userfield"),
        dstchannel: text("dstchannel"),
        accountcode: text("accountcode"),
        disposition: text("disposition"),
        peeraccount: text("peeraccount"),
        outbound_cnam: text("outbound_cnam"),
        outbound_cnum: text("outbound_cnum"),
        recordingfile: text("recordingfile"),
        raw: JsonValue::Object(record.raw().clone()),
    })
}

/// Maps a whole batch, stopping at the first record that cannot be normalized.
pub fn map_records(records: &[CdrRecord], tz: Tz) -> Result<Vec<CdrRow>, MapError> {
    records.iter().map(|record| map_record(record, tz)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Started)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown run status {0:?}")]
pub struct UnknownRunStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(RunStatus::Started),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(UnknownRunStatus(other.to_string())),
        }
    }
}

/// Identity columns written once when a `script_logs` row is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogStart {
    pub run_timestamp: DateTime<Utc>,
    pub script_name: String,
    pub status: RunStatus,
    pub message: String,
}

/// End-of-run columns, applied as an update or carried by a fresh insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogPayload {
    pub status: RunStatus,
    pub message: String,
    pub records_fetched: Option<i64>,
    pub records_deduplicated: Option<i64>,
    pub records_added: Option<i64>,
    pub duration_ms: i64,
    pub initial_db_count: Option<i64>,
    pub final_db_count: Option<i64>,
}

/// A `script_logs` row as read back for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: i64,
    pub run_timestamp: DateTime<Utc>,
    pub script_name: String,
    pub status: String,
    pub message: Option<String>,
    pub records_fetched: Option<i64>,
    pub records_deduplicated: Option<i64>,
    pub records_added: Option<i64>,
    pub duration_ms: Option<i64>,
    pub initial_db_count: Option<i64>,
    pub final_db_count: Option<i64>,
}

/// Outcome of one ingestion run, returned to whatever triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub message: String,
    pub records_fetched: Option<i64>,
    pub records_deduplicated: Option<i64>,
    pub records_added: Option<i64>,
    pub duration_ms: i64,
    pub log_entry_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: JsonValue) -> CdrRecord {
        CdrRecord::from_value(value).unwrap()
    }

    #[test]
    fn trailing_window_spans_seven_days() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 23, 59, 0).single().unwrap();
        let window = DateWindow::trailing(now);
        assert_eq!(window.start_param(), "2024-03-08");
        assert_eq!(window.end_param(), "2024-03-15");
        assert_eq!(window.to_string(), "2024-03-08..2024-03-15");
    }

    #[test]
    fn trailing_window_crosses_month_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 1).single().unwrap();
        let window = DateWindow::trailing(now);
        assert_eq!(window.start_param(), "2024-02-25");
        assert_eq!(window.end_param(), "2024-03-03");
    }

    #[test]
    fn calldate_converts_to_summer_offset() {
        let local = normalize_calldate("2024-07-01 12:00:00", chrono_tz::America::Toronto).unwrap();
        assert_eq!(local, "2024-07-01 08:00:00");
    }

    #[test]
    fn calldate_converts_to_winter_offset_and_previous_day() {
        let local = normalize_calldate("2024-01-15 02:30:00", chrono_tz::America::Toronto).unwrap();
        assert_eq!(local, "2024-01-14 21:30:00");
    }

    #[test]
    fn calldate_rejects_garbage() {
        let err = normalize_calldate("yesterday-ish", DEFAULT_LOCAL_TIMEZONE).unwrap_err();
        assert_eq!(err.input, "yesterday-ish");
        assert!(err.to_string().contains("yesterday-ish"));
        assert!(normalize_calldate("2024-02-30 10:00:00", DEFAULT_LOCAL_TIMEZONE).is_err());
    }

    #[test]
    fn records_require_object_with_uniqueid() {
        assert_eq!(
            CdrRecord::from_value(json!([1, 2])).unwrap_err(),
            RecordShapeError::NotAnObject { found: "array" }
        );
        assert_eq!(
            CdrRecord::from_value(json!({"calldate": "2024-01-01 00:00:00"})).unwrap_err(),
            RecordShapeError::MissingUniqueId
        );
        assert_eq!(record(json!({"uniqueid": 1700000000.5})).uniqueid(), "1700000000.5");
    }

    #[test]
    fn dedupe_keeps_last_value_in_first_seen_position() {
        let batch = vec![
            record(json!({"uniqueid": "a", "n": 1})),
            record(json!({"uniqueid": "b", "n": 2})),
            record(json!({"uniqueid": "a", "n": 3})),
            record(json!({"uniqueid": "c", "n": 4})),
            record(json!({"uniqueid": "b", "n": 5})),
        ];
        let deduped = dedupe_keep_last(batch);
        assert_eq!(deduped.fetched, 5);
        assert_eq!(deduped.deduplicated(), 3);
        assert_eq!(deduped.dropped(), 2);
        let seen: Vec<_> = deduped
            .records
            .iter()
            .map(|r| (r.uniqueid().to_string(), r.get("n").cloned().unwrap()))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), json!(3)),
                ("b".to_string(), json!(5)),
                ("c".to_string(), json!(4)),
            ]
        );
    }

    #[test]
    fn integer_coercion_policy() {
        assert_eq!(coerce_integer("u", "duration", None), Ok(None));
        assert_eq!(coerce_integer("u", "duration", Some(&json!(null))), Ok(None));
        assert_eq!(coerce_integer("u", "duration", Some(&json!(" "))), Ok(None));
        assert_eq!(coerce_integer("u", "duration", Some(&json!(42))), Ok(Some(42)));
        assert_eq!(coerce_integer("u", "duration", Some(&json!("017"))), Ok(Some(17)));
        assert_eq!(coerce_integer("u", "duration", Some(&json!(12.0))), Ok(Some(12)));

        let err = coerce_integer("u-1", "billsec", Some(&json!("12s"))).unwrap_err();
        assert_eq!(err.field, "billsec");
        assert_eq!(err.uniqueid, "u-1");
        assert!(coerce_integer("u", "billsec", Some(&json!(1.5))).is_err());
        assert!(coerce_integer("u", "billsec", Some(&json!(true))).is_err());
    }

    #[test]
    fn map_record_copies_fields_and_keeps_raw() {
        let source = json!({
            "uniqueid": "1710000000.42",
            "linkedid": "1710000000.40",
            "calldate": "2024-07-01 12:00:00",
            "src": "6135550100",
            "dst": "100",
            "duration": "65",
            "billsec": 60,
            "amaflags": 3,
            "disposition": "ANSWERED",
            "recordingfile": "",
            "vendor_extra": {"leg": 2}
        });
        let row = map_record(&record(source.clone()), DEFAULT_LOCAL_TIMEZONE).unwrap();
        assert_eq!(row.uniqueid, "1710000000.42");
        assert_eq!(row.calldate, "2024-07-01 12:00:00");
        assert_eq!(row.calldate_local, "2024-07-01 08:00:00");
        assert_eq!(row.duration, Some(65));
        assert_eq!(row.billsec, Some(60));
        assert_eq!(row.amaflags.as_deref(), Some("3"));
        assert_eq!(row.recordingfile.as_deref(), Some(""));
        assert_eq!(row.did, None);
        assert_eq!(row.raw, source);
    }

    #[test]
    fn map_records_fails_on_first_bad_record() {
        let batch = vec![
            record(json!({"uniqueid": "ok", "calldate": "2024-07-01 12:00:00", "duration": "1"})),
            record(json!({"uniqueid": "bad", "calldate": "2024-07-01 12:00:00", "duration": "n/a"})),
            record(json!({"uniqueid": "nodate"})),
        ];
        let err = map_records(&batch, DEFAULT_LOCAL_TIMEZONE).unwrap_err();
        assert!(matches!(err, MapError::Coercion(ref e) if e.uniqueid == "bad"));

        let err = map_record(&batch[2], DEFAULT_LOCAL_TIMEZONE).unwrap_err();
        assert_eq!(
            err,
            MapError::MissingCalldate {
                uniqueid: "nodate".to_string()
            }
        );
    }

    #[test]
    fn run_status_round_trips_through_text() {
        for status in [RunStatus::Started, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert!("paused".parse::<RunStatus>().is_err());
        assert!(!RunStatus::Started.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn summary_serializes_camel_case() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            status: RunStatus::Completed,
            message: "done".into(),
            records_fetched: Some(3),
            records_deduplicated: Some(2),
            records_added: None,
            duration_ms: 12,
            log_entry_id: Some(7),
            diagnostics: vec![],
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["recordsFetched"], 3);
        assert_eq!(value["recordsAdded"], JsonValue::Null);
        assert_eq!(value["logEntryId"], 7);
        assert!(value.get("diagnostics").is_none());
    }
}
