//! Core domain model, reports and error taxonomy for snaplake.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "snaplake-core";

/// Upper bound on per-document issues carried inside a report.
pub const MAX_REPORTED_ISSUES: usize = 10;

/// Upper bound on failing bulk items carried inside a publish error.
pub const BULK_ERROR_SAMPLE: usize = 5;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Logical address of a partition: an ISO date, optionally refined by a run id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub logical_date: NaiveDate,
    pub run: Option<String>,
}

impl PartitionKey {
    pub fn new(logical_date: NaiveDate) -> Self {
        Self {
            logical_date,
            run: None,
        }
    }

    pub fn with_run(logical_date: NaiveDate, run: impl Into<String>) -> Self {
        Self {
            logical_date,
            run: Some(run.into()),
        }
    }

    /// Directory name of the date level, e.g. `dt=2026-02-17`.
    pub fn dir_name(&self, prefix: &str) -> String {
        format!("{prefix}={}", self.logical_date.format("%Y-%m-%d"))
    }

    /// Parses `prefix=YYYY-MM-DD`; anything else yields `None`.
    pub fn parse_dir_name(prefix: &str, name: &str) -> Option<NaiveDate> {
        let value = name.strip_prefix(prefix)?.strip_prefix('=')?;
        NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.run {
            Some(run) => write!(f, "{}/run={run}", self.logical_date.format("%Y-%m-%d")),
            None => write!(f, "{}", self.logical_date.format("%Y-%m-%d")),
        }
    }
}

/// A resolved, existing partition directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPath {
    pub path: PathBuf,
    pub prefix: String,
    pub key: PartitionKey,
}

impl PartitionPath {
    pub fn logical_date(&self) -> NaiveDate {
        self.key.logical_date
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for PartitionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Source-specific business identifier used as the upsert key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NaturalId {
    Numeric(i64),
    Text(String),
}

impl fmt::Display for NaturalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NaturalId::Numeric(v) => write!(f, "{v}"),
            NaturalId::Text(v) => f.write_str(v),
        }
    }
}

/// One landed document row keyed by `(snapshot_date, natural_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub snapshot_date: NaiveDate,
    pub natural_id: NaturalId,
    pub title: Option<String>,
    pub payload: JsonValue,
    /// Extra text columns declared by the table, e.g. a cross-reference id.
    #[serde(default)]
    pub attributes: BTreeMap<String, Option<String>>,
    /// Assigned by the store on first insert; never rewritten by an upsert.
    pub created_at: Option<DateTime<Utc>>,
}

/// Ingestion metadata carried by a wrapped document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IngestionMetadata {
    #[serde(default)]
    pub snapshot_date: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub extracted_at: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl IngestionMetadata {
    /// Lenient reading of an envelope's `metadata` block.
    ///
    /// Scalar values of the named fields are kept as text (a numeric `run_id`
    /// becomes `"1333"`); anything else lands in `extra`. `null` is empty
    /// metadata, and a non-object block is kept under `extra["value"]`.
    pub fn from_json(value: JsonValue) -> Self {
        let mut metadata = Self::default();
        let fields = match value {
            JsonValue::Null => return metadata,
            JsonValue::Object(fields) => fields,
            other => {
                metadata.extra.insert("value".to_string(), other);
                return metadata;
            }
        };

        for (key, value) in fields {
            let slot = match key.as_str() {
                "snapshot_date" => &mut metadata.snapshot_date,
                "run_id" => &mut metadata.run_id,
                "extracted_at" => &mut metadata.extracted_at,
                "source" => &mut metadata.source,
                "endpoint" => &mut metadata.endpoint,
                _ => {
                    metadata.extra.insert(key, value);
                    continue;
                }
            };
            match value {
                JsonValue::Null => {}
                JsonValue::String(text) => *slot = Some(text),
                JsonValue::Number(number) => *slot = Some(number.to_string()),
                JsonValue::Bool(flag) => *slot = Some(flag.to_string()),
                nested => {
                    metadata.extra.insert(key, nested);
                }
            }
        }
        metadata
    }
}

/// A decoded document, either a bare payload or a payload with ingestion metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Bare(JsonValue),
    Wrapped {
        metadata: IngestionMetadata,
        data: JsonValue,
    },
}

impl Envelope {
    pub fn payload(&self) -> &JsonValue {
        match self {
            Envelope::Bare(payload) => payload,
            Envelope::Wrapped { data, .. } => data,
        }
    }

    pub fn metadata(&self) -> Option<&IngestionMetadata> {
        match self {
            Envelope::Bare(_) => None,
            Envelope::Wrapped { metadata, .. } => Some(metadata),
        }
    }

    pub fn into_parts(self) -> (JsonValue, Option<IngestionMetadata>) {
        match self {
            Envelope::Bare(payload) => (payload, None),
            Envelope::Wrapped { metadata, data } => (data, Some(metadata)),
        }
    }
}

/// Flattened, time-indexed measurement for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub entity_key: String,
    pub dimension_key: String,
    pub time_utc: DateTime<Utc>,
    pub metrics: BTreeMap<String, Option<f64>>,
}

/// Reference attributes for an entity (e.g. a geocoded city).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionRow {
    pub entity_key: String,
    pub dimension_key: String,
    pub country: Option<String>,
    pub admin1: Option<String>,
    pub timezone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub population: Option<i64>,
}

/// One aggregated, scored and ranked entity within a KPI partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiRow {
    pub snapshot_date: NaiveDate,
    pub entity_key: String,
    pub dimension_key: String,
    pub measurement_count: u32,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub dimension: Option<DimensionRow>,
    pub score: Option<f64>,
    pub rank: u32,
}

/// Typed cell of a row headed for the search index.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    List(Vec<FieldValue>),
    Map(Vec<(String, FieldValue)>),
}

impl From<Option<f64>> for FieldValue {
    fn from(value: Option<f64>) -> Self {
        value.map(FieldValue::Float).unwrap_or(FieldValue::Null)
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map(FieldValue::Text).unwrap_or(FieldValue::Null)
    }
}

impl From<Option<i64>> for FieldValue {
    fn from(value: Option<i64>) -> Self {
        value.map(FieldValue::Int).unwrap_or(FieldValue::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// Ordered column/value pairs for one logical row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchRow {
    pub fields: Vec<(String, FieldValue)>,
}

impl SearchRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.push((column.into(), value.into()));
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

/// A JSON-safe document addressed by a deterministic id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub index_name: String,
    pub document_id: String,
    pub body: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Unreadable,
    Malformed,
    MissingNaturalKey,
    Rejected,
}

/// Per-document problem recorded in a batch report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentIssue {
    pub document: String,
    pub kind: IssueKind,
    pub detail: String,
}

/// Outcome of loading one partition of one document family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub table: String,
    pub partition: String,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub issues: Vec<DocumentIssue>,
}

impl LoadReport {
    pub fn new(table: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            partition: partition.into(),
            inserted: 0,
            updated: 0,
            skipped: 0,
            errors: 0,
            issues: Vec::new(),
        }
    }

    pub fn record_skip(&mut self, document: impl Into<String>, kind: IssueKind, detail: impl Into<String>) {
        self.skipped += 1;
        push_issue(&mut self.issues, document.into(), kind, detail.into());
    }

    pub fn record_error(&mut self, document: impl Into<String>, kind: IssueKind, detail: impl Into<String>) {
        self.errors += 1;
        push_issue(&mut self.issues, document.into(), kind, detail.into());
    }
}

/// Outcome of flattening one raw partition into a formatted partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatReport {
    pub output: String,
    pub documents: usize,
    pub rows: usize,
    pub skipped: usize,
    pub errors: usize,
    pub issues: Vec<DocumentIssue>,
}

impl FormatReport {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            documents: 0,
            rows: 0,
            skipped: 0,
            errors: 0,
            issues: Vec::new(),
        }
    }

    pub fn record_skip(&mut self, document: impl Into<String>, kind: IssueKind, detail: impl Into<String>) {
        self.skipped += 1;
        push_issue(&mut self.issues, document.into(), kind, detail.into());
    }

    pub fn record_error(&mut self, document: impl Into<String>, kind: IssueKind, detail: impl Into<String>) {
        self.errors += 1;
        push_issue(&mut self.issues, document.into(), kind, detail.into());
    }
}

fn push_issue(issues: &mut Vec<DocumentIssue>, document: String, kind: IssueKind, detail: String) {
    if issues.len() < MAX_REPORTED_ISSUES {
        issues.push(DocumentIssue {
            document,
            kind,
            detail,
        });
    }
}

/// One failing item of a bulk response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemFailure {
    pub document_id: Option<String>,
    pub status: u16,
    pub error_type: Option<String>,
    pub reason: Option<String>,
}

impl fmt::Display for BulkItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (status {}): {}",
            self.document_id.as_deref().unwrap_or("<no id>"),
            self.status,
            self.reason
                .as_deref()
                .or(self.error_type.as_deref())
                .unwrap_or("unknown error")
        )
    }
}

/// Outcome of a fully successful bulk publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub index: String,
    pub doc_count: usize,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no partition {} under {}", describe_partition(.prefix, .logical_date), .base.display())]
    PartitionNotFound {
        base: PathBuf,
        prefix: String,
        logical_date: Option<NaiveDate>,
    },
    #[error("malformed document {document}: {reason}")]
    MalformedDocument { document: String, reason: String },
    #[error("bulk indexing into {index} failed for {failed} of {total} documents; sample: {}", describe_sample(.sample))]
    BulkIndexingFailed {
        index: String,
        failed: usize,
        total: usize,
        sample: Vec<BulkItemFailure>,
    },
    #[error("connection to {target} failed: {message}")]
    ConnectionFailure { target: String, message: String },
    #[error("row {row} for index {index} has no value for id column {column}")]
    InvalidDocumentId {
        index: String,
        row: usize,
        column: String,
    },
    #[error("search endpoint returned http {status} for {url}: {body}")]
    SearchHttp { status: u16, url: String, body: String },
    #[error("store operation on {table} failed")]
    Store {
        table: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("io error at {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parquet error at {}: {message}", .path.display())]
    Parquet { path: PathBuf, message: String },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parquet(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        PipelineError::Parquet {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Classifies errors that only invalidate a single document, never the whole batch.
    pub fn document_issue(&self) -> Option<(IssueKind, String)> {
        match self {
            PipelineError::MalformedDocument { reason, .. } => Some((IssueKind::Malformed, reason.clone())),
            PipelineError::Io { source, .. } => Some((IssueKind::Unreadable, source.to_string())),
            _ => None,
        }
    }
}

fn describe_partition(prefix: &str, logical_date: &Option<NaiveDate>) -> String {
    match logical_date {
        Some(date) => format!("{prefix}={}", date.format("%Y-%m-%d")),
        None => format!("{prefix}=<any date>"),
    }
}

fn describe_sample(sample: &[BulkItemFailure]) -> String {
    sample
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_dir_names_round_through_iso_dates() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 17).unwrap();
        let key = PartitionKey::new(date);
        assert_eq!(key.dir_name("dt"), "dt=2026-02-17");
        assert_eq!(PartitionKey::parse_dir_name("dt", "dt=2026-02-17"), Some(date));
        assert_eq!(PartitionKey::parse_dir_name("dt", "date=2026-02-17"), None);
        assert_eq!(PartitionKey::parse_dir_name("dt", "dt=latest"), None);
        assert_eq!(
            PartitionKey::with_run(date, "1333").to_string(),
            "2026-02-17/run=1333"
        );
    }

    #[test]
    fn report_issue_list_is_bounded() {
        let mut report = LoadReport::new("raw.raw_tmdb_details", "date=2026-02-17");
        for i in 0..(MAX_REPORTED_ISSUES + 5) {
            report.record_error(format!("{i}.json"), IssueKind::Malformed, "bad json");
        }
        assert_eq!(report.errors, MAX_REPORTED_ISSUES + 5);
        assert_eq!(report.issues.len(), MAX_REPORTED_ISSUES);
    }

    #[test]
    fn envelope_parts_hide_the_shape() {
        let bare = Envelope::Bare(serde_json::json!({"id": 1}));
        let wrapped = Envelope::Wrapped {
            metadata: IngestionMetadata {
                source: Some("tmdb".into()),
                ..Default::default()
            },
            data: serde_json::json!({"id": 1}),
        };
        assert_eq!(bare.payload(), wrapped.payload());
        assert!(bare.into_parts().1.is_none());
        assert_eq!(
            wrapped.into_parts().1.and_then(|m| m.source).as_deref(),
            Some("tmdb")
        );
    }

    #[test]
    fn bulk_failure_message_carries_sample_ids() {
        let err = PipelineError::BulkIndexingFailed {
            index: "city_kpis".into(),
            failed: 2,
            total: 10,
            sample: vec![BulkItemFailure {
                document_id: Some("2026-02-17_Paris_FR".into()),
                status: 400,
                error_type: Some("mapper_parsing_exception".into()),
                reason: Some("failed to parse field [population]".into()),
            }],
        };
        let text = err.to_string();
        assert!(text.contains("2 of 10"));
        assert!(text.contains("2026-02-17_Paris_FR"));
        assert!(err.document_issue().is_none());
    }

    #[test]
    fn document_level_errors_map_to_issue_kinds() {
        let malformed = PipelineError::MalformedDocument {
            document: "550.json".into(),
            reason: "EOF while parsing".into(),
        };
        assert_eq!(
            malformed.document_issue(),
            Some((IssueKind::Malformed, "EOF while parsing".to_string()))
        );

        let unreadable = PipelineError::io(
            "550.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(unreadable.document_issue().map(|(kind, _)| kind), Some(IssueKind::Unreadable));

        let store = PipelineError::ConnectionFailure {
            target: "postgres".into(),
            message: "refused".into(),
        };
        assert!(store.document_issue().is_none());
    }

    #[test]
    fn metadata_is_read_leniently() {
        let metadata = IngestionMetadata::from_json(serde_json::json!({
            "run_id": 1333,
            "source": "tmdb",
            "snapshot_date": null,
            "endpoint": {"path": "/movie/popular"},
            "city": "Paris"
        }));
        assert_eq!(metadata.run_id.as_deref(), Some("1333"));
        assert_eq!(metadata.source.as_deref(), Some("tmdb"));
        assert_eq!(metadata.snapshot_date, None);
        assert_eq!(metadata.endpoint, None);
        assert_eq!(metadata.extra["endpoint"]["path"], "/movie/popular");
        assert_eq!(metadata.extra["city"], "Paris");

        assert_eq!(IngestionMetadata::from_json(JsonValue::Null), IngestionMetadata::default());
        let scalar = IngestionMetadata::from_json(serde_json::json!("oops"));
        assert_eq!(scalar.extra["value"], "oops");
        assert_eq!(scalar.run_id, None);
    }
}
