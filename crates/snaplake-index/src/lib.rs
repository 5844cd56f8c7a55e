//! Search publisher: index lifecycle and bulk publishing against an Elasticsearch-compatible REST API.

use std::collections::HashMap;
use std::time::Duration;

use chrono::SecondsFormat;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use snaplake_core::{
    BulkItemFailure, FieldValue, PipelineError, PublishReport, Result, SearchDocument, SearchRow,
    BULK_ERROR_SAMPLE,
};
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "snaplake-index";

pub const CITY_KPIS_INDEX: &str = "weather_city_kpis";
pub const MOVIES_INDEX: &str = "movies_enriched_daily";
pub const MOVIE_KPIS_INDEX: &str = "movies_kpis_daily";

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub host: String,
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:9200".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexStatus {
    Existing,
    Created,
}

/// Index definition sent verbatim on creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMapping {
    pub settings: JsonValue,
    pub mappings: JsonValue,
}

impl IndexMapping {
    fn single_shard(properties: JsonValue) -> Self {
        Self {
            settings: json!({"number_of_shards": 1, "number_of_replicas": 0}),
            mappings: json!({ "properties": properties }),
        }
    }
}

pub fn city_kpis_mapping() -> IndexMapping {
    IndexMapping::single_shard(json!({
        "snapshot_date": {"type": "date"},
        "rank": {"type": "integer"},
        "city": {"type": "keyword"},
        "country_code": {"type": "keyword"},
        "measurement_count": {"type": "integer"},
        "avg_temperature": {"type": "double"},
        "total_precipitation": {"type": "double"},
        "avg_wind_speed": {"type": "double"},
        "avg_humidity": {"type": "double"},
        "country": {"type": "keyword"},
        "admin1": {"type": "keyword"},
        "latitude": {"type": "float"},
        "longitude": {"type": "float"},
        "population": {"type": "long"},
        "location": {"type": "geo_point"},
        "comfort_score": {"type": "double"}
    }))
}

pub fn movies_enriched_mapping() -> IndexMapping {
    let text_with_keyword = json!({"type": "text", "fields": {"keyword": {"type": "keyword"}}});
    IndexMapping::single_shard(json!({
        "snapshot_date": {"type": "date"},
        "tmdb_id": {"type": "long"},
        "imdb_id": {"type": "keyword"},
        "title": text_with_keyword,
        "original_language": {"type": "keyword"},
        "release_date": {"type": "date"},
        "release_year": {"type": "integer"},
        "popularity": {"type": "double"},
        "tmdb_rating": {"type": "double"},
        "tmdb_vote_count": {"type": "integer"},
        "imdb_rating": {"type": "double"},
        "imdb_votes": {"type": "integer"},
        "metascore": {"type": "double"},
        "runtime_minutes": {"type": "integer"},
        "status": {"type": "keyword"},
        "rated": {"type": "keyword"},
        "director": text_with_keyword,
        "actors": {"type": "text"},
        "missing_omdb_data": {"type": "boolean"}
    }))
}

/// One document per snapshot date summarizing the enriched movies.
pub fn movies_kpis_mapping() -> IndexMapping {
    IndexMapping::single_shard(json!({
        "snapshot_date": {"type": "date"},
        "nb_movies": {"type": "integer"},
        "nb_movies_with_omdb": {"type": "integer"},
        "omdb_coverage_ratio": {"type": "double"},
        "avg_tmdb_rating": {"type": "double"},
        "avg_imdb_rating": {"type": "double"},
        "avg_popularity": {"type": "double"}
    }))
}

/// Converts a typed cell into a JSON value the index accepts.
pub fn to_json_safe(value: &FieldValue) -> JsonValue {
    match value {
        FieldValue::Null => JsonValue::Null,
        FieldValue::Bool(b) => JsonValue::Bool(*b),
        FieldValue::Int(i) => JsonValue::from(*i),
        // NaN and infinities have no JSON form.
        FieldValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        FieldValue::Text(s) => JsonValue::String(s.clone()),
        FieldValue::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
        FieldValue::Timestamp(ts) => JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
        FieldValue::List(items) => JsonValue::Array(items.iter().map(to_json_safe).collect()),
        FieldValue::Map(pairs) => JsonValue::Object(
            pairs
                .iter()
                .map(|(k, v)| (k.clone(), to_json_safe(v)))
                .collect(),
        ),
    }
}

pub fn row_to_body(row: &SearchRow) -> JsonMap<String, JsonValue> {
    row.fields
        .iter()
        .map(|(name, value)| (name.clone(), to_json_safe(value)))
        .collect()
}

/// `_`-joined rendering of the id columns; strings verbatim, everything else as JSON.
pub fn document_id(index: &str, row_number: usize, body: &JsonMap<String, JsonValue>, id_columns: &[&str]) -> Result<String> {
    let mut parts = Vec::with_capacity(id_columns.len());
    for column in id_columns {
        let part = match body.get(*column) {
            None | Some(JsonValue::Null) => {
                return Err(PipelineError::InvalidDocumentId {
                    index: index.to_string(),
                    row: row_number,
                    column: column.to_string(),
                })
            }
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        parts.push(part);
    }
    Ok(parts.join("_"))
}

/// Converts every row up front so an invalid id aborts before any request.
pub fn build_documents(index: &str, rows: &[SearchRow], id_columns: &[&str]) -> Result<Vec<SearchDocument>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let body = row_to_body(row);
            Ok(SearchDocument {
                index_name: index.to_string(),
                document_id: document_id(index, i, &body, id_columns)?,
                body,
            })
        })
        .collect()
}

/// NDJSON action/body pairs, newline terminated.
pub fn build_bulk_body(documents: &[SearchDocument]) -> String {
    let mut payload = String::new();
    for doc in documents {
        let action = json!({"index": {"_index": doc.index_name, "_id": doc.document_id}});
        payload.push_str(&action.to_string());
        payload.push('\n');
        payload.push_str(&JsonValue::Object(doc.body.clone()).to_string());
        payload.push('\n');
    }
    payload
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    #[serde(default)]
    status: u16,
    error: Option<JsonValue>,
}

impl BulkItem {
    fn failure(&self) -> Option<BulkItemFailure> {
        let error = self.error.as_ref()?;
        let (error_type, reason) = match error {
            JsonValue::String(reason) => (None, Some(reason.clone())),
            other => (
                other.get("type").and_then(|v| v.as_str()).map(str::to_string),
                other.get("reason").and_then(|v| v.as_str()).map(str::to_string),
            ),
        };
        Some(BulkItemFailure {
            document_id: self.id.clone(),
            status: self.status,
            error_type,
            reason,
        })
    }
}

/// Turns a bulk response body into a report, or `BulkIndexingFailed` when any item failed.
pub fn interpret_bulk_response(index: &str, total: usize, response: &JsonValue) -> Result<PublishReport> {
    // Only a 2xx body reaches this point.
    let parsed: BulkResponse =
        serde_json::from_value(response.clone()).map_err(|err| PipelineError::SearchHttp {
            status: 200,
            url: "_bulk".to_string(),
            body: format!("unrecognized bulk response for {index}: {err}"),
        })?;

    let failures = parsed
        .items
        .iter()
        .flat_map(|item| item.values())
        .filter_map(BulkItem::failure)
        .collect::<Vec<_>>();

    if parsed.errors || !failures.is_empty() {
        let failed = failures.len();
        return Err(PipelineError::BulkIndexingFailed {
            index: index.to_string(),
            failed,
            total,
            sample: failures.into_iter().take(BULK_ERROR_SAMPLE).collect(),
        });
    }

    Ok(PublishReport {
        index: index.to_string(),
        doc_count: total,
    })
}

#[derive(Debug, Clone)]
pub struct SearchClient {
    client: reqwest::Client,
    base_url: String,
}

impl SearchClient {
    pub fn new(config: SearchConfig) -> Result<Self> {
        let base_url = config.host.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| PipelineError::ConnectionFailure {
                target: base_url.clone(),
                message: format!("building http client: {err}"),
            })?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Checks reachability and returns the reported cluster version.
    pub async fn ping(&self) -> Result<String> {
        let url = self.url("");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| transport_error(&url, err))?;
        let body: JsonValue = expect_success(response, &url)
            .await?
            .json()
            .await
            .map_err(|err| transport_error(&url, err))?;
        let version = body
            .pointer("/version/number")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        info!(url = %self.base_url, %version, "search endpoint reachable");
        Ok(version)
    }

    /// Creates the index when missing; an existing index is left untouched.
    pub async fn ensure_index(&self, name: &str, mapping: &IndexMapping) -> Result<IndexStatus> {
        let url = self.url(name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| transport_error(&url, err))?;

        match response.status() {
            status if status.is_success() => {
                info!(index = name, "index already exists");
                Ok(IndexStatus::Existing)
            }
            StatusCode::NOT_FOUND => {
                self.create_index(name, mapping).await?;
                Ok(IndexStatus::Created)
            }
            _ => Err(http_error(response, &url).await),
        }
    }

    /// Drops and recreates the index. Destroys every document in it.
    pub async fn recreate_index(&self, name: &str, mapping: &IndexMapping) -> Result<IndexStatus> {
        let url = self.url(name);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|err| transport_error(&url, err))?;
        match response.status() {
            status if status.is_success() => warn!(index = name, "index deleted for rebuild"),
            StatusCode::NOT_FOUND => debug!(index = name, "nothing to delete"),
            _ => return Err(http_error(response, &url).await),
        }
        self.create_index(name, mapping).await?;
        Ok(IndexStatus::Created)
    }

    async fn create_index(&self, name: &str, mapping: &IndexMapping) -> Result<()> {
        let url = self.url(name);
        let response = self
            .client
            .put(&url)
            .json(mapping)
            .send()
            .await
            .map_err(|err| transport_error(&url, err))?;
        expect_success(response, &url).await?;
        info!(index = name, "index created");
        Ok(())
    }

    pub async fn refresh(&self, name: &str) -> Result<()> {
        let url = self.url(&format!("{name}/_refresh"));
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|err| transport_error(&url, err))?;
        expect_success(response, &url).await?;
        Ok(())
    }

    /// Publishes all rows in one bulk request keyed by `id_columns`.
    pub async fn publish(&self, index: &str, rows: &[SearchRow], id_columns: &[&str]) -> Result<PublishReport> {
        if rows.is_empty() {
            warn!(index, "nothing to publish");
            return Ok(PublishReport {
                index: index.to_string(),
                doc_count: 0,
            });
        }

        let documents = build_documents(index, rows, id_columns)?;
        let payload = build_bulk_body(&documents);
        let url = self.url("_bulk");
        let span = info_span!("bulk_publish", index, docs = documents.len());

        async {
            let response = self
                .client
                .post(&url)
                .header(CONTENT_TYPE, "application/x-ndjson")
                .body(payload)
                .send()
                .await
                .map_err(|err| transport_error(&url, err))?;
            let body: JsonValue = expect_success(response, &url)
                .await?
                .json()
                .await
                .map_err(|err| transport_error(&url, err))?;

            let report = interpret_bulk_response(index, documents.len(), &body)?;
            info!(doc_count = report.doc_count, "bulk publish succeeded");
            Ok::<_, PipelineError>(report)
        }
        .instrument(span)
        .await
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> PipelineError {
    PipelineError::ConnectionFailure {
        target: url.to_string(),
        message: err.to_string(),
    }
}

async fn http_error(response: reqwest::Response, url: &str) -> PipelineError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    PipelineError::SearchHttp {
        status,
        url: url.to_string(),
        body,
    }
}

async fn expect_success(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(http_error(response, url).await)
    }
}
