use std::path::Path;
use std::sync::Arc;

use arrow_array::{Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use snaplake_core::{
    DimensionRow, Envelope, FormatReport, IngestionMetadata, IssueKind, MeasurementRow, PartitionKey, PartitionPath,
    PipelineError, Result,
};
use snaplake_storage::{document_name, list_documents, read_document, PartitionWriter};
use tracing::{info, info_span, warn};

use crate::kpi::ScoreModel;
use crate::parquet_io::{
    cell_f64, cell_i64, cell_str, float64, manifest_entry, read_parquet, required_column, typed_column, utf8,
    write_manifest, write_parquet,
};
use crate::{CITIES_FILE, FORMATTED_PREFIX, WEATHER_FILE};

/// Hourly series copied from a weather document, as `(payload key, column)`.
const WEATHER_SERIES: [(&str, &str); 4] = [
    ("temperature_2m", "temperature_2m"),
    ("relative_humidity_2m", "humidity_2m"),
    ("precipitation", "precipitation"),
    ("wind_speed_10m", "wind_speed_10m"),
];

/// Parses the time stamps the weather provider emits (UTC, with or without seconds/offset).
pub fn parse_utc_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn ingestion_field(metadata: Option<&IngestionMetadata>, payload: &JsonValue, field: &str) -> Option<String> {
    metadata
        .and_then(|m| m.extra.get(field))
        .or_else(|| payload.get("_ingestion").and_then(|block| block.get(field)))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Flattens one weather document into hourly measurement rows.
pub fn flatten_weather_document(
    document: &str,
    metadata: Option<&IngestionMetadata>,
    payload: &JsonValue,
    report: &mut FormatReport,
) -> Vec<MeasurementRow> {
    let city = ingestion_field(metadata, payload, "city");
    let country_code = ingestion_field(metadata, payload, "country_code");
    let hourly = payload.get("hourly");
    let series = |key: &str| -> Vec<JsonValue> {
        hourly
            .and_then(|h| h.get(key))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    };
    let times = series("time");

    let (Some(city), Some(country_code)) = (city, country_code) else {
        if !times.is_empty() {
            report.record_skip(document, IssueKind::MissingNaturalKey, "no city/country_code in ingestion metadata");
        }
        return Vec::new();
    };

    let columns = WEATHER_SERIES
        .iter()
        .map(|(key, column)| (*column, series(key)))
        .collect::<Vec<_>>();

    let mut rows = Vec::with_capacity(times.len());
    for (i, time) in times.iter().enumerate() {
        let Some(time_utc) = time.as_str().and_then(parse_utc_time) else {
            report.record_skip(format!("{document}#{i}"), IssueKind::Rejected, format!("unparseable time {time}"));
            continue;
        };
        let metrics = columns
            .iter()
            .map(|(column, values)| (column.to_string(), values.get(i).and_then(|v| v.as_f64())))
            .collect();
        rows.push(MeasurementRow {
            entity_key: city.clone(),
            dimension_key: country_code.clone(),
            time_utc,
            metrics,
        });
    }
    rows
}

/// Picks the most populous geocoding result; the first one wins a tie.
pub fn best_geocoding_result(payload: &JsonValue) -> Option<&JsonValue> {
    let results = payload.get("results")?.as_array()?;
    results.iter().fold(None, |best: Option<&JsonValue>, candidate| {
        let population = |v: &JsonValue| v.get("population").and_then(|p| p.as_i64()).unwrap_or(0);
        match best {
            Some(current) if population(current) >= population(candidate) => Some(current),
            _ => Some(candidate),
        }
    })
}

pub fn geography_row(result: &JsonValue) -> Option<DimensionRow> {
    let text = |field: &str| {
        result
            .get(field)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let latitude = result.get("latitude").and_then(|v| v.as_f64());
    let longitude = result.get("longitude").and_then(|v| v.as_f64());
    Some(DimensionRow {
        entity_key: text("name")?,
        dimension_key: text("country_code")?,
        country: text("country"),
        admin1: text("admin1"),
        timezone: text("timezone"),
        latitude: Some(latitude?),
        longitude: Some(longitude?),
        population: result.get("population").and_then(|v| v.as_i64()),
    })
}

fn decode_partition_documents(
    partition: &PartitionPath,
    name_prefix: &str,
    report: &mut FormatReport,
) -> Result<Vec<(String, Envelope)>> {
    let mut documents = Vec::new();
    for path in list_documents(partition, Some(name_prefix))? {
        let name = document_name(&path);
        report.documents += 1;
        match read_document(&path) {
            Ok(envelope) => documents.push((name, envelope)),
            Err(err) => match err.document_issue() {
                Some((kind, detail)) => {
                    warn!(document = %name, ?kind, error = %err, "skipping document");
                    report.record_error(name, kind, detail);
                }
                None => return Err(err),
            },
        }
    }
    Ok(documents)
}

/// Raw `hourly_*.json` documents → `dt=<date>/weather_hourly.parquet`.
pub fn format_weather_partition(raw: &PartitionPath, output_base: &Path) -> Result<FormatReport> {
    let _span = info_span!("format_weather", partition = %raw).entered();
    let writer = PartitionWriter::new(output_base, FORMATTED_PREFIX);
    let key = PartitionKey::new(raw.logical_date());
    let mut report = FormatReport::new(writer.final_path(&key).display().to_string());

    let mut rows = Vec::new();
    for (name, envelope) in decode_partition_documents(raw, "hourly_", &mut report)? {
        rows.extend(flatten_weather_document(
            &name,
            envelope.metadata(),
            envelope.payload(),
            &mut report,
        ));
    }
    report.rows = rows.len();

    let staged = writer.stage(&key)?;
    let path = staged.file(WEATHER_FILE);
    write_parquet(&path, measurements_batch(&rows)?)?;
    let entry = manifest_entry(&path, rows.len())?;
    write_manifest(&staged, raw.logical_date(), vec![entry])?;
    staged.commit()?;

    info!(rows = report.rows, documents = report.documents, errors = report.errors, "weather partition formatted");
    Ok(report)
}

/// Raw `geocoding_*.json` documents → `dt=<date>/cities.parquet`.
pub fn format_geography_partition(raw: &PartitionPath, output_base: &Path) -> Result<FormatReport> {
    let _span = info_span!("format_geography", partition = %raw).entered();
    let writer = PartitionWriter::new(output_base, FORMATTED_PREFIX);
    let key = PartitionKey::new(raw.logical_date());
    let mut report = FormatReport::new(writer.final_path(&key).display().to_string());

    let mut rows = Vec::new();
    for (name, envelope) in decode_partition_documents(raw, "geocoding_", &mut report)? {
        match best_geocoding_result(envelope.payload()).and_then(geography_row) {
            Some(row) => rows.push(row),
            None => report.record_skip(name, IssueKind::Rejected, "no complete geocoding result"),
        }
    }
    report.rows = rows.len();

    let staged = writer.stage(&key)?;
    let path = staged.file(CITIES_FILE);
    write_parquet(&path, dimensions_batch(&rows)?)?;
    let entry = manifest_entry(&path, rows.len())?;
    write_manifest(&staged, raw.logical_date(), vec![entry])?;
    staged.commit()?;

    info!(rows = report.rows, documents = report.documents, errors = report.errors, "geography partition formatted");
    Ok(report)
}

fn measurements_batch(rows: &[MeasurementRow]) -> Result<RecordBatch> {
    let mut fields = vec![utf8("city", false), utf8("country_code", false), utf8("time_utc", false)];
    fields.extend(WEATHER_SERIES.iter().map(|(_, column)| float64(column)));
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from(rows.iter().map(|r| Some(r.entity_key.as_str())).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| Some(r.dimension_key.as_str())).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| Some(r.time_utc.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
                .collect::<Vec<_>>(),
        )),
    ];
    for (_, column) in WEATHER_SERIES {
        columns.push(Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.metrics.get(column).copied().flatten())
                .collect::<Vec<_>>(),
        )));
    }

    RecordBatch::try_new(schema, columns).map_err(|err| PipelineError::parquet(WEATHER_FILE, err))
}

fn dimensions_batch(rows: &[DimensionRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        utf8("city", false),
        utf8("country_code", false),
        utf8("country", true),
        utf8("admin1", true),
        utf8("timezone", true),
        float64("latitude"),
        float64("longitude"),
        ArrowField::new("population", DataType::Int64, true),
    ]));
    let text = |f: fn(&DimensionRow) -> Option<&str>| {
        Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>())) as Arc<dyn Array>
    };

    RecordBatch::try_new(
        schema,
        vec![
            text(|r| Some(r.entity_key.as_str())),
            text(|r| Some(r.dimension_key.as_str())),
            text(|r| r.country.as_deref()),
            text(|r| r.admin1.as_deref()),
            text(|r| r.timezone.as_deref()),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.latitude).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.longitude).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.population).collect::<Vec<_>>())),
        ],
    )
    .map_err(|err| PipelineError::parquet(CITIES_FILE, err))
}

pub fn read_measurements(path: &Path, model: &ScoreModel) -> Result<Vec<MeasurementRow>> {
    let mut rows = Vec::new();
    for batch in read_parquet(path)? {
        let entities = required_column::<StringArray>(&batch, &model.entity_column, path)?;
        let dimensions = required_column::<StringArray>(&batch, &model.dimension_column, path)?;
        let times = required_column::<StringArray>(&batch, "time_utc", path)?;
        let metrics = model
            .metrics
            .iter()
            .map(|spec| (spec.source.as_str(), typed_column::<Float64Array>(&batch, &spec.source)))
            .collect::<Vec<_>>();

        for i in 0..batch.num_rows() {
            let (Some(entity_key), Some(dimension_key)) = (cell_str(Some(entities), i), cell_str(Some(dimensions), i)) else {
                continue;
            };
            let Some(time_utc) = cell_str(Some(times), i).as_deref().and_then(parse_utc_time) else {
                warn!(path = %path.display(), row = i, "dropping measurement without a parseable time");
                continue;
            };
            rows.push(MeasurementRow {
                entity_key,
                dimension_key,
                time_utc,
                metrics: metrics
                    .iter()
                    .map(|(name, array)| (name.to_string(), cell_f64(*array, i)))
                    .collect(),
            });
        }
    }
    Ok(rows)
}

pub fn read_dimensions(path: &Path) -> Result<Vec<DimensionRow>> {
    let mut rows = Vec::new();
    for batch in read_parquet(path)? {
        let cities = required_column::<StringArray>(&batch, "city", path)?;
        let codes = required_column::<StringArray>(&batch, "country_code", path)?;
        let country = typed_column::<StringArray>(&batch, "country");
        let admin1 = typed_column::<StringArray>(&batch, "admin1");
        let timezone = typed_column::<StringArray>(&batch, "timezone");
        let latitude = typed_column::<Float64Array>(&batch, "latitude");
        let longitude = typed_column::<Float64Array>(&batch, "longitude");
        let population = typed_column::<Int64Array>(&batch, "population");

        for i in 0..batch.num_rows() {
            let (Some(entity_key), Some(dimension_key)) = (cell_str(Some(cities), i), cell_str(Some(codes), i)) else {
                continue;
            };
            rows.push(DimensionRow {
                entity_key,
                dimension_key,
                country: cell_str(country, i),
                admin1: cell_str(admin1, i),
                timezone: cell_str(timezone, i),
                latitude: cell_f64(latitude, i),
                longitude: cell_f64(longitude, i),
                population: cell_i64(population, i),
            });
        }
    }
    Ok(rows)
}
