use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use arrow_array::{Array, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use snaplake_core::{
    DimensionRow, FieldValue, KpiRow, MeasurementRow, PartitionKey, PartitionPath, PipelineError, Result, SearchRow,
};
use snaplake_storage::PartitionWriter;
use tracing::{info, info_span, warn};

use crate::format::{read_dimensions, read_measurements};
use crate::parquet_io::{
    cell_f64, cell_i64, cell_str, float64, manifest_entry, read_parquet, required_column, typed_column, utf8,
    write_manifest, write_parquet, PartitionManifest,
};
use crate::{CITIES_FILE, FORMATTED_PREFIX, KPI_FILE, WEATHER_FILE};

const SCORE_MIN: f64 = 0.0;
const SCORE_MAX: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reducer {
    Mean,
    Sum,
    Min,
    Max,
}

impl Reducer {
    /// Non-finite inputs are ignored; no usable input yields `None`, never zero.
    pub fn reduce(self, values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
        let values = values
            .into_iter()
            .flatten()
            .filter(|v| v.is_finite())
            .collect::<Vec<_>>();
        if values.is_empty() {
            return None;
        }
        let sum = || values.iter().fold(0.0, |acc, v| acc + v);
        Some(match self {
            Reducer::Mean => sum() / values.len() as f64,
            Reducer::Sum => sum(),
            Reducer::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Reducer::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Penalty {
    /// `|value - ideal| * weight`
    AbsDeviation { ideal: f64, weight: f64 },
    /// `value * weight`
    Linear { weight: f64 },
    /// `max(value - threshold, 0) * weight`
    ExcessOver { threshold: f64, weight: f64 },
}

impl Penalty {
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Penalty::AbsDeviation { ideal, weight } => (value - ideal).abs() * weight,
            Penalty::Linear { weight } => value * weight,
            Penalty::ExcessOver { threshold, weight } => (value - threshold).max(0.0) * weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub source: String,
    pub output: String,
    pub reducer: Reducer,
    pub penalty: Penalty,
}

impl MetricSpec {
    pub fn new(source: &str, output: &str, reducer: Reducer, penalty: Penalty) -> Self {
        Self {
            source: source.to_string(),
            output: output.to_string(),
            reducer,
            penalty,
        }
    }
}

/// Deterministic penalty-based score over declared metric aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreModel {
    pub entity_column: String,
    pub dimension_column: String,
    pub score_column: String,
    pub base: f64,
    pub metrics: Vec<MetricSpec>,
}

impl ScoreModel {
    /// City comfort: ideal 22°C, rain hurts, wind above 10 hurts, humidity away from 50% hurts.
    pub fn comfort() -> Self {
        Self {
            entity_column: "city".to_string(),
            dimension_column: "country_code".to_string(),
            score_column: "comfort_score".to_string(),
            base: 100.0,
            metrics: vec![
                MetricSpec::new(
                    "temperature_2m",
                    "avg_temperature",
                    Reducer::Mean,
                    Penalty::AbsDeviation { ideal: 22.0, weight: 3.0 },
                ),
                MetricSpec::new(
                    "precipitation",
                    "total_precipitation",
                    Reducer::Sum,
                    Penalty::Linear { weight: 8.0 },
                ),
                MetricSpec::new(
                    "wind_speed_10m",
                    "avg_wind_speed",
                    Reducer::Mean,
                    Penalty::ExcessOver { threshold: 10.0, weight: 1.5 },
                ),
                MetricSpec::new(
                    "humidity_2m",
                    "avg_humidity",
                    Reducer::Mean,
                    Penalty::AbsDeviation { ideal: 50.0, weight: 0.4 },
                ),
            ],
        }
    }

    /// Clamped to `[0, 100]` whatever the base; any missing aggregate makes the score `None`.
    pub fn score(&self, aggregates: &BTreeMap<String, Option<f64>>) -> Option<f64> {
        let mut score = self.base;
        for spec in &self.metrics {
            let value = aggregates.get(&spec.output).copied().flatten()?;
            score -= spec.penalty.apply(value);
        }
        Some(score.clamp(SCORE_MIN, SCORE_MAX))
    }
}

impl Default for ScoreModel {
    fn default() -> Self {
        Self::comfort()
    }
}

fn join_key(entity: &str, dimension: &str) -> (String, String) {
    (entity.trim().to_string(), dimension.trim().to_string())
}

/// Groups, joins, scores and ranks. Pure and deterministic.
pub fn compute_kpis(
    snapshot_date: NaiveDate,
    measurements: &[MeasurementRow],
    dimensions: &[DimensionRow],
    model: &ScoreModel,
) -> Vec<KpiRow> {
    let mut groups: BTreeMap<(String, String), Vec<&MeasurementRow>> = BTreeMap::new();
    for row in measurements {
        groups
            .entry(join_key(&row.entity_key, &row.dimension_key))
            .or_default()
            .push(row);
    }

    let mut lookup: HashMap<(String, String), DimensionRow> = HashMap::new();
    for dim in dimensions {
        let key = join_key(&dim.entity_key, &dim.dimension_key);
        lookup.entry(key.clone()).or_insert_with(|| DimensionRow {
            entity_key: key.0,
            dimension_key: key.1,
            ..dim.clone()
        });
    }

    let mut rows = groups
        .into_iter()
        .map(|(key, members)| {
            let metrics = model
                .metrics
                .iter()
                .map(|spec| {
                    let value = spec
                        .reducer
                        .reduce(members.iter().map(|m| m.metrics.get(&spec.source).copied().flatten()));
                    (spec.output.clone(), value)
                })
                .collect::<BTreeMap<_, _>>();
            let score = model.score(&metrics);
            KpiRow {
                snapshot_date,
                dimension: lookup.get(&key).cloned(),
                entity_key: key.0,
                dimension_key: key.1,
                measurement_count: members.len() as u32,
                metrics,
                score,
                rank: 0,
            }
        })
        .collect::<Vec<_>>();

    // Stable: equal scores keep group order; missing scores sink to the end.
    rows.sort_by(|a, b| match (a.score, b.score) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = i as u32 + 1;
    }
    rows
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiPartition {
    pub partition: PartitionPath,
    pub rows: usize,
    pub scored: usize,
    pub manifest: PartitionManifest,
}

/// Reads a formatted measurement partition and a dimension partition, writes one KPI partition.
pub fn aggregate(
    formatted: &PartitionPath,
    dimension: &PartitionPath,
    output_base: &Path,
    model: &ScoreModel,
) -> Result<KpiPartition> {
    let _span = info_span!("kpi_aggregate", formatted = %formatted, dimension = %dimension).entered();
    if formatted.logical_date() != dimension.logical_date() {
        warn!(
            formatted = %formatted.key,
            dimension = %dimension.key,
            "dimension partition date differs; using the measurement date"
        );
    }

    let snapshot_date = formatted.logical_date();
    let measurements = read_measurements(&formatted.path.join(WEATHER_FILE), model)?;
    let dimensions = read_dimensions(&dimension.path.join(CITIES_FILE))?;
    let rows = compute_kpis(snapshot_date, &measurements, &dimensions, model);

    let writer = PartitionWriter::new(output_base, FORMATTED_PREFIX);
    let staged = writer.stage(&PartitionKey::new(snapshot_date))?;
    let path = staged.file(KPI_FILE);
    write_parquet(&path, kpi_batch(&rows, model)?)?;
    let entry = manifest_entry(&path, rows.len())?;
    let manifest = write_manifest(&staged, snapshot_date, vec![entry])?;
    let partition = staged.commit()?;

    let scored = rows.iter().filter(|r| r.score.is_some()).count();
    if let Some(top) = rows.first() {
        info!(rows = rows.len(), scored, top = %top.entity_key, top_score = ?top.score, "kpi partition written");
    }
    Ok(KpiPartition {
        partition,
        rows: rows.len(),
        scored,
        manifest,
    })
}

fn kpi_batch(rows: &[KpiRow], model: &ScoreModel) -> Result<RecordBatch> {
    let mut fields = vec![
        utf8("snapshot_date", false),
        ArrowField::new("rank", DataType::UInt32, false),
        utf8(&model.entity_column, false),
        utf8(&model.dimension_column, false),
        ArrowField::new("measurement_count", DataType::UInt32, false),
    ];
    fields.extend(model.metrics.iter().map(|spec| float64(&spec.output)));
    fields.extend([
        utf8("country", true),
        utf8("admin1", true),
        utf8("timezone", true),
        float64("latitude"),
        float64("longitude"),
        ArrowField::new("population", DataType::Int64, true),
        float64(&model.score_column),
    ]);
    let schema = Arc::new(Schema::new(fields));

    let dim_text = |f: fn(&DimensionRow) -> Option<&str>| {
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.dimension.as_ref().and_then(f))
                .collect::<Vec<_>>(),
        )) as Arc<dyn Array>
    };
    let dim_f64 = |f: fn(&DimensionRow) -> Option<f64>| {
        Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.dimension.as_ref().and_then(f))
                .collect::<Vec<_>>(),
        )) as Arc<dyn Array>
    };

    let mut columns: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| Some(r.snapshot_date.format("%Y-%m-%d").to_string()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(rows.iter().map(|r| r.rank).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| Some(r.entity_key.as_str())).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| Some(r.dimension_key.as_str())).collect::<Vec<_>>())),
        Arc::new(UInt32Array::from(rows.iter().map(|r| r.measurement_count).collect::<Vec<_>>())),
    ];
    for spec in &model.metrics {
        columns.push(Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.metrics.get(&spec.output).copied().flatten())
                .collect::<Vec<_>>(),
        )));
    }
    columns.extend([
        dim_text(|d| d.country.as_deref()),
        dim_text(|d| d.admin1.as_deref()),
        dim_text(|d| d.timezone.as_deref()),
        dim_f64(|d| d.latitude),
        dim_f64(|d| d.longitude),
        Arc::new(Int64Array::from(
            rows.iter()
                .map(|r| r.dimension.as_ref().and_then(|d| d.population))
                .collect::<Vec<_>>(),
        )) as Arc<dyn Array>,
        Arc::new(Float64Array::from(rows.iter().map(|r| r.score).collect::<Vec<_>>())) as Arc<dyn Array>,
    ]);

    RecordBatch::try_new(schema, columns).map_err(|err| PipelineError::parquet(KPI_FILE, err))
}

/// Reads a KPI partition back in rank order.
pub fn read_kpi_partition(partition: &PartitionPath, model: &ScoreModel) -> Result<Vec<KpiRow>> {
    let path = partition.path.join(KPI_FILE);
    let mut rows = Vec::new();
    for batch in read_parquet(&path)? {
        let dates = required_column::<StringArray>(&batch, "snapshot_date", &path)?;
        let ranks = required_column::<UInt32Array>(&batch, "rank", &path)?;
        let entities = required_column::<StringArray>(&batch, &model.entity_column, &path)?;
        let dims = required_column::<StringArray>(&batch, &model.dimension_column, &path)?;
        let counts = required_column::<UInt32Array>(&batch, "measurement_count", &path)?;
        let scores = typed_column::<Float64Array>(&batch, &model.score_column);
        let metric_columns = model
            .metrics
            .iter()
            .map(|spec| (spec.output.clone(), typed_column::<Float64Array>(&batch, &spec.output)))
            .collect::<Vec<_>>();
        let country = typed_column::<StringArray>(&batch, "country");
        let admin1 = typed_column::<StringArray>(&batch, "admin1");
        let timezone = typed_column::<StringArray>(&batch, "timezone");
        let latitude = typed_column::<Float64Array>(&batch, "latitude");
        let longitude = typed_column::<Float64Array>(&batch, "longitude");
        let population = typed_column::<Int64Array>(&batch, "population");

        for i in 0..batch.num_rows() {
            let snapshot_date = NaiveDate::parse_from_str(dates.value(i), "%Y-%m-%d")
                .map_err(|err| PipelineError::parquet(&path, err))?;
            let entity_key = entities.value(i).to_string();
            let dimension_key = dims.value(i).to_string();
            let dimension = DimensionRow {
                entity_key: entity_key.clone(),
                dimension_key: dimension_key.clone(),
                country: cell_str(country, i),
                admin1: cell_str(admin1, i),
                timezone: cell_str(timezone, i),
                latitude: cell_f64(latitude, i),
                longitude: cell_f64(longitude, i),
                population: cell_i64(population, i),
            };
            let joined = dimension.country.is_some()
                || dimension.admin1.is_some()
                || dimension.latitude.is_some()
                || dimension.longitude.is_some()
                || dimension.population.is_some();

            rows.push(KpiRow {
                snapshot_date,
                entity_key,
                dimension_key,
                measurement_count: counts.value(i),
                metrics: metric_columns
                    .iter()
                    .map(|(name, array)| (name.clone(), cell_f64(*array, i)))
                    .collect(),
                dimension: joined.then_some(dimension),
                score: cell_f64(scores, i),
                rank: ranks.value(i),
            });
        }
    }
    rows.sort_by_key(|r| r.rank);
    Ok(rows)
}

/// Columns that identify one KPI row across republishes.
pub const KPI_ID_COLUMNS: [&str; 3] = ["snapshot_date", "city", "country_code"];

/// Search-index shape of a KPI row, including a `location` geo point when coordinates exist.
pub fn kpi_search_row(row: &KpiRow, model: &ScoreModel) -> SearchRow {
    let mut out = SearchRow::new()
        .with("snapshot_date", FieldValue::Date(row.snapshot_date))
        .with("rank", FieldValue::Int(i64::from(row.rank)))
        .with(model.entity_column.as_str(), row.entity_key.as_str())
        .with(model.dimension_column.as_str(), row.dimension_key.as_str())
        .with("measurement_count", FieldValue::Int(i64::from(row.measurement_count)));
    for spec in &model.metrics {
        out.push(spec.output.as_str(), row.metrics.get(&spec.output).copied().flatten());
    }

    let dim = row.dimension.as_ref();
    out.push("country", dim.and_then(|d| d.country.clone()));
    out.push("admin1", dim.and_then(|d| d.admin1.clone()));
    out.push("latitude", dim.and_then(|d| d.latitude));
    out.push("longitude", dim.and_then(|d| d.longitude));
    out.push("population", dim.and_then(|d| d.population));
    let location = match (dim.and_then(|d| d.latitude), dim.and_then(|d| d.longitude)) {
        (Some(lat), Some(lon)) => FieldValue::Map(vec![
            ("lat".to_string(), FieldValue::Float(lat)),
            ("lon".to_string(), FieldValue::Float(lon)),
        ]),
        _ => FieldValue::Null,
    };
    out.push("location", location);
    out.push(model.score_column.as_str(), row.score);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::date;
    use chrono::{TimeZone, Utc};

    fn measurement(city: &str, code: &str, hour: u32, values: [Option<f64>; 4]) -> MeasurementRow {
        let names = ["temperature_2m", "precipitation", "wind_speed_10m", "humidity_2m"];
        MeasurementRow {
            entity_key: city.to_string(),
            dimension_key: code.to_string(),
            time_utc: Utc.with_ymd_and_hms(2026, 2, 17, hour, 0, 0).single().expect("ts"),
            metrics: names
                .iter()
                .zip(values)
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
        }
    }

    fn city(name: &str, code: &str) -> DimensionRow {
        DimensionRow {
            entity_key: name.to_string(),
            dimension_key: code.to_string(),
            country: Some("France".into()),
            admin1: Some("Île-de-France".into()),
            timezone: Some("Europe/Paris".into()),
            latitude: Some(48.85341),
            longitude: Some(2.3488),
            population: Some(2_138_551),
        }
    }

    #[test]
    fn paris_comfort_score_matches_the_worked_example() {
        let rows = compute_kpis(
            date("2026-02-17"),
            &[
                measurement("Paris", "FR", 0, [Some(20.0), Some(0.0), Some(5.0), Some(50.0)]),
                measurement("Paris", "FR", 1, [Some(24.0), Some(1.0), Some(8.0), Some(54.0)]),
            ],
            &[city(" Paris ", "FR")],
            &ScoreModel::comfort(),
        );

        assert_eq!(rows.len(), 1);
        let paris = &rows[0];
        assert_eq!(paris.metrics["avg_temperature"], Some(22.0));
        assert_eq!(paris.metrics["total_precipitation"], Some(1.0));
        assert_eq!(paris.metrics["avg_wind_speed"], Some(6.5));
        assert_eq!(paris.metrics["avg_humidity"], Some(52.0));
        assert!((paris.score.expect("score") - 91.2).abs() < 1e-9);
        assert_eq!(paris.rank, 1);
        assert_eq!(paris.measurement_count, 2);
        assert_eq!(
            paris.dimension.as_ref().and_then(|d| d.population),
            Some(2_138_551),
            "trimmed keys must join"
        );
    }

    #[test]
    fn missing_metric_yields_null_score_ranked_last() {
        let rows = compute_kpis(
            date("2026-02-17"),
            &[
                measurement("Oslo", "NO", 0, [Some(-3.0), None, Some(12.0), Some(80.0)]),
                measurement("Lisbon", "PT", 0, [Some(18.0), Some(0.0), Some(9.0), Some(60.0)]),
            ],
            &[],
            &ScoreModel::comfort(),
        );
        assert_eq!(rows[0].entity_key, "Lisbon");
        assert!(rows[0].score.is_some());
        assert_eq!(rows[1].entity_key, "Oslo");
        assert_eq!(rows[1].metrics["total_precipitation"], None);
        assert_eq!(rows[1].score, None);
        assert_eq!(rows[1].rank, 2);
        assert!(rows[1].dimension.is_none());
    }

    #[test]
    fn scores_are_clamped_and_ranks_dense_with_stable_ties() {
        let rows = compute_kpis(
            date("2026-02-17"),
            &[
                measurement("Zurich", "CH", 0, [Some(22.0), Some(0.0), Some(0.0), Some(50.0)]),
                measurement("Cairo", "EG", 0, [Some(60.0), Some(40.0), Some(90.0), Some(5.0)]),
                measurement("Athens", "GR", 0, [Some(22.0), Some(0.0), Some(3.0), Some(50.0)]),
                measurement("Madrid", "ES", 0, [Some(21.0), Some(0.0), Some(4.0), Some(50.0)]),
            ],
            &[],
            &ScoreModel::comfort(),
        );

        for row in &rows {
            let score = row.score.expect("score");
            assert!((0.0..=100.0).contains(&score));
        }
        assert_eq!(rows.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        // Athens and Zurich tie at 100; group order (alphabetical) breaks the tie.
        assert_eq!(
            rows.iter().map(|r| r.entity_key.as_str()).collect::<Vec<_>>(),
            vec!["Athens", "Zurich", "Madrid", "Cairo"]
        );
        assert_eq!(rows[3].score, Some(0.0));
    }

    #[test]
    fn reducers_skip_nulls_but_never_invent_zero() {
        assert_eq!(Reducer::Sum.reduce([None, None]), None);
        assert_eq!(Reducer::Sum.reduce([Some(1.0), None, Some(2.0)]), Some(3.0));
        assert_eq!(Reducer::Mean.reduce([Some(f64::NAN), Some(4.0)]), Some(4.0));
        assert_eq!(Reducer::Min.reduce([Some(3.0), Some(-1.0)]), Some(-1.0));
        assert_eq!(Reducer::Max.reduce([Some(3.0), Some(-1.0)]), Some(3.0));
    }

    #[test]
    fn scores_never_exceed_one_hundred_even_with_a_larger_base() {
        let model = ScoreModel {
            base: 150.0,
            ..ScoreModel::comfort()
        };
        let rows = compute_kpis(
            date("2026-02-17"),
            &[measurement("Zurich", "CH", 0, [Some(22.0), Some(0.0), Some(0.0), Some(50.0)])],
            &[],
            &model,
        );
        assert_eq!(rows[0].score, Some(100.0));

        let bare = ScoreModel {
            base: 250.0,
            metrics: vec![MetricSpec::new("x", "x", Reducer::Mean, Penalty::Linear { weight: 1.0 })],
            ..ScoreModel::comfort()
        };
        let mut only_x = BTreeMap::new();
        only_x.insert("x".to_string(), Some(10.0));
        assert_eq!(bare.score(&only_x), Some(100.0));
    }
}
