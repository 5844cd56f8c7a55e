use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use serde_json::Value as JsonValue;
use snaplake_core::{FieldValue, NaturalId, RawRecord, SearchRow};
use tracing::warn;

use crate::kpi::Reducer;

/// Columns that identify one enriched movie per snapshot.
pub const MOVIE_ID_COLUMNS: [&str; 2] = ["snapshot_date", "tmdb_id"];

/// OMDb renders numbers as text (`"1,234"`, `"N/A"`).
fn omdb_number(value: Option<&JsonValue>) -> Option<f64> {
    value?.as_str()?.replace(',', "").trim().parse().ok()
}

fn text_field(payload: &JsonValue, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "N/A")
        .map(str::to_string)
}

/// Joins loaded detail rows with their ratings rows on the cross-reference id.
pub fn movie_search_rows(details: &[RawRecord], ratings: &[RawRecord]) -> Vec<SearchRow> {
    let by_imdb = ratings
        .iter()
        .filter_map(|r| match &r.natural_id {
            NaturalId::Text(id) => Some((id.as_str(), &r.payload)),
            NaturalId::Numeric(_) => None,
        })
        .collect::<HashMap<_, _>>();

    details
        .iter()
        .filter_map(|record| {
            let NaturalId::Numeric(tmdb_id) = &record.natural_id else {
                warn!(id = %record.natural_id, "detail row without a numeric key");
                return None;
            };
            let payload = &record.payload;
            let imdb_id = record.attributes.get("imdb_id").cloned().flatten();
            let omdb = imdb_id.as_deref().and_then(|id| by_imdb.get(id).copied());
            let release_date = payload
                .get("release_date")
                .and_then(|v| v.as_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());

            Some(
                SearchRow::new()
                    .with("snapshot_date", FieldValue::Date(record.snapshot_date))
                    .with("tmdb_id", FieldValue::Int(*tmdb_id))
                    .with("imdb_id", imdb_id.clone())
                    .with("title", record.title.clone())
                    .with("original_language", text_field(payload, "original_language"))
                    .with("release_date", release_date.map(FieldValue::Date).unwrap_or(FieldValue::Null))
                    .with("release_year", release_date.map(|d| i64::from(d.year())))
                    .with("popularity", payload.get("popularity").and_then(|v| v.as_f64()))
                    .with("tmdb_rating", payload.get("vote_average").and_then(|v| v.as_f64()))
                    .with("tmdb_vote_count", payload.get("vote_count").and_then(|v| v.as_i64()))
                    .with("runtime_minutes", payload.get("runtime").and_then(|v| v.as_i64()))
                    .with("status", text_field(payload, "status"))
                    .with("imdb_rating", omdb.and_then(|o| omdb_number(o.get("imdbRating"))))
                    .with(
                        "imdb_votes",
                        omdb.and_then(|o| omdb_number(o.get("imdbVotes"))).map(|v| v as i64),
                    )
                    .with("metascore", omdb.and_then(|o| omdb_number(o.get("Metascore"))))
                    .with("rated", omdb.and_then(|o| text_field(o, "Rated")))
                    .with("director", omdb.and_then(|o| text_field(o, "Director")))
                    .with("actors", omdb.and_then(|o| text_field(o, "Actors")))
                    .with("missing_omdb_data", FieldValue::Bool(omdb.is_none())),
            )
        })
        .collect()
}

/// Columns that identify the daily movie summary.
pub const MOVIE_KPI_ID_COLUMNS: [&str; 1] = ["snapshot_date"];

/// One `movies_kpis_daily` document summarizing a day of enriched movie rows; `None` for an empty day.
pub fn movie_kpi_summary_row(snapshot_date: NaiveDate, movies: &[SearchRow]) -> Option<SearchRow> {
    if movies.is_empty() {
        return None;
    }
    let with_omdb = movies
        .iter()
        .filter(|m| m.get("missing_omdb_data") == Some(&FieldValue::Bool(false)))
        .count();
    let mean = |field: &str| Reducer::Mean.reduce(movies.iter().map(|m| numeric_cell(m.get(field))));

    Some(
        SearchRow::new()
            .with("snapshot_date", FieldValue::Date(snapshot_date))
            .with("nb_movies", FieldValue::Int(movies.len() as i64))
            .with("nb_movies_with_omdb", FieldValue::Int(with_omdb as i64))
            .with("omdb_coverage_ratio", Some(with_omdb as f64 / movies.len() as f64))
            .with("avg_tmdb_rating", mean("tmdb_rating"))
            .with("avg_imdb_rating", mean("imdb_rating"))
            .with("avg_popularity", mean("popularity")),
    )
}

fn numeric_cell(value: Option<&FieldValue>) -> Option<f64> {
    match value? {
        FieldValue::Float(v) => Some(*v),
        FieldValue::Int(v) => Some(*v as f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::store::{MemoryRawStore, RawStore};
    use crate::test_support::date;
    use serde_json::json;
    use snaplake_adapters::{DocumentFamily, OmdbRatingsFamily, RecordDraft, TmdbDetailsFamily};

    #[tokio::test]
    async fn movies_join_details_with_ratings() {
        let store = MemoryRawStore::new();
        let details = TmdbDetailsFamily::default();
        let ratings = OmdbRatingsFamily::default();
        let day = date("2026-02-17");
        let mut attributes = BTreeMap::new();
        attributes.insert("imdb_id".to_string(), Some("tt15239678".to_string()));
        store
            .upsert_partition(
                details.table(),
                day,
                &[
                    RecordDraft {
                        natural_id: NaturalId::Numeric(693134),
                        title: Some("Dune: Part Two".into()),
                        payload: json!({"release_date": "2024-02-27", "vote_average": 8.2, "runtime": 167}),
                        attributes,
                    },
                    RecordDraft {
                        natural_id: NaturalId::Numeric(550),
                        title: Some("Fight Club".into()),
                        payload: json!({"release_date": ""}),
                        attributes: BTreeMap::new(),
                    },
                ],
            )
            .await
            .expect("details");
        store
            .upsert_partition(
                ratings.table(),
                day,
                &[RecordDraft {
                    natural_id: NaturalId::Text("tt15239678".into()),
                    title: Some("Dune: Part Two".into()),
                    payload: json!({"imdbRating": "8.5", "imdbVotes": "612,345", "Metascore": "N/A", "Director": "Denis Villeneuve"}),
                    attributes: BTreeMap::new(),
                }],
            )
            .await
            .expect("ratings");

        let rows = movie_search_rows(
            &store.fetch_partition(details.table(), day).await.expect("fetch"),
            &store.fetch_partition(ratings.table(), day).await.expect("fetch"),
        );
        assert_eq!(rows.len(), 2);
        let dune = &rows[1];
        assert_eq!(dune.get("imdb_rating"), Some(&FieldValue::Float(8.5)));
        assert_eq!(dune.get("imdb_votes"), Some(&FieldValue::Int(612_345)));
        assert_eq!(dune.get("metascore"), Some(&FieldValue::Null));
        assert_eq!(dune.get("missing_omdb_data"), Some(&FieldValue::Bool(false)));
        assert_eq!(dune.get("release_year"), Some(&FieldValue::Int(2024)));
        assert_eq!(rows[0].get("release_date"), Some(&FieldValue::Null));
        assert_eq!(rows[0].get("release_year"), Some(&FieldValue::Null));
        assert_eq!(rows[0].get("missing_omdb_data"), Some(&FieldValue::Bool(true)));

        let summary = movie_kpi_summary_row(day, &rows).expect("summary");
        assert_eq!(summary.get("snapshot_date"), Some(&FieldValue::Date(day)));
        assert_eq!(summary.get("nb_movies"), Some(&FieldValue::Int(2)));
        assert_eq!(summary.get("nb_movies_with_omdb"), Some(&FieldValue::Int(1)));
        assert_eq!(summary.get("omdb_coverage_ratio"), Some(&FieldValue::Float(0.5)));
        assert_eq!(summary.get("avg_tmdb_rating"), Some(&FieldValue::Float(8.2)));
        assert_eq!(summary.get("avg_imdb_rating"), Some(&FieldValue::Float(8.5)));
        assert_eq!(summary.get("avg_popularity"), Some(&FieldValue::Null));
    }

    #[test]
    fn movie_summary_averages_only_present_values() {
        let day = date("2026-02-17");
        let movie = |rating: Option<f64>, popularity: Option<f64>, with_omdb: bool| {
            SearchRow::new()
                .with("tmdb_rating", rating)
                .with("imdb_rating", rating)
                .with("popularity", popularity)
                .with("missing_omdb_data", FieldValue::Bool(!with_omdb))
        };
        let rows = [
            movie(Some(6.0), Some(100.0), true),
            movie(Some(8.0), None, false),
            movie(None, Some(50.0), false),
            movie(None, None, true),
        ];

        let summary = movie_kpi_summary_row(day, &rows).expect("summary");
        assert_eq!(summary.get("nb_movies"), Some(&FieldValue::Int(4)));
        assert_eq!(summary.get("nb_movies_with_omdb"), Some(&FieldValue::Int(2)));
        assert_eq!(summary.get("omdb_coverage_ratio"), Some(&FieldValue::Float(0.5)));
        assert_eq!(summary.get("avg_tmdb_rating"), Some(&FieldValue::Float(7.0)));
        assert_eq!(summary.get("avg_popularity"), Some(&FieldValue::Float(75.0)));
        assert!(movie_kpi_summary_row(day, &[]).is_none());
    }
}
