//! Document-family adapters: where each family lands and how its natural key is derived.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use snaplake_core::{IssueKind, NaturalId};

pub const CRATE_NAME: &str = "snaplake-adapters";

/// SQL type of a table's natural-key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    Numeric,
    Text,
}

impl KeyKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            KeyKind::Numeric => "BIGINT",
            KeyKind::Text => "TEXT",
        }
    }
}

/// Target table of one document family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub schema: String,
    pub table: String,
    pub key_column: String,
    pub key_kind: KeyKind,
    /// Nullable TEXT columns filled from [`RecordDraft::attributes`].
    pub attribute_columns: Vec<String>,
}

impl TableSpec {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// A document as seen by an adapter: its file name and stem.
#[derive(Debug, Clone, Copy)]
pub struct DocumentRef<'a> {
    pub name: &'a str,
    pub stem: &'a str,
}

impl<'a> DocumentRef<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self {
            name: path.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
            stem: path.file_stem().and_then(|n| n.to_str()).unwrap_or_default(),
        }
    }
}

/// A keyed row ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub natural_id: NaturalId,
    pub title: Option<String>,
    pub payload: JsonValue,
    pub attributes: BTreeMap<String, Option<String>>,
}

/// What an adapter made of one entry of a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Record(RecordDraft),
    Skip {
        entry: String,
        kind: IssueKind,
        detail: String,
    },
}

/// A family of raw documents sharing a location, a table and a key rule.
pub trait DocumentFamily: Send + Sync {
    fn family_id(&self) -> &'static str;

    /// Directory below the raw base, e.g. `tmdb/details`.
    fn domain(&self) -> &'static str;

    fn partition_prefix(&self) -> &'static str {
        "date"
    }

    fn table(&self) -> &TableSpec;

    /// Turns one decoded payload into zero or more candidates.
    fn extract(&self, document: &DocumentRef<'_>, payload: JsonValue) -> Vec<Candidate>;
}

pub fn numeric_key(value: Option<&JsonValue>) -> Option<NaturalId> {
    match value? {
        JsonValue::Number(n) => n.as_i64().map(NaturalId::Numeric),
        JsonValue::String(s) => s.trim().parse::<i64>().ok().map(NaturalId::Numeric),
        _ => None,
    }
}

pub fn text_key(value: Option<&JsonValue>) -> Option<NaturalId> {
    match value? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(NaturalId::Text(s.trim().to_string())),
        JsonValue::Number(n) => Some(NaturalId::Text(n.to_string())),
        _ => None,
    }
}

fn string_field(payload: &JsonValue, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn missing_key(entry: &str, field: &str) -> Candidate {
    Candidate::Skip {
        entry: entry.to_string(),
        kind: IssueKind::MissingNaturalKey,
        detail: format!("no usable `{field}`"),
    }
}

fn raw_table(table: &str, key_column: &str, key_kind: KeyKind, attributes: &[&str]) -> TableSpec {
    TableSpec {
        schema: "raw".to_string(),
        table: table.to_string(),
        key_column: key_column.to_string(),
        key_kind,
        attribute_columns: attributes.iter().map(|a| a.to_string()).collect(),
    }
}

/// Provider listing: one file holding many entities under `results`.
#[derive(Debug, Clone)]
pub struct TmdbPopularFamily {
    table: TableSpec,
}

impl Default for TmdbPopularFamily {
    fn default() -> Self {
        Self {
            table: raw_table("raw_tmdb_popular", "tmdb_id", KeyKind::Numeric, &[]),
        }
    }
}

impl DocumentFamily for TmdbPopularFamily {
    fn family_id(&self) -> &'static str {
        "tmdb_popular"
    }

    fn domain(&self) -> &'static str {
        "tmdb/popular"
    }

    fn table(&self) -> &TableSpec {
        &self.table
    }

    fn extract(&self, document: &DocumentRef<'_>, payload: JsonValue) -> Vec<Candidate> {
        let entries = match payload {
            JsonValue::Array(items) => items,
            JsonValue::Object(mut obj) => match obj.remove("results") {
                Some(JsonValue::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let label = format!("{}#{i}", document.name);
                match numeric_key(entry.get("id")) {
                    Some(natural_id) => Candidate::Record(RecordDraft {
                        natural_id,
                        title: string_field(&entry, "title"),
                        payload: entry,
                        attributes: BTreeMap::new(),
                    }),
                    None => missing_key(&label, "id"),
                }
            })
            .collect()
    }
}

/// Provider detail: one file per entity, carrying a cross-reference id.
#[derive(Debug, Clone)]
pub struct TmdbDetailsFamily {
    table: TableSpec,
}

impl Default for TmdbDetailsFamily {
    fn default() -> Self {
        Self {
            table: raw_table("raw_tmdb_details", "tmdb_id", KeyKind::Numeric, &["imdb_id"]),
        }
    }
}

impl DocumentFamily for TmdbDetailsFamily {
    fn family_id(&self) -> &'static str {
        "tmdb_details"
    }

    fn domain(&self) -> &'static str {
        "tmdb/details"
    }

    fn table(&self) -> &TableSpec {
        &self.table
    }

    fn extract(&self, document: &DocumentRef<'_>, payload: JsonValue) -> Vec<Candidate> {
        let Some(natural_id) = numeric_key(payload.get("id")) else {
            return vec![missing_key(document.name, "id")];
        };
        let mut attributes = BTreeMap::new();
        attributes.insert("imdb_id".to_string(), string_field(&payload, "imdb_id"));

        vec![Candidate::Record(RecordDraft {
            natural_id,
            title: string_field(&payload, "title"),
            payload,
            attributes,
        })]
    }
}

/// Cross-reference ratings: one file per entity, named after its external id.
#[derive(Debug, Clone)]
pub struct OmdbRatingsFamily {
    table: TableSpec,
}

impl Default for OmdbRatingsFamily {
    fn default() -> Self {
        Self {
            table: raw_table("raw_omdb_ratings", "imdb_id", KeyKind::Text, &[]),
        }
    }
}

impl DocumentFamily for OmdbRatingsFamily {
    fn family_id(&self) -> &'static str {
        "omdb_ratings"
    }

    fn domain(&self) -> &'static str {
        "omdb/ratings"
    }

    fn table(&self) -> &TableSpec {
        &self.table
    }

    fn extract(&self, document: &DocumentRef<'_>, payload: JsonValue) -> Vec<Candidate> {
        if payload.get("Response").and_then(|v| v.as_str()) != Some("True") {
            return vec![Candidate::Skip {
                entry: document.name.to_string(),
                kind: IssueKind::Rejected,
                detail: string_field(&payload, "Error")
                    .unwrap_or_else(|| "provider response is not `True`".to_string()),
            }];
        }

        let natural_id = text_key(payload.get("imdbID")).or_else(|| {
            let stem = document.stem.trim();
            (!stem.is_empty()).then(|| NaturalId::Text(stem.to_string()))
        });
        let Some(natural_id) = natural_id else {
            return vec![missing_key(document.name, "imdbID")];
        };

        vec![Candidate::Record(RecordDraft {
            natural_id,
            title: string_field(&payload, "Title"),
            payload,
            attributes: BTreeMap::new(),
        })]
    }
}

pub const FAMILY_IDS: [&str; 3] = ["tmdb_popular", "tmdb_details", "omdb_ratings"];

pub fn family_for_id(family_id: &str) -> Option<Box<dyn DocumentFamily>> {
    match family_id {
        "tmdb_popular" => Some(Box::new(TmdbPopularFamily::default())),
        "tmdb_details" => Some(Box::new(TmdbDetailsFamily::default())),
        "omdb_ratings" => Some(Box::new(OmdbRatingsFamily::default())),
        _ => None,
    }
}

/// Every registered family, in load order.
pub fn all_families() -> Vec<Box<dyn DocumentFamily>> {
    FAMILY_IDS
        .iter()
        .filter_map(|id| family_for_id(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc<'a>(name: &'a str, stem: &'a str) -> DocumentRef<'a> {
        DocumentRef { name, stem }
    }

    fn records(candidates: &[Candidate]) -> Vec<&RecordDraft> {
        candidates
            .iter()
            .filter_map(|c| match c {
                Candidate::Record(r) => Some(r),
                Candidate::Skip { .. } => None,
            })
            .collect()
    }

    #[test]
    fn listing_expands_results_and_skips_keyless_entries() {
        let family = TmdbPopularFamily::default();
        let payload = json!({
            "page": 1,
            "results": [
                {"id": 693134, "title": "Dune: Part Two"},
                {"title": "No id"},
                {"id": "550", "title": "Fight Club"}
            ]
        });
        let out = family.extract(&doc("popular_movies.json", "popular_movies"), payload);
        let recs = records(&out);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].natural_id, NaturalId::Numeric(693134));
        assert_eq!(recs[1].natural_id, NaturalId::Numeric(550));
        assert!(matches!(
            &out[1],
            Candidate::Skip { entry, kind: IssueKind::MissingNaturalKey, .. } if entry == "popular_movies.json#1"
        ));
    }

    #[test]
    fn listing_accepts_a_bare_array() {
        let family = TmdbPopularFamily::default();
        let out = family.extract(&doc("p.json", "p"), json!([{"id": 1}, {"id": 2}]));
        assert_eq!(records(&out).len(), 2);
    }

    #[test]
    fn details_capture_the_cross_reference_column() {
        let family = TmdbDetailsFamily::default();
        let out = family.extract(
            &doc("693134.json", "693134"),
            json!({"id": 693134, "title": "Dune: Part Two", "imdb_id": "tt15239678"}),
        );
        let recs = records(&out);
        assert_eq!(recs[0].attributes["imdb_id"].as_deref(), Some("tt15239678"));
        assert_eq!(family.table().qualified_name(), "raw.raw_tmdb_details");

        let keyless = family.extract(&doc("x.json", "x"), json!({"title": "x"}));
        assert!(records(&keyless).is_empty());
    }

    #[test]
    fn ratings_fall_back_to_the_file_stem_and_reject_failed_responses() {
        let family = OmdbRatingsFamily::default();
        let out = family.extract(
            &doc("tt15239678.json", "tt15239678"),
            json!({"Title": "Dune: Part Two", "Response": "True", "imdbRating": "8.5"}),
        );
        assert_eq!(
            records(&out)[0].natural_id,
            NaturalId::Text("tt15239678".into())
        );

        let failed = family.extract(
            &doc("tt0000000.json", "tt0000000"),
            json!({"Response": "False", "Error": "Incorrect IMDb ID."}),
        );
        assert!(matches!(
            &failed[0],
            Candidate::Skip { kind: IssueKind::Rejected, detail, .. } if detail == "Incorrect IMDb ID."
        ));
    }

    #[test]
    fn registry_knows_every_family() {
        let families = all_families();
        assert_eq!(families.len(), FAMILY_IDS.len());
        assert!(family_for_id("unknown").is_none());
        assert_eq!(
            families.iter().map(|f| f.domain()).collect::<Vec<_>>(),
            vec!["tmdb/popular", "tmdb/details", "omdb/ratings"]
        );
    }
}
