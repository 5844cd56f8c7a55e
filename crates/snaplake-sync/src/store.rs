use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use snaplake_adapters::{Candidate, DocumentFamily, DocumentRef, KeyKind, RecordDraft, TableSpec};
use snaplake_core::{LoadReport, NaturalId, PartitionPath, PipelineError, RawRecord, Result};
use snaplake_storage::{list_documents, read_document, SnapshotResolver};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

/// Durable, keyed storage for landed documents.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Creates the table if needed and upserts every record, all or nothing.
    async fn upsert_partition(
        &self,
        table: &TableSpec,
        snapshot_date: NaiveDate,
        records: &[RecordDraft],
    ) -> Result<UpsertOutcome>;

    async fn fetch_partition(&self, table: &TableSpec, snapshot_date: NaiveDate) -> Result<Vec<RawRecord>>;
}

pub struct PgRawStore {
    pool: PgPool,
}

impl PgRawStore {
    /// Opens a single-connection pool; the loader never needs more.
    pub async fn connect(database_url: &str, timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await
            .map_err(|err| PipelineError::ConnectionFailure {
                target: redact_url(database_url),
                message: err.to_string(),
            })?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl RawStore for PgRawStore {
    async fn upsert_partition(
        &self,
        table: &TableSpec,
        snapshot_date: NaiveDate,
        records: &[RecordDraft],
    ) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await.map_err(|err| store_error(table, err))?;

        match apply_upserts(&mut tx, table, snapshot_date, records).await {
            Ok(outcome) => {
                tx.commit().await.map_err(|err| store_error(table, err))?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(table = %table.qualified_name(), error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn fetch_partition(&self, table: &TableSpec, snapshot_date: NaiveDate) -> Result<Vec<RawRecord>> {
        let mut conn = self.pool.acquire().await.map_err(|err| store_error(table, err))?;
        ensure_table(&mut conn, table).await?;

        let attribute_select = table
            .attribute_columns
            .iter()
            .map(|c| format!(", {c}"))
            .collect::<String>();
        let sql = format!(
            "SELECT snapshot_date, {key}, title, payload, created_at{attribute_select} \
             FROM {name} WHERE snapshot_date = $1 ORDER BY {key}",
            key = table.key_column,
            name = table.qualified_name(),
        );
        let rows = sqlx::query(&sql)
            .bind(snapshot_date)
            .fetch_all(&mut *conn)
            .await
            .map_err(|err| store_error(table, err))?;

        rows.iter()
            .map(|row| {
                let natural_id = match table.key_kind {
                    KeyKind::Numeric => row.try_get::<i64, _>(table.key_column.as_str()).map(NaturalId::Numeric),
                    KeyKind::Text => row.try_get::<String, _>(table.key_column.as_str()).map(NaturalId::Text),
                }
                .map_err(|err| store_error(table, err))?;
                let mut attributes = BTreeMap::new();
                for column in &table.attribute_columns {
                    let value: Option<String> =
                        row.try_get(column.as_str()).map_err(|err| store_error(table, err))?;
                    attributes.insert(column.clone(), value);
                }
                let payload: sqlx::types::Json<JsonValue> =
                    row.try_get("payload").map_err(|err| store_error(table, err))?;

                Ok(RawRecord {
                    snapshot_date: row.try_get("snapshot_date").map_err(|err| store_error(table, err))?,
                    natural_id,
                    title: row.try_get("title").map_err(|err| store_error(table, err))?,
                    payload: payload.0,
                    attributes,
                    created_at: row.try_get("created_at").map_err(|err| store_error(table, err))?,
                })
            })
            .collect()
    }
}

fn create_table_sql(table: &TableSpec) -> String {
    let attribute_columns = table
        .attribute_columns
        .iter()
        .map(|c| format!("    {c} TEXT,\n"))
        .collect::<String>();
    format!(
        "CREATE TABLE IF NOT EXISTS {name} (\n    snapshot_date DATE NOT NULL,\n    {key} {key_type} NOT NULL,\n{attribute_columns}    title TEXT,\n    payload JSONB NOT NULL,\n    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n    PRIMARY KEY (snapshot_date, {key})\n)",
        name = table.qualified_name(),
        key = table.key_column,
        key_type = table.key_kind.sql_type(),
    )
}

fn upsert_sql(table: &TableSpec) -> String {
    let mut columns = vec![
        "snapshot_date".to_string(),
        table.key_column.clone(),
        "title".to_string(),
        "payload".to_string(),
    ];
    columns.extend(table.attribute_columns.iter().cloned());
    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = std::iter::once("title".to_string())
        .chain(std::iter::once("payload".to_string()))
        .chain(table.attribute_columns.iter().cloned())
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    // xmax is zero only for a freshly inserted tuple.
    format!(
        "INSERT INTO {name} ({columns}) VALUES ({placeholders}) \
         ON CONFLICT (snapshot_date, {key}) DO UPDATE SET {updates} \
         RETURNING (xmax = 0) AS inserted",
        name = table.qualified_name(),
        columns = columns.join(", "),
        key = table.key_column,
    )
}

async fn ensure_table(conn: &mut PgConnection, table: &TableSpec) -> Result<()> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", table.schema))
        .execute(&mut *conn)
        .await
        .map_err(|err| store_error(table, err))?;
    sqlx::query(&create_table_sql(table))
        .execute(&mut *conn)
        .await
        .map_err(|err| store_error(table, err))?;
    Ok(())
}

async fn apply_upserts(
    conn: &mut PgConnection,
    table: &TableSpec,
    snapshot_date: NaiveDate,
    records: &[RecordDraft],
) -> Result<UpsertOutcome> {
    ensure_table(conn, table).await?;

    let sql = upsert_sql(table);
    let mut outcome = UpsertOutcome::default();
    for record in records {
        let mut query = sqlx::query(&sql).bind(snapshot_date);
        query = match &record.natural_id {
            NaturalId::Numeric(id) => query.bind(*id),
            NaturalId::Text(id) => query.bind(id.clone()),
        };
        query = query
            .bind(record.title.clone())
            .bind(sqlx::types::Json(record.payload.clone()));
        for column in &table.attribute_columns {
            query = query.bind(record.attributes.get(column).cloned().flatten());
        }

        let row = query
            .fetch_one(&mut *conn)
            .await
            .map_err(|err| store_error(table, err))?;
        let inserted: bool = row.try_get("inserted").map_err(|err| store_error(table, err))?;
        if inserted {
            outcome.inserted += 1;
        } else {
            outcome.updated += 1;
        }
    }
    Ok(outcome)
}

fn store_error(table: &TableSpec, err: sqlx::Error) -> PipelineError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            PipelineError::ConnectionFailure {
                target: "postgres".to_string(),
                message: err.to_string(),
            }
        }
        _ => PipelineError::Store {
            table: table.qualified_name(),
            source: Box::new(err),
        },
    }
}

/// Drops the userinfo part of a connection URL before it reaches logs or errors.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

/// In-process store with the same all-or-nothing upsert contract as Postgres.
#[derive(Debug, Default)]
pub struct MemoryRawStore {
    rows: Mutex<BTreeMap<(String, NaiveDate, NaturalId), RawRecord>>,
    fail_on: Option<NaturalId>,
}

impl MemoryRawStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose upsert fails when it reaches the given key.
    pub fn failing_on(natural_id: NaturalId) -> Self {
        Self {
            rows: Mutex::default(),
            fail_on: Some(natural_id),
        }
    }

    pub fn row_count(&self, table: &TableSpec) -> usize {
        let name = table.qualified_name();
        self.lock().keys().filter(|(t, _, _)| *t == name).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, NaiveDate, NaturalId), RawRecord>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RawStore for MemoryRawStore {
    async fn upsert_partition(
        &self,
        table: &TableSpec,
        snapshot_date: NaiveDate,
        records: &[RecordDraft],
    ) -> Result<UpsertOutcome> {
        let name = table.qualified_name();
        let mut rows = self.lock();
        let mut staged = rows.clone();
        let mut outcome = UpsertOutcome::default();

        for record in records {
            if self.fail_on.as_ref() == Some(&record.natural_id) {
                return Err(PipelineError::Store {
                    table: name,
                    source: format!("write rejected for key {}", record.natural_id).into(),
                });
            }
            let key = (name.clone(), snapshot_date, record.natural_id.clone());
            match staged.get_mut(&key) {
                Some(existing) => {
                    existing.title = record.title.clone();
                    existing.payload = record.payload.clone();
                    existing.attributes = record.attributes.clone();
                    outcome.updated += 1;
                }
                None => {
                    staged.insert(
                        key,
                        RawRecord {
                            snapshot_date,
                            natural_id: record.natural_id.clone(),
                            title: record.title.clone(),
                            payload: record.payload.clone(),
                            attributes: record.attributes.clone(),
                            created_at: Some(Utc::now()),
                        },
                    );
                    outcome.inserted += 1;
                }
            }
        }

        *rows = staged;
        Ok(outcome)
    }

    async fn fetch_partition(&self, table: &TableSpec, snapshot_date: NaiveDate) -> Result<Vec<RawRecord>> {
        let name = table.qualified_name();
        Ok(self
            .lock()
            .iter()
            .filter(|((t, d, _), _)| *t == name && *d == snapshot_date)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

/// Loads every document of one partition of one family into its table.
pub async fn load_partition<S>(
    store: &S,
    partition: &PartitionPath,
    family: &dyn DocumentFamily,
) -> Result<LoadReport>
where
    S: RawStore + ?Sized,
{
    let table = family.table();
    let span = info_span!("raw_load", family = family.family_id(), table = %table.qualified_name(), partition = %partition);

    async {
        let mut report = LoadReport::new(table.qualified_name(), partition.to_string());
        let mut drafts = Vec::new();

        for path in list_documents(partition, None)? {
            let document = DocumentRef::from_path(&path);
            let envelope = match read_document(&path) {
                Ok(envelope) => envelope,
                Err(err) => match err.document_issue() {
                    Some((kind, detail)) => {
                        warn!(document = document.name, ?kind, error = %err, "skipping document");
                        report.record_error(document.name, kind, detail);
                        continue;
                    }
                    None => return Err(err),
                },
            };

            let (payload, metadata) = envelope.into_parts();
            if let Some(stamped) = metadata.as_ref().and_then(|m| m.snapshot_date.as_deref()) {
                let expected = partition.logical_date().format("%Y-%m-%d").to_string();
                if stamped != expected {
                    warn!(document = document.name, stamped, expected = %expected, "envelope date differs from partition");
                }
            }

            for candidate in family.extract(&document, payload) {
                match candidate {
                    Candidate::Record(draft) => drafts.push(draft),
                    Candidate::Skip { entry, kind, detail } => {
                        warn!(entry = %entry, ?kind, detail = %detail, "skipping entry");
                        report.record_skip(entry, kind, detail);
                    }
                }
            }
        }

        let outcome = store
            .upsert_partition(table, partition.logical_date(), &drafts)
            .await?;
        report.inserted = outcome.inserted;
        report.updated = outcome.updated;

        info!(
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors,
            "raw partition loaded"
        );
        Ok::<_, PipelineError>(report)
    }
    .instrument(span)
    .await
}

/// Resolves and loads one partition per family for a logical date (latest when `None`).
pub async fn load_snapshot<S>(
    store: &S,
    raw_dir: &Path,
    families: &[Box<dyn DocumentFamily>],
    logical_date: Option<NaiveDate>,
) -> Result<Vec<LoadReport>>
where
    S: RawStore + ?Sized,
{
    let mut reports = Vec::with_capacity(families.len());
    for family in families {
        let resolver = SnapshotResolver::new(raw_dir.join(family.domain()), family.partition_prefix());
        let partition = resolver.resolve(logical_date)?;
        reports.push(load_partition(store, &partition, family.as_ref()).await?);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::test_support::{date, resolve, write_json};
    use serde_json::json;
    use snaplake_adapters::{OmdbRatingsFamily, TmdbDetailsFamily, TmdbPopularFamily};
    use snaplake_core::IssueKind;
    use tempfile::tempdir;

    fn details_partition(root: &Path) -> PathBuf {
        let dir = root.join("tmdb").join("details").join("date=2026-02-17");
        std::fs::create_dir_all(&dir).expect("mkdir");
        write_json(&dir, "693134.json", &json!({"id": 693134, "title": "Dune: Part Two", "imdb_id": "tt15239678"}));
        write_json(
            &dir,
            "550.json",
            &json!({"metadata": {"snapshot_date": "2026-02-17", "source": "tmdb"}, "data": {"id": 550, "title": "Fight Club"}}),
        );
        write_json(&dir, "broken.json", &json!({"title": "no id here"}));
        dir
    }

    #[tokio::test]
    async fn reload_of_the_same_partition_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        details_partition(dir.path());
        let partition = resolve(dir.path(), "tmdb/details", "date");
        let family = TmdbDetailsFamily::default();
        let store = MemoryRawStore::new();

        let first = load_partition(&store, &partition, &family).await.expect("first load");
        assert_eq!((first.inserted, first.updated, first.skipped, first.errors), (2, 0, 1, 0));
        let stored_first = store.fetch_partition(family.table(), date("2026-02-17")).await.expect("fetch");

        let second = load_partition(&store, &partition, &family).await.expect("second load");
        assert_eq!((second.inserted, second.updated, second.skipped, second.errors), (0, 2, 1, 0));
        let stored_second = store.fetch_partition(family.table(), date("2026-02-17")).await.expect("fetch");

        assert_eq!(store.row_count(family.table()), 2);
        assert_eq!(stored_first, stored_second);
        assert_eq!(stored_second[0].attributes["imdb_id"], None);
        assert_eq!(stored_second[1].attributes["imdb_id"].as_deref(), Some("tt15239678"));
    }

    #[tokio::test]
    async fn modified_documents_overwrite_title_and_payload() {
        let dir = tempdir().expect("tempdir");
        let part_dir = details_partition(dir.path());
        let partition = resolve(dir.path(), "tmdb/details", "date");
        let family = TmdbDetailsFamily::default();
        let store = MemoryRawStore::new();
        load_partition(&store, &partition, &family).await.expect("load");

        write_json(&part_dir, "550.json", &json!({"id": 550, "title": "Fight Club (Remastered)", "runtime": 139}));
        let report = load_partition(&store, &partition, &family).await.expect("reload");
        assert_eq!(report.updated, 2);

        let rows = store.fetch_partition(family.table(), date("2026-02-17")).await.expect("fetch");
        assert_eq!(rows.len(), 2);
        let fight_club = rows
            .iter()
            .find(|r| r.natural_id == NaturalId::Numeric(550))
            .expect("row 550");
        assert_eq!(fight_club.title.as_deref(), Some("Fight Club (Remastered)"));
        assert_eq!(fight_club.payload["runtime"], 139);
    }

    #[tokio::test]
    async fn malformed_documents_are_counted_not_fatal() {
        let dir = tempdir().expect("tempdir");
        let part_dir = dir.path().join("omdb").join("ratings").join("date=2026-02-17");
        std::fs::create_dir_all(&part_dir).expect("mkdir");
        write_json(&part_dir, "tt15239678.json", &json!({"Title": "Dune: Part Two", "Response": "True"}));
        write_json(&part_dir, "tt0000001.json", &json!({"Response": "False", "Error": "Movie not found!"}));
        std::fs::write(part_dir.join("tt0137523.json"), b"{\"Title\": \"Fight").expect("write");

        let partition = resolve(dir.path(), "omdb/ratings", "date");
        let store = MemoryRawStore::new();
        let report = load_partition(&store, &partition, &OmdbRatingsFamily::default())
            .await
            .expect("load");

        assert_eq!((report.inserted, report.skipped, report.errors), (1, 1, 1));
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::Malformed && i.document == "tt0137523.json"));
    }

    #[tokio::test]
    async fn loosely_typed_envelopes_still_load() {
        let dir = tempdir().expect("tempdir");
        let part_dir = dir.path().join("tmdb").join("details").join("date=2026-02-17");
        std::fs::create_dir_all(&part_dir).expect("mkdir");
        write_json(
            &part_dir,
            "7.json",
            &json!({"metadata": {"run_id": 1333, "source": "tmdb"}, "data": {"id": 7, "title": "Dune"}}),
        );
        write_json(&part_dir, "8.json", &json!({"metadata": null, "data": {"id": 8, "title": "Arrival"}}));

        let partition = resolve(dir.path(), "tmdb/details", "date");
        let store = MemoryRawStore::new();
        let report = load_partition(&store, &partition, &TmdbDetailsFamily::default())
            .await
            .expect("load");
        assert_eq!((report.inserted, report.skipped, report.errors), (2, 0, 0));
    }

    #[tokio::test]
    async fn failed_upsert_leaves_previous_state_intact() {
        let dir = tempdir().expect("tempdir");
        let part_dir = dir.path().join("tmdb").join("popular").join("date=2026-02-17");
        std::fs::create_dir_all(&part_dir).expect("mkdir");
        write_json(
            &part_dir,
            "popular_movies.json",
            &json!({"results": [{"id": 1, "title": "A"}, {"id": 2, "title": "B"}, {"id": 3, "title": "C"}]}),
        );
        let partition = resolve(dir.path(), "tmdb/popular", "date");
        let family = TmdbPopularFamily::default();

        let store = MemoryRawStore::failing_on(NaturalId::Numeric(3));
        let err = load_partition(&store, &partition, &family).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store { .. }));
        assert_eq!(store.row_count(family.table()), 0);
    }

    #[tokio::test]
    async fn snapshot_load_fails_fast_on_a_missing_partition() {
        let dir = tempdir().expect("tempdir");
        details_partition(dir.path());
        let store = MemoryRawStore::new();
        let families = snaplake_adapters::all_families();

        let err = load_snapshot(&store, dir.path(), &families, Some(date("2026-02-17")))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PartitionNotFound { .. }));
    }

    #[test]
    fn upsert_sql_overwrites_every_mutable_column() {
        let family = TmdbDetailsFamily::default();
        let sql = upsert_sql(family.table());
        assert!(sql.contains("ON CONFLICT (snapshot_date, tmdb_id)"));
        assert!(sql.contains("title = EXCLUDED.title"));
        assert!(sql.contains("payload = EXCLUDED.payload"));
        assert!(sql.contains("imdb_id = EXCLUDED.imdb_id"));
        assert!(sql.contains("$5"));
        assert!(create_table_sql(family.table()).contains("PRIMARY KEY (snapshot_date, tmdb_id)"));
    }

    #[test]
    fn credentials_are_redacted() {
        assert_eq!(
            redact_url("postgres://postgres:secret@db:5432/datalake"),
            "postgres://db:5432/datalake"
        );
        assert_eq!(redact_url("http://localhost:9200"), "http://localhost:9200");
    }
}
