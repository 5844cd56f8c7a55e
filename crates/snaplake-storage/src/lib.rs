//! Partition resolution, envelope decoding and atomic partition publishing for snaplake.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use snaplake_core::{Envelope, IngestionMetadata, PartitionKey, PartitionPath, PipelineError, Result};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "snaplake-storage";

const RUN_PREFIX: &str = "run";

/// Finds `prefix=YYYY-MM-DD` partitions below one base directory.
#[derive(Debug, Clone)]
pub struct SnapshotResolver {
    base: PathBuf,
    prefix: String,
}

impl SnapshotResolver {
    pub fn new(base: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            prefix: prefix.into(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// All complete partitions, oldest first. ISO dates sort chronologically as text.
    pub fn list_partitions(&self) -> Result<Vec<PartitionPath>> {
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PipelineError::io(&self.base, err)),
        };

        let mut partitions = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                match PartitionKey::parse_dir_name(&self.prefix, &name) {
                    Some(date) => Some((name, date, entry.path())),
                    None => {
                        debug!(base = %self.base.display(), entry = %name, "ignoring non-partition entry");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        partitions.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(partitions
            .into_iter()
            .map(|(_, date, path)| PartitionPath {
                path,
                prefix: self.prefix.clone(),
                key: PartitionKey::new(date),
            })
            .collect())
    }

    pub fn resolve_latest(&self) -> Result<PartitionPath> {
        self.list_partitions()?
            .pop()
            .ok_or_else(|| self.not_found(None))
    }

    pub fn resolve_exact(&self, logical_date: NaiveDate) -> Result<PartitionPath> {
        let key = PartitionKey::new(logical_date);
        let path = self.base.join(key.dir_name(&self.prefix));
        if !path.is_dir() {
            return Err(self.not_found(Some(logical_date)));
        }
        Ok(PartitionPath {
            path,
            prefix: self.prefix.clone(),
            key,
        })
    }

    /// `resolve_exact` when a date is given, `resolve_latest` otherwise.
    pub fn resolve(&self, logical_date: Option<NaiveDate>) -> Result<PartitionPath> {
        match logical_date {
            Some(date) => self.resolve_exact(date),
            None => self.resolve_latest(),
        }
    }

    /// Descends into the greatest `run=*` child of a date partition.
    pub fn resolve_latest_run(&self, partition: &PartitionPath) -> Result<PartitionPath> {
        let entries = fs::read_dir(&partition.path)
            .map_err(|err| PipelineError::io(&partition.path, err))?;
        let mut runs = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let run = name.strip_prefix(RUN_PREFIX)?.strip_prefix('=')?.to_string();
                (!run.is_empty()).then_some((run, entry.path()))
            })
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| a.0.cmp(&b.0));

        let (run, path) = runs
            .pop()
            .ok_or_else(|| self.not_found(Some(partition.logical_date())))?;
        Ok(PartitionPath {
            path,
            prefix: self.prefix.clone(),
            key: PartitionKey::with_run(partition.logical_date(), run),
        })
    }

    fn not_found(&self, logical_date: Option<NaiveDate>) -> PipelineError {
        PipelineError::PartitionNotFound {
            base: self.base.clone(),
            prefix: self.prefix.clone(),
            logical_date,
        }
    }
}

/// Decodes a document that may or may not be wrapped in an ingestion envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    decode_named("<bytes>", bytes)
}

fn decode_named(document: &str, bytes: &[u8]) -> Result<Envelope> {
    let value: JsonValue =
        serde_json::from_slice(bytes).map_err(|err| PipelineError::MalformedDocument {
            document: document.to_string(),
            reason: err.to_string(),
        })?;

    match value {
        JsonValue::Object(mut obj) if obj.contains_key("metadata") && obj.contains_key("data") => {
            let metadata = IngestionMetadata::from_json(obj.remove("metadata").unwrap_or(JsonValue::Null));
            let data = obj.remove("data").unwrap_or(JsonValue::Null);
            Ok(Envelope::Wrapped { metadata, data })
        }
        other => Ok(Envelope::Bare(other)),
    }
}

/// Reads and decodes one document file.
pub fn read_document(path: &Path) -> Result<Envelope> {
    let bytes = fs::read(path).map_err(|err| PipelineError::io(path, err))?;
    decode_named(&document_name(path), &bytes)
}

/// File name used to identify a document in reports and logs.
pub fn document_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Document files directly inside a partition, sorted by file name.
pub fn list_documents(partition: &PartitionPath, name_prefix: Option<&str>) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(&partition.path).map_err(|err| PipelineError::io(&partition.path, err))?;
    let mut files = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
        .filter(|path| match name_prefix {
            Some(prefix) => document_name(path).starts_with(prefix),
            None => true,
        })
        .collect::<Vec<_>>();
    files.sort_by_key(|path| document_name(path));
    Ok(files)
}

/// Publishes whole partitions under `base/prefix=<date>` via temp directory + rename.
#[derive(Debug, Clone)]
pub struct PartitionWriter {
    base: PathBuf,
    prefix: String,
}

impl PartitionWriter {
    pub fn new(base: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            prefix: prefix.into(),
        }
    }

    pub fn final_path(&self, key: &PartitionKey) -> PathBuf {
        self.base.join(key.dir_name(&self.prefix))
    }

    /// Opens a hidden staging directory next to the final partition location.
    pub fn stage(&self, key: &PartitionKey) -> Result<StagedPartition> {
        fs::create_dir_all(&self.base).map_err(|err| PipelineError::io(&self.base, err))?;
        let temp_dir = self
            .base
            .join(format!(".{}.{}.tmp", key.dir_name(&self.prefix), Uuid::new_v4()));
        fs::create_dir(&temp_dir).map_err(|err| PipelineError::io(&temp_dir, err))?;

        Ok(StagedPartition {
            temp_dir,
            final_dir: self.final_path(key),
            prefix: self.prefix.clone(),
            key: key.clone(),
            committed: false,
        })
    }
}

/// A partition being written; invisible to resolvers until committed.
#[derive(Debug)]
pub struct StagedPartition {
    temp_dir: PathBuf,
    final_dir: PathBuf,
    prefix: String,
    key: PartitionKey,
    committed: bool,
}

impl StagedPartition {
    pub fn path(&self) -> &Path {
        &self.temp_dir
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.temp_dir.join(name)
    }

    /// Swaps the staged directory into place, replacing a previous run of the same partition.
    pub fn commit(mut self) -> Result<PartitionPath> {
        if self.final_dir.exists() {
            warn!(partition = %self.final_dir.display(), "replacing existing partition");
            fs::remove_dir_all(&self.final_dir)
                .map_err(|err| PipelineError::io(&self.final_dir, err))?;
        }
        fs::rename(&self.temp_dir, &self.final_dir).map_err(|err| PipelineError::io(&self.final_dir, err))?;
        self.committed = true;

        Ok(PartitionPath {
            path: self.final_dir.clone(),
            prefix: self.prefix.clone(),
            key: self.key.clone(),
        })
    }
}

impl Drop for StagedPartition {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.temp_dir);
        }
    }
}
