use std::fs::File;
use std::path::Path;

use arrow_array::{Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField};
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snaplake_core::{PartitionPath, PipelineError, Result};
use snaplake_storage::{document_name, StagedPartition};

use crate::MANIFEST_FILE;

/// Per-file checksum entry of a partition manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub schema_version: u32,
    pub snapshot_date: NaiveDate,
    pub files: Vec<ManifestFile>,
}

pub(crate) fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).map_err(|err| PipelineError::io(path, err))?;
    let mut writer =
        ArrowWriter::try_new(file, batch.schema(), None).map_err(|err| PipelineError::parquet(path, err))?;
    writer.write(&batch).map_err(|err| PipelineError::parquet(path, err))?;
    writer.close().map_err(|err| PipelineError::parquet(path, err))?;
    Ok(())
}

pub(crate) fn read_parquet(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .map_err(|err| PipelineError::parquet(path, err))?;
    reader
        .map(|batch| batch.map_err(|err| PipelineError::parquet(path, err)))
        .collect()
}

pub(crate) fn manifest_entry(path: &Path, rows: usize) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).map_err(|err| PipelineError::io(path, err))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(ManifestFile {
        name: document_name(path),
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

pub(crate) fn write_manifest(staged: &StagedPartition, snapshot_date: NaiveDate, files: Vec<ManifestFile>) -> Result<PartitionManifest> {
    let manifest = PartitionManifest {
        schema_version: 1,
        snapshot_date,
        files,
    };
    let path = staged.file(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).map_err(|err| PipelineError::parquet(&path, err))?;
    std::fs::write(&path, bytes).map_err(|err| PipelineError::io(&path, err))?;
    Ok(manifest)
}

pub fn read_manifest(partition: &PartitionPath) -> Result<PartitionManifest> {
    let path = partition.path.join(MANIFEST_FILE);
    let bytes = std::fs::read(&path).map_err(|err| PipelineError::io(&path, err))?;
    serde_json::from_slice(&bytes).map_err(|err| PipelineError::MalformedDocument {
        document: path.display().to_string(),
        reason: err.to_string(),
    })
}

pub(crate) fn typed_column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Option<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<T>())
}

pub(crate) fn required_column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a T> {
    typed_column(batch, name)
        .ok_or_else(|| PipelineError::parquet(path, format!("missing or mistyped column `{name}`")))
}

pub(crate) fn cell_str(array: Option<&StringArray>, i: usize) -> Option<String> {
    array.filter(|a| !a.is_null(i)).map(|a| a.value(i).to_string())
}

pub(crate) fn cell_f64(array: Option<&Float64Array>, i: usize) -> Option<f64> {
    array.filter(|a| !a.is_null(i)).map(|a| a.value(i))
}

pub(crate) fn cell_i64(array: Option<&Int64Array>, i: usize) -> Option<i64> {
    array.filter(|a| !a.is_null(i)).map(|a| a.value(i))
}

pub(crate) fn utf8(name: &str, nullable: bool) -> ArrowField {
    ArrowField::new(name, DataType::Utf8, nullable)
}

pub(crate) fn float64(name: &str) -> ArrowField {
    ArrowField::new(name, DataType::Float64, true)
}
