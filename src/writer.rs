//! Buffered columnar output for one extraction run
//!
//! Records accumulate in memory and land in the endpoint's Parquet file one
//! row group per flush. Bronze-layer columns are all UTF8: values arrive
//! loosely typed from JSON and typing them is a downstream concern. Two
//! provenance columns are appended to whatever the mapper projects:
//! `_extracted_at` (flush timestamp, identical across a batch) and
//! `_extractor` (endpoint id).

use chrono::Utc;
use parquet::basic::{Compression, ConvertedType, Repetition, Type as PhysicalType};
use parquet::data_type::{ByteArray, ByteArrayType};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::types::Type;
use serde_json::Value;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Provenance columns appended after the mapper's columns.
pub const PROVENANCE_COLUMNS: [&str; 2] = ["_extracted_at", "_extractor"];

/// Whole-buffer retries before a flush failure becomes fatal to the run.
const FLUSH_RETRIES: u32 = 3;

/// I/O failure while landing records. Fatal to the affected run only.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("endpoint '{endpoint}': failed to open output {path}: {detail}")]
    Open {
        endpoint: String,
        path: String,
        detail: String,
    },

    #[error("endpoint '{endpoint}': segment {segment} failed after {attempts} attempts: {detail}")]
    Flush {
        endpoint: String,
        segment: u64,
        attempts: u32,
        detail: String,
    },

    #[error("endpoint '{endpoint}': failed to finalize output: {detail}")]
    Finalize { endpoint: String, detail: String },
}

/// Counts reported by [`BatchWriter::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub rows: u64,
    pub segments: u64,
}

/// Buffers records and flushes them as row groups of one Parquet file.
///
/// Created per run; creating the writer truncates the endpoint's previous
/// output, so each run's file holds exactly that run's records. Flushes
/// already written stay on disk even if the run later fails.
pub struct BatchWriter {
    path: PathBuf,
    endpoint_id: String,
    /// Data columns, in mapper order
    columns: Vec<String>,
    threshold: usize,
    buffer: Vec<Vec<Option<String>>>,
    writer: SerializedFileWriter<File>,
    rows: u64,
    segments: u64,
}

impl BatchWriter {
    /// Open the output file and prepare its schema.
    ///
    /// # Arguments
    /// * `path` - output file, parent directories are created as needed
    /// * `endpoint_id` - stamped into the `_extractor` provenance column
    /// * `columns` - data columns in output order, without provenance
    /// * `threshold` - buffered records per flush
    pub fn create(
        path: impl AsRef<Path>,
        endpoint_id: impl Into<String>,
        columns: Vec<String>,
        threshold: usize,
    ) -> Result<Self, WriteError> {
        let path = path.as_ref().to_path_buf();
        let endpoint_id = endpoint_id.into();

        let open_error = |detail: String| WriteError::Open {
            endpoint: endpoint_id.clone(),
            path: path.display().to_string(),
            detail,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| open_error(e.to_string()))?;
        }

        let schema = build_schema(&columns).map_err(|e| open_error(e.to_string()))?;
        let file = File::create(&path).map_err(|e| open_error(e.to_string()))?;
        let props = Arc::new(
            WriterProperties::builder()
                .set_compression(Compression::SNAPPY)
                .build(),
        );
        let writer =
            SerializedFileWriter::new(file, schema, props).map_err(|e| open_error(e.to_string()))?;

        Ok(Self {
            path,
            endpoint_id,
            columns,
            threshold: threshold.max(1),
            buffer: Vec::new(),
            writer,
            rows: 0,
            segments: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer one record, flushing if the batch threshold is reached.
    ///
    /// Values are matched to columns by name; columns the record does not
    /// carry become nulls.
    pub fn append(&mut self, record: Vec<(String, Value)>) -> Result<(), WriteError> {
        let row = self
            .columns
            .iter()
            .map(|column| {
                record
                    .iter()
                    .find(|(name, _)| name == column)
                    .and_then(|(_, value)| cell(value))
            })
            .collect();

        self.buffer.push(row);

        if self.buffer.len() >= self.threshold {
            self.flush()?;
        }

        Ok(())
    }

    /// Write the buffered records as one new row group.
    ///
    /// Provenance is stamped here, not at append time, so every record in a
    /// segment carries the same extraction timestamp. On failure the whole
    /// buffer is retried; a partial segment is never left behind in the
    /// buffer's place.
    pub fn flush(&mut self) -> Result<(), WriteError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let stamp = Utc::now().to_rfc3339();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.write_segment(&stamp) {
                Ok(()) => {
                    self.segments += 1;
                    self.rows += self.buffer.len() as u64;
                    log::debug!(
                        "Endpoint '{}': flushed segment {} ({} records)",
                        self.endpoint_id,
                        self.segments,
                        self.buffer.len()
                    );
                    self.buffer.clear();
                    return Ok(());
                }
                Err(error) if attempts < FLUSH_RETRIES => {
                    log::warn!(
                        "Endpoint '{}': segment write failed (attempt {}/{}): {}",
                        self.endpoint_id,
                        attempts,
                        FLUSH_RETRIES,
                        error
                    );
                }
                Err(error) => {
                    return Err(WriteError::Flush {
                        endpoint: self.endpoint_id.clone(),
                        segment: self.segments + 1,
                        attempts,
                        detail: error.to_string(),
                    });
                }
            }
        }
    }

    fn write_segment(&mut self, stamp: &str) -> Result<(), parquet::errors::ParquetError> {
        let mut row_group = self.writer.next_row_group()?;
        let mut index = 0;

        while let Some(mut column) = row_group.next_column()? {
            let mut values: Vec<ByteArray> = Vec::with_capacity(self.buffer.len());
            let mut def_levels: Vec<i16> = Vec::with_capacity(self.buffer.len());

            for row in &self.buffer {
                let cell: Option<&str> = if index < self.columns.len() {
                    row[index].as_deref()
                } else if index == self.columns.len() {
                    Some(stamp)
                } else {
                    Some(&self.endpoint_id)
                };

                match cell {
                    Some(text) => {
                        values.push(ByteArray::from(text));
                        def_levels.push(1);
                    }
                    None => def_levels.push(0),
                }
            }

            column
                .typed::<ByteArrayType>()
                .write_batch(&values, Some(&def_levels), None)?;
            column.close()?;
            index += 1;
        }

        row_group.close()?;
        Ok(())
    }

    /// Flush the remainder and close the file, making it readable.
    pub fn finalize(mut self) -> Result<WriterStats, WriteError> {
        self.flush()?;

        self.writer.close().map_err(|e| WriteError::Finalize {
            endpoint: self.endpoint_id.clone(),
            detail: e.to_string(),
        })?;

        log::debug!(
            "Endpoint '{}': wrote {} records in {} segment(s) to {}",
            self.endpoint_id,
            self.rows,
            self.segments,
            self.path.display()
        );

        Ok(WriterStats {
            rows: self.rows,
            segments: self.segments,
        })
    }
}

/// All-optional UTF8 schema: data columns followed by provenance.
fn build_schema(columns: &[String]) -> Result<Arc<Type>, parquet::errors::ParquetError> {
    let mut fields = Vec::with_capacity(columns.len() + PROVENANCE_COLUMNS.len());

    for name in columns.iter().map(String::as_str).chain(PROVENANCE_COLUMNS) {
        let field = Type::primitive_type_builder(name, PhysicalType::BYTE_ARRAY)
            .with_repetition(Repetition::OPTIONAL)
            .with_converted_type(ConvertedType::UTF8)
            .build()?;
        fields.push(Arc::new(field));
    }

    Ok(Arc::new(
        Type::group_type_builder("bronze_record")
            .with_fields(fields)
            .build()?,
    ))
}

/// Bronze cell rendering: strings pass through, other scalars and nested
/// values keep their JSON text, nulls stay null.
fn cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
