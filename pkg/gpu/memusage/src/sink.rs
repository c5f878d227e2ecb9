// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Output sinks for task records.
//!
//! Every sink appends to its file and flushes after each record, so a crash
//! of the host loses at most the record being written.

use log::info;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::errors::{Error, Result};
use crate::record::{Columns, TaskRecord};

pub const DEFAULT_OUTPUT_PATH: &str = "memory_usage_gpus.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Csv,
    /// JSON Lines, one object per record.
    Json,
    /// Space-aligned text table.
    Table,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" | "jsonl" => Ok(OutputFormat::Json),
            "table" | "tabular" | "dataframe" => Ok(OutputFormat::Table),
            _ => Err(Error::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Table => write!(f, "table"),
        }
    }
}

/// Destination for finished task records, written in arrival order.
pub trait RecordSink: Send {
    fn write(&mut self, record: &TaskRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Open the sink for `format` at `path`, writing any header up front.
pub fn open(format: OutputFormat, path: &Path, columns: Columns) -> Result<Box<dyn RecordSink>> {
    let sink: Box<dyn RecordSink> = match format {
        OutputFormat::Csv => Box::new(CsvSink::open(path, columns)?),
        OutputFormat::Json => Box::new(JsonLinesSink::open(path)?),
        OutputFormat::Table => Box::new(TableSink::open(path, columns)?),
    };
    info!("recording GPU memory usage as {format} to {}", path.display());
    Ok(sink)
}

fn sink_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::SinkWrite {
        path: path.to_path_buf(),
        source,
    }
}

/// Open for append and report whether the file already had content.
fn open_append(path: &Path) -> Result<(File, bool)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(sink_error(path))?;
    let len = file.metadata().map_err(sink_error(path))?.len();
    Ok((file, len > 0))
}

pub struct CsvSink {
    path: PathBuf,
    columns: Columns,
    writer: csv::Writer<File>,
}

impl CsvSink {
    /// The header row goes out only when the file is new or empty, so
    /// reopening an existing file keeps appending to one table.
    pub fn open(path: &Path, columns: Columns) -> Result<Self> {
        let (file, has_content) = open_append(path)?;
        let mut sink = Self {
            path: path.to_path_buf(),
            columns,
            writer: csv::WriterBuilder::new().has_headers(false).from_writer(file),
        };
        if !has_content {
            sink.writer
                .write_record(columns.headers())
                .map_err(|e| sink_error(&sink.path)(e.into()))?;
            sink.flush()?;
        }
        Ok(sink)
    }
}

impl RecordSink for CsvSink {
    fn write(&mut self, record: &TaskRecord) -> Result<()> {
        self.writer
            .write_record(self.columns.cells(record, ""))
            .map_err(|e| sink_error(&self.path)(e.into()))?;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(sink_error(&self.path))
    }
}

pub struct JsonLinesSink {
    path: PathBuf,
    file: File,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> Result<Self> {
        let (file, _) = open_append(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl RecordSink for JsonLinesSink {
    fn write(&mut self, record: &TaskRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).map_err(|e| sink_error(&self.path)(e.into()))?;
        line.push(b'\n');
        self.file.write_all(&line).map_err(sink_error(&self.path))
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(sink_error(&self.path))
    }
}

const TABLE_MIN_WIDTHS: [(&str, usize); 5] = [
    ("task_key", 40),
    ("time", 14),
    ("min_gpu_memory_mb", 17),
    ("max_gpu_memory_mb", 17),
    ("worker_id", 0),
];

pub struct TableSink {
    path: PathBuf,
    columns: Columns,
    widths: Vec<usize>,
    file: File,
}

impl TableSink {
    pub fn open(path: &Path, columns: Columns) -> Result<Self> {
        let (file, has_content) = open_append(path)?;
        let widths = columns
            .headers()
            .iter()
            .map(|h| {
                TABLE_MIN_WIDTHS
                    .iter()
                    .find(|(name, _)| name == h)
                    .map_or(h.len(), |(_, w)| (*w).max(h.len()))
            })
            .collect();
        let mut sink = Self {
            path: path.to_path_buf(),
            columns,
            widths,
            file,
        };
        if !has_content {
            let headers: Vec<String> = columns.headers().iter().map(|h| h.to_string()).collect();
            sink.write_line(&headers)?;
        }
        Ok(sink)
    }

    fn write_line(&mut self, cells: &[String]) -> Result<()> {
        let last = cells.len().saturating_sub(1);
        let mut line = String::new();
        for (i, (cell, width)) in cells.iter().zip(self.widths.iter().copied()).enumerate() {
            if i == last {
                line.push_str(cell);
            } else {
                line.push_str(&format!("{cell:<width$}  "));
            }
        }
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .map_err(sink_error(&self.path))
    }
}

impl RecordSink for TableSink {
    fn write(&mut self, record: &TaskRecord) -> Result<()> {
        let cells = self.columns.cells(record, "-");
        self.write_line(&cells)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(sink_error(&self.path))
    }
}

/// Keeps records in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TaskRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl RecordSink for MemorySink {
    fn write(&mut self, record: &TaskRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}
