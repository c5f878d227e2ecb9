// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::Serialize;

/// One output row per finished task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_key: String,
    /// Seconds since the plugin was created, when time recording is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// `None` in max-only mode.
    pub min_gpu_memory_mb: Option<u64>,
    pub max_gpu_memory_mb: u64,
    pub worker_id: String,
    /// Samples behind min/max. Zero means the values are the no-data sentinel.
    #[serde(skip)]
    pub sample_count: u64,
}

impl TaskRecord {
    pub fn has_samples(&self) -> bool {
        self.sample_count > 0
    }
}

/// Column set shared by the row-oriented sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Columns {
    pub with_time: bool,
}

impl Columns {
    pub fn headers(&self) -> Vec<&'static str> {
        let mut headers = vec!["task_key"];
        if self.with_time {
            headers.push("time");
        }
        headers.extend(["min_gpu_memory_mb", "max_gpu_memory_mb", "worker_id"]);
        headers
    }

    /// Cell values in header order. `missing` fills absent optional cells.
    pub fn cells(&self, record: &TaskRecord, missing: &str) -> Vec<String> {
        let mut cells = vec![record.task_key.clone()];
        if self.with_time {
            cells.push(
                record
                    .time
                    .map(|t| format!("{t:.6}"))
                    .unwrap_or_else(|| missing.to_string()),
            );
        }
        cells.push(
            record
                .min_gpu_memory_mb
                .map(|m| m.to_string())
                .unwrap_or_else(|| missing.to_string()),
        );
        cells.push(record.max_gpu_memory_mb.to_string());
        cells.push(record.worker_id.clone());
        cells
    }
}
