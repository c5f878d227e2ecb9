// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use log::{error, warn};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::query::MemoryQueryService;
use crate::record::TaskRecord;
use crate::sink::RecordSink;
use crate::transition::TaskTransition;

/// Turns completion transitions into task records.
///
/// Called synchronously from the host's transition callback, possibly from
/// several threads. Query and write happen under the sink lock so records
/// land in the order their windows were closed.
pub struct TaskLifecycleCorrelator {
    query: MemoryQueryService,
    sink: Mutex<Box<dyn RecordSink>>,
    max_only: bool,
    record_time: bool,
    created: Instant,
}

impl TaskLifecycleCorrelator {
    pub fn new(query: MemoryQueryService, sink: Box<dyn RecordSink>) -> Self {
        Self {
            query,
            sink: Mutex::new(sink),
            max_only: false,
            record_time: false,
            created: Instant::now(),
        }
    }

    /// Drop the minimum from records.
    pub fn with_max_only(mut self, max_only: bool) -> Self {
        self.max_only = max_only;
        self
    }

    /// Stamp records with seconds since construction.
    pub fn with_record_time(mut self, record_time: bool) -> Self {
        self.record_time = record_time;
        self
    }

    /// Handle one transition. Returns the record produced, if any. Sink
    /// failures are logged and do not propagate to the host.
    pub fn on_transition(&self, transition: &TaskTransition) -> Option<TaskRecord> {
        if !transition.is_task_completion() {
            return None;
        }
        let Some(worker_id) = transition.worker.as_deref() else {
            warn!(
                "task {} finished ({} -> {}) without a worker, not recorded",
                transition.key, transition.start, transition.finish
            );
            return None;
        };

        let mut sink = self.lock_sink();
        let envelope = self.query.fetch_task_used_memory(worker_id);
        let record = TaskRecord {
            task_key: transition.key.clone(),
            time: self
                .record_time
                .then(|| self.created.elapsed().as_secs_f64()),
            min_gpu_memory_mb: (!self.max_only).then_some(envelope.min),
            max_gpu_memory_mb: envelope.max,
            worker_id: worker_id.to_string(),
            sample_count: envelope.sample_count,
        };
        if let Err(e) = sink.write(&record) {
            error!("failed to record GPU memory for task {}: {e}", record.task_key);
        }
        Some(record)
    }

    pub fn flush(&self) {
        if let Err(e) = self.lock_sink().flush() {
            error!("failed to flush GPU memory records: {e}");
        }
    }

    fn lock_sink(&self) -> MutexGuard<'_, Box<dyn RecordSink>> {
        self.sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
