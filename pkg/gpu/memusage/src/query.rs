// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use log::debug;

use crate::errors::{Error, Result};
use crate::tracker::{self, MemoryEnvelope, SharedTracker};

/// Read-and-reset access to the tracker, for the task lifecycle hook.
///
/// Each query returns what was observed for the worker since the previous
/// query and starts a new window. Tasks shorter than one sampling interval
/// can come back empty; that is reported as "no data", never waited on.
#[derive(Clone)]
pub struct MemoryQueryService {
    tracker: SharedTracker,
}

impl MemoryQueryService {
    pub fn new(tracker: SharedTracker) -> Self {
        Self { tracker }
    }

    /// Envelope for `worker_id` since its last query, or
    /// [`Error::UnknownWorker`] if the sampler has never seen that worker.
    pub fn try_fetch(&self, worker_id: &str) -> Result<MemoryEnvelope> {
        let mut tracker = tracker::lock(&self.tracker);
        if !tracker.knows(worker_id) {
            return Err(Error::UnknownWorker(worker_id.to_string()));
        }
        Ok(tracker.snapshot_and_reset(worker_id))
    }

    /// Like [`try_fetch`](Self::try_fetch) but never fails: unknown workers
    /// and empty windows both yield [`MemoryEnvelope::EMPTY`].
    pub fn fetch_task_used_memory(&self, worker_id: &str) -> MemoryEnvelope {
        match self.try_fetch(worker_id) {
            Ok(envelope) => {
                if envelope.is_empty() {
                    debug!("no GPU memory sample for worker {worker_id} since last query");
                }
                envelope
            }
            Err(e) => {
                debug!("{e}");
                MemoryEnvelope::EMPTY
            }
        }
    }
}
