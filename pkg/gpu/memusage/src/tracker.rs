// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Min/max GPU memory seen for one worker since its last reset.
///
/// `min` and `max` are only meaningful when `sample_count > 0`; an empty
/// envelope reports `0`/`0` and must be read as "no data".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryEnvelope {
    pub min: u64,
    pub max: u64,
    pub sample_count: u64,
}

impl MemoryEnvelope {
    pub const EMPTY: MemoryEnvelope = MemoryEnvelope {
        min: 0,
        max: 0,
        sample_count: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    pub fn as_pair(&self) -> (u64, u64) {
        (self.min, self.max)
    }

    fn observe(&mut self, used_memory_mb: u64) {
        if self.sample_count == 0 {
            self.min = used_memory_mb;
            self.max = used_memory_mb;
        } else {
            self.min = self.min.min(used_memory_mb);
            self.max = self.max.max(used_memory_mb);
        }
        self.sample_count += 1;
    }
}

/// Per-worker running envelopes. Not synchronized on its own; see
/// [`SharedTracker`].
#[derive(Debug, Default)]
pub struct WorkerMemoryTracker {
    envelopes: HashMap<String, MemoryEnvelope>,
}

impl WorkerMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, worker_id: &str, used_memory_mb: u64) {
        match self.envelopes.get_mut(worker_id) {
            Some(envelope) => envelope.observe(used_memory_mb),
            None => {
                let mut envelope = MemoryEnvelope::EMPTY;
                envelope.observe(used_memory_mb);
                self.envelopes.insert(worker_id.to_string(), envelope);
            }
        }
    }

    /// Return the worker's envelope and reset it, so the next observation
    /// seeds a fresh min/max. Unknown workers yield [`MemoryEnvelope::EMPTY`].
    pub fn snapshot_and_reset(&mut self, worker_id: &str) -> MemoryEnvelope {
        self.envelopes
            .get_mut(worker_id)
            .map(std::mem::take)
            .unwrap_or(MemoryEnvelope::EMPTY)
    }

    /// Current envelope without resetting it.
    pub fn peek(&self, worker_id: &str) -> Option<MemoryEnvelope> {
        self.envelopes.get(worker_id).copied()
    }

    /// Whether the worker has ever been observed, even if currently reset.
    pub fn knows(&self, worker_id: &str) -> bool {
        self.envelopes.contains_key(worker_id)
    }

    pub fn worker_count(&self) -> usize {
        self.envelopes.len()
    }
}

/// The tracker as shared between the sampler (writer) and the query path
/// (read-and-reset). Every access goes through the one mutex.
pub type SharedTracker = Arc<Mutex<WorkerMemoryTracker>>;

pub fn shared() -> SharedTracker {
    Arc::new(Mutex::new(WorkerMemoryTracker::new()))
}

/// Lock the tracker, recovering from poisoning. Each tracker operation is a
/// single in-place update, so a panicking holder cannot leave it half-written.
pub fn lock(tracker: &SharedTracker) -> MutexGuard<'_, WorkerMemoryTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
