// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Background sampling of GPU memory.
//!
//! The loop ticks on a monotonic interval, runs the probe, maps each reading
//! to its worker and folds it into the shared tracker. A failed probe only
//! costs that tick. Shutdown is signalled over a watch channel; the current
//! tick is allowed to finish for up to `stop_timeout` before the task is
//! aborted.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};

use crate::devices::DeviceMap;
use crate::errors::{Error, Result};
use crate::probe::DeviceMemoryProbe;
use crate::state::SamplerState;
use crate::tracker::{self, SharedTracker};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for an aborted task to unwind.
const ABORT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub ticks: u64,
    pub probe_failures: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    probe_failures: AtomicU64,
}

struct Inner {
    state: SamplerState,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

pub struct SamplingLoop {
    probe: Arc<dyn DeviceMemoryProbe>,
    devices: Arc<DeviceMap>,
    tracker: SharedTracker,
    interval: Duration,
    stop_timeout: Duration,
    counters: Arc<Counters>,
    inner: Mutex<Inner>,
}

impl SamplingLoop {
    pub fn new(
        probe: Arc<dyn DeviceMemoryProbe>,
        devices: DeviceMap,
        tracker: SharedTracker,
        interval: Duration,
    ) -> Self {
        Self {
            probe,
            devices: Arc::new(devices),
            tracker,
            interval,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            counters: Arc::new(Counters::default()),
            inner: Mutex::new(Inner {
                state: SamplerState::Idle,
                shutdown: None,
                handle: None,
            }),
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn state(&self) -> SamplerState {
        self.lock_inner().state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn tracker(&self) -> SharedTracker {
        self.tracker.clone()
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            probe_failures: self.counters.probe_failures.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic task. Must be called from within a Tokio runtime.
    /// Starting twice, or after stopping, is a [`Error::Lifecycle`] error.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Configuration("the sampler must be started inside a Tokio runtime".to_string())
        })?;

        let mut inner = self.lock_inner();
        check_transition(inner.state, SamplerState::Running)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = TickWorker {
            probe: self.probe.clone(),
            devices: self.devices.clone(),
            tracker: self.tracker.clone(),
            counters: self.counters.clone(),
        };
        inner.handle = Some(runtime.spawn(worker.run(self.interval, shutdown_rx)));
        inner.shutdown = Some(shutdown_tx);
        inner.state = SamplerState::Running;

        info!(
            "GPU memory sampler started (interval={}ms, workers={})",
            self.interval.as_millis(),
            self.devices.workers().len()
        );
        Ok(())
    }

    /// Signal the loop to exit and wait for it, at most `stop_timeout`, then
    /// abort it. Safe to call from any task, and more than once.
    pub async fn stop(&self) {
        let (shutdown, handle) = {
            let mut inner = self.lock_inner();
            match inner.state {
                SamplerState::Idle => {
                    inner.state = SamplerState::Stopped;
                    return;
                }
                SamplerState::Stopping | SamplerState::Stopped => return,
                SamplerState::Running => {
                    inner.state = SamplerState::Stopping;
                    (inner.shutdown.take(), inner.handle.take())
                }
            }
        };

        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }

        // Reaches Stopped even if this future is dropped while waiting.
        let mut guard = StopGuard {
            sampler: self,
            handle,
        };
        if let Some(handle) = guard.handle.as_mut()
            && timeout(self.stop_timeout, &mut *handle).await.is_err()
        {
            warn!(
                "GPU memory sampler did not stop within {}s, aborting it",
                self.stop_timeout.as_secs()
            );
            handle.abort();
            let _ = timeout(ABORT_GRACE, &mut *handle).await;
        }
        drop(guard);

        let stats = self.stats();
        info!(
            "GPU memory sampler stopped after {} tick(s), {} probe failure(s)",
            stats.ticks, stats.probe_failures
        );
    }

    /// Stop without waiting: signal and abort the task immediately.
    pub fn cancel(&self) {
        let mut inner = self.lock_inner();
        match inner.state {
            SamplerState::Stopped => return,
            SamplerState::Idle => {
                inner.state = SamplerState::Stopped;
                return;
            }
            SamplerState::Running | SamplerState::Stopping => {}
        }
        if let Some(tx) = inner.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = inner.handle.take() {
            handle.abort();
        }
        // Passes through Stopping without waiting on the task.
        inner.state = SamplerState::Stopped;
        debug!("GPU memory sampler cancelled");
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SamplingLoop {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Finishes a `stop()`: aborts the task if it is still around and marks the
/// loop Stopped.
struct StopGuard<'a> {
    sampler: &'a SamplingLoop,
    handle: Option<JoinHandle<()>>,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.sampler.lock_inner().state = SamplerState::Stopped;
    }
}

fn check_transition(from: SamplerState, to: SamplerState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::Lifecycle { from, to })
    }
}

/// The state moved into the spawned task.
struct TickWorker {
    probe: Arc<dyn DeviceMemoryProbe>,
    devices: Arc<DeviceMap>,
    tracker: SharedTracker,
    counters: Arc<Counters>,
}

impl TickWorker {
    async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
        debug!("GPU memory sampling loop exited");
    }

    async fn tick(&self) {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let readings = match self.probe.sample().await {
            Ok(readings) => readings,
            Err(e) => {
                self.counters.probe_failures.fetch_add(1, Ordering::Relaxed);
                warn!("GPU memory probe failed, skipping tick: {e}");
                return;
            }
        };

        // Resolve before taking the lock; hold it only for the updates.
        let per_worker = self.devices.resolve(&readings);
        {
            let mut tracker = tracker::lock(&self.tracker);
            for (worker, used_memory_mb) in &per_worker {
                tracker.observe(worker, *used_memory_mb);
            }
        }
        debug!(
            "sampled {} device(s) for {} worker(s)",
            readings.len(),
            per_worker.len()
        );
    }
}
