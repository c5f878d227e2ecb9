// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Host-facing hooks: attach, per-transition callback and close.

use log::{info, warn};
use std::sync::Arc;

use crate::config::Config;
use crate::correlator::TaskLifecycleCorrelator;
use crate::errors::Result;
use crate::probe::DeviceMemoryProbe;
use crate::query::MemoryQueryService;
use crate::record::{Columns, TaskRecord};
use crate::sampler::SamplingLoop;
use crate::sink::{self, OutputFormat, RecordSink};
use crate::tracker;
use crate::transition::TaskTransition;

pub struct GpuMemoryPlugin {
    sampler: SamplingLoop,
    correlator: TaskLifecycleCorrelator,
    format: OutputFormat,
}

impl GpuMemoryPlugin {
    /// Validate the config and open the configured sink. Nothing is started
    /// and no output file is touched if validation fails.
    pub fn new(config: &Config, probe: Arc<dyn DeviceMemoryProbe>) -> Result<Self> {
        let format = config.validate()?;
        let columns = Columns {
            with_time: config.record_time,
        };
        let sink = sink::open(format, &config.output.path, columns)?;
        Self::build(config, format, probe, sink)
    }

    /// Like [`GpuMemoryPlugin::new`] but records into the given sink instead
    /// of the configured output path.
    pub fn with_sink(
        config: &Config,
        probe: Arc<dyn DeviceMemoryProbe>,
        sink: Box<dyn RecordSink>,
    ) -> Result<Self> {
        let format = config.validate()?;
        Self::build(config, format, probe, sink)
    }

    fn build(
        config: &Config,
        format: OutputFormat,
        probe: Arc<dyn DeviceMemoryProbe>,
        sink: Box<dyn RecordSink>,
    ) -> Result<Self> {
        let devices = config.device_map()?;
        if devices.is_empty() {
            warn!("no worker has a GPU device assigned, every task will report no data");
        }

        let tracker = tracker::shared();
        let sampler = SamplingLoop::new(
            probe,
            devices,
            tracker.clone(),
            config.sampling_interval(),
        )
        .with_stop_timeout(config.stop_timeout());
        let correlator = TaskLifecycleCorrelator::new(MemoryQueryService::new(tracker), sink)
            .with_max_only(config.max_only)
            .with_record_time(config.record_time);

        Ok(Self {
            sampler,
            correlator,
            format,
        })
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn sampler(&self) -> &SamplingLoop {
        &self.sampler
    }

    /// Start sampling. Must run inside a Tokio runtime.
    pub fn on_attach(&self) -> Result<()> {
        self.sampler.start()?;
        info!("GPU memory plugin attached, recording as {}", self.format);
        Ok(())
    }

    /// Transition callback. Never fails; see [`TaskLifecycleCorrelator`].
    pub fn transition(&self, transition: &TaskTransition) -> Option<TaskRecord> {
        self.correlator.on_transition(transition)
    }

    /// Stop the sampler, bounded by the configured stop timeout, and flush
    /// the sink.
    pub async fn before_close(&self) {
        self.sampler.stop().await;
        self.correlator.flush();
    }
}
