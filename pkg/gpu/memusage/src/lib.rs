// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod cli;
pub mod config;
pub mod correlator;
pub mod devices;
pub mod errors;
pub mod plugin;
pub mod probe;
pub mod query;
pub mod record;
pub mod sampler;
pub mod sink;
pub mod state;
pub mod tracker;
pub mod transition;

// Re-export the public API
pub use errors::{Error, ProbeError, Result};
pub use plugin::GpuMemoryPlugin;
pub use probe::{DeviceMemoryProbe, DeviceReading, NvidiaSmiProbe};
pub use record::TaskRecord;
pub use sink::{OutputFormat, RecordSink};
pub use tracker::{MemoryEnvelope, WorkerMemoryTracker};
pub use transition::{TaskState, TaskTransition};
